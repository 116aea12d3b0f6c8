//! Template handlers: validate, execute, then publish raised domain events.
//!
//! Feature code implements [`CommandExecutor`] or [`QueryExecutor`] and wraps
//! it in [`StandardCommandHandler`] or [`StandardQueryHandler`], which add
//! stage logging and, for commands, domain event publishing.

use futures::future::BoxFuture;
use std::marker::PhantomData;
use std::sync::Arc;
use wiz_kernel_core::{
    Command, CommandHandler, DomainEventSink, DomainEvents, KernelResult, Query, QueryHandler,
};

/// Business logic of one command type.
pub trait CommandExecutor<C: Command>: Send + Sync + 'static {
    /// Reject invalid input before any work happens.
    ///
    /// # Errors
    ///
    /// Typically [`wiz_kernel_core::KernelError::Validation`].
    fn validate(&self, _command: &C) -> KernelResult<()> {
        Ok(())
    }

    /// Perform the command, queueing raised domain events into `events`.
    fn execute<'a>(
        &'a self,
        command: C,
        events: &'a mut DomainEvents,
    ) -> BoxFuture<'a, KernelResult<C::Output>>;
}

/// Business logic of one query type.
pub trait QueryExecutor<Q: Query>: Send + Sync + 'static {
    /// Reject invalid input before any work happens.
    ///
    /// # Errors
    ///
    /// Typically [`wiz_kernel_core::KernelError::Validation`].
    fn validate(&self, _query: &Q) -> KernelResult<()> {
        Ok(())
    }

    /// Answer the query.
    fn execute(&self, query: Q) -> BoxFuture<'_, KernelResult<Q::Output>>;
}

/// Runs a [`CommandExecutor`] and publishes the events it raised.
///
/// Each call starts with an empty event buffer. Events are published only
/// after a successful execution; without a sink they are discarded.
pub struct StandardCommandHandler<C, E> {
    executor: E,
    sink: Option<Arc<dyn DomainEventSink>>,
    _command: PhantomData<fn(C)>,
}

impl<C: Command, E: CommandExecutor<C>> StandardCommandHandler<C, E> {
    /// Wrap an executor that publishes into `sink`.
    #[must_use]
    pub fn new(executor: E, sink: Arc<dyn DomainEventSink>) -> Self {
        Self {
            executor,
            sink: Some(sink),
            _command: PhantomData,
        }
    }

    /// Wrap an executor whose raised events are discarded.
    #[must_use]
    pub const fn without_events(executor: E) -> Self {
        Self {
            executor,
            sink: None,
            _command: PhantomData,
        }
    }

    /// The wrapped executor.
    #[must_use]
    pub const fn executor(&self) -> &E {
        &self.executor
    }

    async fn run(&self, command: C) -> KernelResult<C::Output> {
        let command_type = C::COMMAND_TYPE;
        tracing::debug!(command_type, "Handling command");

        if let Err(err) = self.executor.validate(&command) {
            tracing::warn!(command_type, error = %err, "Command validation failed");
            return Err(err);
        }

        let mut events = DomainEvents::new();
        let output = match self.executor.execute(command, &mut events).await {
            Ok(output) => output,
            Err(err) => {
                tracing::error!(command_type, error = %err, "Command execution failed");
                return Err(err);
            }
        };

        let raised = events.take();
        if !raised.is_empty() {
            match &self.sink {
                Some(sink) => {
                    let count = raised.len();
                    if let Err(err) = sink.publish_all(raised).await {
                        tracing::error!(
                            command_type,
                            error = %err,
                            "Failed to publish domain events"
                        );
                        return Err(err);
                    }
                    tracing::debug!(command_type, count, "Domain events published");
                }
                None => {
                    tracing::debug!(
                        command_type,
                        count = raised.len(),
                        "Domain events discarded"
                    );
                }
            }
        }

        tracing::info!(command_type, "Command handled");
        Ok(output)
    }
}

impl<C: Command, E: CommandExecutor<C>> CommandHandler<C> for StandardCommandHandler<C, E> {
    fn handle(&self, command: C) -> BoxFuture<'_, KernelResult<C::Output>> {
        Box::pin(self.run(command))
    }
}

/// Runs a [`QueryExecutor`] with stage logging.
pub struct StandardQueryHandler<Q, E> {
    executor: E,
    _query: PhantomData<fn(Q)>,
}

impl<Q: Query, E: QueryExecutor<Q>> StandardQueryHandler<Q, E> {
    /// Wrap an executor.
    #[must_use]
    pub const fn new(executor: E) -> Self {
        Self {
            executor,
            _query: PhantomData,
        }
    }

    async fn run(&self, query: Q) -> KernelResult<Q::Output> {
        let query_type = Q::QUERY_TYPE;
        tracing::debug!(query_type, "Handling query");

        if let Err(err) = self.executor.validate(&query) {
            tracing::warn!(query_type, error = %err, "Query validation failed");
            return Err(err);
        }

        let result = self.executor.execute(query).await;
        match &result {
            Ok(_) => tracing::debug!(query_type, "Query handled"),
            Err(err) => tracing::error!(query_type, error = %err, "Query execution failed"),
        }
        result
    }
}

impl<Q: Query, E: QueryExecutor<Q>> QueryHandler<Q> for StandardQueryHandler<Q, E> {
    fn handle(&self, query: Q) -> BoxFuture<'_, KernelResult<Q::Output>> {
        Box::pin(self.run(query))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiz_kernel_core::{DomainEvent, KernelError};
    use wiz_kernel_testing::mocks::RecordingSink;

    struct RenameAgent {
        id: String,
        name: String,
    }

    impl Command for RenameAgent {
        type Output = u64;
        const COMMAND_TYPE: &'static str = "RenameAgent";
    }

    struct RenameAgentExecutor;

    impl CommandExecutor<RenameAgent> for RenameAgentExecutor {
        fn validate(&self, command: &RenameAgent) -> KernelResult<()> {
            if command.name.trim().is_empty() {
                return Err(KernelError::validation("name must not be blank"));
            }
            Ok(())
        }

        fn execute<'a>(
            &'a self,
            command: RenameAgent,
            events: &'a mut DomainEvents,
        ) -> BoxFuture<'a, KernelResult<u64>> {
            Box::pin(async move {
                if command.name == "forbidden" {
                    events.add(DomainEvent::new("agent.rename_attempted", &command.id, 2, json!({})));
                    return Err(KernelError::handler("name is reserved"));
                }
                events.add(DomainEvent::new(
                    "agent.renamed",
                    &command.id,
                    2,
                    json!({ "name": command.name }),
                ));
                Ok(2)
            })
        }
    }

    fn rename(name: &str) -> RenameAgent {
        RenameAgent {
            id: "agent-1".to_owned(),
            name: name.to_owned(),
        }
    }

    #[tokio::test]
    async fn successful_execution_publishes_raised_events() {
        let sink = RecordingSink::new();
        let handler = StandardCommandHandler::new(RenameAgentExecutor, Arc::new(sink.clone()));

        assert_eq!(handler.handle(rename("Ada")).await, Ok(2));
        assert_eq!(sink.published_names(), vec!["agent.renamed"]);
        assert_eq!(sink.published()[0].data["name"], "Ada");
    }

    #[tokio::test]
    async fn failed_execution_publishes_nothing() {
        let sink = RecordingSink::new();
        let handler = StandardCommandHandler::new(RenameAgentExecutor, Arc::new(sink.clone()));

        assert_eq!(
            handler.handle(rename("forbidden")).await,
            Err(KernelError::handler("name is reserved"))
        );
        assert_eq!(sink.calls(), 0);

        // A later call starts from an empty buffer.
        handler.handle(rename("Grace")).await.unwrap();
        assert_eq!(sink.published_names(), vec!["agent.renamed"]);
    }

    #[tokio::test]
    async fn validation_failure_skips_execution() {
        let sink = RecordingSink::new();
        let handler = StandardCommandHandler::new(RenameAgentExecutor, Arc::new(sink.clone()));

        let result = handler.handle(rename("  ")).await;
        assert_eq!(result, Err(KernelError::validation("name must not be blank")));
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test]
    async fn sink_failure_fails_the_command() {
        let sink = RecordingSink::new();
        sink.fail_next(1);
        let handler = StandardCommandHandler::new(RenameAgentExecutor, Arc::new(sink.clone()));

        assert!(handler.handle(rename("Ada")).await.is_err());
    }

    #[tokio::test]
    async fn without_sink_events_are_discarded() {
        let handler = StandardCommandHandler::without_events(RenameAgentExecutor);
        assert_eq!(handler.handle(rename("Ada")).await, Ok(2));
    }

    struct AgentName(String);

    impl Query for AgentName {
        type Output = String;
        const QUERY_TYPE: &'static str = "AgentName";
    }

    struct AgentNameExecutor;

    impl QueryExecutor<AgentName> for AgentNameExecutor {
        fn validate(&self, query: &AgentName) -> KernelResult<()> {
            if query.0.is_empty() {
                return Err(KernelError::validation("id is required"));
            }
            Ok(())
        }

        fn execute(&self, query: AgentName) -> BoxFuture<'_, KernelResult<String>> {
            Box::pin(async move { Ok(format!("name-of-{}", query.0)) })
        }
    }

    #[tokio::test]
    async fn query_handler_validates_then_executes() {
        let handler = StandardQueryHandler::new(AgentNameExecutor);
        assert_eq!(
            handler.handle(AgentName("a-1".to_owned())).await,
            Ok("name-of-a-1".to_owned())
        );
        assert!(handler.handle(AgentName(String::new())).await.is_err());
    }
}
