//! Message and handler contracts for the command/query buses and the mediator.
//!
//! Every message type carries a stable string key as an associated constant.
//! Buses map that key to a handler when the application is composed, so a
//! missing or duplicate handler is reported by the registry rather than
//! discovered through reflection at dispatch time.
//!
//! Handler traits return boxed futures so they stay dyn-compatible and can be
//! stored as `Arc<dyn CommandHandler<C>>`.
//!
//! # Example
//!
//! ```
//! use futures::future::BoxFuture;
//! use wiz_kernel_core::error::KernelResult;
//! use wiz_kernel_core::message::{Command, CommandHandler};
//!
//! struct CreateAgent {
//!     name: String,
//! }
//!
//! impl Command for CreateAgent {
//!     type Output = String;
//!     const COMMAND_TYPE: &'static str = "CreateAgent";
//! }
//!
//! struct CreateAgentHandler;
//!
//! impl CommandHandler<CreateAgent> for CreateAgentHandler {
//!     fn handle(&self, command: CreateAgent) -> BoxFuture<'_, KernelResult<String>> {
//!         Box::pin(async move { Ok(format!("agent:{}", command.name)) })
//!     }
//! }
//! ```

use crate::error::KernelResult;
use futures::future::BoxFuture;
use std::sync::Arc;

/// A request to change state. Exactly one handler per [`Command::COMMAND_TYPE`].
pub trait Command: Send + 'static {
    /// Value produced on success.
    type Output: Send + 'static;

    /// Stable type key the handler is registered under.
    const COMMAND_TYPE: &'static str;
}

/// A request to read state. Exactly one handler per [`Query::QUERY_TYPE`].
pub trait Query: Send + 'static {
    /// Value produced on success.
    type Output: Send + 'static;

    /// Stable type key the handler is registered under.
    const QUERY_TYPE: &'static str;
}

/// Handles one command type.
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    /// Execute the command.
    fn handle(&self, command: C) -> BoxFuture<'_, KernelResult<C::Output>>;

    /// Type key this handler serves.
    fn command_type(&self) -> &'static str {
        C::COMMAND_TYPE
    }
}

/// Handles one query type.
pub trait QueryHandler<Q: Query>: Send + Sync + 'static {
    /// Execute the query.
    fn handle(&self, query: Q) -> BoxFuture<'_, KernelResult<Q::Output>>;

    /// Type key this handler serves.
    fn query_type(&self) -> &'static str {
        Q::QUERY_TYPE
    }
}

impl<C: Command, H: CommandHandler<C> + ?Sized> CommandHandler<C> for Arc<H> {
    fn handle(&self, command: C) -> BoxFuture<'_, KernelResult<C::Output>> {
        (**self).handle(command)
    }
}

impl<Q: Query, H: QueryHandler<Q> + ?Sized> QueryHandler<Q> for Arc<H> {
    fn handle(&self, query: Q) -> BoxFuture<'_, KernelResult<Q::Output>> {
        (**self).handle(query)
    }
}

/// A mediator request answered by exactly one handler.
pub trait Request: Send + 'static {
    /// Response produced on success.
    type Response: Send + 'static;

    /// Stable type key the handler is registered under.
    const REQUEST_TYPE: &'static str;

    /// Identity of this request, used in log fields.
    fn request_id(&self) -> &str;

    /// Correlation id, if the caller supplied one.
    fn correlation_id(&self) -> Option<&str> {
        None
    }
}

/// A mediator notification delivered to zero or more handlers.
pub trait Notification: Send + Sync + 'static {
    /// Stable type key handlers subscribe to.
    const NOTIFICATION_TYPE: &'static str;

    /// Identity of this notification, used in log fields.
    fn notification_id(&self) -> &str;
}

/// Answers one request type.
pub trait RequestHandler<R: Request>: Send + Sync + 'static {
    /// Produce the response.
    fn handle(&self, request: R) -> BoxFuture<'_, KernelResult<R::Response>>;
}

/// Reacts to one notification type.
///
/// Handlers share the notification through an `Arc` because they run concurrently.
pub trait NotificationHandler<N: Notification>: Send + Sync + 'static {
    /// React to the notification.
    fn handle(&self, notification: Arc<N>) -> BoxFuture<'_, KernelResult<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping;

    impl Command for Ping {
        type Output = &'static str;
        const COMMAND_TYPE: &'static str = "Ping";
    }

    struct PingHandler;

    impl CommandHandler<Ping> for PingHandler {
        fn handle(&self, _command: Ping) -> BoxFuture<'_, KernelResult<&'static str>> {
            Box::pin(async { Ok("pong") })
        }
    }

    #[tokio::test]
    async fn handler_reports_command_type_and_handles() {
        let handler = PingHandler;
        assert_eq!(handler.command_type(), "Ping");
        assert_eq!(handler.handle(Ping).await, Ok("pong"));
    }

    #[tokio::test]
    async fn arc_wrapped_handler_delegates() {
        let handler: Arc<dyn CommandHandler<Ping>> = Arc::new(PingHandler);
        assert_eq!(handler.handle(Ping).await, Ok("pong"));
    }
}
