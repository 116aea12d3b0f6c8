//! Command and query dispatch.
//!
//! Both buses follow the same steps: resolve the handler by type key, run it
//! on its own task raced against the configured timeout, warn when it was
//! slow, and pass the handler's result through unchanged.

use super::BusConfig;
use super::registry::{CommandRegistry, QueryRegistry};
use crate::execution::run_guarded;
use crate::metrics::CqrsMetrics;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use wiz_kernel_core::{
    Command, CommandHandler, HandlerKind, KernelError, KernelResult, Query, QueryHandler,
};

/// Dispatches commands to their single handler.
#[derive(Debug, Default)]
pub struct CommandBus {
    config: BusConfig,
    registry: CommandRegistry,
}

impl CommandBus {
    /// Create a command bus with an empty registry.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            registry: CommandRegistry::new(),
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The handler registry.
    #[must_use]
    pub const fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Register the handler for command `C`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::DuplicateHandler`] if `C` already has a handler.
    pub fn register<C, H>(&self, handler: H) -> KernelResult<()>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.registry.register(handler)
    }

    /// Execute a command and return its handler's result.
    ///
    /// # Errors
    ///
    /// - [`KernelError::HandlerNotFound`] when `C` has no handler.
    /// - [`KernelError::Timeout`] when the handler outlives the bus timeout;
    ///   the handler keeps running in the background.
    /// - [`KernelError::Panicked`] when the handler panics.
    /// - Whatever error the handler returns.
    pub async fn execute<C: Command>(&self, command: C) -> KernelResult<C::Output> {
        let Some(handler) = self.registry.get::<C>() else {
            return Err(not_found(HandlerKind::Command, C::COMMAND_TYPE));
        };
        observe(
            &self.config,
            HandlerKind::Command,
            C::COMMAND_TYPE,
            run_guarded("Command execution", self.config.timeout, async move {
                handler.handle(command).await
            }),
        )
        .await
    }
}

/// Dispatches queries to their single handler.
#[derive(Debug, Default)]
pub struct QueryBus {
    config: BusConfig,
    registry: QueryRegistry,
}

impl QueryBus {
    /// Create a query bus with an empty registry.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            registry: QueryRegistry::new(),
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The handler registry.
    #[must_use]
    pub const fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    /// Register the handler for query `Q`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::DuplicateHandler`] if `Q` already has a handler.
    pub fn register<Q, H>(&self, handler: H) -> KernelResult<()>
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        self.registry.register(handler)
    }

    /// Execute a query and return its handler's result.
    ///
    /// # Errors
    ///
    /// Same as [`CommandBus::execute`], with query wording.
    pub async fn execute<Q: Query>(&self, query: Q) -> KernelResult<Q::Output> {
        let Some(handler) = self.registry.get::<Q>() else {
            return Err(not_found(HandlerKind::Query, Q::QUERY_TYPE));
        };
        observe(
            &self.config,
            HandlerKind::Query,
            Q::QUERY_TYPE,
            run_guarded("Query execution", self.config.timeout, async move {
                handler.handle(query).await
            }),
        )
        .await
    }
}

fn not_found(kind: HandlerKind, type_name: &'static str) -> KernelError {
    let err = KernelError::handler_not_found(kind, type_name);
    tracing::error!(kind = %kind, type_name, error = %err, "No handler registered");
    CqrsMetrics::record_execution(kind.as_str(), false, std::time::Duration::ZERO);
    err
}

async fn observe<T>(
    config: &BusConfig,
    kind: HandlerKind,
    type_name: &'static str,
    execution: impl Future<Output = KernelResult<T>>,
) -> KernelResult<T> {
    if config.enable_logging {
        tracing::debug!(kind = %kind, type_name, "Executing");
    }

    let started = Instant::now();
    let result = execution.await;
    let elapsed = started.elapsed();

    match &result {
        Ok(_) => {
            if is_slow(config, elapsed) {
                CqrsMetrics::record_slow(kind.as_str());
                tracing::warn!(
                    kind = %kind,
                    type_name,
                    duration_ms = elapsed.as_millis(),
                    threshold_ms = config.slow_execution_threshold.as_millis(),
                    "Slow execution detected"
                );
            }
            if config.enable_logging {
                tracing::debug!(
                    kind = %kind,
                    type_name,
                    duration_ms = elapsed.as_millis(),
                    "Executed successfully"
                );
            }
        }
        Err(err) => {
            if err.is_timeout() {
                CqrsMetrics::record_timeout(kind.as_str());
            }
            tracing::error!(
                kind = %kind,
                type_name,
                duration_ms = elapsed.as_millis(),
                error = %err,
                "Execution failed"
            );
        }
    }

    CqrsMetrics::record_execution(kind.as_str(), result.is_ok(), elapsed);
    result
}

/// Only successful executions are checked against the threshold.
fn is_slow(config: &BusConfig, elapsed: Duration) -> bool {
    config.enable_performance_monitoring && elapsed > config.slow_execution_threshold
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    struct CreateAgent {
        name: String,
    }

    impl Command for CreateAgent {
        type Output = String;
        const COMMAND_TYPE: &'static str = "CreateAgent";
    }

    struct DeleteAgent;

    impl Command for DeleteAgent {
        type Output = ();
        const COMMAND_TYPE: &'static str = "DeleteAgent";
    }

    struct CreateAgentHandler;

    impl CommandHandler<CreateAgent> for CreateAgentHandler {
        fn handle(&self, command: CreateAgent) -> BoxFuture<'_, KernelResult<String>> {
            Box::pin(async move {
                if command.name.is_empty() {
                    Err(KernelError::validation("name is required"))
                } else {
                    Ok(format!("agent-{}", command.name))
                }
            })
        }
    }

    struct Hang;

    impl Query for Hang {
        type Output = ();
        const QUERY_TYPE: &'static str = "Hang";
    }

    struct HangHandler;

    impl QueryHandler<Hang> for HangHandler {
        fn handle(&self, _query: Hang) -> BoxFuture<'_, KernelResult<()>> {
            Box::pin(std::future::pending())
        }
    }

    struct Crash;

    impl Query for Crash {
        type Output = u8;
        const QUERY_TYPE: &'static str = "Crash";
    }

    struct CrashHandler;

    fn explode() -> KernelResult<u8> {
        panic!("query handler bug")
    }

    impl QueryHandler<Crash> for CrashHandler {
        fn handle(&self, _query: Crash) -> BoxFuture<'_, KernelResult<u8>> {
            Box::pin(async { explode() })
        }
    }

    #[tokio::test]
    async fn unregistered_command_type_is_an_error_result() {
        let bus = CommandBus::default();
        bus.register(CreateAgentHandler).unwrap();

        let err = bus.execute(DeleteAgent).await.unwrap_err();
        assert!(
            err.to_string()
                .contains("No handler registered for command type: DeleteAgent")
        );
    }

    #[tokio::test]
    async fn handler_results_pass_through() {
        let bus = CommandBus::default();
        bus.register(CreateAgentHandler).unwrap();

        let created = bus
            .execute(CreateAgent {
                name: "ada".to_owned(),
            })
            .await;
        assert_eq!(created, Ok("agent-ada".to_owned()));

        let rejected = bus
            .execute(CreateAgent {
                name: String::new(),
            })
            .await;
        assert_eq!(rejected, Err(KernelError::validation("name is required")));
    }

    #[tokio::test(start_paused = true)]
    async fn never_resolving_handler_times_out_on_schedule() {
        let bus = QueryBus::new(BusConfig::default().with_timeout(Duration::from_millis(250)));
        bus.register(HangHandler).unwrap();

        let started = Instant::now();
        let err = bus.execute(Hang).await.unwrap_err();

        assert_eq!(started.elapsed(), Duration::from_millis(250));
        assert_eq!(err.to_string(), "Query execution timeout after 250ms");
    }

    #[tokio::test]
    async fn panicking_handler_becomes_error_result() {
        let bus = QueryBus::default();
        bus.register(CrashHandler).unwrap();

        let err = bus.execute(Crash).await.unwrap_err();
        assert!(matches!(err, KernelError::Panicked { .. }));
    }

    #[test]
    fn slow_check_respects_monitoring_switch_and_threshold() {
        let config = BusConfig::default().with_slow_execution_threshold(Duration::from_millis(100));
        assert!(is_slow(&config, Duration::from_millis(150)));
        assert!(!is_slow(&config, Duration::from_millis(100)));
        assert!(!is_slow(
            &config.with_performance_monitoring(false),
            Duration::from_secs(5)
        ));
    }

    struct WarningCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for WarningCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct Sleepy;

    impl Query for Sleepy {
        type Output = ();
        const QUERY_TYPE: &'static str = "Sleepy";
    }

    struct SleepyHandler;

    impl QueryHandler<Sleepy> for SleepyHandler {
        fn handle(&self, _query: Sleepy) -> BoxFuture<'_, KernelResult<()>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn only_successful_executions_are_flagged_slow() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(WarningCounter(Arc::clone(&warnings))),
        );
        let bus = QueryBus::new(
            BusConfig::default()
                .with_timeout(Duration::from_millis(250))
                .with_slow_execution_threshold(Duration::from_millis(10)),
        );
        bus.register(HangHandler).unwrap();
        bus.register(SleepyHandler).unwrap();

        assert!(bus.execute(Hang).await.is_err());
        assert_eq!(warnings.load(Ordering::SeqCst), 0);

        bus.execute(Sleepy).await.unwrap();
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }
}
