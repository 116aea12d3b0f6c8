//! Command and query buses.
//!
//! Handlers are registered against the stable type key of their message
//! ([`Command::COMMAND_TYPE`], [`Query::QUERY_TYPE`]) while the application is
//! composed. [`HandlerRegistry::require`] lets the composition root verify that
//! every expected key is covered before the first dispatch.
//!
//! - [`registry`]: one handler per type key
//! - [`bus`]: timeout-guarded execution with slow-execution warnings
//! - [`handlers`]: validate/execute/publish template handlers
//! - [`decorators`]: idempotency and query caching wrappers
//!
//! # Example
//!
//! ```
//! use futures::future::BoxFuture;
//! use wiz_kernel_core::{Command, CommandHandler, KernelResult};
//! use wiz_kernel_runtime::cqrs::{BusConfig, CqrsBus};
//!
//! struct CreateAgent(String);
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
//!         Box::pin(async move { Ok(format!("agent:{}", command.0)) })
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = CqrsBus::new(BusConfig::default());
//! bus.register_command(CreateAgentHandler).unwrap();
//!
//! let id = bus.execute_command(CreateAgent("ada".into())).await.unwrap();
//! assert_eq!(id, "agent:ada");
//! # }
//! ```

pub mod bus;
pub mod decorators;
pub mod handlers;
pub mod registry;

pub use bus::{CommandBus, QueryBus};
pub use decorators::{CachedQueryHandler, IdempotentCommandHandler};
pub use handlers::{CommandExecutor, QueryExecutor, StandardCommandHandler, StandardQueryHandler};
pub use registry::{CommandRegistry, HandlerRegistry, QueryRegistry};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use wiz_kernel_core::{Command, CommandHandler, KernelResult, Query, QueryHandler};

/// Command and query bus configuration.
///
/// # Default Values
///
/// - `timeout`: 30 seconds
/// - `enable_logging`: true
/// - `enable_performance_monitoring`: true
/// - `slow_execution_threshold`: 1 second
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// How long a caller waits for a handler
    pub timeout: Duration,
    /// Log every dispatch
    pub enable_logging: bool,
    /// Warn about slow executions
    pub enable_performance_monitoring: bool,
    /// Executions slower than this are reported
    pub slow_execution_threshold: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            enable_logging: true,
            enable_performance_monitoring: true,
            slow_execution_threshold: Duration::from_secs(1),
        }
    }
}

impl BusConfig {
    /// Set the execution timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable dispatch logging.
    #[must_use]
    pub const fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    /// Enable or disable slow-execution reporting.
    #[must_use]
    pub const fn with_performance_monitoring(mut self, enabled: bool) -> Self {
        self.enable_performance_monitoring = enabled;
        self
    }

    /// Set the slow-execution threshold.
    #[must_use]
    pub const fn with_slow_execution_threshold(mut self, threshold: Duration) -> Self {
        self.slow_execution_threshold = threshold;
        self
    }
}

/// Registration summary of a [`CqrsBus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CqrsStats {
    /// Number of command handlers.
    pub command_handlers: usize,
    /// Number of query handlers.
    pub query_handlers: usize,
    /// Registered command type keys, sorted.
    pub registered_commands: Vec<&'static str>,
    /// Registered query type keys, sorted.
    pub registered_queries: Vec<&'static str>,
}

/// A command bus and a query bus sharing one configuration.
#[derive(Debug)]
pub struct CqrsBus {
    commands: CommandBus,
    queries: QueryBus,
}

impl CqrsBus {
    /// Create both buses.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            commands: CommandBus::new(config.clone()),
            queries: QueryBus::new(config),
        }
    }

    /// The command bus.
    #[must_use]
    pub const fn commands(&self) -> &CommandBus {
        &self.commands
    }

    /// The query bus.
    #[must_use]
    pub const fn queries(&self) -> &QueryBus {
        &self.queries
    }

    /// Register a command handler.
    ///
    /// # Errors
    ///
    /// Returns [`wiz_kernel_core::KernelError::DuplicateHandler`] when the
    /// command type already has a handler.
    pub fn register_command<C, H>(&self, handler: H) -> KernelResult<()>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.commands.register(handler)
    }

    /// Register a query handler.
    ///
    /// # Errors
    ///
    /// Returns [`wiz_kernel_core::KernelError::DuplicateHandler`] when the
    /// query type already has a handler.
    pub fn register_query<Q, H>(&self, handler: H) -> KernelResult<()>
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        self.queries.register(handler)
    }

    /// Execute a command.
    ///
    /// # Errors
    ///
    /// See [`CommandBus::execute`].
    pub async fn execute_command<C: Command>(&self, command: C) -> KernelResult<C::Output> {
        self.commands.execute(command).await
    }

    /// Execute a query.
    ///
    /// # Errors
    ///
    /// See [`QueryBus::execute`].
    pub async fn execute_query<Q: Query>(&self, query: Q) -> KernelResult<Q::Output> {
        self.queries.execute(query).await
    }

    /// Registration summary.
    #[must_use]
    pub fn stats(&self) -> CqrsStats {
        CqrsStats {
            command_handlers: self.commands.registry().handler_count(),
            query_handlers: self.queries.registry().handler_count(),
            registered_commands: self.commands.registry().registered_types(),
            registered_queries: self.queries.registry().registered_types(),
        }
    }
}

impl Default for CqrsBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}
