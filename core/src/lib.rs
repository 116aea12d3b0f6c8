//! # Wiz Kernel Core
//!
//! Core types and contracts for the Project Wiz application kernel.
//!
//! This crate holds the vocabulary shared by every kernel service:
//!
//! - **Results and errors**: [`KernelResult`] and the [`KernelError`] taxonomy
//! - **Events**: the generic [`Event`] envelope and versioned [`DomainEvent`]s
//! - **Messages**: commands, queries, requests and notifications with their
//!   handler traits, keyed by stable type strings
//! - **Modules**: the [`Module`] startup contract
//! - **Environment**: injected dependencies such as the [`environment::Clock`]
//!
//! Services built on these types (buses, mediator, pipeline, module container)
//! live in `wiz-kernel-runtime`; transactional persistence lives in
//! `wiz-kernel-sqlite`.
//!
//! ## Example
//!
//! ```
//! use futures::future::BoxFuture;
//! use wiz_kernel_core::{KernelResult, Query, QueryHandler};
//!
//! struct CountAgents;
//!
//! impl Query for CountAgents {
//!     type Output = usize;
//!     const QUERY_TYPE: &'static str = "CountAgents";
//! }
//!
//! struct CountAgentsHandler;
//!
//! impl QueryHandler<CountAgents> for CountAgentsHandler {
//!     fn handle(&self, _query: CountAgents) -> BoxFuture<'_, KernelResult<usize>> {
//!         Box::pin(async { Ok(3) })
//!     }
//! }
//! ```

pub mod error;
pub mod event;
pub mod event_store;
pub mod message;
pub mod module;

pub use error::{HandlerKind, KernelError, KernelResult, ResultExt};
pub use event::{DomainEvent, DomainEvents, Event};
pub use event_store::{DomainEventSink, EventStore, EventStoreStats};
pub use message::{
    Command, CommandHandler, Notification, NotificationHandler, Query, QueryHandler, Request,
    RequestHandler,
};
pub use module::{HookedModule, Module, ModuleHooks};

/// Injected dependencies.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use wiz_kernel_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// assert!(clock.now() <= chrono::Utc::now());
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
