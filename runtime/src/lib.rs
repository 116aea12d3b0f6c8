//! # Wiz Kernel Runtime
//!
//! Runtime services of the Project Wiz application kernel.
//!
//! ## Core Components
//!
//! - **Event Bus**: typed pub/sub with priorities, filters, once-subscriptions,
//!   bounded concurrent delivery, timeouts and a dead-letter queue
//! - **Event Dispatcher**: immediate, async, batched and delayed delivery with retry
//! - **Domain events**: a domain-facing bus, a buffered publisher and an
//!   in-memory event store
//! - **CQRS**: command and query buses over explicit handler registries, with
//!   template handlers and idempotency/caching decorators
//! - **Mediator**: request/response through priority-ordered behaviors, and
//!   notification fan-out
//! - **Pipeline**: priority-ordered step pipelines
//! - **Module container**: dependency-ordered two-phase module startup
//! - **Kernel**: the composition root owning one instance of each service
//!
//! Every handler runs on its own task raced against a timeout. A timeout or a
//! panic becomes an error result; the handler's task is not cancelled.
//!
//! ## Example
//!
//! ```
//! use serde_json::json;
//! use wiz_kernel_core::Event;
//! use wiz_kernel_runtime::{Kernel, SubscribeOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let kernel = Kernel::default();
//! let bus = kernel.event_bus();
//!
//! bus.subscribe("user.created", |_event| async { Ok(()) }, SubscribeOptions::new());
//!
//! let report = bus
//!     .publish(Event::new("user.created", json!({ "id": "u-1" })))
//!     .await
//!     .unwrap();
//! assert_eq!(report.success_count, 1);
//! # }
//! ```

/// Environment-driven configuration of every service
pub mod config;

/// Module dependency container
pub mod container;

/// Command and query buses
pub mod cqrs;

/// Bounded dead-letter queue
pub mod dead_letter;

/// Strategy-based event dispatch
pub mod dispatcher;

/// Domain event bus and buffered publisher
pub mod domain_events;

/// Generic event bus
pub mod event_bus;

/// In-memory domain event store
pub mod event_store;

/// Composition root
pub mod kernel;

/// Request/notification mediator and pipeline behaviors
pub mod mediator;

/// Prometheus metrics for observability
pub mod metrics;

/// Step pipelines
pub mod pipeline;

/// Retry logic with backoff
pub mod retry;

/// Tracing subscriber bootstrap
pub mod telemetry;

mod execution;

pub use config::{ConfigError, KernelConfig};
pub use container::{ModuleContainer, ModuleState};
pub use cqrs::{BusConfig, CommandBus, CqrsBus, QueryBus};
pub use dispatcher::{DispatchOptions, DispatchReport, DispatchStrategy, EventDispatcher};
pub use domain_events::{DomainEventBus, DomainEventPublisher, PublisherConfig};
pub use event_bus::{EventBus, EventBusConfig, EventDispatchReport, SubscribeOptions, Subscription};
pub use event_store::{EventStoreConfig, InMemoryEventStore};
pub use kernel::Kernel;
pub use mediator::{Mediator, MediatorConfig, PipelineBehavior};
pub use pipeline::{Pipeline, PipelineConfig, PipelineContext, PipelineResult, PipelineStep};
pub use retry::RetryPolicy;
