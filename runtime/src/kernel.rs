//! Composition root.
//!
//! [`Kernel`] constructs one instance of each runtime service from a
//! [`KernelConfig`] and hands out shared references. Feature code receives
//! what it needs from here instead of reaching for global instances.

use crate::config::KernelConfig;
use crate::container::ModuleContainer;
use crate::cqrs::CqrsBus;
use crate::dispatcher::EventDispatcher;
use crate::domain_events::{DomainEventBus, DomainEventPublisher};
use crate::event_bus::EventBus;
use crate::event_store::InMemoryEventStore;
use crate::mediator::Mediator;
use std::sync::Arc;
use wiz_kernel_core::environment::{Clock, SystemClock};
use wiz_kernel_core::{DomainEventSink, KernelResult};

/// The application's kernel services.
#[derive(Clone)]
pub struct Kernel {
    config: KernelConfig,
    event_bus: Arc<EventBus>,
    dispatcher: Arc<EventDispatcher>,
    domain_events: Arc<DomainEventBus>,
    publisher: Arc<DomainEventPublisher>,
    event_store: Arc<InMemoryEventStore>,
    cqrs: Arc<CqrsBus>,
    mediator: Arc<Mediator>,
    modules: Arc<ModuleContainer>,
}

impl Kernel {
    /// Build every service with the system clock.
    #[must_use]
    pub fn new(config: KernelConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build every service, timestamping stored events with `clock`.
    #[must_use]
    pub fn with_clock(config: KernelConfig, clock: Arc<dyn Clock>) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_bus.clone()));
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&event_bus)));
        let domain_events = Arc::new(DomainEventBus::new(Arc::clone(&event_bus)));
        let sink: Arc<dyn DomainEventSink> = domain_events.clone();
        let publisher = Arc::new(DomainEventPublisher::new(sink, config.publisher.clone()));
        let event_store = Arc::new(InMemoryEventStore::with_clock(
            config.event_store.clone(),
            clock,
        ));
        let cqrs = Arc::new(CqrsBus::new(config.cqrs.clone()));
        let mediator = Arc::new(Mediator::new(config.mediator.clone()));

        tracing::info!("Kernel services constructed");
        Self {
            config,
            event_bus,
            dispatcher,
            domain_events,
            publisher,
            event_store,
            cqrs,
            mediator,
            modules: Arc::new(ModuleContainer::new()),
        }
    }

    /// Build every service, failing startup on unregistered module dependencies.
    #[must_use]
    pub fn strict(config: KernelConfig) -> Self {
        Self {
            modules: Arc::new(ModuleContainer::strict()),
            ..Self::new(config)
        }
    }

    /// The configuration the services were built from.
    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Generic event bus.
    #[must_use]
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.event_bus)
    }

    /// Strategy-based dispatcher over the event bus.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<EventDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Domain event facade over the event bus.
    #[must_use]
    pub fn domain_events(&self) -> Arc<DomainEventBus> {
        Arc::clone(&self.domain_events)
    }

    /// Buffered publisher feeding the domain event bus.
    #[must_use]
    pub fn publisher(&self) -> Arc<DomainEventPublisher> {
        Arc::clone(&self.publisher)
    }

    /// In-memory domain event store.
    #[must_use]
    pub fn event_store(&self) -> Arc<InMemoryEventStore> {
        Arc::clone(&self.event_store)
    }

    /// Command and query buses.
    #[must_use]
    pub fn cqrs(&self) -> Arc<CqrsBus> {
        Arc::clone(&self.cqrs)
    }

    /// Request and notification mediator.
    #[must_use]
    pub fn mediator(&self) -> Arc<Mediator> {
        Arc::clone(&self.mediator)
    }

    /// Module container.
    #[must_use]
    pub fn modules(&self) -> Arc<ModuleContainer> {
        Arc::clone(&self.modules)
    }

    /// Start every registered module.
    ///
    /// # Errors
    ///
    /// See [`ModuleContainer::initialize_all`].
    pub async fn start(&self) -> KernelResult<()> {
        self.modules.initialize_all().await
    }

    /// Flush buffered events and stop background work.
    ///
    /// # Errors
    ///
    /// Returns the publish error if buffered domain events could not be
    /// delivered; background work is stopped regardless.
    pub async fn shutdown(&self) -> KernelResult<()> {
        let flushed = self.publisher.publish_now().await;
        self.publisher.dispose();
        self.dispatcher.flush_batches().await;
        self.dispatcher.dispose();
        tracing::info!("Kernel shut down");
        flushed.map(|_| ())
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("event_bus", &self.event_bus)
            .field("cqrs", &self.cqrs)
            .field("mediator", &self.mediator)
            .field("modules", &self.modules)
            .finish_non_exhaustive()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}
