//! Domain-facing event publishing.
//!
//! [`DomainEventBus`] adapts [`DomainEvent`]s onto the generic [`EventBus`] and
//! back, so domain handlers never see the generic envelope.
//! [`DomainEventPublisher`] buffers events raised by aggregates and flushes
//! them through any [`DomainEventSink`], either when the buffer reaches its
//! batch size or after a short debounce delay.

use crate::event_bus::{EventBus, SubscribeOptions, Subscription};
use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use wiz_kernel_core::{DomainEvent, DomainEventSink, Event, KernelError, KernelResult};

/// Handle returned by [`DomainEventBus::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainSubscription {
    event_name: String,
    inner: Subscription,
}

impl DomainSubscription {
    /// Event name the subscription listens to.
    #[must_use]
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Subscription id on the underlying event bus.
    #[must_use]
    pub fn id(&self) -> &str {
        self.inner.id()
    }
}

/// Publishes domain events through the generic event bus.
///
/// Handlers are registered with a fixed priority of
/// [`DomainEventBus::HANDLER_PRIORITY`]. A handler error is logged and also
/// reported to the event bus, so it shows up in failure counts and can
/// dead-letter the event.
pub struct DomainEventBus {
    bus: Arc<EventBus>,
    handlers: Mutex<HashMap<String, Vec<String>>>,
}

impl DomainEventBus {
    /// Priority given to every domain handler on the event bus.
    pub const HANDLER_PRIORITY: i32 = 500;

    /// Create a domain event bus delivering through `bus`.
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe a handler to domain events named `event_name`.
    pub fn subscribe<F, Fut>(&self, event_name: impl Into<String>, handler: F) -> DomainSubscription
    where
        F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = KernelResult<()>> + Send + 'static,
    {
        let event_name = event_name.into();
        let handler = Arc::new(handler);
        let adapter = move |event: Event| -> BoxFuture<'static, KernelResult<()>> {
            let Some(domain) = DomainEvent::from_event(&event) else {
                let err = KernelError::Internal(format!(
                    "Event {} of type {} carries no domain event metadata",
                    event.id, event.event_type
                ));
                return Box::pin(futures::future::ready(Err(err)));
            };
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let event_id = domain.event_id.clone();
                let event_name = domain.event_name.clone();
                let result = handler(domain).await;
                if let Err(err) = &result {
                    tracing::error!(
                        event_id = %event_id,
                        event_name = %event_name,
                        error = %err,
                        "Domain event handler failed"
                    );
                }
                result
            })
        };

        let inner = self.bus.subscribe_boxed(
            event_name.clone(),
            Arc::new(adapter),
            SubscribeOptions::new().priority(Self::HANDLER_PRIORITY),
        );
        self.lock()
            .entry(event_name.clone())
            .or_default()
            .push(inner.id().to_owned());

        tracing::debug!(event_name = %event_name, "Domain event handler subscribed");
        DomainSubscription { event_name, inner }
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, subscription: &DomainSubscription) -> bool {
        {
            let mut handlers = self.lock();
            if let Some(ids) = handlers.get_mut(&subscription.event_name) {
                ids.retain(|id| id != subscription.id());
                if ids.is_empty() {
                    handlers.remove(&subscription.event_name);
                }
            }
        }
        self.bus.unsubscribe(&subscription.inner)
    }

    /// Publish one domain event.
    ///
    /// # Errors
    ///
    /// Returns the event bus error, e.g. the first handler failure when the
    /// bus does not continue on error.
    pub async fn publish(&self, event: DomainEvent) -> KernelResult<()> {
        let generic = Event::from(&event);
        match self.bus.publish(generic).await {
            Ok(report) => {
                tracing::debug!(
                    event_id = %event.event_id,
                    event_name = %event.event_name,
                    aggregate_id = %event.aggregate_id,
                    handler_count = report.handler_count,
                    failure_count = report.failure_count,
                    "Domain event published"
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    event_id = %event.event_id,
                    event_name = %event.event_name,
                    error = %err,
                    "Failed to publish domain event"
                );
                Err(err)
            }
        }
    }

    /// Publish several domain events concurrently.
    ///
    /// # Errors
    ///
    /// Returns the first failure once every publish has settled.
    pub async fn publish_all(&self, events: Vec<DomainEvent>) -> KernelResult<()> {
        let outcomes = join_all(events.into_iter().map(|event| self.publish(event))).await;
        outcomes.into_iter().collect()
    }

    /// Handlers subscribed to `event_name`.
    #[must_use]
    pub fn handler_count(&self, event_name: &str) -> usize {
        self.lock().get(event_name).map_or(0, Vec::len)
    }

    /// Event names with at least one handler, sorted.
    #[must_use]
    pub fn registered_event_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Handlers across every event name.
    #[must_use]
    pub fn total_handler_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DomainEventSink for DomainEventBus {
    fn publish(&self, event: DomainEvent) -> BoxFuture<'_, KernelResult<()>> {
        Box::pin(Self::publish(self, event))
    }

    fn publish_all(&self, events: Vec<DomainEvent>) -> BoxFuture<'_, KernelResult<()>> {
        Box::pin(Self::publish_all(self, events))
    }
}

/// Domain event publisher configuration.
///
/// # Default Values
///
/// - `auto_publish`: true
/// - `batch_size`: 10
/// - `publish_delay`: 100ms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Flush automatically on batch size or after the delay
    pub auto_publish: bool,
    /// Buffer size that triggers an immediate flush
    pub batch_size: usize,
    /// Debounce delay before a flush
    pub publish_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            auto_publish: true,
            batch_size: 10,
            publish_delay: Duration::from_millis(100),
        }
    }
}

impl PublisherConfig {
    /// Enable or disable automatic flushing.
    #[must_use]
    pub const fn with_auto_publish(mut self, auto_publish: bool) -> Self {
        self.auto_publish = auto_publish;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the debounce delay.
    #[must_use]
    pub const fn with_publish_delay(mut self, publish_delay: Duration) -> Self {
        self.publish_delay = publish_delay;
        self
    }
}

struct PublisherInner {
    sink: Arc<dyn DomainEventSink>,
    config: PublisherConfig,
    pending: Mutex<Vec<DomainEvent>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl PublisherInner {
    async fn publish_now(&self) -> KernelResult<usize> {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
        self.flush().await
    }

    async fn flush(&self) -> KernelResult<usize> {
        let events = std::mem::take(&mut *lock(&self.pending));
        if events.is_empty() {
            return Ok(0);
        }

        let count = events.len();
        tracing::debug!(count, "Publishing pending domain events");
        match self.sink.publish_all(events.clone()).await {
            Ok(()) => Ok(count),
            Err(err) => {
                let pending_count = {
                    let mut pending = lock(&self.pending);
                    let newer = std::mem::replace(&mut *pending, events);
                    pending.extend(newer);
                    pending.len()
                };
                tracing::error!(
                    count,
                    pending_count,
                    error = %err,
                    "Failed to publish domain events, kept for retry"
                );
                Err(err)
            }
        }
    }
}

/// Buffers domain events and flushes them through a [`DomainEventSink`].
///
/// Events that fail to publish are put back at the front of the buffer.
pub struct DomainEventPublisher {
    inner: Arc<PublisherInner>,
}

impl DomainEventPublisher {
    /// Create a publisher flushing into `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn DomainEventSink>, config: PublisherConfig) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                sink,
                config,
                pending: Mutex::new(Vec::new()),
                timer: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &PublisherConfig {
        &self.inner.config
    }

    /// Buffer one event.
    pub fn add_event(&self, event: DomainEvent) {
        tracing::debug!(
            event_id = %event.event_id,
            event_name = %event.event_name,
            aggregate_id = %event.aggregate_id,
            "Domain event added"
        );
        lock(&self.inner.pending).push(event);
        self.schedule_publish();
    }

    /// Buffer several events.
    pub fn add_events(&self, events: Vec<DomainEvent>) {
        tracing::debug!(count = events.len(), "Domain events added");
        lock(&self.inner.pending).extend(events);
        self.schedule_publish();
    }

    /// Publish everything buffered now. Returns how many events were published.
    ///
    /// # Errors
    ///
    /// Returns the sink error; the events stay buffered in their original order.
    pub async fn publish_now(&self) -> KernelResult<usize> {
        self.inner.publish_now().await
    }

    /// Number of buffered events.
    #[must_use]
    pub fn pending_event_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Distinct names of buffered events, sorted.
    #[must_use]
    pub fn pending_event_types(&self) -> Vec<String> {
        lock(&self.inner.pending)
            .iter()
            .map(|event| event.event_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Drop buffered events without publishing them.
    pub fn clear_pending_events(&self) {
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.abort();
        }
        let count = {
            let mut pending = lock(&self.inner.pending);
            let count = pending.len();
            pending.clear();
            count
        };
        tracing::debug!(count, "Pending domain events cleared");
    }

    /// Cancel the debounce timer and drop buffered events.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        self.clear_pending_events();
        tracing::debug!("Domain event publisher disposed");
    }

    fn schedule_publish(&self) {
        if !self.inner.config.auto_publish || self.inner.disposed.load(Ordering::Acquire) {
            return;
        }

        if self.pending_event_count() >= self.inner.config.batch_size.max(1) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                if let Err(err) = inner.publish_now().await {
                    tracing::warn!(error = %err, "Automatic domain event publish failed");
                }
            });
            return;
        }

        let mut timer = lock(&self.inner.timer);
        if timer.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let delay = self.inner.config.publish_delay;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A missing handle means publish_now or clear took over this flush.
            if lock(&inner.timer).take().is_none() {
                return;
            }
            if let Err(err) = inner.flush().await {
                tracing::warn!(error = %err, "Delayed domain event publish failed");
            }
        }));
    }
}

impl Drop for DomainEventPublisher {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
