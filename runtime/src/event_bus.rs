//! In-process publish/subscribe event bus.
//!
//! Subscribers register a handler for an event type with an optional filter,
//! a priority and once-semantics. Publishing delivers the event to every
//! matching subscriber:
//!
//! - in descending priority order,
//! - in bounded concurrent batches of `max_concurrent_handlers`,
//! - each handler started on the publishing task and raced against
//!   `handler_timeout`,
//! - with failures isolated and aggregated into an [`EventDispatchReport`].
//!
//! When every applicable handler fails the event is moved to the dead-letter
//! queue.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use wiz_kernel_core::Event;
//! use wiz_kernel_runtime::event_bus::{EventBus, EventBusConfig, SubscribeOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = EventBus::new(EventBusConfig::default());
//! let subscription = bus.subscribe(
//!     "user.created",
//!     |event: Event| async move {
//!         println!("welcome {}", event.data["name"]);
//!         Ok(())
//!     },
//!     SubscribeOptions::new().priority(10),
//! );
//!
//! let report = bus.publish(Event::new("user.created", json!({ "name": "Ada" }))).await.unwrap();
//! assert_eq!(report.success_count, 1);
//!
//! assert!(bus.unsubscribe(&subscription));
//! # }
//! ```

use crate::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::execution::run_inline;
use crate::metrics::EventBusMetrics;
use chrono::Utc;
use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use wiz_kernel_core::{Event, KernelError, KernelResult};

/// Type-erased event handler.
pub type EventHandlerFn = Arc<dyn Fn(Event) -> BoxFuture<'static, KernelResult<()>> + Send + Sync>;

/// Predicate deciding whether a subscriber sees an event.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Event bus configuration.
///
/// # Default Values
///
/// - `max_concurrent_handlers`: 10
/// - `handler_timeout`: 30 seconds
/// - `continue_on_error`: true
/// - `enable_dead_letter_queue`: true
/// - `dead_letter_queue_max_size`: 1000
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Handlers run concurrently in batches of this size
    pub max_concurrent_handlers: usize,
    /// Per-handler timeout
    pub handler_timeout: Duration,
    /// Keep delivering after a handler fails
    pub continue_on_error: bool,
    /// Dead-letter events every handler failed on
    pub enable_dead_letter_queue: bool,
    /// Capacity of the dead-letter queue
    pub dead_letter_queue_max_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 10,
            handler_timeout: Duration::from_secs(30),
            continue_on_error: true,
            enable_dead_letter_queue: true,
            dead_letter_queue_max_size: 1000,
        }
    }
}

impl EventBusConfig {
    /// Set the concurrent batch size.
    #[must_use]
    pub const fn with_max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = max;
        self
    }

    /// Set the per-handler timeout.
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set whether delivery continues after a handler failure.
    #[must_use]
    pub const fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Enable or disable the dead-letter queue.
    #[must_use]
    pub const fn with_dead_letter_queue(mut self, enabled: bool) -> Self {
        self.enable_dead_letter_queue = enabled;
        self
    }
}

/// Options for [`EventBus::subscribe`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    filter: Option<EventFilter>,
    once: bool,
    priority: i32,
}

impl SubscribeOptions {
    /// Default options: no filter, persistent, priority 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only deliver events the predicate accepts.
    #[must_use]
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Remove the subscription after its first delivery.
    #[must_use]
    pub const fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Delivery priority; higher runs first.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("filtered", &self.filter.is_some())
            .field("once", &self.once)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: String,
    event_type: String,
}

impl Subscription {
    /// Unique subscription id (`sub-{millis}-{n}`).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Event type the subscription listens to.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

#[derive(Clone)]
struct SubscriptionEntry {
    id: String,
    sequence: u64,
    handler: EventHandlerFn,
    filter: Option<EventFilter>,
    once: bool,
    priority: i32,
}

impl SubscriptionEntry {
    fn accepts(&self, event: &Event) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(event))
    }

    /// Whether `self` is delivered before `other`.
    fn precedes(&self, other: &Self) -> bool {
        self.priority > other.priority
            || (self.priority == other.priority && self.sequence < other.sequence)
    }
}

/// Outcome of delivering one event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDispatchReport {
    /// The delivered event.
    pub event: Event,
    /// Number of subscribers the event applied to.
    pub handler_count: usize,
    /// Handlers that completed successfully.
    pub success_count: usize,
    /// Handlers that failed, timed out or panicked.
    pub failure_count: usize,
    /// One error per failed handler.
    pub errors: Vec<KernelError>,
}

impl EventDispatchReport {
    fn empty(event: Event) -> Self {
        Self {
            event,
            handler_count: 0,
            success_count: 0,
            failure_count: 0,
            errors: Vec::new(),
        }
    }
}

/// Generic publish/subscribe event bus.
pub struct EventBus {
    config: EventBusConfig,
    subscriptions: Mutex<HashMap<String, Vec<SubscriptionEntry>>>,
    next_id: AtomicU64,
    dead_letters: DeadLetterQueue<Event>,
}

impl EventBus {
    /// Create an event bus.
    #[must_use]
    pub fn new(config: EventBusConfig) -> Self {
        let dead_letters = DeadLetterQueue::new(config.dead_letter_queue_max_size);
        Self {
            config,
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dead_letters,
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Subscribe `handler` to events of `event_type`.
    ///
    /// Subscribers are kept sorted by descending priority; equal priorities
    /// keep subscription order.
    pub fn subscribe<F, Fut>(
        &self,
        event_type: impl Into<String>,
        handler: F,
        options: SubscribeOptions,
    ) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = KernelResult<()>> + Send + 'static,
    {
        let handler: EventHandlerFn =
            Arc::new(move |event: Event| -> BoxFuture<'static, KernelResult<()>> {
                Box::pin(handler(event))
            });
        self.subscribe_boxed(event_type.into(), handler, options)
    }

    /// Subscribe an already type-erased handler.
    pub fn subscribe_boxed(
        &self,
        event_type: String,
        handler: EventHandlerFn,
        options: SubscribeOptions,
    ) -> Subscription {
        let sequence = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("sub-{}-{sequence}", Utc::now().timestamp_millis());
        let entry = SubscriptionEntry {
            id: id.clone(),
            sequence,
            handler,
            filter: options.filter,
            once: options.once,
            priority: options.priority,
        };

        let mut subscriptions = self.lock();
        let list = subscriptions.entry(event_type.clone()).or_default();
        let position = list.partition_point(|existing| existing.precedes(&entry));
        list.insert(position, entry);

        tracing::debug!(
            subscription_id = %id,
            event_type = %event_type,
            priority = options.priority,
            once = options.once,
            "Event subscription added"
        );

        Subscription { id, event_type }
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut subscriptions = self.lock();
        let Some(list) = subscriptions.get_mut(&subscription.event_type) else {
            return false;
        };

        let before = list.len();
        list.retain(|entry| entry.id != subscription.id);
        let removed = list.len() < before;

        if list.is_empty() {
            subscriptions.remove(&subscription.event_type);
        }

        if removed {
            tracing::debug!(
                subscription_id = %subscription.id,
                event_type = %subscription.event_type,
                "Event subscription removed"
            );
        }
        removed
    }

    /// Deliver `event` to every matching subscriber.
    ///
    /// Individual handler failures are aggregated into the report.
    ///
    /// # Errors
    ///
    /// With `continue_on_error` disabled, the first handler failure aborts the
    /// remaining batches and is returned. Once-subscriptions in the skipped
    /// batches stay subscribed.
    pub async fn publish(&self, event: Event) -> KernelResult<EventDispatchReport> {
        let started = Instant::now();
        let applicable = self.claim_subscribers(&event);

        if applicable.is_empty() {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                "No subscribers for event"
            );
            return Ok(EventDispatchReport::empty(event));
        }

        let batch_size = self.config.max_concurrent_handlers.max(1);
        let timeout = self.config.handler_timeout;
        let mut report = EventDispatchReport {
            handler_count: applicable.len(),
            ..EventDispatchReport::empty(event)
        };
        let mut aborted = None;
        let mut delivered = 0;

        for batch in applicable.chunks(batch_size) {
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|entry| run_inline("Handler", timeout, (entry.handler)(report.event.clone()))),
            )
            .await;
            delivered += batch.len();

            for (entry, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => report.success_count += 1,
                    Err(err) => {
                        tracing::warn!(
                            subscription_id = %entry.id,
                            event_id = %report.event.id,
                            event_type = %report.event.event_type,
                            error = %err,
                            "Event handler failed"
                        );
                        report.failure_count += 1;
                        aborted.get_or_insert_with(|| err.clone());
                        report.errors.push(err);
                    }
                }
            }

            if !self.config.continue_on_error && aborted.is_some() {
                break;
            }
        }

        if delivered < applicable.len() {
            self.restore_once(&report.event.event_type, &applicable[delivered..]);
        }

        if report.failure_count == report.handler_count && self.config.enable_dead_letter_queue {
            let reasons: Vec<String> = report.errors.iter().map(ToString::to_string).collect();
            self.dead_letters
                .push(report.event.clone(), reasons.join("; "));
            EventBusMetrics::record_dead_letter();
            tracing::warn!(
                event_id = %report.event.id,
                event_type = %report.event.event_type,
                "All handlers failed, event moved to dead-letter queue"
            );
        }

        EventBusMetrics::record_publish(report.failure_count, started.elapsed());
        tracing::debug!(
            event_id = %report.event.id,
            event_type = %report.event.event_type,
            handler_count = report.handler_count,
            success_count = report.success_count,
            failure_count = report.failure_count,
            duration_ms = started.elapsed().as_millis(),
            "Event published"
        );

        match aborted {
            Some(err) if !self.config.continue_on_error => Err(err),
            _ => Ok(report),
        }
    }

    /// Event types with at least one subscriber, sorted.
    #[must_use]
    pub fn registered_event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.lock().keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of subscriptions for one type, or for all types.
    #[must_use]
    pub fn subscription_count(&self, event_type: Option<&str>) -> usize {
        let subscriptions = self.lock();
        match event_type {
            Some(event_type) => subscriptions.get(event_type).map_or(0, Vec::len),
            None => subscriptions.values().map(Vec::len).sum(),
        }
    }

    /// Snapshot of the dead-letter queue, oldest first.
    #[must_use]
    pub fn dead_letter_queue(&self) -> Vec<DeadLetter<Event>> {
        self.dead_letters.entries()
    }

    /// Empty the dead-letter queue, returning its entries.
    pub fn clear_dead_letter_queue(&self) -> Vec<DeadLetter<Event>> {
        self.dead_letters.drain()
    }

    /// Snapshot the matching subscribers and claim once-subscriptions.
    ///
    /// A once-subscription is removed in the same step it is selected, so two
    /// concurrent publishes cannot both deliver to it.
    fn claim_subscribers(&self, event: &Event) -> Vec<SubscriptionEntry> {
        let snapshot = self
            .lock()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        let matching: Vec<SubscriptionEntry> = snapshot
            .into_iter()
            .filter(|entry| entry.accepts(event))
            .collect();

        if !matching.iter().any(|entry| entry.once) {
            return matching;
        }

        let mut subscriptions = self.lock();
        let Some(list) = subscriptions.get_mut(&event.event_type) else {
            return matching.into_iter().filter(|entry| !entry.once).collect();
        };

        let mut claimed = Vec::with_capacity(matching.len());
        for entry in matching {
            if !entry.once {
                claimed.push(entry);
                continue;
            }
            if let Some(position) = list.iter().position(|existing| existing.id == entry.id) {
                list.remove(position);
                claimed.push(entry);
            }
        }
        if list.is_empty() {
            subscriptions.remove(&event.event_type);
        }
        claimed
    }

    /// Put back once-subscriptions that were claimed but never reached.
    fn restore_once(&self, event_type: &str, unreached: &[SubscriptionEntry]) {
        let mut subscriptions = self.lock();
        for entry in unreached.iter().filter(|entry| entry.once) {
            let list = subscriptions.entry(event_type.to_owned()).or_default();
            let position = list.partition_point(|existing| existing.precedes(entry));
            list.insert(position, entry.clone());
            tracing::debug!(subscription_id = %entry.id, event_type, "Once subscription kept after aborted publish");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<SubscriptionEntry>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("subscriptions", &self.subscription_count(None))
            .field("dead_letters", &self.dead_letters.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use wiz_kernel_testing::helpers::CallLog;

    fn explode() -> KernelResult<()> {
        panic!("handler bug")
    }

    fn user_created(id: &str) -> Event {
        Event::new("user.created", json!({ "name": "Ada" })).with_id(id)
    }

    #[tokio::test]
    async fn delivers_in_descending_priority_and_honours_unsubscribe() {
        let bus = EventBus::default();
        let log = CallLog::new();

        let b = bus.subscribe(
            "user.created",
            log.event_recorder("B"),
            SubscribeOptions::new().priority(5),
        );
        bus.subscribe(
            "user.created",
            log.event_recorder("A"),
            SubscribeOptions::new().priority(10),
        );

        let report = bus.publish(user_created("e1")).await.unwrap();
        assert_eq!(report.handler_count, 2);
        assert_eq!(report.success_count, 2);
        assert_eq!(log.entries(), vec!["A", "B"]);

        log.clear();
        assert!(bus.unsubscribe(&b));

        bus.publish(user_created("e2")).await.unwrap();
        assert_eq!(log.entries(), vec!["A"]);
    }

    #[tokio::test]
    async fn equal_priorities_keep_subscription_order() {
        let bus = EventBus::default();
        let log = CallLog::new();
        for label in ["first", "second", "third"] {
            bus.subscribe("tick", log.event_recorder(label), SubscribeOptions::new());
        }

        bus.publish(Event::new("tick", json!({}))).await.unwrap();
        assert_eq!(log.entries(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn once_subscription_fires_exactly_once() {
        let bus = EventBus::default();
        let log = CallLog::new();
        bus.subscribe("user.created", log.event_recorder("once"), SubscribeOptions::new().once());

        let first = bus.publish(user_created("e1")).await.unwrap();
        let second = bus.publish(user_created("e2")).await.unwrap();

        assert_eq!(first.handler_count, 1);
        assert_eq!(second.handler_count, 0);
        assert_eq!(log.entries(), vec!["once"]);
        assert!(bus.registered_event_types().is_empty());
    }

    #[tokio::test]
    async fn once_subscription_is_removed_even_when_it_fails() {
        let bus = EventBus::default();
        bus.subscribe(
            "user.created",
            |_event| async { Err(KernelError::handler("nope")) },
            SubscribeOptions::new().once(),
        );

        bus.publish(user_created("e1")).await.unwrap();
        assert_eq!(bus.subscription_count(Some("user.created")), 0);
    }

    #[tokio::test]
    async fn filtered_out_once_subscription_is_kept() {
        let bus = EventBus::default();
        let log = CallLog::new();
        bus.subscribe(
            "user.created",
            log.event_recorder("vip"),
            SubscribeOptions::new()
                .once()
                .filter(|event| event.data["vip"] == json!(true)),
        );

        bus.publish(user_created("regular")).await.unwrap();
        assert_eq!(bus.subscription_count(Some("user.created")), 1);

        bus.publish(Event::new("user.created", json!({ "vip": true })))
            .await
            .unwrap();
        assert_eq!(log.entries(), vec!["vip"]);
        assert_eq!(bus.subscription_count(None), 0);
    }

    #[tokio::test]
    async fn rejecting_filter_never_runs_handler() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bus.subscribe(
            "user.created",
            move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            SubscribeOptions::new().filter(|_| false),
        );

        for n in 0..20 {
            let report = bus.publish(user_created(&format!("e{n}"))).await.unwrap();
            assert_eq!(report.handler_count, 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_subscribers_yields_empty_success() {
        let bus = EventBus::default();
        let report = bus.publish(user_created("e1")).await.unwrap();

        assert_eq!(report.handler_count, 0);
        assert_eq!(report.success_count, 0);
        assert_eq!(report.failure_count, 0);
        assert!(report.errors.is_empty());
        assert!(bus.dead_letter_queue().is_empty());
    }

    #[tokio::test]
    async fn total_failure_dead_letters_the_event() {
        let bus = EventBus::default();
        bus.subscribe(
            "user.created",
            |_event| async { Err(KernelError::handler("db down")) },
            SubscribeOptions::new(),
        );
        bus.subscribe(
            "user.created",
            |_event| async { Err(KernelError::handler("mail down")) },
            SubscribeOptions::new(),
        );

        let report = bus.publish(user_created("e1")).await.unwrap();
        assert_eq!(report.failure_count, 2);
        assert_eq!(report.errors.len(), 2);

        let dead = bus.dead_letter_queue();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload.id, "e1");
        assert_eq!(dead[0].error_message, "db down; mail down");

        assert_eq!(bus.clear_dead_letter_queue().len(), 1);
        assert!(bus.dead_letter_queue().is_empty());
    }

    #[tokio::test]
    async fn partial_failure_is_not_dead_lettered() {
        let bus = EventBus::default();
        bus.subscribe("user.created", |_event| async { Ok(()) }, SubscribeOptions::new());
        bus.subscribe(
            "user.created",
            |_event| async { Err(KernelError::handler("boom")) },
            SubscribeOptions::new(),
        );

        let report = bus.publish(user_created("e1")).await.unwrap();
        assert_eq!(report.success_count, 1);
        assert_eq!(report.failure_count, 1);
        assert!(bus.dead_letter_queue().is_empty());
    }

    #[tokio::test]
    async fn dead_letter_queue_can_be_disabled() {
        let bus = EventBus::new(EventBusConfig::default().with_dead_letter_queue(false));
        bus.subscribe(
            "user.created",
            |_event| async { Err(KernelError::handler("boom")) },
            SubscribeOptions::new(),
        );

        bus.publish(user_created("e1")).await.unwrap();
        assert!(bus.dead_letter_queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let bus = EventBus::new(
            EventBusConfig::default().with_handler_timeout(Duration::from_millis(100)),
        );
        bus.subscribe(
            "user.created",
            |_event| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            SubscribeOptions::new(),
        );

        let report = bus.publish(user_created("e1")).await.unwrap();
        assert_eq!(report.failure_count, 1);
        assert!(report.errors[0].to_string().contains("Handler timeout"));
        assert_eq!(bus.dead_letter_queue().len(), 1);
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let bus = EventBus::default();
        bus.subscribe(
            "user.created",
            |_event| async { explode() },
            SubscribeOptions::new(),
        );
        bus.subscribe("user.created", |_event| async { Ok(()) }, SubscribeOptions::new());

        let report = bus.publish(user_created("e1")).await.unwrap();
        assert_eq!(report.success_count, 1);
        assert_eq!(report.failure_count, 1);
        assert!(matches!(report.errors[0], KernelError::Panicked { .. }));
    }

    #[tokio::test]
    async fn stop_on_error_aborts_remaining_batches() {
        let bus = EventBus::new(
            EventBusConfig::default()
                .with_continue_on_error(false)
                .with_max_concurrent_handlers(1),
        );
        let log = CallLog::new();
        bus.subscribe(
            "user.created",
            |_event| async { Err(KernelError::handler("first fails")) },
            SubscribeOptions::new().priority(10),
        );
        bus.subscribe("user.created", log.event_recorder("later"), SubscribeOptions::new());

        let result = bus.publish(user_created("e1")).await;
        assert_eq!(result, Err(KernelError::handler("first fails")));
        assert!(log.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn batches_bound_concurrency() {
        let bus = EventBus::new(EventBusConfig::default().with_max_concurrent_handlers(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            bus.subscribe(
                "load",
                move |_event| {
                    let running = Arc::clone(&running);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                SubscribeOptions::new(),
            );
        }

        let report = bus.publish(Event::new("load", json!({}))).await.unwrap();
        assert_eq!(report.success_count, 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_prunes_and_reports() {
        let bus = EventBus::default();
        let subscription = bus.subscribe("a", |_event| async { Ok(()) }, SubscribeOptions::new());
        bus.subscribe("b", |_event| async { Ok(()) }, SubscribeOptions::new());

        assert_eq!(bus.registered_event_types(), vec!["a", "b"]);
        assert!(subscription.id().starts_with("sub-"));
        assert_eq!(subscription.event_type(), "a");

        assert!(bus.unsubscribe(&subscription));
        assert!(!bus.unsubscribe(&subscription));
        assert_eq!(bus.registered_event_types(), vec!["b"]);
        assert_eq!(bus.subscription_count(None), 1);
    }

    #[tokio::test]
    async fn aborted_publish_keeps_unreached_once_subscriptions() {
        let bus = EventBus::new(
            EventBusConfig::default()
                .with_continue_on_error(false)
                .with_max_concurrent_handlers(1),
        );
        let log = CallLog::new();
        bus.subscribe(
            "user.created",
            |_event| async { Err(KernelError::handler("first fails")) },
            SubscribeOptions::new().priority(10).once(),
        );
        bus.subscribe("user.created", log.event_recorder("plain"), SubscribeOptions::new());
        bus.subscribe(
            "user.created",
            log.event_recorder("once"),
            SubscribeOptions::new().once(),
        );

        assert!(bus.publish(user_created("e1")).await.is_err());
        assert!(log.entries().is_empty());
        assert_eq!(bus.subscription_count(Some("user.created")), 2);

        let report = bus.publish(user_created("e2")).await.unwrap();
        assert_eq!(report.success_count, 2);
        assert_eq!(log.entries(), vec!["plain", "once"]);
        assert_eq!(bus.subscription_count(Some("user.created")), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn priority_order_holds_on_a_multi_threaded_runtime() {
        let bus = EventBus::default();
        let log = CallLog::new();
        for (label, priority) in [("C", 1), ("A", 10), ("B", 5)] {
            bus.subscribe(
                "user.created",
                log.event_recorder(label),
                SubscribeOptions::new().priority(priority),
            );
        }

        for n in 0..50 {
            log.clear();
            bus.publish(user_created(&format!("e{n}"))).await.unwrap();
            assert_eq!(log.entries(), vec!["A", "B", "C"], "publish {n}");
        }
    }
}
