//! Delivery strategies over the [`EventBus`].
//!
//! | Strategy  | Caller waits for delivery | Result means |
//! |-----------|---------------------------|--------------|
//! | Immediate | yes | delivered (after retries) |
//! | Async     | no  | accepted |
//! | Batched   | only when the dispatch fills the batch | buffered, or the flushed batch outcome |
//! | Delayed   | no  | scheduled |
//!
//! Every strategy delivers through the same retry-wrapped publish. A delivery
//! attempt fails when [`EventBus::publish`] returns an error; with the bus's
//! `continue_on_error` disabled that includes any handler failure.
//!
//! Delayed events sit in a time-ordered list scanned every 100ms by a
//! background task started on the first delayed dispatch.

use crate::event_bus::EventBus;
use crate::metrics::DispatcherMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use wiz_kernel_core::{Event, KernelError, KernelResult};

const DELAYED_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// How an event is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStrategy {
    /// Publish now and wait for the outcome.
    Immediate,
    /// Publish in the background; acknowledge immediately.
    Async,
    /// Buffer per event type; flush on size or timeout.
    Batched,
    /// Publish once the configured delay has elapsed.
    Delayed,
}

impl DispatchStrategy {
    /// Lowercase name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Async => "async",
            Self::Batched => "batched",
            Self::Delayed => "delayed",
        }
    }
}

/// Options for [`EventDispatcher::dispatch`].
///
/// # Default Values
///
/// - `strategy`: Immediate
/// - `delay`: 1000ms
/// - `batch_size`: 10
/// - `batch_timeout`: 5000ms
/// - `retry`: one attempt, 1000ms backoff, not exponential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOptions {
    /// Delivery strategy
    pub strategy: DispatchStrategy,
    /// Delay for [`DispatchStrategy::Delayed`]
    pub delay: Duration,
    /// Flush threshold for [`DispatchStrategy::Batched`]
    pub batch_size: usize,
    /// Flush timeout for [`DispatchStrategy::Batched`]
    pub batch_timeout: Duration,
    /// Retry policy applied to each delivery
    pub retry: RetryPolicy,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            strategy: DispatchStrategy::Immediate,
            delay: Duration::from_millis(1000),
            batch_size: 10,
            batch_timeout: Duration::from_millis(5000),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchOptions {
    /// Immediate delivery.
    #[must_use]
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Fire-and-forget delivery.
    #[must_use]
    pub fn asynchronous() -> Self {
        Self {
            strategy: DispatchStrategy::Async,
            ..Self::default()
        }
    }

    /// Batched delivery.
    #[must_use]
    pub fn batched(batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            strategy: DispatchStrategy::Batched,
            batch_size,
            batch_timeout,
            ..Self::default()
        }
    }

    /// Delayed delivery.
    #[must_use]
    pub fn delayed(delay: Duration) -> Self {
        Self {
            strategy: DispatchStrategy::Delayed,
            delay,
            ..Self::default()
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Outcome of a dispatch call.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    /// Events covered by this report.
    pub events: Vec<Event>,
    /// Events delivered, accepted or scheduled.
    pub success_count: usize,
    /// Events whose delivery failed.
    pub failure_count: usize,
    /// Strategy used.
    pub strategy: DispatchStrategy,
    /// Time spent inside the dispatch call.
    pub processing_time: Duration,
}

impl DispatchReport {
    fn accepted(event: Event, strategy: DispatchStrategy, started: Instant) -> Self {
        Self {
            events: vec![event],
            success_count: 1,
            failure_count: 0,
            strategy,
            processing_time: started.elapsed(),
        }
    }
}

struct PendingBatch {
    events: Vec<Event>,
    retry: RetryPolicy,
    timer: Option<JoinHandle<()>>,
}

struct DelayedEvent {
    event: Event,
    execute_at: Instant,
    retry: RetryPolicy,
}

struct Inner {
    bus: Arc<EventBus>,
    batches: Mutex<HashMap<String, PendingBatch>>,
    delayed: Mutex<Vec<DelayedEvent>>,
    disposed: AtomicBool,
}

impl Inner {
    async fn deliver(&self, event: &Event, retry: &RetryPolicy) -> KernelResult<()> {
        retry_with_backoff(retry, || self.bus.publish(event.clone()))
            .await
            .map(|_| ())
    }

    async fn process_batch(&self, event_type: &str, batch: Vec<Event>, retry: &RetryPolicy) -> DispatchReport {
        let started = Instant::now();
        let outcomes = join_all(batch.iter().map(|event| self.deliver(event, retry))).await;

        let mut failure_count = 0;
        for (event, outcome) in batch.iter().zip(&outcomes) {
            if let Err(err) = outcome {
                failure_count += 1;
                tracing::error!(
                    event_id = %event.id,
                    event_type,
                    error = %err,
                    "Batched event delivery failed"
                );
            }
        }

        tracing::debug!(event_type, size = batch.len(), failure_count, "Batch flushed");
        DispatchReport {
            success_count: batch.len() - failure_count,
            failure_count,
            events: batch,
            strategy: DispatchStrategy::Batched,
            processing_time: started.elapsed(),
        }
    }

    fn take_batch(&self, event_type: &str) -> Option<PendingBatch> {
        let batch = lock(&self.batches).remove(event_type)?;
        if let Some(timer) = &batch.timer {
            timer.abort();
        }
        Some(batch)
    }

    fn take_due(&self) -> Vec<DelayedEvent> {
        let now = Instant::now();
        let mut delayed = lock(&self.delayed);
        let due = delayed.partition_point(|entry| entry.execute_at <= now);
        delayed.drain(..due).collect()
    }

    async fn dispatch_due(&self) {
        let due = self.take_due();
        if due.is_empty() {
            return;
        }
        join_all(due.into_iter().map(|entry| async move {
            if let Err(err) = self.deliver(&entry.event, &entry.retry).await {
                tracing::error!(
                    event_id = %entry.event.id,
                    event_type = %entry.event.event_type,
                    error = %err,
                    "Delayed event delivery failed"
                );
            }
        }))
        .await;
    }
}

/// Strategy layer over the event bus.
pub struct EventDispatcher {
    inner: Arc<Inner>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    /// Create a dispatcher delivering through `bus`.
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                batches: Mutex::new(HashMap::new()),
                delayed: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
            scanner: Mutex::new(None),
        }
    }

    /// Dispatch one event with the given options.
    ///
    /// # Errors
    ///
    /// - Immediate: the last delivery error once retries are exhausted.
    /// - Any strategy: [`KernelError::Internal`] after [`EventDispatcher::dispose`].
    pub async fn dispatch(&self, event: Event, options: &DispatchOptions) -> KernelResult<DispatchReport> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(KernelError::Internal(
                "Event dispatcher has been disposed".to_owned(),
            ));
        }

        let started = Instant::now();
        DispatcherMetrics::record_dispatch(options.strategy.as_str(), 1);

        match options.strategy {
            DispatchStrategy::Immediate => {
                self.inner.deliver(&event, &options.retry).await?;
                Ok(DispatchReport::accepted(event, DispatchStrategy::Immediate, started))
            }
            DispatchStrategy::Async => {
                let inner = Arc::clone(&self.inner);
                let retry = options.retry.clone();
                let background = event.clone();
                tokio::spawn(async move {
                    if let Err(err) = inner.deliver(&background, &retry).await {
                        tracing::error!(
                            event_id = %background.id,
                            event_type = %background.event_type,
                            error = %err,
                            "Async event delivery failed"
                        );
                    }
                });
                Ok(DispatchReport::accepted(event, DispatchStrategy::Async, started))
            }
            DispatchStrategy::Batched => Ok(self.enqueue_batched(event, options, started).await),
            DispatchStrategy::Delayed => {
                self.schedule_delayed(event.clone(), options);
                Ok(DispatchReport::accepted(event, DispatchStrategy::Delayed, started))
            }
        }
    }

    /// Dispatch several events concurrently and aggregate the outcome.
    ///
    /// A failed dispatch counts as one failure; this call itself never fails.
    pub async fn dispatch_all(&self, events: Vec<Event>, options: &DispatchOptions) -> DispatchReport {
        let started = Instant::now();
        let outcomes = join_all(
            events
                .iter()
                .map(|event| self.dispatch(event.clone(), options)),
        )
        .await;

        let mut report = DispatchReport {
            events,
            success_count: 0,
            failure_count: 0,
            strategy: options.strategy,
            processing_time: Duration::ZERO,
        };
        for outcome in outcomes {
            match outcome {
                Ok(partial) => {
                    report.success_count += partial.success_count;
                    report.failure_count += partial.failure_count;
                }
                Err(_) => report.failure_count += 1,
            }
        }
        report.processing_time = started.elapsed();
        report
    }

    /// Deliver every buffered batch now.
    pub async fn flush_batches(&self) -> DispatchReport {
        let started = Instant::now();
        let pending: Vec<(String, PendingBatch)> = lock(&self.inner.batches).drain().collect();

        let mut report = DispatchReport {
            events: Vec::new(),
            success_count: 0,
            failure_count: 0,
            strategy: DispatchStrategy::Batched,
            processing_time: Duration::ZERO,
        };
        for (event_type, batch) in pending {
            if let Some(timer) = &batch.timer {
                timer.abort();
            }
            let flushed = self
                .inner
                .process_batch(&event_type, batch.events, &batch.retry)
                .await;
            report.success_count += flushed.success_count;
            report.failure_count += flushed.failure_count;
            report.events.extend(flushed.events);
        }
        report.processing_time = started.elapsed();
        report
    }

    /// Events waiting in batches.
    #[must_use]
    pub fn pending_batch_count(&self) -> usize {
        lock(&self.inner.batches)
            .values()
            .map(|batch| batch.events.len())
            .sum()
    }

    /// Events waiting for their delay to elapse.
    #[must_use]
    pub fn pending_delayed_count(&self) -> usize {
        lock(&self.inner.delayed).len()
    }

    /// Stop background work and drop everything still pending.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        if let Some(scanner) = lock(&self.scanner).take() {
            scanner.abort();
        }

        let batches: Vec<PendingBatch> = lock(&self.inner.batches).drain().map(|(_, b)| b).collect();
        let dropped_batched: usize = batches.iter().map(|batch| batch.events.len()).sum();
        for batch in &batches {
            if let Some(timer) = &batch.timer {
                timer.abort();
            }
        }

        let dropped_delayed = {
            let mut delayed = lock(&self.inner.delayed);
            let count = delayed.len();
            delayed.clear();
            count
        };

        tracing::info!(dropped_batched, dropped_delayed, "Event dispatcher disposed");
    }

    async fn enqueue_batched(&self, event: Event, options: &DispatchOptions, started: Instant) -> DispatchReport {
        let event_type = event.event_type.clone();
        let full = {
            let mut batches = lock(&self.inner.batches);
            let batch = batches
                .entry(event_type.clone())
                .or_insert_with(|| PendingBatch {
                    events: Vec::new(),
                    retry: options.retry.clone(),
                    timer: None,
                });
            batch.events.push(event.clone());

            if batch.events.len() >= options.batch_size.max(1) {
                true
            } else {
                if batch.timer.is_none() {
                    batch.timer = Some(self.spawn_batch_timer(event_type.clone(), options.batch_timeout));
                }
                false
            }
        };

        if full {
            if let Some(batch) = self.inner.take_batch(&event_type) {
                return self
                    .inner
                    .process_batch(&event_type, batch.events, &batch.retry)
                    .await;
            }
        }
        DispatchReport::accepted(event, DispatchStrategy::Batched, started)
    }

    fn spawn_batch_timer(&self, event_type: String, timeout: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let batch = lock(&inner.batches).remove(&event_type);
            if let Some(batch) = batch {
                inner.process_batch(&event_type, batch.events, &batch.retry).await;
            }
        })
    }

    fn schedule_delayed(&self, event: Event, options: &DispatchOptions) {
        let entry = DelayedEvent {
            event,
            execute_at: Instant::now() + options.delay,
            retry: options.retry.clone(),
        };
        {
            let mut delayed = lock(&self.inner.delayed);
            let position = delayed.partition_point(|existing| existing.execute_at <= entry.execute_at);
            delayed.insert(position, entry);
        }
        self.ensure_scanner();
    }

    fn ensure_scanner(&self) {
        let mut scanner = lock(&self.scanner);
        if scanner.is_some() {
            return;
        }
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        *scanner = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(DELAYED_SCAN_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.dispatch_due().await;
            }
        }));
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        if let Some(scanner) = lock(&self.scanner).take() {
            scanner.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
