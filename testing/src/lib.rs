//! # Wiz Kernel Testing
//!
//! Testing utilities and helpers for the Project Wiz kernel.
//!
//! This crate provides:
//! - Deterministic clocks
//! - A recording domain event sink that can be told to fail
//! - An ordered call log for asserting delivery order
//! - Property-based testing strategies for events
//!
//! ## Example
//!
//! ```
//! use wiz_kernel_testing::helpers::CallLog;
//!
//! let log = CallLog::new();
//! log.record("A");
//! log.record("B");
//! assert_eq!(log.entries(), vec!["A", "B"]);
//! ```

use chrono::{DateTime, Utc};
use wiz_kernel_core::environment::Clock;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use wiz_kernel_core::{DomainEvent, DomainEventSink, KernelError, KernelResult};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use wiz_kernel_testing::mocks::FixedClock;
    /// use wiz_kernel_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Clock that only moves when told to.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Domain event sink that records what it receives.
    ///
    /// `fail_next(n)` makes the next `n` calls fail without recording.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingSink {
        published: Arc<Mutex<Vec<DomainEvent>>>,
        failures_left: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl RecordingSink {
        /// Create an empty sink.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `n` publish calls.
        pub fn fail_next(&self, n: usize) {
            self.failures_left.store(n, Ordering::SeqCst);
        }

        /// Every event published successfully, in order.
        #[must_use]
        pub fn published(&self) -> Vec<DomainEvent> {
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Names of published events, in order.
        #[must_use]
        pub fn published_names(&self) -> Vec<String> {
            self.published()
                .into_iter()
                .map(|event| event.event_name)
                .collect()
        }

        /// Number of publish calls, failed ones included.
        #[must_use]
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn accept(&self, events: Vec<DomainEvent>) -> KernelResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let should_fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(KernelError::handler("sink unavailable"));
            }
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(events);
            Ok(())
        }
    }

    impl DomainEventSink for RecordingSink {
        fn publish(&self, event: DomainEvent) -> BoxFuture<'_, KernelResult<()>> {
            Box::pin(async move { self.accept(vec![event]) })
        }

        fn publish_all(&self, events: Vec<DomainEvent>) -> BoxFuture<'_, KernelResult<()>> {
            Box::pin(async move { self.accept(events) })
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use futures::future::{Ready, ready};
    use std::sync::{Arc, Mutex, PoisonError};
    use wiz_kernel_core::{Event, KernelResult};

    /// Ordered, shareable log of labels.
    #[derive(Debug, Clone, Default)]
    pub struct CallLog {
        entries: Arc<Mutex<Vec<String>>>,
    }

    impl CallLog {
        /// Create an empty log.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Append a label.
        pub fn record(&self, label: impl Into<String>) {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(label.into());
        }

        /// Labels recorded so far.
        #[must_use]
        pub fn entries(&self) -> Vec<String> {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Number of recorded labels.
        #[must_use]
        pub fn len(&self) -> usize {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }

        /// Whether nothing was recorded.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Forget every label.
        pub fn clear(&self) {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }

        /// An event handler that records `label` synchronously and succeeds.
        pub fn event_recorder(
            &self,
            label: &str,
        ) -> impl Fn(Event) -> Ready<KernelResult<()>> + Send + Sync + 'static {
            let log = self.clone();
            let label = label.to_owned();
            move |_event| {
                log.record(label.clone());
                ready(Ok(()))
            }
        }
    }

    /// Install a test-friendly tracing subscriber once per process.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::collection::hash_set;
    use proptest::prelude::*;
    use serde_json::json;
    use wiz_kernel_core::Event;

    /// Dotted event type names such as `user.created`.
    pub fn arb_event_type() -> impl Strategy<Value = String> {
        "[a-z]{1,8}\\.[a-z]{1,8}"
    }

    /// Events with a random type, id and small payload.
    pub fn arb_event() -> impl Strategy<Value = Event> {
        (arb_event_type(), "[a-z0-9]{1,12}", any::<i64>()).prop_map(|(event_type, id, n)| {
            Event::new(event_type, json!({ "n": n })).with_id(id)
        })
    }

    /// A non-empty set of distinct priorities.
    pub fn arb_priorities() -> impl Strategy<Value = Vec<i32>> {
        hash_set(-1000_i32..1000, 1..12).prop_map(|set| set.into_iter().collect())
    }
}

// Re-export commonly used items
pub use helpers::{CallLog, init_test_tracing};
pub use mocks::{FixedClock, ManualClock, RecordingSink, test_clock};
