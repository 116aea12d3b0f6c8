//! Domain event persistence contracts.
//!
//! [`DomainEventSink`] is the narrow, domain-facing publishing interface used by
//! the event publisher and by command handlers. [`EventStore`] retains domain
//! events for later lookup by aggregate or by event name.

use crate::error::KernelResult;
use crate::event::DomainEvent;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Accepts domain events for delivery.
pub trait DomainEventSink: Send + Sync {
    /// Publish a single event.
    fn publish(&self, event: DomainEvent) -> BoxFuture<'_, KernelResult<()>>;

    /// Publish a batch; fails if any event fails.
    fn publish_all(&self, events: Vec<DomainEvent>) -> BoxFuture<'_, KernelResult<()>>;
}

/// Counters describing the contents of an [`EventStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStoreStats {
    /// Number of retained events.
    pub total_events: usize,
    /// Distinct aggregate ids.
    pub unique_aggregates: usize,
    /// Distinct event names.
    pub unique_event_types: usize,
    /// Occurrence time of the oldest retained event.
    pub oldest_event: Option<DateTime<Utc>>,
    /// Occurrence time of the newest retained event.
    pub newest_event: Option<DateTime<Utc>>,
}

/// Retains domain events and answers lookups over them.
///
/// Trait methods return boxed futures so the store can be shared as
/// `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Retain one event.
    fn save(&self, event: DomainEvent) -> BoxFuture<'_, KernelResult<()>>;

    /// Retain several events in order.
    fn save_all(&self, events: Vec<DomainEvent>) -> BoxFuture<'_, KernelResult<()>>;

    /// Events of one aggregate ordered by version, optionally from `from_version` on.
    fn events_for_aggregate<'a>(
        &'a self,
        aggregate_id: &'a str,
        from_version: Option<u64>,
    ) -> BoxFuture<'a, KernelResult<Vec<DomainEvent>>>;

    /// Events with one name ordered by occurrence, optionally from `from` on.
    fn events_by_type<'a>(
        &'a self,
        event_name: &'a str,
        from: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, KernelResult<Vec<DomainEvent>>>;

    /// A page of all events ordered by occurrence.
    fn all_events(&self, limit: usize, offset: usize)
    -> BoxFuture<'_, KernelResult<Vec<DomainEvent>>>;

    /// Summary counters.
    fn stats(&self) -> BoxFuture<'_, KernelResult<EventStoreStats>>;

    /// Drop everything.
    fn clear(&self) -> BoxFuture<'_, KernelResult<()>>;
}
