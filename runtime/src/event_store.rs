//! In-memory domain event store.
//!
//! Events are kept in arrival order and indexed by aggregate id and by event
//! name. Every save prunes events older than the retention window.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use wiz_kernel_core::{DomainEvent, EventStore};
//! use wiz_kernel_runtime::event_store::InMemoryEventStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = InMemoryEventStore::default();
//! store.save(DomainEvent::new("agent.created", "agent-1", 1, json!({}))).await.unwrap();
//!
//! let history = store.events_for_aggregate("agent-1", None).await.unwrap();
//! assert_eq!(history.len(), 1);
//! # }
//! ```

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use wiz_kernel_core::environment::{Clock, SystemClock};
use wiz_kernel_core::{DomainEvent, EventStore, EventStoreStats, KernelResult};

/// In-memory event store configuration.
///
/// # Default Values
///
/// - `max_query_size`: 1000
/// - `retention_days`: 365 (0 keeps events forever)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStoreConfig {
    /// Upper bound on events returned by one query
    pub max_query_size: usize,
    /// Age in days after which events are pruned
    pub retention_days: u32,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            max_query_size: 1000,
            retention_days: 365,
        }
    }
}

impl EventStoreConfig {
    /// Set the query size cap.
    #[must_use]
    pub const fn with_max_query_size(mut self, max_query_size: usize) -> Self {
        self.max_query_size = max_query_size;
        self
    }

    /// Set the retention window.
    #[must_use]
    pub const fn with_retention_days(mut self, retention_days: u32) -> Self {
        self.retention_days = retention_days;
        self
    }
}

#[derive(Debug, Default)]
struct Entries {
    next_sequence: u64,
    events: BTreeMap<u64, DomainEvent>,
    by_aggregate: HashMap<String, Vec<u64>>,
    by_name: HashMap<String, Vec<u64>>,
}

impl Entries {
    fn insert(&mut self, event: DomainEvent) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.by_aggregate
            .entry(event.aggregate_id.clone())
            .or_default()
            .push(sequence);
        self.by_name
            .entry(event.event_name.clone())
            .or_default()
            .push(sequence);
        self.events.insert(sequence, event);
    }

    fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let expired: Vec<u64> = self
            .events
            .iter()
            .filter(|(_, event)| event.occurred_on < cutoff)
            .map(|(sequence, _)| *sequence)
            .collect();

        for sequence in &expired {
            if let Some(event) = self.events.remove(sequence) {
                remove_from_index(&mut self.by_aggregate, &event.aggregate_id, *sequence);
                remove_from_index(&mut self.by_name, &event.event_name, *sequence);
            }
        }
        expired.len()
    }

    fn collect(&self, sequences: Option<&Vec<u64>>) -> Vec<DomainEvent> {
        sequences
            .into_iter()
            .flatten()
            .filter_map(|sequence| self.events.get(sequence).cloned())
            .collect()
    }
}

fn remove_from_index(index: &mut HashMap<String, Vec<u64>>, key: &str, sequence: u64) {
    if let Some(sequences) = index.get_mut(key) {
        sequences.retain(|existing| *existing != sequence);
        if sequences.is_empty() {
            index.remove(key);
        }
    }
}

/// Domain event store backed by process memory.
#[derive(Clone)]
pub struct InMemoryEventStore {
    config: EventStoreConfig,
    clock: Arc<dyn Clock>,
    entries: Arc<RwLock<Entries>>,
}

impl InMemoryEventStore {
    /// Create a store using wall-clock time for retention.
    #[must_use]
    pub fn new(config: EventStoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a store measuring retention against `clock`.
    #[must_use]
    pub fn with_clock(config: EventStoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: Arc::new(RwLock::new(Entries::default())),
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    fn store(&self, events: Vec<DomainEvent>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            tracing::debug!(
                event_id = %event.event_id,
                event_name = %event.event_name,
                aggregate_id = %event.aggregate_id,
                version = event.version,
                "Domain event stored"
            );
            entries.insert(event);
        }

        if self.config.retention_days > 0 {
            let cutoff = self.clock.now() - chrono::Duration::days(i64::from(self.config.retention_days));
            let removed = entries.prune_before(cutoff);
            if removed > 0 {
                tracing::info!(
                    removed,
                    retention_days = self.config.retention_days,
                    "Expired domain events pruned"
                );
            }
        }
    }

    fn cap(&self, mut events: Vec<DomainEvent>, query: &str) -> Vec<DomainEvent> {
        if events.len() > self.config.max_query_size {
            tracing::warn!(
                query,
                found = events.len(),
                max_query_size = self.config.max_query_size,
                "Event query truncated"
            );
            events.truncate(self.config.max_query_size);
        }
        events
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(EventStoreConfig::default())
    }
}

impl EventStore for InMemoryEventStore {
    fn save(&self, event: DomainEvent) -> BoxFuture<'_, KernelResult<()>> {
        self.store(vec![event]);
        Box::pin(async { Ok(()) })
    }

    fn save_all(&self, events: Vec<DomainEvent>) -> BoxFuture<'_, KernelResult<()>> {
        self.store(events);
        Box::pin(async { Ok(()) })
    }

    fn events_for_aggregate<'a>(
        &'a self,
        aggregate_id: &'a str,
        from_version: Option<u64>,
    ) -> BoxFuture<'a, KernelResult<Vec<DomainEvent>>> {
        Box::pin(async move {
            let mut events = {
                let entries = self.read();
                entries.collect(entries.by_aggregate.get(aggregate_id))
            };
            if let Some(from_version) = from_version {
                events.retain(|event| event.version >= from_version);
            }
            events.sort_by_key(|event| event.version);
            Ok(self.cap(events, "aggregate"))
        })
    }

    fn events_by_type<'a>(
        &'a self,
        event_name: &'a str,
        from: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, KernelResult<Vec<DomainEvent>>> {
        Box::pin(async move {
            let mut events = {
                let entries = self.read();
                entries.collect(entries.by_name.get(event_name))
            };
            if let Some(from) = from {
                events.retain(|event| event.occurred_on >= from);
            }
            events.sort_by_key(|event| event.occurred_on);
            Ok(self.cap(events, "type"))
        })
    }

    fn all_events(
        &self,
        limit: usize,
        offset: usize,
    ) -> BoxFuture<'_, KernelResult<Vec<DomainEvent>>> {
        Box::pin(async move {
            let limit = if limit == 0 {
                self.config.max_query_size
            } else {
                limit.min(self.config.max_query_size)
            };
            let mut events: Vec<DomainEvent> = self.read().events.values().cloned().collect();
            events.sort_by_key(|event| event.occurred_on);
            Ok(events.into_iter().skip(offset).take(limit).collect())
        })
    }

    fn stats(&self) -> BoxFuture<'_, KernelResult<EventStoreStats>> {
        Box::pin(async move {
            let entries = self.read();
            let times = entries.events.values().map(|event| event.occurred_on);
            Ok(EventStoreStats {
                total_events: entries.events.len(),
                unique_aggregates: entries.by_aggregate.len(),
                unique_event_types: entries.by_name.len(),
                oldest_event: times.clone().min(),
                newest_event: times.max(),
            })
        })
    }

    fn clear(&self) -> BoxFuture<'_, KernelResult<()>> {
        let count = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let count = entries.events.len();
            *entries = Entries::default();
            count
        };
        tracing::info!(count, "Event store cleared");
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiz_kernel_testing::mocks::{ManualClock, test_epoch};

    fn event(name: &str, aggregate: &str, version: u64, days_after_epoch: i64) -> DomainEvent {
        DomainEvent::new(name, aggregate, version, json!({}))
            .occurred_at(test_epoch() + chrono::Duration::days(days_after_epoch))
    }

    fn store_at_epoch(config: EventStoreConfig) -> (InMemoryEventStore, ManualClock) {
        let clock = ManualClock::new(test_epoch());
        let store = InMemoryEventStore::with_clock(config, Arc::new(clock.clone()));
        (store, clock)
    }

    #[tokio::test]
    async fn aggregate_history_is_ordered_by_version() {
        let (store, _clock) = store_at_epoch(EventStoreConfig::default());
        store
            .save_all(vec![
                event("agent.renamed", "a-1", 3, 0),
                event("agent.created", "a-1", 1, 0),
                event("agent.created", "a-2", 1, 0),
                event("agent.updated", "a-1", 2, 0),
            ])
            .await
            .unwrap();

        let versions: Vec<u64> = store
            .events_for_aggregate("a-1", None)
            .await
            .unwrap()
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);

        let from_two = store.events_for_aggregate("a-1", Some(2)).await.unwrap();
        assert_eq!(from_two.len(), 2);
        assert!(store.events_for_aggregate("missing", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_by_type_respects_from_date() {
        let (store, _clock) = store_at_epoch(EventStoreConfig::default());
        store.save(event("agent.created", "a-1", 1, -2)).await.unwrap();
        store.save(event("agent.created", "a-2", 1, 0)).await.unwrap();
        store.save(event("agent.deleted", "a-1", 2, 0)).await.unwrap();

        let created = store.events_by_type("agent.created", None).await.unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].aggregate_id, "a-1");

        let recent = store
            .events_by_type("agent.created", Some(test_epoch() - chrono::Duration::days(1)))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].aggregate_id, "a-2");
    }

    #[tokio::test]
    async fn queries_are_capped_and_paged() {
        let (store, _clock) = store_at_epoch(EventStoreConfig::default().with_max_query_size(3));
        let events = (1..=5).map(|v| event("tick", "clock", v, 0)).collect();
        store.save_all(events).await.unwrap();

        assert_eq!(store.events_for_aggregate("clock", None).await.unwrap().len(), 3);
        assert_eq!(store.all_events(0, 0).await.unwrap().len(), 3);
        assert_eq!(store.all_events(10, 4).await.unwrap().len(), 1);
        assert_eq!(store.all_events(2, 1).await.unwrap()[0].version, 2);
    }

    #[tokio::test]
    async fn saving_prunes_events_outside_retention() {
        let (store, clock) = store_at_epoch(EventStoreConfig::default().with_retention_days(30));
        store.save(event("agent.created", "old", 1, -10)).await.unwrap();

        clock.advance(chrono::Duration::days(25));
        store.save(event("agent.created", "new", 1, 25)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.unique_aggregates, 1);
        assert!(store.events_for_aggregate("old", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_and_clear() {
        let (store, _clock) = store_at_epoch(EventStoreConfig::default());
        store.save(event("agent.created", "a-1", 1, -1)).await.unwrap();
        store.save(event("agent.deleted", "a-1", 2, 0)).await.unwrap();
        store.save(event("agent.created", "a-2", 1, 0)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.unique_aggregates, 2);
        assert_eq!(stats.unique_event_types, 2);
        assert_eq!(stats.oldest_event, Some(test_epoch() - chrono::Duration::days(1)));
        assert_eq!(stats.newest_event, Some(test_epoch()));

        store.clear().await.unwrap();
        assert_eq!(store.stats().await.unwrap(), EventStoreStats::default());
    }
}
