//! Handler decorators.
//!
//! [`IdempotentCommandHandler`] replays the recorded result of a command seen
//! within its TTL, failures included. [`CachedQueryHandler`] serves successful
//! query results from a TTL cache. Both key entries by message type plus the
//! JSON encoding of the payload unless a custom key function is supplied.
//! Expiry is checked when an entry is read; nothing sweeps the maps in the
//! background.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use wiz_kernel_core::{Command, CommandHandler, KernelResult, Query, QueryHandler};

/// Derives a cache key from a message.
pub type KeyFn<M> = Arc<dyn Fn(&M) -> String + Send + Sync>;

struct Entry<T> {
    result: KernelResult<T>,
    stored_at: Instant,
    recorded_on: DateTime<Utc>,
}

impl<T> Entry<T> {
    fn new(result: KernelResult<T>) -> Self {
        Self {
            result,
            stored_at: Instant::now(),
            recorded_on: Utc::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

fn default_key<M: Serialize>(type_name: &str, message: &M) -> KernelResult<String> {
    Ok(format!("{type_name}-{}", serde_json::to_string(message)?))
}

fn time_range<'a, T: 'a>(
    entries: impl Iterator<Item = &'a Entry<T>> + Clone,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    (
        entries.clone().map(|entry| entry.recorded_on).min(),
        entries.map(|entry| entry.recorded_on).max(),
    )
}

/// Contents of an idempotency cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdempotencyStats {
    /// Recorded results.
    pub total_entries: usize,
    /// Recorded successes.
    pub successful_results: usize,
    /// Recorded failures.
    pub failed_results: usize,
    /// When the oldest entry was recorded.
    pub oldest_entry: Option<DateTime<Utc>>,
    /// When the newest entry was recorded.
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Contents of a query cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryCacheStats {
    /// Cached results.
    pub total_entries: usize,
    /// When the oldest entry was cached.
    pub oldest_entry: Option<DateTime<Utc>>,
    /// When the newest entry was cached.
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Runs a command at most once per key within the TTL.
///
/// Default TTL: 1 hour.
pub struct IdempotentCommandHandler<C: Command, H> {
    inner: H,
    ttl: Duration,
    key_fn: Option<KeyFn<C>>,
    results: Mutex<HashMap<String, Entry<C::Output>>>,
}

impl<C, H> IdempotentCommandHandler<C, H>
where
    C: Command + Serialize,
    C::Output: Clone,
    H: CommandHandler<C>,
{
    /// Default time a recorded result is replayed.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

    /// Wrap `inner` with the default TTL.
    #[must_use]
    pub fn new(inner: H) -> Self {
        Self::with_ttl(inner, Self::DEFAULT_TTL)
    }

    /// Wrap `inner` with a custom TTL.
    #[must_use]
    pub fn with_ttl(inner: H, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            key_fn: None,
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Derive idempotency keys with `key_fn` instead of the JSON payload.
    #[must_use]
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&C) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Forget recorded results, all of them or only those older than `older_than`.
    ///
    /// Returns how many were removed.
    pub fn clear_results(&self, older_than: Option<Duration>) -> usize {
        let mut results = self.lock();
        let before = results.len();
        match older_than {
            None => results.clear(),
            Some(age) => results.retain(|_, entry| entry.stored_at.elapsed() <= age),
        }
        before - results.len()
    }

    /// Summary of the recorded results.
    #[must_use]
    pub fn cache_stats(&self) -> IdempotencyStats {
        let results = self.lock();
        let successful_results = results.values().filter(|entry| entry.result.is_ok()).count();
        let (oldest_entry, newest_entry) = time_range(results.values());
        IdempotencyStats {
            total_entries: results.len(),
            successful_results,
            failed_results: results.len() - successful_results,
            oldest_entry,
            newest_entry,
        }
    }

    fn key(&self, command: &C) -> KernelResult<String> {
        match &self.key_fn {
            Some(key_fn) => Ok(key_fn(command)),
            None => default_key(C::COMMAND_TYPE, command),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry<C::Output>>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(&self, command: C) -> KernelResult<C::Output> {
        let key = self.key(&command)?;

        {
            let mut results = self.lock();
            match results.get(&key) {
                Some(entry) if entry.is_fresh(self.ttl) => {
                    tracing::debug!(
                        command_type = C::COMMAND_TYPE,
                        key = %key,
                        "Replaying recorded command result"
                    );
                    return entry.result.clone();
                }
                Some(_) => {
                    results.remove(&key);
                }
                None => {}
            }
        }

        let result = self.inner.handle(command).await;
        self.lock().insert(key, Entry::new(result.clone()));
        result
    }
}

impl<C, H> CommandHandler<C> for IdempotentCommandHandler<C, H>
where
    C: Command + Serialize,
    C::Output: Clone,
    H: CommandHandler<C>,
{
    fn handle(&self, command: C) -> BoxFuture<'_, KernelResult<C::Output>> {
        Box::pin(self.run(command))
    }
}

/// Serves successful query results from a TTL cache.
///
/// Default TTL: 5 minutes. Failures are never cached.
pub struct CachedQueryHandler<Q: Query, H> {
    inner: H,
    ttl: Duration,
    key_fn: Option<KeyFn<Q>>,
    cache: Mutex<HashMap<String, Entry<Q::Output>>>,
}

impl<Q, H> CachedQueryHandler<Q, H>
where
    Q: Query + Serialize,
    Q::Output: Clone,
    H: QueryHandler<Q>,
{
    /// Default time a cached result is served.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

    /// Wrap `inner` with the default TTL.
    #[must_use]
    pub fn new(inner: H) -> Self {
        Self::with_ttl(inner, Self::DEFAULT_TTL)
    }

    /// Wrap `inner` with a custom TTL.
    #[must_use]
    pub fn with_ttl(inner: H, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            key_fn: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Derive cache keys with `key_fn` instead of the JSON payload.
    #[must_use]
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Q) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Drop every cached result. Returns how many were removed.
    pub fn clear_cache(&self) -> usize {
        let mut cache = self.lock();
        let removed = cache.len();
        cache.clear();
        removed
    }

    /// Summary of the cache.
    #[must_use]
    pub fn cache_stats(&self) -> QueryCacheStats {
        let cache = self.lock();
        let (oldest_entry, newest_entry) = time_range(cache.values());
        QueryCacheStats {
            total_entries: cache.len(),
            oldest_entry,
            newest_entry,
        }
    }

    fn key(&self, query: &Q) -> KernelResult<String> {
        match &self.key_fn {
            Some(key_fn) => Ok(key_fn(query)),
            None => default_key(Q::QUERY_TYPE, query),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry<Q::Output>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(&self, query: Q) -> KernelResult<Q::Output> {
        let key = self.key(&query)?;

        {
            let mut cache = self.lock();
            match cache.get(&key) {
                Some(entry) if entry.is_fresh(self.ttl) => {
                    tracing::debug!(query_type = Q::QUERY_TYPE, key = %key, "Query cache hit");
                    return entry.result.clone();
                }
                Some(_) => {
                    cache.remove(&key);
                }
                None => {}
            }
        }

        let result = self.inner.handle(query).await;
        if let Ok(value) = &result {
            self.lock().insert(key, Entry::new(Ok(value.clone())));
        }
        result
    }
}

impl<Q, H> QueryHandler<Q> for CachedQueryHandler<Q, H>
where
    Q: Query + Serialize,
    Q::Output: Clone,
    H: QueryHandler<Q>,
{
    fn handle(&self, query: Q) -> BoxFuture<'_, KernelResult<Q::Output>> {
        Box::pin(self.run(query))
    }
}
