//! Transaction manager.
//!
//! Every call to [`TransactionManager::execute_transaction`] gets a
//! `tx_{millis}_{n}` id and a tracked [`TransactionContext`]. The operation
//! runs inside a native SQLite transaction on a pooled connection, raced
//! against the configured timeout, and is retried with a fixed delay until it
//! commits or the attempts run out.
//!
//! Status transitions:
//!
//! ```text
//! Pending -> Active -> Committed
//!              |
//!              v
//!          RolledBack -> Active (retry) ... -> Failed
//! ```

use crate::database_error;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use wiz_kernel_core::environment::Clock;
use wiz_kernel_core::{KernelError, KernelResult};
use wiz_kernel_runtime::metrics::TransactionMetrics;
use wiz_kernel_runtime::retry::retry_with_backoff;
use wiz_kernel_runtime::RetryPolicy;

/// Age after which finished transactions are pruned by default.
pub const DEFAULT_CLEANUP_AGE: Duration = Duration::from_secs(60 * 60);

/// Future returned by a transactional operation.
pub type TransactionFuture<'c, T> = BoxFuture<'c, KernelResult<T>>;

/// Requested isolation level.
///
/// SQLite transactions are serializable. Only `ReadUncommitted` changes
/// behaviour, through `PRAGMA read_uncommitted` on shared-cache connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// Dirty reads allowed.
    ReadUncommitted,
    /// Default.
    #[default]
    ReadCommitted,
    /// Repeatable reads.
    RepeatableRead,
    /// Full serializability.
    Serializable,
}

/// Per-call transaction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    /// Isolation level.
    pub isolation_level: IsolationLevel,
    /// Limit on a single attempt.
    pub timeout: Duration,
    /// Reject writes through `PRAGMA query_only`.
    pub read_only: bool,
    /// Total attempts, including the first.
    pub retry_attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::default(),
            timeout: Duration::from_secs(30),
            read_only: false,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

impl TransactionOptions {
    /// Set the isolation level.
    #[must_use]
    pub const fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark the transaction read-only.
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Set the total number of attempts.
    #[must_use]
    pub const fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Set the delay between attempts.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retry_attempts, self.retry_delay)
    }
}

/// Lifecycle state of a tracked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Tracked, no attempt started yet.
    Pending,
    /// An attempt is running.
    Active,
    /// Committed.
    Committed,
    /// The latest attempt was rolled back.
    RolledBack,
    /// Every attempt failed.
    Failed,
}

impl TransactionStatus {
    /// Whether the transaction has reached a final state.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }

    /// Upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Committed => "COMMITTED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracked state of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionContext {
    /// `tx_{millis}_{n}`.
    pub id: String,
    /// Current status.
    pub status: TransactionStatus,
    /// When the transaction was requested.
    pub start_time: DateTime<Utc>,
    /// When it committed or failed.
    pub end_time: Option<DateTime<Utc>>,
    /// Attempts started so far.
    pub attempts: u32,
    /// Settings it runs with.
    pub options: TransactionOptions,
}

/// A committed transaction's value and context.
#[derive(Debug, Clone)]
pub struct TransactionOutcome<T> {
    /// Value returned by the operation.
    pub value: T,
    /// Final context.
    pub context: TransactionContext,
    /// Wall time across all attempts.
    pub execution_time: Duration,
}

/// Aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStats {
    /// Tracked transactions that have not finished.
    pub active_transactions: usize,
    /// Transactions started since construction.
    pub total_transactions: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions that exhausted their attempts.
    pub failed: u64,
}

/// Runs operations inside retried, time-limited SQLite transactions.
pub struct TransactionManager {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    contexts: Mutex<HashMap<String, TransactionContext>>,
    sequence: AtomicU64,
    total: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
}

impl TransactionManager {
    /// Manage transactions on `pool`, timestamping contexts with `clock`.
    #[must_use]
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            contexts: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            total: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run `operation` in a transaction.
    ///
    /// The operation receives the transaction's connection. It may be invoked
    /// once per attempt, so it must be repeatable. A timed out attempt is
    /// dropped and rolled back.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Transaction`] carrying the last attempt's error
    /// once every attempt has failed.
    pub async fn execute_transaction<T, F>(
        &self,
        options: &TransactionOptions,
        operation: F,
    ) -> KernelResult<TransactionOutcome<T>>
    where
        T: Send,
        F: for<'c> Fn(&'c mut SqliteConnection) -> TransactionFuture<'c, T> + Send + Sync,
    {
        let id = self.next_id();
        let started = Instant::now();
        self.contexts().insert(
            id.clone(),
            TransactionContext {
                id: id.clone(),
                status: TransactionStatus::Pending,
                start_time: self.clock.now(),
                end_time: None,
                attempts: 0,
                options: options.clone(),
            },
        );
        self.total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(transaction_id = %id, ?options, "Transaction started");

        let attempts = AtomicU32::new(0);
        let result = {
            let (id, operation, attempts) = (id.as_str(), &operation, &attempts);
            retry_with_backoff(&options.retry_policy(), move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                self.update(id, |context| {
                    context.status = TransactionStatus::Active;
                    context.attempts = attempt;
                });
                self.attempt(id, operation, options)
            })
            .await
        };

        let execution_time = started.elapsed();
        match result {
            Ok(value) => {
                let context = self.finish(&id, TransactionStatus::Committed, options);
                self.committed.fetch_add(1, Ordering::Relaxed);
                TransactionMetrics::record_commit(execution_time);
                tracing::debug!(
                    transaction_id = %id,
                    attempts = context.attempts,
                    duration_ms = execution_time.as_millis(),
                    "Transaction committed"
                );
                Ok(TransactionOutcome {
                    value,
                    context,
                    execution_time,
                })
            }
            Err(err) => {
                let context = self.finish(&id, TransactionStatus::Failed, options);
                self.failed.fetch_add(1, Ordering::Relaxed);
                TransactionMetrics::record_failure(execution_time);
                tracing::error!(
                    transaction_id = %id,
                    attempts = context.attempts,
                    error = %err,
                    "Transaction execution failed"
                );
                Err(KernelError::Transaction {
                    transaction_id: id,
                    attempts: context.attempts,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Run `operation` in a transaction that rejects writes.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::execute_transaction`].
    pub async fn execute_read_only_transaction<T, F>(
        &self,
        options: &TransactionOptions,
        operation: F,
    ) -> KernelResult<TransactionOutcome<T>>
    where
        T: Send,
        F: for<'c> Fn(&'c mut SqliteConnection) -> TransactionFuture<'c, T> + Send + Sync,
    {
        let options = options.clone().read_only();
        self.execute_transaction(&options, operation).await
    }

    /// Tracked context by id, finished or not.
    #[must_use]
    pub fn active_transaction(&self, id: &str) -> Option<TransactionContext> {
        self.contexts().get(id).cloned()
    }

    /// Contexts of transactions that have not finished, oldest first.
    #[must_use]
    pub fn active_transactions(&self) -> Vec<TransactionContext> {
        let mut active: Vec<TransactionContext> = self
            .contexts()
            .values()
            .filter(|context| !context.status.is_finished())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        active
    }

    /// Aggregate counters.
    #[must_use]
    pub fn transaction_stats(&self) -> TransactionStats {
        let active_transactions = self
            .contexts()
            .values()
            .filter(|context| !context.status.is_finished())
            .count();
        TransactionStats {
            active_transactions,
            total_transactions: self.total.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Forget finished transactions that ended more than `older_than` ago.
    ///
    /// Returns the number of contexts removed.
    pub fn cleanup_completed_transactions(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| self.clock.now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut contexts = self.contexts();
        let before = contexts.len();
        contexts.retain(|_, context| {
            !(context.status.is_finished() && context.end_time.is_some_and(|end| end <= cutoff))
        });
        let removed = before - contexts.len();
        drop(contexts);

        if removed > 0 {
            tracing::debug!(removed, "Cleaned up completed transactions");
        }
        removed
    }

    async fn attempt<T, F>(
        &self,
        id: &str,
        operation: &F,
        options: &TransactionOptions,
    ) -> KernelResult<T>
    where
        F: for<'c> Fn(&'c mut SqliteConnection) -> TransactionFuture<'c, T> + Send + Sync,
    {
        let result = self.run_attempt(operation, options).await;
        if let Err(err) = &result {
            TransactionMetrics::record_rollback();
            self.update(id, |context| context.status = TransactionStatus::RolledBack);
            tracing::warn!(transaction_id = id, error = %err, "Transaction attempt rolled back");
        }
        result
    }

    async fn run_attempt<T, F>(&self, operation: &F, options: &TransactionOptions) -> KernelResult<T>
    where
        F: for<'c> Fn(&'c mut SqliteConnection) -> TransactionFuture<'c, T> + Send + Sync,
    {
        let mut conn = self.pool.acquire().await.map_err(database_error)?;

        let read_uncommitted = if options.isolation_level == IsolationLevel::ReadUncommitted {
            "PRAGMA read_uncommitted = ON"
        } else {
            "PRAGMA read_uncommitted = OFF"
        };
        pragma(&mut conn, read_uncommitted).await?;
        if options.read_only {
            pragma(&mut conn, "PRAGMA query_only = ON").await?;
        }

        let result = run_in_transaction(&mut conn, operation, options.timeout).await;

        if options.read_only {
            if let Err(err) = pragma(&mut conn, "PRAGMA query_only = OFF").await {
                tracing::warn!(error = %err, "Failed to reset query_only on pooled connection");
            }
        }
        result
    }

    fn next_id(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("tx_{}_{n}", self.clock.now().timestamp_millis())
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut TransactionContext)) {
        if let Some(context) = self.contexts().get_mut(id) {
            apply(context);
        }
    }

    fn finish(
        &self,
        id: &str,
        status: TransactionStatus,
        options: &TransactionOptions,
    ) -> TransactionContext {
        let now = self.clock.now();
        let mut contexts = self.contexts();
        let context = contexts
            .entry(id.to_owned())
            .or_insert_with(|| TransactionContext {
                id: id.to_owned(),
                status,
                start_time: now,
                end_time: None,
                attempts: 0,
                options: options.clone(),
            });
        context.status = status;
        context.end_time = Some(now);
        context.clone()
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<String, TransactionContext>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("stats", &self.transaction_stats())
            .finish_non_exhaustive()
    }
}

async fn pragma(conn: &mut SqliteConnection, statement: &str) -> KernelResult<()> {
    sqlx::query(statement)
        .execute(&mut *conn)
        .await
        .map_err(database_error)?;
    Ok(())
}

async fn run_in_transaction<T, F>(
    conn: &mut SqliteConnection,
    operation: &F,
    timeout: Duration,
) -> KernelResult<T>
where
    F: for<'c> Fn(&'c mut SqliteConnection) -> TransactionFuture<'c, T> + Send + Sync,
{
    let mut tx = conn.begin().await.map_err(database_error)?;

    let result = match tokio::time::timeout(timeout, operation(&mut *tx)).await {
        Ok(result) => result,
        Err(_) => Err(KernelError::timeout("Transaction", timeout)),
    };

    match result {
        Ok(value) => {
            tx.commit().await.map_err(database_error)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "Rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use wiz_kernel_testing::{ManualClock, test_clock};
    use wiz_kernel_testing::mocks::test_epoch;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE counters (name TEXT PRIMARY KEY, value INTEGER NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    fn quick() -> TransactionOptions {
        TransactionOptions::default().with_retry_delay(Duration::from_millis(1))
    }

    async fn count(pool: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM counters")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[test]
    fn defaults() {
        let options = TransactionOptions::default();
        assert_eq!(options.isolation_level, IsolationLevel::ReadCommitted);
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert!(!options.read_only);
        assert_eq!(options.retry_attempts, 3);
        assert_eq!(options.retry_delay, Duration::from_millis(1000));
        assert_eq!(
            serde_json::to_value(TransactionStatus::RolledBack).unwrap(),
            "ROLLED_BACK"
        );
    }

    #[tokio::test]
    async fn commits_and_tracks_the_context() {
        let manager = TransactionManager::new(pool().await, Arc::new(test_clock()));

        let outcome = manager
            .execute_transaction(&quick(), |conn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO counters (name, value) VALUES ('a', 1)")
                        .execute(&mut *conn)
                        .await
                        .map_err(database_error)?;
                    Ok(7)
                })
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, 7);
        assert_eq!(outcome.context.status, TransactionStatus::Committed);
        assert_eq!(outcome.context.attempts, 1);
        assert_eq!(outcome.context.end_time, Some(test_epoch()));
        assert_eq!(
            outcome.context.id,
            format!("tx_{}_1", test_epoch().timestamp_millis())
        );
        assert_eq!(count(manager.pool()).await, 1);
        assert_eq!(
            manager.active_transaction(&outcome.context.id),
            Some(outcome.context)
        );
    }

    #[tokio::test]
    async fn retries_until_an_attempt_commits() {
        let manager = TransactionManager::new(pool().await, Arc::new(test_clock()));
        let calls = AtomicU32::new(0);

        let outcome = manager
            .execute_transaction(&quick(), |conn| {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Box::pin(async move {
                    sqlx::query("INSERT INTO counters (name, value) VALUES ('a', ?)")
                        .bind(i64::from(call))
                        .execute(&mut *conn)
                        .await
                        .map_err(database_error)?;
                    if call < 3 {
                        return Err(KernelError::handler("transient"));
                    }
                    Ok(call)
                })
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, 3);
        assert_eq!(outcome.context.attempts, 3);
        // Failed attempts left nothing behind.
        assert_eq!(count(manager.pool()).await, 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_and_roll_back() {
        let manager = TransactionManager::new(pool().await, Arc::new(test_clock()));

        let err = manager
            .execute_transaction(&quick(), |conn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO counters (name, value) VALUES ('a', 1)")
                        .execute(&mut *conn)
                        .await
                        .map_err(database_error)?;
                    Err::<(), _>(KernelError::handler("always"))
                })
            })
            .await
            .unwrap_err();

        let KernelError::Transaction {
            transaction_id,
            attempts,
            message,
        } = err
        else {
            panic!("expected a transaction error");
        };
        assert_eq!(attempts, 3);
        assert!(message.contains("always"));
        assert_eq!(count(manager.pool()).await, 0);
        assert_eq!(
            manager.active_transaction(&transaction_id).unwrap().status,
            TransactionStatus::Failed
        );
        assert_eq!(
            manager.transaction_stats(),
            TransactionStats {
                active_transactions: 0,
                total_transactions: 1,
                committed: 0,
                failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn read_only_transactions_reject_writes() {
        let manager = TransactionManager::new(pool().await, Arc::new(test_clock()));
        let options = quick().with_retry_attempts(1);

        let write = manager
            .execute_read_only_transaction(&options, |conn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO counters (name, value) VALUES ('a', 1)")
                        .execute(&mut *conn)
                        .await
                        .map_err(database_error)?;
                    Ok(())
                })
            })
            .await;
        assert!(matches!(write, Err(KernelError::Transaction { .. })));

        let read = manager
            .execute_read_only_transaction(&options, |conn| {
                Box::pin(async move {
                    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM counters")
                        .fetch_one(&mut *conn)
                        .await
                        .map_err(database_error)
                })
            })
            .await
            .unwrap();
        assert_eq!(read.value, 0);

        // The pooled connection accepts writes again afterwards.
        manager
            .execute_transaction(&options, |conn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO counters (name, value) VALUES ('b', 1)")
                        .execute(&mut *conn)
                        .await
                        .map_err(database_error)?;
                    Ok(())
                })
            })
            .await
            .unwrap();
        assert_eq!(count(manager.pool()).await, 1);
    }

    #[tokio::test]
    async fn slow_attempts_time_out_and_roll_back() {
        let manager = TransactionManager::new(pool().await, Arc::new(test_clock()));
        let options = quick()
            .with_retry_attempts(1)
            .with_timeout(Duration::from_millis(20));

        let err = manager
            .execute_transaction(&options, |conn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO counters (name, value) VALUES ('a', 1)")
                        .execute(&mut *conn)
                        .await
                        .map_err(database_error)?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Transaction timeout after 20ms"));
        assert_eq!(count(manager.pool()).await, 0);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_finished_transactions() {
        let clock = Arc::new(ManualClock::new(test_epoch()));
        let manager = TransactionManager::new(pool().await, clock.clone());

        let old = manager
            .execute_transaction(&quick(), |_conn| Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        clock.advance(chrono::Duration::hours(2));
        let recent = manager
            .execute_transaction(&quick(), |_conn| Box::pin(async { Ok(()) }))
            .await
            .unwrap();

        assert_eq!(manager.cleanup_completed_transactions(DEFAULT_CLEANUP_AGE), 1);
        assert!(manager.active_transaction(&old.context.id).is_none());
        assert!(manager.active_transaction(&recent.context.id).is_some());
        assert!(manager.active_transactions().is_empty());
        assert_eq!(manager.transaction_stats().total_transactions, 2);
    }
}
