//! Unit of work.
//!
//! [`UnitOfWork::begin`] returns a [`UnitOfWorkSession`] that stages insert,
//! update, delete and custom operations. Nothing touches the database until
//! [`UnitOfWorkSession::commit`], which applies every staged operation inside
//! one transaction so they succeed or fail together. Both `commit` and
//! `rollback` consume the session.

use crate::table::Table;
use crate::transaction::{TransactionManager, TransactionOptions};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::SqliteConnection;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use wiz_kernel_core::{KernelError, KernelResult};

/// Caller-supplied operation run inside the commit transaction.
///
/// It may run once per commit attempt.
pub type CustomOperation =
    Arc<dyn for<'c> Fn(&'c mut SqliteConnection) -> BoxFuture<'c, KernelResult<Value>> + Send + Sync>;

/// What a staged operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// Insert a row.
    Insert,
    /// Update a row by id.
    Update,
    /// Delete a row by id.
    Delete,
    /// Arbitrary statements.
    Custom,
}

#[derive(Clone)]
enum Action {
    Insert {
        table: Table,
        entity: Map<String, Value>,
    },
    Update {
        table: Table,
        id: String,
        changes: Map<String, Value>,
    },
    Delete {
        table: Table,
        id: String,
    },
    Custom(CustomOperation),
}

/// One staged operation.
#[derive(Clone)]
pub struct UnitOfWorkOperation {
    action: Action,
    metadata: Map<String, Value>,
}

impl UnitOfWorkOperation {
    /// Operation kind.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self.action {
            Action::Insert { .. } => OperationKind::Insert,
            Action::Update { .. } => OperationKind::Update,
            Action::Delete { .. } => OperationKind::Delete,
            Action::Custom(_) => OperationKind::Custom,
        }
    }

    /// Target table, if any.
    #[must_use]
    pub fn table(&self) -> Option<&str> {
        match &self.action {
            Action::Insert { table, .. }
            | Action::Update { table, .. }
            | Action::Delete { table, .. } => Some(table.name()),
            Action::Custom(_) => None,
        }
    }

    /// Target row id for updates and deletes.
    #[must_use]
    pub fn entity_id(&self) -> Option<&str> {
        match &self.action {
            Action::Update { id, .. } | Action::Delete { id, .. } => Some(id),
            Action::Insert { .. } | Action::Custom(_) => None,
        }
    }

    /// Inserted row or applied changes.
    #[must_use]
    pub fn entity(&self) -> Option<&Map<String, Value>> {
        match &self.action {
            Action::Insert { entity, .. } => Some(entity),
            Action::Update { changes, .. } => Some(changes),
            Action::Delete { .. } | Action::Custom(_) => None,
        }
    }

    /// Caller annotations.
    #[must_use]
    pub const fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Attach an annotation.
    pub fn annotate(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.metadata.insert(key.into(), value);
        self
    }

    async fn apply(&self, conn: &mut SqliteConnection) -> KernelResult<Value> {
        match &self.action {
            Action::Insert { table, entity } => table.insert(conn, entity).await,
            Action::Update { table, id, changes } => table.update(conn, id, changes).await,
            Action::Delete { table, id } => table.delete(conn, id).await,
            Action::Custom(operation) => operation(conn).await,
        }
    }
}

impl fmt::Debug for UnitOfWorkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWorkOperation")
            .field("kind", &self.kind())
            .field("table", &self.table())
            .field("entity_id", &self.entity_id())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWorkStatus {
    /// `uow_{millis}_{n}`.
    pub id: String,
    /// Staged operations.
    pub operation_count: usize,
    /// When the session began.
    pub started_at: DateTime<Utc>,
    /// Session annotations.
    pub metadata: Map<String, Value>,
}

/// Outcome of a committed session.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOfWorkResult {
    /// One value per operation, in staging order.
    pub results: Vec<Value>,
    /// Operations applied.
    pub operation_count: usize,
    /// Transaction that applied them; `None` for an empty session.
    pub transaction_id: Option<String>,
    /// Time from `begin` to commit.
    pub execution_time: Duration,
}

/// Creates unit-of-work sessions over a transaction manager.
pub struct UnitOfWork {
    transactions: Arc<TransactionManager>,
    defaults: TransactionOptions,
    sequence: AtomicU64,
}

impl UnitOfWork {
    /// Sessions committed through `transactions` with default options.
    #[must_use]
    pub fn new(transactions: Arc<TransactionManager>) -> Self {
        Self::with_defaults(transactions, TransactionOptions::default())
    }

    /// Sessions committed with `defaults` unless overridden at `begin`.
    #[must_use]
    pub const fn with_defaults(
        transactions: Arc<TransactionManager>,
        defaults: TransactionOptions,
    ) -> Self {
        Self {
            transactions,
            defaults,
            sequence: AtomicU64::new(0),
        }
    }

    /// Start an empty session with the default options.
    #[must_use]
    pub fn begin(&self) -> UnitOfWorkSession {
        self.begin_with(self.defaults.clone(), Map::new())
    }

    /// Start an empty session.
    #[must_use]
    pub fn begin_with(
        &self,
        options: TransactionOptions,
        metadata: Map<String, Value>,
    ) -> UnitOfWorkSession {
        let started_at = self.transactions.clock().now();
        let n = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("uow_{}_{n}", started_at.timestamp_millis());
        tracing::debug!(unit_of_work_id = %id, "Unit of work started");

        UnitOfWorkSession {
            id,
            started_at,
            started: Instant::now(),
            options,
            metadata,
            operations: Vec::new(),
            transactions: Arc::clone(&self.transactions),
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

/// Staged operations awaiting commit.
pub struct UnitOfWorkSession {
    id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    options: TransactionOptions,
    metadata: Map<String, Value>,
    operations: Vec<UnitOfWorkOperation>,
    transactions: Arc<TransactionManager>,
}

impl UnitOfWorkSession {
    /// Session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stage an insert of `entity`, which must serialize to a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Serialization`] if `entity` cannot be serialized
    /// and [`KernelError::Validation`] if it is not an object.
    pub fn register_insert<E: Serialize>(
        &mut self,
        table: &Table,
        entity: &E,
    ) -> KernelResult<&mut UnitOfWorkOperation> {
        let entity = to_object(entity)?;
        Ok(self.push(Action::Insert {
            table: table.clone(),
            entity,
        }))
    }

    /// Stage an update of the row `id` with `changes`, which must serialize
    /// to a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Serialization`] if `changes` cannot be
    /// serialized and [`KernelError::Validation`] if it is not an object.
    pub fn register_update<E: Serialize>(
        &mut self,
        table: &Table,
        id: impl Into<String>,
        changes: &E,
    ) -> KernelResult<&mut UnitOfWorkOperation> {
        let changes = to_object(changes)?;
        Ok(self.push(Action::Update {
            table: table.clone(),
            id: id.into(),
            changes,
        }))
    }

    /// Stage a delete of the row `id`.
    pub fn register_delete(
        &mut self,
        table: &Table,
        id: impl Into<String>,
    ) -> &mut UnitOfWorkOperation {
        self.push(Action::Delete {
            table: table.clone(),
            id: id.into(),
        })
    }

    /// Stage an arbitrary operation.
    pub fn register_custom<F>(&mut self, operation: F) -> &mut UnitOfWorkOperation
    where
        F: for<'c> Fn(&'c mut SqliteConnection) -> BoxFuture<'c, KernelResult<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.push(Action::Custom(Arc::new(operation)))
    }

    /// Staged operations in order.
    #[must_use]
    pub fn operations(&self) -> &[UnitOfWorkOperation] {
        &self.operations
    }

    /// Number of staged operations.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Unstage the operation at `index`.
    pub fn clear_operation(&mut self, index: usize) -> Option<UnitOfWorkOperation> {
        (index < self.operations.len()).then(|| self.operations.remove(index))
    }

    /// Unstage everything.
    pub fn clear_all(&mut self) {
        self.operations.clear();
    }

    /// Snapshot of the session.
    #[must_use]
    pub fn status(&self) -> UnitOfWorkStatus {
        UnitOfWorkStatus {
            id: self.id.clone(),
            operation_count: self.operations.len(),
            started_at: self.started_at,
            metadata: self.metadata.clone(),
        }
    }

    /// Apply every staged operation in one transaction.
    ///
    /// An empty session commits without opening a transaction.
    ///
    /// # Errors
    ///
    /// Returns the transaction error when any operation fails; no operation's
    /// effect is kept.
    pub async fn commit(self) -> KernelResult<UnitOfWorkResult> {
        let Self {
            id,
            started,
            options,
            operations,
            transactions,
            ..
        } = self;
        let operation_count = operations.len();

        if operations.is_empty() {
            tracing::debug!(unit_of_work_id = %id, "Committed empty unit of work");
            return Ok(UnitOfWorkResult {
                results: Vec::new(),
                operation_count: 0,
                transaction_id: None,
                execution_time: started.elapsed(),
            });
        }

        let operations = Arc::new(operations);
        let outcome = transactions
            .execute_transaction(&options, move |conn| {
                let operations = Arc::clone(&operations);
                Box::pin(async move {
                    let mut results = Vec::with_capacity(operations.len());
                    for operation in operations.iter() {
                        results.push(operation.apply(&mut *conn).await?);
                    }
                    Ok(results)
                })
            })
            .await;

        match outcome {
            Ok(outcome) => {
                tracing::info!(
                    unit_of_work_id = %id,
                    transaction_id = %outcome.context.id,
                    operation_count,
                    "Unit of work committed"
                );
                Ok(UnitOfWorkResult {
                    results: outcome.value,
                    operation_count,
                    transaction_id: Some(outcome.context.id),
                    execution_time: started.elapsed(),
                })
            }
            Err(err) => {
                tracing::error!(
                    unit_of_work_id = %id,
                    operation_count,
                    error = %err,
                    "Unit of work commit failed"
                );
                Err(err)
            }
        }
    }

    /// Discard every staged operation without touching the database.
    ///
    /// Returns the number of operations discarded.
    pub fn rollback(self) -> usize {
        let discarded = self.operations.len();
        tracing::debug!(unit_of_work_id = %self.id, discarded, "Unit of work rolled back");
        discarded
    }

    fn push(&mut self, action: Action) -> &mut UnitOfWorkOperation {
        self.operations.push(UnitOfWorkOperation {
            action,
            metadata: Map::new(),
        });
        let last = self.operations.len() - 1;
        &mut self.operations[last]
    }
}

impl fmt::Debug for UnitOfWorkSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWorkSession")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

fn to_object<E: Serialize>(entity: &E) -> KernelResult<Map<String, Value>> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(KernelError::validation(format!(
            "Entity must serialize to an object, got {other}"
        ))),
        Err(err) => Err(KernelError::Serialization(err.to_string())),
    }
}
