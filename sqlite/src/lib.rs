//! # Wiz Kernel SQLite
//!
//! Transactional persistence for the Project Wiz kernel on an embedded SQLite
//! database.
//!
//! - [`Persistence`] owns the connection pool, the [`TransactionManager`] and
//!   the [`UnitOfWork`] factory
//! - [`TransactionManager`] runs operations in retried, time-limited
//!   transactions and tracks their status
//! - [`UnitOfWork`] hands out sessions that stage row writes and apply them
//!   atomically on commit
//! - [`Table`] describes a table addressed by an id column
//!
//! ## Example
//!
//! ```no_run
//! use serde_json::json;
//! use wiz_kernel_sqlite::{DatabaseConfig, Persistence, Table};
//!
//! # async fn example() -> wiz_kernel_core::KernelResult<()> {
//! let persistence = Persistence::connect(DatabaseConfig::default()).await?;
//! let agents = Table::new("agents")?;
//!
//! let mut session = persistence.unit_of_work().begin();
//! session.register_insert(&agents, &json!({ "id": "a-1", "name": "Ada" }))?;
//! session.register_update(&agents, "a-0", &json!({ "active": false }))?;
//! let committed = session.commit().await?;
//! assert_eq!(committed.operation_count, 2);
//!
//! persistence.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod table;
pub mod transaction;
pub mod unit_of_work;

pub use config::DatabaseConfig;
pub use table::Table;
pub use transaction::{
    IsolationLevel, TransactionContext, TransactionManager, TransactionOptions,
    TransactionOutcome, TransactionStats, TransactionStatus,
};
pub use unit_of_work::{
    OperationKind, UnitOfWork, UnitOfWorkOperation, UnitOfWorkResult, UnitOfWorkSession,
    UnitOfWorkStatus,
};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use wiz_kernel_core::environment::{Clock, SystemClock};
use wiz_kernel_core::{KernelError, KernelResult};

pub(crate) fn database_error(err: sqlx::Error) -> KernelError {
    KernelError::Database(err.to_string())
}

/// Database handle, transaction manager and unit-of-work factory.
#[derive(Debug, Clone)]
pub struct Persistence {
    config: DatabaseConfig,
    pool: SqlitePool,
    transactions: Arc<TransactionManager>,
    unit_of_work: Arc<UnitOfWork>,
}

impl Persistence {
    /// Open the database described by `config`.
    ///
    /// File databases are created when missing.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Database`] if the URL is invalid or the
    /// database cannot be opened.
    pub async fn connect(config: DatabaseConfig) -> KernelResult<Self> {
        Self::connect_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Open the database, timestamping transactions with `clock`.
    ///
    /// # Errors
    ///
    /// See [`Persistence::connect`].
    pub async fn connect_with_clock(
        config: DatabaseConfig,
        clock: Arc<dyn Clock>,
    ) -> KernelResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(database_error)?
            .create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.effective_max_connections())
            .min_connections(1);
        if config.is_in_memory() {
            // Dropping the last connection would discard the database.
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(database_error)?;

        tracing::info!(
            url = %config.url,
            max_connections = config.effective_max_connections(),
            "Database connected"
        );

        let transactions = Arc::new(TransactionManager::new(pool.clone(), clock));
        let unit_of_work = Arc::new(UnitOfWork::new(Arc::clone(&transactions)));
        Ok(Self {
            config,
            pool,
            transactions,
            unit_of_work,
        })
    }

    /// Settings the database was opened with.
    #[must_use]
    pub const fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Connection pool, for reads outside a transaction.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Transaction manager.
    #[must_use]
    pub fn transactions(&self) -> Arc<TransactionManager> {
        Arc::clone(&self.transactions)
    }

    /// Unit-of-work factory.
    #[must_use]
    pub fn unit_of_work(&self) -> Arc<UnitOfWork> {
        Arc::clone(&self.unit_of_work)
    }

    /// Close every pooled connection.
    ///
    /// Later transactions fail with a database error.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!(url = %self.config.url, "Database closed");
    }

    /// Whether [`Persistence::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
