//! Database configuration.

use serde::{Deserialize, Serialize};
use wiz_kernel_runtime::ConfigError;

/// Connection settings for the embedded database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL.
    pub url: String,
    /// Pool size. In-memory databases always use a single connection.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_owned(),
            max_connections: 1,
        }
    }
}

impl DatabaseConfig {
    /// Configuration for the given URL with default pool settings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Set the pool size.
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Whether the URL names a private in-memory database.
    ///
    /// Every connection to such a URL opens its own empty database.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }

    /// Pool size actually used.
    #[must_use]
    pub fn effective_max_connections(&self) -> u32 {
        if self.is_in_memory() {
            1
        } else {
            self.max_connections.max(1)
        }
    }

    /// Load from `WIZ_DATABASE_URL` and `WIZ_DATABASE_MAX_CONNECTIONS`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the pool size is not a number.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the pool size is not a number.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("WIZ_DATABASE_URL") {
            let url = url.trim();
            if !url.is_empty() {
                url.clone_into(&mut config.url);
            }
        }
        if let Some(raw) = lookup("WIZ_DATABASE_MAX_CONNECTIONS") {
            config.max_connections = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "WIZ_DATABASE_MAX_CONNECTIONS".to_owned(),
                value: raw.clone(),
            })?;
        }
        Ok(config)
    }
}
