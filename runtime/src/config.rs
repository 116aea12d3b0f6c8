//! Kernel configuration.
//!
//! Each service owns a config struct with defaults and `with_*` setters.
//! [`KernelConfig`] aggregates them and applies overrides from `WIZ_*`
//! environment variables.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use wiz_kernel_runtime::config::KernelConfig;
//!
//! let config = KernelConfig::from_lookup(|key| match key {
//!     "WIZ_BUS_TIMEOUT_MS" => Some("250".to_string()),
//!     _ => None,
//! })
//! .unwrap();
//!
//! assert_eq!(config.cqrs.timeout, Duration::from_millis(250));
//! assert_eq!(config.event_bus.max_concurrent_handlers, 10);
//! ```

use crate::cqrs::BusConfig;
use crate::domain_events::PublisherConfig;
use crate::event_bus::EventBusConfig;
use crate::event_store::EventStoreConfig;
use crate::mediator::MediatorConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use wiz_kernel_core::error::duration_millis;

/// Errors from loading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held an unparsable value.
    #[error("Invalid value for {key}: {value}")]
    Invalid {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

/// Configuration of every runtime service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Event bus settings.
    pub event_bus: EventBusConfig,
    /// Command and query bus settings.
    pub cqrs: BusConfig,
    /// Mediator settings.
    pub mediator: MediatorConfig,
    /// Domain event publisher settings.
    pub publisher: PublisherConfig,
    /// In-memory event store settings.
    pub event_store: EventStoreConfig,
}

impl KernelConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a variable cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        let bus = &mut config.event_bus;
        env.parse("WIZ_EVENT_BUS_MAX_CONCURRENT_HANDLERS", &mut bus.max_concurrent_handlers)?;
        env.millis("WIZ_EVENT_BUS_HANDLER_TIMEOUT_MS", &mut bus.handler_timeout)?;
        env.flag("WIZ_EVENT_BUS_CONTINUE_ON_ERROR", &mut bus.continue_on_error)?;
        env.flag("WIZ_EVENT_BUS_DEAD_LETTER_QUEUE", &mut bus.enable_dead_letter_queue)?;
        env.parse("WIZ_DEAD_LETTER_QUEUE_MAX_SIZE", &mut bus.dead_letter_queue_max_size)?;

        let cqrs = &mut config.cqrs;
        env.millis("WIZ_BUS_TIMEOUT_MS", &mut cqrs.timeout)?;
        env.flag("WIZ_BUS_ENABLE_LOGGING", &mut cqrs.enable_logging)?;
        env.millis("WIZ_BUS_SLOW_THRESHOLD_MS", &mut cqrs.slow_execution_threshold)?;

        let mediator = &mut config.mediator;
        env.millis("WIZ_MEDIATOR_TIMEOUT_MS", &mut mediator.request_timeout)?;
        env.parse(
            "WIZ_MEDIATOR_MAX_CONCURRENT_NOTIFICATIONS",
            &mut mediator.max_concurrent_notifications,
        )?;

        let publisher = &mut config.publisher;
        env.flag("WIZ_PUBLISHER_AUTO_PUBLISH", &mut publisher.auto_publish)?;
        env.parse("WIZ_PUBLISHER_BATCH_SIZE", &mut publisher.batch_size)?;
        env.millis("WIZ_PUBLISHER_DELAY_MS", &mut publisher.publish_delay)?;

        let store = &mut config.event_store;
        env.parse("WIZ_EVENT_STORE_MAX_QUERY_SIZE", &mut store.max_query_size)?;
        env.parse("WIZ_EVENT_STORE_RETENTION_DAYS", &mut store.retention_days)?;

        Ok(config)
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn parse<T: FromStr>(&self, key: &str, target: &mut T) -> Result<(), ConfigError> {
        if let Some(raw) = (self.0)(key) {
            *target = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: key.to_owned(),
                value: raw.clone(),
            })?;
        }
        Ok(())
    }

    fn millis(&self, key: &str, target: &mut Duration) -> Result<(), ConfigError> {
        let mut millis = duration_millis(*target);
        self.parse(key, &mut millis)?;
        *target = Duration::from_millis(millis);
        Ok(())
    }

    fn flag(&self, key: &str, target: &mut bool) -> Result<(), ConfigError> {
        if let Some(raw) = (self.0)(key) {
            *target = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: key.to_owned(),
                        value: raw,
                    });
                }
            };
        }
        Ok(())
    }
}
