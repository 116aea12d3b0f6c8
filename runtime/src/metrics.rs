//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for all kernel services:
//! - Event bus publish and dead-lettering
//! - Event dispatcher strategies
//! - Command and query execution
//! - Mediator requests and notifications
//! - Transactions and retries
//!
//! # Example
//!
//! ```rust,no_run
//! use wiz_kernel_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the Prometheus recorder and renders the text exposition format.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the exposition is advertised on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe every kernel metric and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the metrics exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the call
    /// succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Event Bus Metrics
    describe_counter!(
        "event_bus_events_published_total",
        "Total number of events published to the event bus"
    );
    describe_counter!(
        "event_bus_handler_failures_total",
        "Total number of event handler failures, timeouts included"
    );
    describe_counter!(
        "event_bus_dead_lettered_total",
        "Total number of events moved to the dead-letter queue"
    );
    describe_histogram!(
        "event_bus_publish_duration_seconds",
        "Time taken to deliver an event to all its handlers"
    );
    describe_gauge!("dlq.size", "Current dead-letter queue size");

    // Dispatcher Metrics
    describe_counter!(
        "dispatcher_events_dispatched_total",
        "Total number of events handed to the dispatcher, by strategy"
    );

    // Command/Query Metrics
    describe_counter!(
        "cqrs_executions_total",
        "Total number of command and query executions, by kind and outcome"
    );
    describe_counter!(
        "cqrs_timeouts_total",
        "Total number of command and query executions that timed out"
    );
    describe_counter!(
        "cqrs_slow_executions_total",
        "Total number of executions slower than the configured threshold"
    );
    describe_histogram!(
        "cqrs_execution_duration_seconds",
        "Time taken to execute commands and queries"
    );

    // Mediator Metrics
    describe_counter!(
        "mediator_requests_total",
        "Total number of mediator requests, by outcome"
    );
    describe_counter!(
        "mediator_notifications_total",
        "Total number of mediator notifications published"
    );
    describe_counter!(
        "mediator_notification_failures_total",
        "Total number of notification handler failures"
    );

    // Transaction Metrics
    describe_counter!(
        "transactions_committed_total",
        "Total number of committed transactions"
    );
    describe_counter!(
        "transactions_failed_total",
        "Total number of transactions that failed on every attempt"
    );
    describe_counter!(
        "transactions_rolled_back_total",
        "Total number of rolled back transaction attempts"
    );
    describe_histogram!(
        "transaction_duration_seconds",
        "Time taken to run a transaction including retries"
    );

    // Retry Metrics
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!(
        "retry_successes_total",
        "Total number of operations that succeeded after retrying"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that exhausted their attempts"
    );
}

/// Event bus metrics recorder.
pub struct EventBusMetrics;

impl EventBusMetrics {
    /// Record an event delivery.
    pub fn record_publish(failures: usize, duration: Duration) {
        counter!("event_bus_events_published_total").increment(1);
        counter!("event_bus_handler_failures_total").increment(failures as u64);
        histogram!("event_bus_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an event moved to the dead-letter queue.
    pub fn record_dead_letter() {
        counter!("event_bus_dead_lettered_total").increment(1);
    }
}

/// Dispatcher metrics recorder.
pub struct DispatcherMetrics;

impl DispatcherMetrics {
    /// Record events handed to a strategy.
    pub fn record_dispatch(strategy: &'static str, count: usize) {
        counter!("dispatcher_events_dispatched_total", "strategy" => strategy)
            .increment(count as u64);
    }
}

/// Command and query metrics recorder.
pub struct CqrsMetrics;

impl CqrsMetrics {
    /// Record a finished execution.
    pub fn record_execution(kind: &'static str, success: bool, duration: Duration) {
        let outcome = if success { "success" } else { "failure" };
        counter!("cqrs_executions_total", "kind" => kind, "outcome" => outcome).increment(1);
        histogram!("cqrs_execution_duration_seconds", "kind" => kind)
            .record(duration.as_secs_f64());
    }

    /// Record a timed out execution.
    pub fn record_timeout(kind: &'static str) {
        counter!("cqrs_timeouts_total", "kind" => kind).increment(1);
    }

    /// Record an execution above the slow threshold.
    pub fn record_slow(kind: &'static str) {
        counter!("cqrs_slow_executions_total", "kind" => kind).increment(1);
    }
}

/// Mediator metrics recorder.
pub struct MediatorMetrics;

impl MediatorMetrics {
    /// Record a finished request.
    pub fn record_request(success: bool) {
        let outcome = if success { "success" } else { "failure" };
        counter!("mediator_requests_total", "outcome" => outcome).increment(1);
    }

    /// Record a published notification and its handler failures.
    pub fn record_notification(failures: usize) {
        counter!("mediator_notifications_total").increment(1);
        counter!("mediator_notification_failures_total").increment(failures as u64);
    }
}

/// Transaction metrics recorder.
pub struct TransactionMetrics;

impl TransactionMetrics {
    /// Record a committed transaction.
    pub fn record_commit(duration: Duration) {
        counter!("transactions_committed_total").increment(1);
        histogram!("transaction_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rolled back attempt.
    pub fn record_rollback() {
        counter!("transactions_rolled_back_total").increment(1);
    }

    /// Record a transaction that failed on every attempt.
    pub fn record_failure(duration: Duration) {
        counter!("transactions_failed_total").increment(1);
        histogram!("transaction_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}
