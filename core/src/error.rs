//! Error taxonomy and the result type returned by every kernel operation.
//!
//! Expected failures (missing handler, duplicate registration, validation,
//! exhausted retries) are values of [`KernelError`] returned through
//! [`KernelResult`]. Handler code that panics is caught at the nearest kernel
//! boundary and surfaces as [`KernelError::Panicked`], so nothing a handler does
//! escapes a bus unhandled.
//!
//! # Example
//!
//! ```
//! use wiz_kernel_core::error::{HandlerKind, KernelError, KernelResult, ResultExt};
//!
//! fn lookup(found: bool) -> KernelResult<u32> {
//!     if found {
//!         Ok(7)
//!     } else {
//!         Err(KernelError::handler_not_found(HandlerKind::Command, "DeleteAgent"))
//!     }
//! }
//!
//! assert_eq!(lookup(true).value_or_default(0), 7);
//! assert_eq!(
//!     lookup(false).unwrap_err().to_string(),
//!     "No handler registered for command type: DeleteAgent"
//! );
//! ```

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type used at every kernel boundary.
pub type KernelResult<T> = Result<T, KernelError>;

/// The kind of message a handler was registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Command handler (one per command type).
    Command,
    /// Query handler (one per query type).
    Query,
    /// Mediator request handler (one per request type).
    Request,
    /// Mediator notification handler (many per notification type).
    Notification,
}

impl HandlerKind {
    /// Lowercase name used in error messages and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Query => "query",
            Self::Request => "request",
            Self::Notification => "notification",
        }
    }

    const fn capitalized(self) -> &'static str {
        match self {
            Self::Command => "Command",
            Self::Query => "Query",
            Self::Request => "Request",
            Self::Notification => "Notification",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure the kernel reports.
///
/// The enum is `Clone` so idempotency caches can replay a failed result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// No handler is registered for the dispatched type.
    #[error("No handler registered for {kind} type: {type_name}")]
    HandlerNotFound {
        /// Kind of message being dispatched.
        kind: HandlerKind,
        /// The type key that had no handler.
        type_name: String,
    },

    /// A handler is already registered for the type key.
    #[error("{} handler already registered for type: {type_name}", .kind.capitalized())]
    DuplicateHandler {
        /// Kind of handler being registered.
        kind: HandlerKind,
        /// The type key that was already taken.
        type_name: String,
    },

    /// Expected handler keys were missing at composition time.
    #[error("Missing {kind} handlers: {}", .type_names.join(", "))]
    MissingHandlers {
        /// Kind of handler being verified.
        kind: HandlerKind,
        /// Type keys without a handler.
        type_names: Vec<String>,
    },

    /// The operation did not finish within its configured timeout.
    ///
    /// The underlying work is not guaranteed to have stopped.
    #[error("{operation} timeout after {timeout_ms}ms")]
    Timeout {
        /// Human-readable operation label, e.g. `Command execution`.
        operation: String,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// Input failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A handler reported a failure.
    #[error("{0}")]
    Handler(String),

    /// Handler code panicked; the panic was contained at a kernel boundary.
    #[error("Handler panicked during {context}: {message}")]
    Panicked {
        /// What the kernel was doing when the panic happened.
        context: String,
        /// Panic payload rendered as text.
        message: String,
    },

    /// A payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A module with the same name is already registered.
    #[error("Module already registered: {0}")]
    ModuleAlreadyRegistered(String),

    /// A module declared a dependency that is not registered.
    #[error("Module {module} depends on unregistered module {dependency}")]
    MissingDependency {
        /// The dependent module.
        module: String,
        /// The unresolved dependency name.
        dependency: String,
    },

    /// Module dependencies form a cycle.
    #[error("Module dependency cycle detected: {}", .path.join(" -> "))]
    DependencyCycle {
        /// Module names along the cycle, first and last equal.
        path: Vec<String>,
    },

    /// An operation required an initialized module.
    #[error("Module {0} is not initialized")]
    ModuleNotInitialized(String),

    /// A module's initialization hook failed.
    #[error("Module {module} failed to initialize: {message}")]
    ModuleInitialization {
        /// The failing module.
        module: String,
        /// Underlying failure.
        message: String,
    },

    /// A transaction failed on every attempt.
    #[error("Transaction {transaction_id} failed after {attempts} attempt(s): {message}")]
    Transaction {
        /// Transaction identifier (`tx_...`).
        transaction_id: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last failure.
        message: String,
    },

    /// Error reported by the database driver.
    #[error("Database error: {0}")]
    Database(String),

    /// A pipeline step failed and the pipeline does not continue on error.
    #[error("Pipeline step {step} failed: {message}")]
    PipelineStep {
        /// Name of the failing step.
        step: String,
        /// Underlying failure.
        message: String,
        /// Steps that completed before the failure.
        executed_steps: Vec<String>,
        /// Steps that were skipped before the failure.
        skipped_steps: Vec<String>,
        /// Elapsed time until the failure.
        elapsed_ms: u64,
    },

    /// Unexpected internal fault.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KernelError {
    /// Missing-handler error for a message kind and type key.
    #[must_use]
    pub fn handler_not_found(kind: HandlerKind, type_name: impl Into<String>) -> Self {
        Self::HandlerNotFound {
            kind,
            type_name: type_name.into(),
        }
    }

    /// Duplicate-registration error for a message kind and type key.
    #[must_use]
    pub fn duplicate_handler(kind: HandlerKind, type_name: impl Into<String>) -> Self {
        Self::DuplicateHandler {
            kind,
            type_name: type_name.into(),
        }
    }

    /// Timeout error for `operation` after `timeout`.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: duration_millis(timeout),
        }
    }

    /// Handler failure with a message.
    #[must_use]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Validation failure with a message.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convenience extractors on [`KernelResult`].
pub trait ResultExt<T> {
    /// The success value, or `default` on error.
    fn value_or_default(self, default: T) -> T;

    /// The error, or `default` on success.
    fn error_or_default(self, default: KernelError) -> KernelError;
}

impl<T> ResultExt<T> for KernelResult<T> {
    fn value_or_default(self, default: T) -> T {
        self.unwrap_or(default)
    }

    fn error_or_default(self, default: KernelError) -> KernelError {
        self.err().unwrap_or(default)
    }
}

/// Milliseconds in a duration, saturating at `u64::MAX`.
#[must_use]
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
