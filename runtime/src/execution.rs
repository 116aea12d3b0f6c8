//! Guarded execution of handler futures.
//!
//! [`run_guarded`] runs handler work on its own tokio task. The caller waits
//! for it for at most the configured timeout; when the timeout wins the task is
//! detached and keeps running in the background, only the caller stops
//! waiting. [`run_inline`] polls the work on the calling task instead, so
//! futures started in sequence begin in that sequence; a timeout drops it.
//!
//! Either way a panic is reported as [`KernelError::Panicked`] instead of
//! unwinding into the bus.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinError;
use wiz_kernel_core::{KernelError, KernelResult};

/// Run `task` on a fresh tokio task and wait up to `timeout` for it.
///
/// `operation` labels the timeout error, e.g. `"Command execution"` yields
/// `"Command execution timeout after 50ms"`.
pub(crate) async fn run_guarded<T, F>(operation: &str, timeout: Duration, task: F) -> KernelResult<T>
where
    T: Send + 'static,
    F: Future<Output = KernelResult<T>> + Send + 'static,
{
    let handle = tokio::spawn(task);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(join_failure(operation, join_error)),
        Err(_) => Err(KernelError::timeout(operation, timeout)),
    }
}

/// Poll `task` on the calling task for at most `timeout`.
pub(crate) async fn run_inline<T, F>(operation: &str, timeout: Duration, task: F) -> KernelResult<T>
where
    F: Future<Output = KernelResult<T>>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(task).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => {
            let message = panic_message(payload);
            tracing::error!(context = operation, panic = %message, "Handler panicked");
            Err(KernelError::Panicked {
                context: operation.to_owned(),
                message,
            })
        }
        Err(_) => Err(KernelError::timeout(operation, timeout)),
    }
}

/// Convert a failed join into a kernel error.
pub(crate) fn join_failure(context: &str, join_error: JoinError) -> KernelError {
    if join_error.is_panic() {
        let message = panic_message(join_error.into_panic());
        tracing::error!(context, panic = %message, "Handler panicked");
        KernelError::Panicked {
            context: context.to_owned(),
            message,
        }
    } else {
        KernelError::Internal(format!("{context} task was cancelled"))
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}
