//! Ordered processing pipelines of named steps.
//!
//! Steps run in descending priority order. Each step receives the previous
//! step's output and the shared [`PipelineContext`]. A step whose
//! `should_execute` returns false is skipped. A failing step aborts the run
//! unless `continue_on_error` is set, in which case it is recorded as skipped
//! and the next step sees the unchanged input.
//!
//! # Example
//!
//! ```
//! use futures::future::BoxFuture;
//! use wiz_kernel_core::KernelResult;
//! use wiz_kernel_runtime::pipeline::{Pipeline, PipelineConfig, PipelineContext, PipelineStep};
//!
//! struct Trim;
//!
//! impl PipelineStep<String> for Trim {
//!     fn name(&self) -> &str {
//!         "trim"
//!     }
//!
//!     fn execute<'a>(
//!         &'a self,
//!         input: String,
//!         _context: &'a mut PipelineContext,
//!     ) -> BoxFuture<'a, KernelResult<String>> {
//!         Box::pin(async move { Ok(input.trim().to_owned()) })
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut pipeline = Pipeline::new(PipelineConfig::default());
//! pipeline.add_step(Trim);
//!
//! let outcome = pipeline.execute("  hi  ".to_owned(), None).await.unwrap();
//! assert_eq!(outcome.result, "hi");
//! assert_eq!(outcome.executed_steps, vec!["trim"]);
//! # }
//! ```

use crate::execution::{panic_message, run_guarded};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use wiz_kernel_core::error::duration_millis;
use wiz_kernel_core::{KernelError, KernelResult};

/// One named stage of a [`Pipeline`].
pub trait PipelineStep<T>: Send + Sync + 'static {
    /// Name recorded in executed/skipped lists.
    fn name(&self) -> &str;

    /// Ordering key; higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// Whether the step runs for this input.
    fn should_execute(&self, _input: &T) -> bool {
        true
    }

    /// Transform the input.
    fn execute<'a>(&'a self, input: T, context: &'a mut PipelineContext)
    -> BoxFuture<'a, KernelResult<T>>;
}

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Limit for a whole run
    pub timeout: Duration,
    /// Record failing steps as skipped and keep going
    pub continue_on_error: bool,
    /// Log every step
    pub enable_logging: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            continue_on_error: false,
            enable_logging: true,
        }
    }
}

impl PipelineConfig {
    /// Set the run timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Keep going after a failing step.
    #[must_use]
    pub const fn with_continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    /// Enable or disable step logging.
    #[must_use]
    pub const fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }
}

/// State shared by every step of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineContext {
    /// `pipe-{millis}-{n}`
    pub execution_id: String,
    /// When the run started
    pub start_time: DateTime<Utc>,
    /// Caller-supplied correlation id
    pub correlation_id: Option<String>,
    /// Values steps hand to later steps
    pub data: HashMap<String, Value>,
    /// Free-form execution metadata
    pub metadata: HashMap<String, Value>,
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineResult<T> {
    /// Output of the last executed step
    pub result: T,
    /// Names of steps that ran successfully, in order
    pub executed_steps: Vec<String>,
    /// Names of steps that were skipped or failed under `continue_on_error`
    pub skipped_steps: Vec<String>,
    /// Wall time of the run
    pub execution_time: Duration,
    /// Final context
    pub context: PipelineContext,
}

type Steps<T> = Arc<Vec<Arc<dyn PipelineStep<T>>>>;

/// A priority-ordered list of steps over values of type `T`.
///
/// `T: Clone` lets a failing step under `continue_on_error` leave the input
/// unchanged for the next step.
pub struct Pipeline<T> {
    config: PipelineConfig,
    steps: Steps<T>,
    execution_counter: Arc<AtomicU64>,
}

impl<T> Pipeline<T>
where
    T: Clone + Send + 'static,
{
    /// Create an empty pipeline.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            steps: Arc::new(Vec::new()),
            execution_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Add a step. Equal priorities keep insertion order.
    pub fn add_step<S: PipelineStep<T>>(&mut self, step: S) -> &mut Self {
        let priority = step.priority();
        let steps = Arc::make_mut(&mut self.steps);
        let position = steps.partition_point(|existing| existing.priority() >= priority);
        if self.config.enable_logging {
            tracing::debug!(
                step = step.name(),
                priority,
                total_steps = steps.len() + 1,
                "Pipeline step added"
            );
        }
        steps.insert(position, Arc::new(step));
        self
    }

    /// Number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Step names in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.name().to_owned()).collect()
    }

    /// Run every step over `input`.
    ///
    /// # Errors
    ///
    /// - [`KernelError::PipelineStep`] when a step fails (or panics) and
    ///   `continue_on_error` is off.
    /// - [`KernelError::Timeout`] ("Pipeline execution timeout after Nms")
    ///   when the run outlives the timeout.
    pub async fn execute(
        &self,
        input: T,
        correlation_id: Option<String>,
    ) -> KernelResult<PipelineResult<T>> {
        let n = self.execution_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let start_time = Utc::now();
        let context = PipelineContext {
            execution_id: format!("pipe-{}-{n}", start_time.timestamp_millis()),
            start_time,
            correlation_id,
            data: HashMap::new(),
            metadata: HashMap::new(),
        };
        let execution_id = context.execution_id.clone();

        if self.config.enable_logging {
            tracing::debug!(
                execution_id = %execution_id,
                step_count = self.steps.len(),
                "Pipeline execution started"
            );
        }

        let started = Instant::now();
        let result = run_guarded(
            "Pipeline execution",
            self.config.timeout,
            run_steps(Arc::clone(&self.steps), self.config.clone(), input, context, started),
        )
        .await;

        match &result {
            Ok(outcome) if self.config.enable_logging => tracing::debug!(
                execution_id = %execution_id,
                executed_steps = outcome.executed_steps.len(),
                skipped_steps = outcome.skipped_steps.len(),
                duration_ms = outcome.execution_time.as_millis(),
                "Pipeline execution completed"
            ),
            Ok(_) => {}
            Err(err) => tracing::error!(
                execution_id = %execution_id,
                duration_ms = started.elapsed().as_millis(),
                error = %err,
                "Pipeline execution failed"
            ),
        }
        result
    }
}

async fn run_steps<T: Clone + Send + 'static>(
    steps: Steps<T>,
    config: PipelineConfig,
    input: T,
    mut context: PipelineContext,
    started: Instant,
) -> KernelResult<PipelineResult<T>> {
    let mut executed_steps = Vec::new();
    let mut skipped_steps = Vec::new();
    let mut current = input;

    for step in steps.iter() {
        let name = step.name().to_owned();
        if !step.should_execute(&current) {
            if config.enable_logging {
                tracing::debug!(execution_id = %context.execution_id, step = %name, "Pipeline step skipped");
            }
            skipped_steps.push(name);
            continue;
        }

        let fallback = config.continue_on_error.then(|| current.clone());
        let step_started = Instant::now();
        let outcome = AssertUnwindSafe(step.execute(current, &mut context))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(KernelError::Panicked {
                    context: format!("pipeline step {name}"),
                    message: panic_message(payload),
                })
            });

        match (outcome, fallback) {
            (Ok(output), _) => {
                if config.enable_logging {
                    tracing::debug!(
                        execution_id = %context.execution_id,
                        step = %name,
                        duration_ms = step_started.elapsed().as_millis(),
                        "Pipeline step completed"
                    );
                }
                current = output;
                executed_steps.push(name);
            }
            (Err(err), Some(unchanged)) => {
                tracing::error!(
                    execution_id = %context.execution_id,
                    step = %name,
                    error = %err,
                    "Pipeline step failed, continuing"
                );
                current = unchanged;
                skipped_steps.push(name);
            }
            (Err(err), None) => {
                tracing::error!(
                    execution_id = %context.execution_id,
                    step = %name,
                    error = %err,
                    "Pipeline step failed"
                );
                return Err(KernelError::PipelineStep {
                    step: name,
                    message: err.to_string(),
                    executed_steps,
                    skipped_steps,
                    elapsed_ms: duration_millis(started.elapsed()),
                });
            }
        }
    }

    Ok(PipelineResult {
        result: current,
        executed_steps,
        skipped_steps,
        execution_time: started.elapsed(),
        context,
    })
}

impl<T> Clone for Pipeline<T> {
    /// A copy with the same steps and configuration and its own execution counter.
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            steps: Arc::clone(&self.steps),
            execution_counter: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<T: 'static> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|step| step.name()).collect();
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("steps", &names)
            .finish()
    }
}
