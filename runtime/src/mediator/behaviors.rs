//! Standard pipeline behaviors.

use super::{Next, PipelineBehavior, RequestEnvelope, Response};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use wiz_kernel_core::{KernelResult, Request};

/// Logs entry, completion and failure of every request. Priority 1000.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBehavior;

impl LoggingBehavior {
    /// Priority of the behavior.
    pub const PRIORITY: i32 = 1000;
}

impl PipelineBehavior for LoggingBehavior {
    fn handle(&self, request: RequestEnvelope, next: Next) -> BoxFuture<'_, KernelResult<Response>> {
        Box::pin(async move {
            let request_type = request.request_type();
            let request_id = request.request_id().to_owned();
            let correlation_id = request.correlation_id().to_owned();
            tracing::info!(
                request_type,
                request_id = %request_id,
                correlation_id = %correlation_id,
                "Request started"
            );

            let started = Instant::now();
            let result = next(request).await;
            let duration_ms = started.elapsed().as_millis();

            match &result {
                Ok(_) => tracing::info!(
                    request_type,
                    request_id = %request_id,
                    correlation_id = %correlation_id,
                    duration_ms,
                    "Request completed"
                ),
                Err(err) => tracing::error!(
                    request_type,
                    request_id = %request_id,
                    correlation_id = %correlation_id,
                    duration_ms,
                    error = %err,
                    "Request failed"
                ),
            }
            result
        })
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }
}

type Validator = Arc<dyn Fn(&RequestEnvelope) -> KernelResult<()> + Send + Sync>;

/// Runs a validator before the rest of the pipeline. Priority 900.
///
/// A failed validation short-circuits: inner behaviors and the handler never
/// run and the validator's error is the request's result.
#[derive(Clone)]
pub struct ValidationBehavior {
    validator: Validator,
    request_type: Option<&'static str>,
}

impl ValidationBehavior {
    /// Priority of the behavior.
    pub const PRIORITY: i32 = 900;

    /// Validate every request with `validator`.
    pub fn new<F>(validator: F) -> Self
    where
        F: Fn(&RequestEnvelope) -> KernelResult<()> + Send + Sync + 'static,
    {
        Self {
            validator: Arc::new(validator),
            request_type: None,
        }
    }

    /// Validate only requests of type `R`, seeing the typed payload.
    pub fn for_request<R, F>(validator: F) -> Self
    where
        R: Request,
        F: Fn(&R) -> KernelResult<()> + Send + Sync + 'static,
    {
        Self {
            validator: Arc::new(move |envelope: &RequestEnvelope| {
                envelope.payload::<R>().map_or(Ok(()), &validator)
            }),
            request_type: Some(R::REQUEST_TYPE),
        }
    }
}

impl std::fmt::Debug for ValidationBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationBehavior")
            .field("request_type", &self.request_type)
            .finish_non_exhaustive()
    }
}

impl PipelineBehavior for ValidationBehavior {
    fn handle(&self, request: RequestEnvelope, next: Next) -> BoxFuture<'_, KernelResult<Response>> {
        Box::pin(async move {
            if let Err(err) = (self.validator)(&request) {
                tracing::warn!(
                    request_type = request.request_type(),
                    request_id = request.request_id(),
                    error = %err,
                    "Request validation failed"
                );
                return Err(err);
            }
            next(request).await
        })
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn applies_to(&self, request_type: &str) -> bool {
        self.request_type.is_none_or(|only| only == request_type)
    }
}

/// Warns when a request takes longer than a threshold. Priority 100.
///
/// Never fails or delays the request.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceMonitoringBehavior {
    threshold: Duration,
}

impl PerformanceMonitoringBehavior {
    /// Priority of the behavior.
    pub const PRIORITY: i32 = 100;

    /// Warn above `threshold`.
    #[must_use]
    pub const fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    /// The slow-request threshold.
    #[must_use]
    pub const fn threshold(&self) -> Duration {
        self.threshold
    }
}

impl Default for PerformanceMonitoringBehavior {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl PipelineBehavior for PerformanceMonitoringBehavior {
    fn handle(&self, request: RequestEnvelope, next: Next) -> BoxFuture<'_, KernelResult<Response>> {
        Box::pin(async move {
            let request_type = request.request_type();
            let request_id = request.request_id().to_owned();
            let started = Instant::now();
            let result = next(request).await;
            let elapsed = started.elapsed();

            if elapsed > self.threshold {
                tracing::warn!(
                    request_type,
                    request_id = %request_id,
                    duration_ms = elapsed.as_millis(),
                    threshold_ms = self.threshold.as_millis(),
                    "Slow request detected"
                );
            }
            result
        })
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mediator::Mediator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiz_kernel_core::{KernelError, RequestHandler};

    struct CreateAgent {
        id: String,
        name: String,
    }

    impl Request for CreateAgent {
        type Response = String;
        const REQUEST_TYPE: &'static str = "CreateAgent";

        fn request_id(&self) -> &str {
            &self.id
        }
    }

    struct CreateAgentHandler {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl RequestHandler<CreateAgent> for CreateAgentHandler {
        fn handle(&self, request: CreateAgent) -> BoxFuture<'_, KernelResult<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(format!("agent-{}", request.name))
            })
        }
    }

    fn mediator_with(delay: Duration) -> (Mediator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mediator = Mediator::default();
        mediator
            .register_request_handler(CreateAgentHandler {
                calls: Arc::clone(&calls),
                delay,
            })
            .unwrap();
        (mediator, calls)
    }

    fn create(name: &str) -> CreateAgent {
        CreateAgent {
            id: "req-1".to_owned(),
            name: name.to_owned(),
        }
    }

    #[tokio::test]
    async fn typed_validation_short_circuits_the_handler() {
        let (mediator, calls) = mediator_with(Duration::ZERO);
        mediator.register_behavior(LoggingBehavior);
        mediator.register_behavior(ValidationBehavior::for_request(|request: &CreateAgent| {
            if request.name.is_empty() {
                Err(KernelError::validation("name is required"))
            } else {
                Ok(())
            }
        }));

        assert_eq!(
            mediator.send(create("")).await,
            Err(KernelError::validation("name is required"))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(mediator.send(create("ada")).await, Ok("agent-ada".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn typed_validation_applies_only_to_its_request() {
        let behavior = ValidationBehavior::for_request(|_: &CreateAgent| Ok(()));
        assert!(behavior.applies_to("CreateAgent"));
        assert!(!behavior.applies_to("DeleteAgent"));
        assert!(ValidationBehavior::new(|_| Ok(())).applies_to("DeleteAgent"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_requests_still_succeed() {
        let (mediator, calls) = mediator_with(Duration::from_secs(2));
        mediator.register_behavior(PerformanceMonitoringBehavior::default());

        assert_eq!(mediator.send(create("ada")).await, Ok("agent-ada".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn standard_priorities() {
        assert_eq!(LoggingBehavior.priority(), 1000);
        assert_eq!(ValidationBehavior::new(|_| Ok(())).priority(), 900);
        assert_eq!(PerformanceMonitoringBehavior::default().priority(), 100);
        assert_eq!(
            PerformanceMonitoringBehavior::default().threshold(),
            Duration::from_secs(1)
        );
    }
}
