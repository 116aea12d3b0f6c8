//! Request/response and notification mediator.
//!
//! A request is answered by exactly one handler, wrapped in the registered
//! [`PipelineBehavior`]s that apply to its type. Behaviors are ordered by
//! descending priority, the highest priority running outermost. The whole
//! pipeline runs on its own task raced against the request timeout.
//!
//! A notification goes to every handler registered for its type, in bounded
//! concurrent chunks. Handler failures are logged and counted and never fail
//! the publish.
//!
//! # Example
//!
//! ```
//! use futures::future::BoxFuture;
//! use wiz_kernel_core::{KernelResult, Request, RequestHandler};
//! use wiz_kernel_runtime::mediator::{Mediator, MediatorConfig, behaviors::LoggingBehavior};
//!
//! struct Greet {
//!     id: String,
//!     name: String,
//! }
//!
//! impl Request for Greet {
//!     type Response = String;
//!     const REQUEST_TYPE: &'static str = "Greet";
//!
//!     fn request_id(&self) -> &str {
//!         &self.id
//!     }
//! }
//!
//! struct GreetHandler;
//!
//! impl RequestHandler<Greet> for GreetHandler {
//!     fn handle(&self, request: Greet) -> BoxFuture<'_, KernelResult<String>> {
//!         Box::pin(async move { Ok(format!("hello {}", request.name)) })
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mediator = Mediator::new(MediatorConfig::default());
//! mediator.register_request_handler(GreetHandler).unwrap();
//! mediator.register_behavior(LoggingBehavior);
//!
//! let reply = mediator
//!     .send(Greet { id: "r-1".into(), name: "Ada".into() })
//!     .await
//!     .unwrap();
//! assert_eq!(reply, "hello Ada");
//! # }
//! ```

pub mod behaviors;

use crate::execution::run_guarded;
use crate::metrics::MediatorMetrics;
use chrono::Utc;
use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use wiz_kernel_core::{
    HandlerKind, KernelError, KernelResult, Notification, NotificationHandler, Request,
    RequestHandler,
};

/// Mediator configuration.
///
/// # Default Values
///
/// - `request_timeout`: 30 seconds
/// - `max_concurrent_notifications`: 10
/// - `enable_logging`: true
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediatorConfig {
    /// How long `send` waits for the pipeline
    pub request_timeout: Duration,
    /// Notification handlers run concurrently in chunks of this size
    pub max_concurrent_notifications: usize,
    /// Log every request and notification
    pub enable_logging: bool,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_concurrent_notifications: 10,
            enable_logging: true,
        }
    }
}

impl MediatorConfig {
    /// Set the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the notification chunk size.
    #[must_use]
    pub const fn with_max_concurrent_notifications(mut self, max: usize) -> Self {
        self.max_concurrent_notifications = max;
        self
    }

    /// Enable or disable request logging.
    #[must_use]
    pub const fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }
}

/// Type-erased response travelling back through the pipeline.
pub type Response = Box<dyn Any + Send>;

/// The rest of the pipeline, as seen by a behavior.
pub type Next = Box<dyn FnOnce(RequestEnvelope) -> BoxFuture<'static, KernelResult<Response>> + Send>;

/// A request travelling through the pipeline.
pub struct RequestEnvelope {
    request_type: &'static str,
    request_id: String,
    correlation_id: String,
    payload: Box<dyn Any + Send>,
}

impl RequestEnvelope {
    /// Type key of the request.
    #[must_use]
    pub const fn request_type(&self) -> &'static str {
        self.request_type
    }

    /// Identity of the request.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Correlation id, supplied by the caller or generated as `req-{millis}-{n}`.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The typed request, if it is an `R`.
    #[must_use]
    pub fn payload<R: 'static>(&self) -> Option<&R> {
        self.payload.downcast_ref::<R>()
    }

    fn into_payload<R: 'static>(self) -> KernelResult<R> {
        let request_type = self.request_type;
        self.payload.downcast::<R>().map(|boxed| *boxed).map_err(|_| {
            KernelError::Internal(format!("Request payload does not match type {request_type}"))
        })
    }
}

impl fmt::Debug for RequestEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEnvelope")
            .field("request_type", &self.request_type)
            .field("request_id", &self.request_id)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

/// Cross-cutting wrapper around request handling.
pub trait PipelineBehavior: Send + Sync + 'static {
    /// Handle the request, usually by calling `next` somewhere inside.
    fn handle(&self, request: RequestEnvelope, next: Next) -> BoxFuture<'_, KernelResult<Response>>;

    /// Ordering key; higher runs further out.
    fn priority(&self) -> i32;

    /// Whether the behavior wraps requests of `request_type`.
    fn applies_to(&self, _request_type: &str) -> bool {
        true
    }
}

type ErasedRequestHandler =
    Arc<dyn Fn(RequestEnvelope) -> BoxFuture<'static, KernelResult<Response>> + Send + Sync>;

type ErasedNotificationHandler =
    Arc<dyn Fn(Arc<dyn Any + Send + Sync>) -> BoxFuture<'static, KernelResult<()>> + Send + Sync>;

type Behaviors = Arc<Vec<Arc<dyn PipelineBehavior>>>;

fn run_pipeline(
    chain: Behaviors,
    index: usize,
    terminal: ErasedRequestHandler,
    request: RequestEnvelope,
) -> BoxFuture<'static, KernelResult<Response>> {
    let Some(behavior) = chain.get(index).cloned() else {
        return terminal(request);
    };
    let next: Next = Box::new(move |request| run_pipeline(chain, index + 1, terminal, request));
    Box::pin(async move { behavior.handle(request, next).await })
}

/// Routes requests and notifications to their handlers.
pub struct Mediator {
    config: MediatorConfig,
    request_handlers: RwLock<HashMap<&'static str, ErasedRequestHandler>>,
    notification_handlers: RwLock<HashMap<&'static str, Vec<ErasedNotificationHandler>>>,
    behaviors: RwLock<Vec<Arc<dyn PipelineBehavior>>>,
    request_counter: AtomicU64,
}

impl Mediator {
    /// Create a mediator with no handlers.
    #[must_use]
    pub fn new(config: MediatorConfig) -> Self {
        Self {
            config,
            request_handlers: RwLock::new(HashMap::new()),
            notification_handlers: RwLock::new(HashMap::new()),
            behaviors: RwLock::new(Vec::new()),
            request_counter: AtomicU64::new(0),
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &MediatorConfig {
        &self.config
    }

    /// Register the single handler for request `R`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::DuplicateHandler`] if `R` already has a handler.
    pub fn register_request_handler<R, H>(&self, handler: H) -> KernelResult<()>
    where
        R: Request,
        H: RequestHandler<R>,
    {
        let handler = Arc::new(handler);
        let erased: ErasedRequestHandler = Arc::new(move |request: RequestEnvelope| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let request = request.into_payload::<R>()?;
                let response = handler.handle(request).await?;
                Ok(Box::new(response) as Response)
            })
        });

        let mut handlers = write(&self.request_handlers);
        if handlers.contains_key(R::REQUEST_TYPE) {
            return Err(KernelError::duplicate_handler(HandlerKind::Request, R::REQUEST_TYPE));
        }
        handlers.insert(R::REQUEST_TYPE, erased);
        tracing::debug!(request_type = R::REQUEST_TYPE, "Request handler registered");
        Ok(())
    }

    /// Add a handler for notification `N`. Any number may be registered.
    pub fn register_notification_handler<N, H>(&self, handler: H)
    where
        N: Notification,
        H: NotificationHandler<N>,
    {
        let handler = Arc::new(handler);
        let erased: ErasedNotificationHandler =
            Arc::new(move |notification: Arc<dyn Any + Send + Sync>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let notification = notification.downcast::<N>().map_err(|_| {
                        KernelError::Internal(format!(
                            "Notification payload does not match type {}",
                            N::NOTIFICATION_TYPE
                        ))
                    })?;
                    handler.handle(notification).await
                })
            });

        let mut handlers = write(&self.notification_handlers);
        let list = handlers.entry(N::NOTIFICATION_TYPE).or_default();
        list.push(erased);
        tracing::debug!(
            notification_type = N::NOTIFICATION_TYPE,
            handler_count = list.len(),
            "Notification handler registered"
        );
    }

    /// Add a pipeline behavior. Equal priorities keep registration order.
    pub fn register_behavior<B: PipelineBehavior>(&self, behavior: B) {
        let priority = behavior.priority();
        let mut behaviors = write(&self.behaviors);
        let position = behaviors.partition_point(|existing| existing.priority() >= priority);
        behaviors.insert(position, Arc::new(behavior));
        tracing::debug!(priority, "Pipeline behavior registered");
    }

    /// Send a request through the pipeline to its handler.
    ///
    /// # Errors
    ///
    /// - [`KernelError::HandlerNotFound`] when `R` has no handler.
    /// - [`KernelError::Timeout`] ("Request timeout after Nms") when the
    ///   pipeline outlives the request timeout.
    /// - [`KernelError::Panicked`] when a behavior or the handler panics.
    /// - Any error a behavior or the handler returns.
    pub async fn send<R: Request>(&self, request: R) -> KernelResult<R::Response> {
        let started = Instant::now();
        let request_id = request.request_id().to_owned();
        let correlation_id = request
            .correlation_id()
            .map_or_else(|| self.next_correlation_id(), ToOwned::to_owned);

        if self.config.enable_logging {
            tracing::debug!(
                request_type = R::REQUEST_TYPE,
                request_id = %request_id,
                correlation_id = %correlation_id,
                "Processing request"
            );
        }

        let Some(handler) = read(&self.request_handlers).get(R::REQUEST_TYPE).cloned() else {
            MediatorMetrics::record_request(false);
            return Err(KernelError::handler_not_found(
                HandlerKind::Request,
                R::REQUEST_TYPE,
            ));
        };

        let chain: Behaviors = Arc::new(
            read(&self.behaviors)
                .iter()
                .filter(|behavior| behavior.applies_to(R::REQUEST_TYPE))
                .cloned()
                .collect(),
        );
        let envelope = RequestEnvelope {
            request_type: R::REQUEST_TYPE,
            request_id: request_id.clone(),
            correlation_id: correlation_id.clone(),
            payload: Box::new(request),
        };

        let result = run_guarded(
            "Request",
            self.config.request_timeout,
            run_pipeline(chain, 0, handler, envelope),
        )
        .await
        .and_then(|response| {
            response.downcast::<R::Response>().map(|boxed| *boxed).map_err(|_| {
                KernelError::Internal(format!(
                    "Response does not match request type {}",
                    R::REQUEST_TYPE
                ))
            })
        });

        MediatorMetrics::record_request(result.is_ok());
        match &result {
            Ok(_) if self.config.enable_logging => tracing::debug!(
                request_type = R::REQUEST_TYPE,
                request_id = %request_id,
                correlation_id = %correlation_id,
                duration_ms = started.elapsed().as_millis(),
                "Request processed"
            ),
            Ok(_) => {}
            Err(err) => tracing::error!(
                request_type = R::REQUEST_TYPE,
                request_id = %request_id,
                correlation_id = %correlation_id,
                duration_ms = started.elapsed().as_millis(),
                error = %err,
                "Request failed"
            ),
        }
        result
    }

    /// Deliver a notification to every handler of its type.
    ///
    /// Handler failures, timeouts and panics are logged and counted; the
    /// publish itself always succeeds once every handler has settled.
    pub async fn publish<N: Notification>(&self, notification: N) {
        let handlers = read(&self.notification_handlers)
            .get(N::NOTIFICATION_TYPE)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::debug!(
                notification_type = N::NOTIFICATION_TYPE,
                notification_id = notification.notification_id(),
                "No handlers for notification"
            );
            MediatorMetrics::record_notification(0);
            return;
        }

        let notification_id = notification.notification_id().to_owned();
        let shared: Arc<dyn Any + Send + Sync> = Arc::new(notification);
        let timeout = self.config.request_timeout;
        let mut failures = 0;

        for chunk in handlers.chunks(self.config.max_concurrent_notifications.max(1)) {
            let outcomes = join_all(chunk.iter().map(|handler| {
                run_guarded("Notification handler", timeout, handler(Arc::clone(&shared)))
            }))
            .await;

            for err in outcomes.into_iter().filter_map(Result::err) {
                failures += 1;
                tracing::warn!(
                    notification_type = N::NOTIFICATION_TYPE,
                    notification_id = %notification_id,
                    error = %err,
                    "Notification handler failed"
                );
            }
        }

        MediatorMetrics::record_notification(failures);
        if self.config.enable_logging {
            tracing::debug!(
                notification_type = N::NOTIFICATION_TYPE,
                notification_id = %notification_id,
                handler_count = handlers.len(),
                failures,
                "Notification published"
            );
        }
    }

    /// Request types with a handler, sorted.
    #[must_use]
    pub fn registered_request_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = read(&self.request_handlers).keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Notification types with at least one handler, sorted.
    #[must_use]
    pub fn registered_notification_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> =
            read(&self.notification_handlers).keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Handlers registered for a notification type.
    #[must_use]
    pub fn notification_handler_count(&self, notification_type: &str) -> usize {
        read(&self.notification_handlers)
            .get(notification_type)
            .map_or(0, Vec::len)
    }

    /// Number of registered behaviors.
    #[must_use]
    pub fn behavior_count(&self) -> usize {
        read(&self.behaviors).len()
    }

    fn next_correlation_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req-{}-{n}", Utc::now().timestamp_millis())
    }
}

impl Default for Mediator {
    fn default() -> Self {
        Self::new(MediatorConfig::default())
    }
}

impl fmt::Debug for Mediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mediator")
            .field("config", &self.config)
            .field("request_types", &self.registered_request_types())
            .field("notification_types", &self.registered_notification_types())
            .field("behaviors", &self.behavior_count())
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use wiz_kernel_testing::helpers::CallLog;

    struct Greet {
        id: String,
        name: String,
        correlation: Option<String>,
    }

    impl Request for Greet {
        type Response = String;
        const REQUEST_TYPE: &'static str = "Greet";

        fn request_id(&self) -> &str {
            &self.id
        }

        fn correlation_id(&self) -> Option<&str> {
            self.correlation.as_deref()
        }
    }

    fn greet(name: &str) -> Greet {
        Greet {
            id: "r-1".to_owned(),
            name: name.to_owned(),
            correlation: None,
        }
    }

    struct GreetHandler {
        log: CallLog,
    }

    impl RequestHandler<Greet> for GreetHandler {
        fn handle(&self, request: Greet) -> BoxFuture<'_, KernelResult<String>> {
            self.log.record("handler");
            Box::pin(async move { Ok(format!("hello {}", request.name)) })
        }
    }

    struct Tracing {
        label: &'static str,
        priority: i32,
        log: CallLog,
        only: Option<&'static str>,
    }

    impl PipelineBehavior for Tracing {
        fn handle(&self, request: RequestEnvelope, next: Next) -> BoxFuture<'_, KernelResult<Response>> {
            Box::pin(async move {
                self.log.record(format!("{}:before", self.label));
                let response = next(request).await;
                self.log.record(format!("{}:after", self.label));
                response
            })
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn applies_to(&self, request_type: &str) -> bool {
            self.only.is_none_or(|only| only == request_type)
        }
    }

    fn behavior(label: &'static str, priority: i32, log: &CallLog) -> Tracing {
        Tracing {
            label,
            priority,
            log: log.clone(),
            only: None,
        }
    }

    #[tokio::test]
    async fn highest_priority_behavior_runs_outermost() {
        let log = CallLog::new();
        let mediator = Mediator::default();
        mediator
            .register_request_handler(GreetHandler { log: log.clone() })
            .unwrap();
        mediator.register_behavior(behavior("low", 100, &log));
        mediator.register_behavior(behavior("high", 1000, &log));
        mediator.register_behavior(behavior("mid", 900, &log));
        mediator.register_behavior(Tracing {
            only: Some("Other"),
            ..behavior("skipped", 5000, &log)
        });

        let reply = mediator.send(greet("Ada")).await.unwrap();
        assert_eq!(reply, "hello Ada");
        assert_eq!(
            log.entries(),
            vec![
                "high:before",
                "mid:before",
                "low:before",
                "handler",
                "low:after",
                "mid:after",
                "high:after",
            ]
        );
    }

    struct Reject;

    impl PipelineBehavior for Reject {
        fn handle(&self, _request: RequestEnvelope, _next: Next) -> BoxFuture<'_, KernelResult<Response>> {
            Box::pin(async { Err(KernelError::validation("blocked")) })
        }

        fn priority(&self) -> i32 {
            900
        }
    }

    #[tokio::test]
    async fn behavior_can_short_circuit() {
        let log = CallLog::new();
        let mediator = Mediator::default();
        mediator
            .register_request_handler(GreetHandler { log: log.clone() })
            .unwrap();
        mediator.register_behavior(Reject);

        let result = mediator.send(greet("Ada")).await;
        assert_eq!(result, Err(KernelError::validation("blocked")));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn missing_and_duplicate_handlers() {
        let mediator = Mediator::default();
        let err = mediator.send(greet("Ada")).await.unwrap_err();
        assert_eq!(err.to_string(), "No handler registered for request type: Greet");

        mediator
            .register_request_handler(GreetHandler { log: CallLog::new() })
            .unwrap();
        assert!(
            mediator
                .register_request_handler(GreetHandler { log: CallLog::new() })
                .is_err()
        );
        assert_eq!(mediator.registered_request_types(), vec!["Greet"]);
    }

    struct SlowHandler;

    impl RequestHandler<Greet> for SlowHandler {
        fn handle(&self, _request: Greet) -> BoxFuture<'_, KernelResult<String>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(String::new())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out() {
        let mediator =
            Mediator::new(MediatorConfig::default().with_request_timeout(Duration::from_millis(300)));
        mediator.register_request_handler(SlowHandler).unwrap();

        let started = Instant::now();
        let err = mediator.send(greet("Ada")).await.unwrap_err();
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(err.to_string(), "Request timeout after 300ms");
    }

    struct EchoCorrelation;

    impl PipelineBehavior for EchoCorrelation {
        fn handle(&self, request: RequestEnvelope, _next: Next) -> BoxFuture<'_, KernelResult<Response>> {
            let correlation = request.correlation_id().to_owned();
            Box::pin(async move { Ok(Box::new(correlation) as Response) })
        }

        fn priority(&self) -> i32 {
            1
        }
    }

    #[tokio::test]
    async fn correlation_id_is_kept_or_generated() {
        let mediator = Mediator::default();
        mediator.register_request_handler(SlowHandler).unwrap();
        mediator.register_behavior(EchoCorrelation);

        let generated = mediator.send(greet("Ada")).await.unwrap();
        assert!(generated.starts_with("req-"));

        let supplied = mediator
            .send(Greet {
                correlation: Some("corr-7".to_owned()),
                ..greet("Ada")
            })
            .await
            .unwrap();
        assert_eq!(supplied, "corr-7");
    }

    struct AgentCreated {
        id: String,
    }

    impl Notification for AgentCreated {
        const NOTIFICATION_TYPE: &'static str = "AgentCreated";

        fn notification_id(&self) -> &str {
            &self.id
        }
    }

    struct CountingListener {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl NotificationHandler<AgentCreated> for CountingListener {
        fn handle(&self, _notification: Arc<AgentCreated>) -> BoxFuture<'_, KernelResult<()>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err(KernelError::handler("listener down"))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn notification_failures_are_isolated() {
        let mediator = Mediator::new(MediatorConfig::default().with_max_concurrent_notifications(2));
        let calls = Arc::new(AtomicUsize::new(0));
        for fail in [false, true, false, true, false] {
            mediator.register_notification_handler(CountingListener {
                calls: Arc::clone(&calls),
                fail,
            });
        }

        mediator
            .publish(AgentCreated {
                id: "n-1".to_owned(),
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(mediator.notification_handler_count("AgentCreated"), 5);
        assert_eq!(mediator.registered_notification_types(), vec!["AgentCreated"]);
    }

    #[tokio::test]
    async fn notification_without_handlers_is_fine() {
        let mediator = Mediator::default();
        mediator
            .publish(AgentCreated {
                id: "n-1".to_owned(),
            })
            .await;
        assert_eq!(mediator.notification_handler_count("AgentCreated"), 0);
    }
}
