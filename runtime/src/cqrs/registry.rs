//! Type-keyed handler registries.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use wiz_kernel_core::{
    Command, CommandHandler, HandlerKind, KernelError, KernelResult, Query, QueryHandler,
};

/// Marks which kind of message a registry holds handlers for.
pub trait RegistryKind: Send + Sync + 'static {
    /// The handler kind reported in errors.
    const KIND: HandlerKind;
}

/// Marker for command registries.
#[derive(Debug)]
pub enum Commands {}

/// Marker for query registries.
#[derive(Debug)]
pub enum Queries {}

impl RegistryKind for Commands {
    const KIND: HandlerKind = HandlerKind::Command;
}

impl RegistryKind for Queries {
    const KIND: HandlerKind = HandlerKind::Query;
}

/// Registry of command handlers.
pub type CommandRegistry = HandlerRegistry<Commands>;

/// Registry of query handlers.
pub type QueryRegistry = HandlerRegistry<Queries>;

type ErasedHandler = Arc<dyn Any + Send + Sync>;

/// Maps a message type key to exactly one handler.
///
/// Handlers are stored type-erased and recovered by downcasting with the
/// message type at dispatch.
pub struct HandlerRegistry<K: RegistryKind> {
    handlers: RwLock<HashMap<&'static str, ErasedHandler>>,
    _kind: PhantomData<K>,
}

impl<K: RegistryKind> HandlerRegistry<K> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            _kind: PhantomData,
        }
    }

    /// Whether a handler is registered for `type_name`.
    #[must_use]
    pub fn has(&self, type_name: &str) -> bool {
        self.read().contains_key(type_name)
    }

    /// Registered type keys, sorted.
    #[must_use]
    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.read().keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.read().len()
    }

    /// Remove the handler for `type_name`. Returns whether one existed.
    pub fn unregister(&self, type_name: &str) -> bool {
        let removed = self.write().remove(type_name).is_some();
        if removed {
            tracing::debug!(kind = %K::KIND, type_name, "Handler unregistered");
        }
        removed
    }

    /// Remove every handler.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Verify that every key in `type_names` has a handler.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::MissingHandlers`] listing the uncovered keys.
    pub fn require(&self, type_names: &[&str]) -> KernelResult<()> {
        let handlers = self.read();
        let missing: Vec<String> = type_names
            .iter()
            .filter(|name| !handlers.contains_key(**name))
            .map(|name| (*name).to_owned())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(KernelError::MissingHandlers {
                kind: K::KIND,
                type_names: missing,
            })
        }
    }

    fn insert(&self, type_name: &'static str, handler: ErasedHandler) -> KernelResult<()> {
        let mut handlers = self.write();
        if handlers.contains_key(type_name) {
            return Err(KernelError::duplicate_handler(K::KIND, type_name));
        }
        handlers.insert(type_name, handler);
        tracing::debug!(kind = %K::KIND, type_name, "Handler registered");
        Ok(())
    }

    fn lookup(&self, type_name: &str) -> Option<ErasedHandler> {
        self.read().get(type_name).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<&'static str, ErasedHandler>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<&'static str, ErasedHandler>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HandlerRegistry<Commands> {
    /// Register the handler for command `C`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::DuplicateHandler`] if `C` already has a handler.
    pub fn register<C, H>(&self, handler: H) -> KernelResult<()>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let handler: Arc<dyn CommandHandler<C>> = Arc::new(handler);
        self.insert(C::COMMAND_TYPE, Arc::new(handler))
    }

    /// The handler registered for command `C`.
    #[must_use]
    pub fn get<C: Command>(&self) -> Option<Arc<dyn CommandHandler<C>>> {
        self.lookup(C::COMMAND_TYPE)?
            .downcast_ref::<Arc<dyn CommandHandler<C>>>()
            .cloned()
    }
}

impl HandlerRegistry<Queries> {
    /// Register the handler for query `Q`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::DuplicateHandler`] if `Q` already has a handler.
    pub fn register<Q, H>(&self, handler: H) -> KernelResult<()>
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        let handler: Arc<dyn QueryHandler<Q>> = Arc::new(handler);
        self.insert(Q::QUERY_TYPE, Arc::new(handler))
    }

    /// The handler registered for query `Q`.
    #[must_use]
    pub fn get<Q: Query>(&self) -> Option<Arc<dyn QueryHandler<Q>>> {
        self.lookup(Q::QUERY_TYPE)?
            .downcast_ref::<Arc<dyn QueryHandler<Q>>>()
            .cloned()
    }
}

impl<K: RegistryKind> Default for HandlerRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: RegistryKind> fmt::Debug for HandlerRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kind", &K::KIND)
            .field("types", &self.registered_types())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;

    struct CreateAgent;

    impl Command for CreateAgent {
        type Output = u32;
        const COMMAND_TYPE: &'static str = "CreateAgent";
    }

    struct ListAgents;

    impl Query for ListAgents {
        type Output = Vec<String>;
        const QUERY_TYPE: &'static str = "ListAgents";
    }

    struct CreateAgentHandler(u32);

    impl CommandHandler<CreateAgent> for CreateAgentHandler {
        fn handle(&self, _command: CreateAgent) -> BoxFuture<'_, KernelResult<u32>> {
            Box::pin(async move { Ok(self.0) })
        }
    }

    struct ListAgentsHandler;

    impl QueryHandler<ListAgents> for ListAgentsHandler {
        fn handle(&self, _query: ListAgents) -> BoxFuture<'_, KernelResult<Vec<String>>> {
            Box::pin(async { Ok(vec!["ada".to_owned()]) })
        }
    }

    #[tokio::test]
    async fn registered_handler_is_recovered_by_type() {
        let registry = CommandRegistry::new();
        registry.register(CreateAgentHandler(7)).unwrap();

        assert!(registry.has("CreateAgent"));
        let handler = registry.get::<CreateAgent>().unwrap();
        assert_eq!(handler.handle(CreateAgent).await, Ok(7));
        assert_eq!(handler.command_type(), "CreateAgent");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = CommandRegistry::new();
        registry.register(CreateAgentHandler(1)).unwrap();

        let err = registry.register(CreateAgentHandler(2)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Command handler already registered for type: CreateAgent"
        );
        assert_eq!(registry.handler_count(), 1);
    }

    #[test]
    fn require_reports_missing_keys() {
        let registry = QueryRegistry::new();
        registry.register(ListAgentsHandler).unwrap();

        assert!(registry.require(&["ListAgents"]).is_ok());
        assert_eq!(
            registry.require(&["ListAgents", "GetAgent", "CountAgents"]),
            Err(KernelError::MissingHandlers {
                kind: HandlerKind::Query,
                type_names: vec!["GetAgent".to_owned(), "CountAgents".to_owned()],
            })
        );
    }

    #[test]
    fn unregister_and_clear() {
        let registry = CommandRegistry::new();
        registry.register(CreateAgentHandler(1)).unwrap();
        assert_eq!(registry.registered_types(), vec!["CreateAgent"]);

        assert!(registry.unregister("CreateAgent"));
        assert!(!registry.unregister("CreateAgent"));
        assert!(registry.get::<CreateAgent>().is_none());

        registry.register(CreateAgentHandler(1)).unwrap();
        registry.clear();
        assert_eq!(registry.handler_count(), 0);
    }
}
