//! Module dependency container.
//!
//! Modules are registered by name and started in two phases by
//! [`ModuleContainer::initialize_all`]:
//!
//! 1. Every module is initialized in dependency order (dependencies first).
//! 2. Only then does each module register its IPC handlers, in the same order.
//!
//! A module's surface therefore never becomes reachable before every
//! dependency's services exist.

use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use wiz_kernel_core::{KernelError, KernelResult, Module};

/// Lifecycle state of a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    /// Registered, not yet started.
    Registered,
    /// `initialize` is running.
    Initializing,
    /// `initialize` completed.
    Initialized,
    /// IPC handlers are registered.
    IpcRegistered,
}

impl ModuleState {
    /// Whether `initialize` has completed.
    #[must_use]
    pub const fn is_initialized(self) -> bool {
        matches!(self, Self::Initialized | Self::IpcRegistered)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Registered => "registered",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::IpcRegistered => "ipc-registered",
        })
    }
}

struct Entry {
    module: Arc<dyn Module>,
    state: ModuleState,
}

#[derive(Default)]
struct Modules {
    // Registration order keeps the topological sort deterministic.
    names: Vec<String>,
    entries: HashMap<String, Entry>,
}

/// Owns the application's modules and drives their startup.
#[derive(Default)]
pub struct ModuleContainer {
    strict: bool,
    modules: Mutex<Modules>,
    order: Mutex<Vec<String>>,
    // Held for a whole startup run so overlapping runs never initialize a
    // module twice.
    startup: tokio::sync::Mutex<()>,
}

impl ModuleContainer {
    /// A container that skips unregistered dependency names with a warning.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A container that fails startup on unregistered dependency names.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    /// Register a module.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleAlreadyRegistered`] for a duplicate name.
    pub fn register<M: Module + 'static>(&self, module: M) -> KernelResult<()> {
        self.register_shared(Arc::new(module))
    }

    /// Register a module that is shared with other owners.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleAlreadyRegistered`] for a duplicate name.
    pub fn register_shared(&self, module: Arc<dyn Module>) -> KernelResult<()> {
        let name = module.name().to_owned();
        let mut modules = lock(&self.modules);
        if modules.entries.contains_key(&name) {
            return Err(KernelError::ModuleAlreadyRegistered(name));
        }
        tracing::debug!(module = %name, dependencies = ?module.dependencies(), "Module registered");
        modules.names.push(name.clone());
        modules.entries.insert(
            name,
            Entry {
                module,
                state: ModuleState::Registered,
            },
        );
        Ok(())
    }

    /// Initialize every module in dependency order, then register every
    /// module's IPC handlers. Modules already started are skipped, so calling
    /// this again only starts modules registered since. Overlapping calls run
    /// one after the other.
    ///
    /// # Errors
    ///
    /// - [`KernelError::DependencyCycle`] when dependencies form a cycle.
    /// - [`KernelError::MissingDependency`] for an unregistered dependency in
    ///   a strict container.
    /// - [`KernelError::ModuleInitialization`] when a module fails to start.
    /// - Any error from a module's `register_ipc_handlers`.
    pub async fn initialize_all(&self) -> KernelResult<()> {
        let _startup = self.startup.lock().await;
        let order = self.resolve_order()?;
        tracing::info!(order = ?order, "Initializing modules");

        for name in &order {
            self.ensure_initialized(name).await?;
        }

        for name in &order {
            let Some((module, state)) = self.entry(name) else {
                continue;
            };
            if state == ModuleState::IpcRegistered {
                continue;
            }
            module.register_ipc_handlers()?;
            self.set_state(name, ModuleState::IpcRegistered);
            tracing::debug!(module = %name, "Module IPC handlers registered");
        }

        tracing::info!(count = order.len(), "All modules initialized");
        Ok(())
    }

    fn ensure_initialized<'a>(&'a self, name: &'a str) -> BoxFuture<'a, KernelResult<()>> {
        Box::pin(async move {
            let Some((module, state)) = self.entry(name) else {
                return Ok(());
            };
            if state.is_initialized() {
                return Ok(());
            }

            for dependency in module.dependencies() {
                self.ensure_initialized(&dependency).await?;
            }

            self.set_state(name, ModuleState::Initializing);
            tracing::debug!(module = %name, "Initializing module");
            if let Err(err) = module.initialize().await {
                self.set_state(name, ModuleState::Registered);
                tracing::error!(module = %name, error = %err, "Module initialization failed");
                return Err(KernelError::ModuleInitialization {
                    module: name.to_owned(),
                    message: err.to_string(),
                });
            }
            self.set_state(name, ModuleState::Initialized);
            lock(&self.order).push(name.to_owned());
            tracing::info!(module = %name, "Module initialized");
            Ok(())
        })
    }

    /// Registered modules in dependency order (post-order depth-first).
    fn resolve_order(&self) -> KernelResult<Vec<String>> {
        let modules = lock(&self.modules);
        let mut order = Vec::with_capacity(modules.names.len());
        let mut done = HashSet::new();
        let mut path = Vec::new();

        for name in &modules.names {
            self.visit(&modules, name, &mut done, &mut path, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        modules: &Modules,
        name: &str,
        done: &mut HashSet<String>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> KernelResult<()> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|visiting| visiting == name) {
            let mut cycle = path[start..].to_vec();
            cycle.push(name.to_owned());
            return Err(KernelError::DependencyCycle { path: cycle });
        }
        let Some(entry) = modules.entries.get(name) else {
            return Ok(());
        };

        path.push(name.to_owned());
        for dependency in entry.module.dependencies() {
            if !modules.entries.contains_key(&dependency) {
                if self.strict {
                    return Err(KernelError::MissingDependency {
                        module: name.to_owned(),
                        dependency,
                    });
                }
                tracing::warn!(module = %name, dependency = %dependency, "Skipping unregistered dependency");
                continue;
            }
            self.visit(modules, &dependency, done, path, order)?;
        }
        path.pop();

        done.insert(name.to_owned());
        order.push(name.to_owned());
        Ok(())
    }

    /// Lifecycle state of a module, if registered.
    #[must_use]
    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        lock(&self.modules).entries.get(name).map(|entry| entry.state)
    }

    /// Whether a module has completed `initialize`.
    #[must_use]
    pub fn is_initialized(&self, name: &str) -> bool {
        self.module_state(name).is_some_and(ModuleState::is_initialized)
    }

    /// The module registered under `name`.
    #[must_use]
    pub fn get_module(&self, name: &str) -> Option<Arc<dyn Module>> {
        lock(&self.modules)
            .entries
            .get(name)
            .map(|entry| Arc::clone(&entry.module))
    }

    /// Registered module names in registration order.
    #[must_use]
    pub fn module_names(&self) -> Vec<String> {
        lock(&self.modules).names.clone()
    }

    /// Names in the order their `initialize` completed.
    #[must_use]
    pub fn initialization_order(&self) -> Vec<String> {
        lock(&self.order).clone()
    }

    fn entry(&self, name: &str) -> Option<(Arc<dyn Module>, ModuleState)> {
        lock(&self.modules)
            .entries
            .get(name)
            .map(|entry| (Arc::clone(&entry.module), entry.state))
    }

    fn set_state(&self, name: &str, state: ModuleState) {
        if let Some(entry) = lock(&self.modules).entries.get_mut(name) {
            entry.state = state;
        }
    }
}

impl fmt::Debug for ModuleContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContainer")
            .field("strict", &self.strict)
            .field("modules", &self.module_names())
            .field("initialization_order", &self.initialization_order())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
