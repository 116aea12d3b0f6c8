//! Feature module contract.
//!
//! A module names itself, declares the modules it depends on, and goes through
//! two startup phases driven by the module container: `initialize` (build
//! internal services, subscribe to events) and then `register_ipc_handlers`
//! (expose its surface), the second phase only starting once every module has
//! finished the first.
//!
//! Most modules implement [`ModuleHooks`] and are wrapped in [`HookedModule`],
//! which runs the hooks once and refuses to register handlers before
//! initialization.

use crate::error::{KernelError, KernelResult};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};

/// A unit of startup ordering.
pub trait Module: Send + Sync {
    /// Unique module name.
    fn name(&self) -> &str;

    /// Names of modules that must be initialized first.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Build internal services. Called once by the container.
    fn initialize(&self) -> BoxFuture<'_, KernelResult<()>>;

    /// Expose the module's handlers.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleNotInitialized`] when called before
    /// [`Module::initialize`] completed.
    fn register_ipc_handlers(&self) -> KernelResult<()>;
}

/// Lifecycle hooks of a feature module.
pub trait ModuleHooks: Send + Sync {
    /// Unique module name.
    fn name(&self) -> &str;

    /// Names of modules that must be initialized first.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Build internal services.
    fn on_initialize(&self) -> BoxFuture<'_, KernelResult<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Subscribe to domain events. Runs right after [`ModuleHooks::on_initialize`].
    fn subscribe_to_events(&self) -> KernelResult<()> {
        Ok(())
    }

    /// Register the module's IPC handlers.
    fn register_handlers(&self) -> KernelResult<()> {
        Ok(())
    }
}

/// Runs [`ModuleHooks`] with an initialized guard.
#[derive(Debug)]
pub struct HookedModule<H> {
    hooks: H,
    initialized: AtomicBool,
}

impl<H: ModuleHooks> HookedModule<H> {
    /// Wrap a set of hooks.
    #[must_use]
    pub const fn new(hooks: H) -> Self {
        Self {
            hooks,
            initialized: AtomicBool::new(false),
        }
    }

    /// The wrapped hooks.
    #[must_use]
    pub const fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Whether initialization completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

impl<H: ModuleHooks> Module for HookedModule<H> {
    fn name(&self) -> &str {
        self.hooks.name()
    }

    fn dependencies(&self) -> Vec<String> {
        self.hooks.dependencies()
    }

    fn initialize(&self) -> BoxFuture<'_, KernelResult<()>> {
        Box::pin(async move {
            if self.is_initialized() {
                return Ok(());
            }
            self.hooks.on_initialize().await?;
            self.hooks.subscribe_to_events()?;
            self.initialized.store(true, Ordering::Release);
            Ok(())
        })
    }

    fn register_ipc_handlers(&self) -> KernelResult<()> {
        if !self.is_initialized() {
            return Err(KernelError::ModuleNotInitialized(self.name().to_owned()));
        }
        self.hooks.register_handlers()
    }
}
