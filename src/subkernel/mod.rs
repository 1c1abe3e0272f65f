//! Embedded sub-kernels for secondary languages.
//!
//! A [`SubKernelManager`] owns the entry point into one secondary runtime,
//! launched lazily on first use. The [`SubKernelRegistry`] guarantees at most
//! one manager per kernel name and routes comms to the manager that owns
//! them.

pub mod process;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::evaluator::ExecutionContext;
use crate::{AppError, Result};

/// Handle used to dispatch calls into a running secondary runtime.
pub trait SubKernelEntryPoint: Send + Sync {
    /// Evaluate `code` in the secondary runtime.
    fn evaluate(&self, code: String) -> BoxFuture<'_, Result<Value>>;

    /// Forward a comm payload to the secondary runtime.
    fn send_comm_message(&self, comm_id: String, data: Value) -> BoxFuture<'_, Result<()>>;

    /// Stop the secondary runtime.
    fn shutdown(&self) -> BoxFuture<'_, Result<()>>;
}

/// Starts secondary runtimes by name.
pub trait SubKernelLauncher: Send + Sync {
    /// Whether `name` can be launched at all.
    fn is_available(&self, name: &str) -> bool;

    /// Launch the runtime for `name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NoSuchSubKernel` for unknown names and
    /// `AppError::SubKernel` when the runtime fails to start.
    fn launch<'a>(
        &'a self,
        name: &'a str,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Arc<dyn SubKernelEntryPoint>>>;
}

/// Launcher that knows no secondary runtimes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSubKernels;

impl SubKernelLauncher for NoSubKernels {
    fn is_available(&self, _name: &str) -> bool {
        false
    }

    fn launch<'a>(
        &'a self,
        name: &'a str,
        _context: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Arc<dyn SubKernelEntryPoint>>> {
        Box::pin(async move { Err(AppError::NoSuchSubKernel(name.to_owned())) })
    }
}

/// Lazily launched secondary runtime bound to one kernel name.
pub struct SubKernelManager {
    name: String,
    context: ExecutionContext,
    launcher: Arc<dyn SubKernelLauncher>,
    entry_point: OnceCell<Arc<dyn SubKernelEntryPoint>>,
    closed: AtomicBool,
}

impl SubKernelManager {
    /// Bind a manager to `name`; nothing is launched yet.
    #[must_use]
    pub fn new(
        name: String,
        context: ExecutionContext,
        launcher: Arc<dyn SubKernelLauncher>,
    ) -> Self {
        Self {
            name,
            context,
            launcher,
            entry_point: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Kernel name this manager serves.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution context the runtime is launched with.
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Whether the runtime has been launched.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.entry_point.initialized()
    }

    /// Entry point into the runtime, launching it on first call.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NoSuchSubKernel` if the manager was closed or the
    /// launcher cannot resolve the name, or the launcher's startup error.
    pub async fn entry_point(&self) -> Result<Arc<dyn SubKernelEntryPoint>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::NoSuchSubKernel(format!(
                "{} has been shut down",
                self.name
            )));
        }
        let entry = self
            .entry_point
            .get_or_try_init(|| async {
                info!(kernel = %self.name, "launching sub-kernel");
                self.launcher.launch(&self.name, &self.context).await
            })
            .await?;
        Ok(Arc::clone(entry))
    }

    /// Shut the runtime down if it was launched. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the runtime's shutdown error.
    pub async fn exit(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(entry) = self.entry_point.get() {
            entry.shutdown().await?;
            info!(kernel = %self.name, "sub-kernel stopped");
        }
        Ok(())
    }
}

/// Registry of sub-kernel managers plus the comm → kernel name routing map.
pub struct SubKernelRegistry {
    launcher: Arc<dyn SubKernelLauncher>,
    managers: Mutex<HashMap<String, Arc<SubKernelManager>>>,
    comm_kernels: Mutex<HashMap<String, String>>,
    /// Set by `close_all` while holding the `managers` lock.
    closed: AtomicBool,
}

impl SubKernelRegistry {
    /// Create an empty registry launching runtimes through `launcher`.
    #[must_use]
    pub fn new(launcher: Arc<dyn SubKernelLauncher>) -> Self {
        Self {
            launcher,
            managers: Mutex::new(HashMap::new()),
            comm_kernels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn managers(&self) -> MutexGuard<'_, HashMap<String, Arc<SubKernelManager>>> {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn comm_kernels(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.comm_kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Launcher backing this registry.
    #[must_use]
    pub fn launcher(&self) -> &Arc<dyn SubKernelLauncher> {
        &self.launcher
    }

    /// Existing manager for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<SubKernelManager>> {
        self.managers().get(name).cloned()
    }

    /// Manager for `name`, creating and installing it if absent.
    ///
    /// `context` is only evaluated on a miss and runs outside the registry
    /// lock. Under concurrent misses exactly one manager is installed and
    /// every caller receives it. After [`close_all`](Self::close_all) a miss
    /// yields a detached manager that is already shut down.
    pub fn get_or_create(
        &self,
        name: &str,
        context: impl FnOnce() -> ExecutionContext,
    ) -> Arc<SubKernelManager> {
        if let Some(manager) = self.get(name) {
            return manager;
        }

        let context = context();
        let mut managers = self.managers();
        if self.closed.load(Ordering::SeqCst) {
            warn!(kernel = name, "sub-kernel requested after shutdown");
            let manager =
                SubKernelManager::new(name.to_owned(), context, Arc::clone(&self.launcher));
            manager.closed.store(true, Ordering::SeqCst);
            return Arc::new(manager);
        }
        let manager = managers.entry(name.to_owned()).or_insert_with(|| {
            info!(kernel = name, "sub-kernel manager created");
            Arc::new(SubKernelManager::new(
                name.to_owned(),
                context,
                Arc::clone(&self.launcher),
            ))
        });
        Arc::clone(manager)
    }

    /// Record that `comm_id` belongs to `kernel_name`. Last write wins.
    pub fn associate_comm(&self, comm_id: &str, kernel_name: &str) {
        let previous = self
            .comm_kernels()
            .insert(comm_id.to_owned(), kernel_name.to_owned());
        if let Some(previous) = previous.filter(|p| p != kernel_name) {
            warn!(
                comm_id,
                previous = %previous,
                current = kernel_name,
                "comm re-associated with a different sub-kernel"
            );
        }
    }

    /// Kernel name owning `comm_id`.
    #[must_use]
    pub fn kernel_name_for_comm(&self, comm_id: &str) -> Option<String> {
        self.comm_kernels().get(comm_id).cloned()
    }

    /// Manager owning `comm_id`; absent if either lookup misses.
    #[must_use]
    pub fn by_comm(&self, comm_id: &str) -> Option<Arc<SubKernelManager>> {
        let name = self.kernel_name_for_comm(comm_id)?;
        self.get(&name)
    }

    /// Names of installed managers.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.managers().keys().cloned().collect()
    }

    /// Close every installed manager, continuing past failures. No new
    /// manager is installed afterwards.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Teardown` naming every manager that failed.
    pub async fn close_all(&self) -> Result<()> {
        let snapshot: Vec<Arc<SubKernelManager>> = {
            let managers = self.managers();
            self.closed.store(true, Ordering::SeqCst);
            managers.values().cloned().collect()
        };
        let mut failures = Vec::new();

        for manager in snapshot {
            if let Err(err) = manager.exit().await {
                warn!(kernel = %manager.name(), %err, "sub-kernel failed to stop");
                failures.push(format!("{}: {err}", manager.name()));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AppError::Teardown(failures.join("; ")))
        }
    }
}
