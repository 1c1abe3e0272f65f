//! Process-wide directory of the active kernel.
//!
//! Collaborators that need "the current kernel" receive an
//! `Arc<KernelDirectory>` instead of reaching for a global. The directory
//! holds a weak reference, so it never keeps a finished kernel alive.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::debug;

use super::Kernel;

/// Directory tracking the kernel currently serving this process.
#[derive(Default)]
pub struct KernelDirectory {
    active: Mutex<Weak<Kernel>>,
}

impl KernelDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `kernel` the active kernel, replacing any previous one.
    pub fn register(&self, kernel: &Arc<Kernel>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(kernel);
        debug!(session_id = %kernel.session_id(), "kernel registered as active");
    }

    /// The active kernel, if one is registered and still alive.
    #[must_use]
    pub fn active(&self) -> Option<Arc<Kernel>> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }
}
