//! Bridge from process signals to kernel entry points.
//!
//! On Unix, `SIGINT` cancels in-flight execution (the front-end's interrupt
//! button) and `SIGTERM` asks the transport to stop. Other platforms have no
//! equivalent of delivering an interrupt to a running kernel, so the wiring
//! is skipped there.

use std::sync::Weak;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::Kernel;

/// Signal listener tasks owned by a kernel; aborted on drop.
#[derive(Default)]
pub struct SignalBridge {
    tasks: Vec<JoinHandle<()>>,
}

impl SignalBridge {
    /// A bridge that listens to nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether any signal listener is installed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Install the listeners for `kernel` on the current tokio runtime.
    #[cfg(unix)]
    #[must_use]
    pub fn install(kernel: Weak<Kernel>) -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; signal bridge disabled");
            return Self::disabled();
        };
        let _enter = runtime.enter();
        let mut tasks = Vec::new();

        match signal(SignalKind::interrupt()) {
            Ok(mut sigint) => {
                let kernel = kernel.clone();
                tasks.push(runtime.spawn(async move {
                    while sigint.recv().await.is_some() {
                        let Some(kernel) = kernel.upgrade() else { break };
                        info!("received SIGINT; cancelling execution");
                        kernel.cancel_execution();
                    }
                }));
            }
            Err(err) => warn!(%err, "failed to register SIGINT handler"),
        }

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tasks.push(runtime.spawn(async move {
                    if sigterm.recv().await.is_some() {
                        if let Some(kernel) = kernel.upgrade() {
                            info!("received SIGTERM; stopping kernel");
                            kernel.request_stop();
                        }
                    }
                }));
            }
            Err(err) => warn!(%err, "failed to register SIGTERM handler"),
        }

        Self { tasks }
    }

    /// Signal wiring is not available on this platform.
    #[cfg(not(unix))]
    #[must_use]
    pub fn install(_kernel: Weak<Kernel>) -> Self {
        info!("interrupt signal wiring skipped on this platform");
        Self::disabled()
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
