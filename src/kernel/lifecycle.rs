//! Kernel lifecycle states, the close-kernel action, and ordered teardown.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{debug, error, info};

use crate::{AppError, Result};

/// Lifecycle state of a [`Kernel`](super::Kernel).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum KernelState {
    /// Constructed; no transport yet.
    Created,
    /// Transport started; serving requests.
    Running,
    /// Transport finished; teardown in progress.
    ShuttingDown,
    /// Teardown complete.
    Terminated,
}

/// Final action invoked after every other teardown step.
pub trait CloseKernelAction: Send + Sync {
    /// Finish the kernel process.
    ///
    /// # Errors
    ///
    /// Returns an error if the action could not complete.
    fn close(&self) -> Result<()>;
}

/// Default close action: terminate the process with status 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitProcess;

impl CloseKernelAction for ExitProcess {
    fn close(&self) -> Result<()> {
        info!("exiting kernel process");
        std::process::exit(0)
    }
}

/// Close action for embedded callers that keep the process alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepProcess;

impl CloseKernelAction for KeepProcess {
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// One named step of the shutdown sequence.
pub struct TeardownStep<'a> {
    name: &'static str,
    run: BoxFuture<'a, Result<()>>,
}

impl<'a> TeardownStep<'a> {
    /// Wrap a lazily evaluated step.
    #[must_use]
    pub fn new(name: &'static str, run: BoxFuture<'a, Result<()>>) -> Self {
        Self { name, run }
    }
}

/// Failures collected while tearing the kernel down.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// `(step, error)` for every step that failed or panicked.
    pub failures: Vec<(&'static str, AppError)>,
}

impl ShutdownReport {
    /// Whether every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run `steps` in order. A failing or panicking step is logged and the
/// remaining steps still run.
pub async fn run_teardown(steps: Vec<TeardownStep<'_>>) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    for step in steps {
        match AssertUnwindSafe(step.run).catch_unwind().await {
            Ok(Ok(())) => debug!(step = step.name, "teardown step complete"),
            Ok(Err(err)) => {
                error!(step = step.name, %err, "teardown step failed");
                report.failures.push((step.name, err));
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(step = step.name, %reason, "teardown step panicked");
                report
                    .failures
                    .push((step.name, AppError::Teardown(format!("panicked: {reason}"))));
            }
        }
    }

    report
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
