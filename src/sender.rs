//! Asynchronous delivery path for execution outputs.
//!
//! Evaluators push [`ExecutionOutput`]s through [`ExecutionResultSender::update`]
//! from whatever thread they run on. A single drain task converts them into
//! protocol messages and hands them to an [`OutputSink`] in arrival order.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{self, ExecutionState, Message};
use crate::{AppError, Result};

/// One piece of output produced by an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutput {
    /// Text written to stdout.
    Stdout(String),
    /// Text written to stderr.
    Stderr(String),
    /// Value of the execution.
    Result(Value),
    /// Execution error.
    Error {
        /// Error name.
        ename: String,
        /// Error value.
        evalue: String,
    },
    /// Kernel status, queued behind the outputs it follows.
    Status(ExecutionState),
}

/// Destination for converted output messages.
pub trait OutputSink: Send + Sync {
    /// Publish messages to the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the messages could not be delivered.
    fn publish(&self, messages: Vec<Message>) -> Result<()>;
}

struct Envelope {
    parent: Message,
    execution_count: u64,
    output: ExecutionOutput,
}

/// Queue plus drain task delivering execution outputs.
#[derive(Default)]
pub struct ExecutionResultSender {
    tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionResultSender {
    /// Create a stopped sender.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the drain task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lifecycle` if the sender is already running or no
    /// runtime is available.
    pub fn start(&self, sink: Arc<dyn OutputSink>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            AppError::Lifecycle(format!("execution result sender needs a runtime: {err}"))
        })?;

        let mut tx_guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if tx_guard.is_some() {
            return Err(AppError::Lifecycle(
                "execution result sender already started".into(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *tx_guard = Some(tx);
        drop(tx_guard);

        let handle = runtime.spawn(drain(rx, sink));
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!("execution result sender started");
        Ok(())
    }

    /// Whether outputs are currently accepted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Queue one output for delivery. Dropped when the sender is stopped.
    pub fn update(&self, parent: Message, execution_count: u64, output: ExecutionOutput) {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            debug!("execution result sender stopped; dropping output");
            return;
        };
        let envelope = Envelope {
            parent,
            execution_count,
            output,
        };
        if tx.send(envelope).is_err() {
            warn!("execution result drain task is gone; dropping output");
        }
    }

    /// Stop accepting outputs and wait for queued ones to drain.
    ///
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Teardown` if the drain task panicked.
    pub async fn exit(&self) -> Result<()> {
        // Dropping the last sender closes the channel; the drain task ends
        // after flushing what is already queued.
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = worker {
            handle.await.map_err(|err| {
                AppError::Teardown(format!("execution result drain task failed: {err}"))
            })?;
            info!("execution result sender stopped");
        }
        Ok(())
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<Envelope>, sink: Arc<dyn OutputSink>) {
    while let Some(envelope) = rx.recv().await {
        let msg = to_message(&envelope);
        if let Err(err) = sink.publish(vec![msg]) {
            warn!(%err, "failed to publish execution output");
        }
    }
}

fn to_message(envelope: &Envelope) -> Message {
    let parent = &envelope.parent;
    match &envelope.output {
        ExecutionOutput::Stdout(text) => message::stream(parent, "stdout", text),
        ExecutionOutput::Stderr(text) => message::stream(parent, "stderr", text),
        ExecutionOutput::Result(value) => {
            message::execute_result(parent, envelope.execution_count, value)
        }
        ExecutionOutput::Error { ename, evalue } => message::error(parent, ename, evalue),
        ExecutionOutput::Status(state) => message::status(parent, *state),
    }
}
