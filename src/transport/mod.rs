//! Transport abstraction between the kernel and the front-end.
//!
//! The kernel creates its transport through a [`TransportFactory`] when it
//! starts running, then suspends on [`Transport::join`] until the transport
//! stops serving.

pub mod ipc;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::kernel::Kernel;
use crate::message::Message;
use crate::Result;

/// Callback the transport runs once when it stops serving.
pub type OnClose = Box<dyn FnOnce() + Send>;

/// Logical channel an outbound message belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Direct replies to requests.
    Shell,
    /// Broadcast side effects (status, streams, results).
    Iopub,
}

/// Outbound frame: a message tagged with its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Channel the message travels on.
    pub channel: Channel,
    /// The message itself.
    pub message: Message,
}

/// A running transport.
pub trait Transport: Send + Sync {
    /// Begin accepting peers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the transport cannot bind.
    fn start(&self) -> Result<()>;

    /// Resolve once the transport has stopped serving.
    ///
    /// # Errors
    ///
    /// Returns `AppError::TransportInterrupted` if the serving task was
    /// interrupted rather than stopped.
    fn join(&self) -> BoxFuture<'_, Result<()>>;

    /// Broadcast messages on the iopub channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the messages cannot be queued.
    fn publish(&self, messages: Vec<Message>) -> Result<()>;

    /// Send a reply on the shell channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the message cannot be queued.
    fn send(&self, message: Message) -> Result<()>;

    /// Deliver everything queued so far to connected peers, then stop
    /// accepting frames. Runs once, after the kernel's last output.
    fn flush(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Builds the transport for a kernel.
pub trait TransportFactory: Send + Sync {
    /// Create a transport serving `kernel` until `stop` fires.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the transport cannot be created.
    fn create(
        &self,
        kernel: Arc<Kernel>,
        stop: CancellationToken,
        on_close: OnClose,
    ) -> Result<Arc<dyn Transport>>;
}
