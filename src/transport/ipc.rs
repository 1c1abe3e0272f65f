//! Local-socket transport.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Peers write one [`Message`] JSON object
//! per line and receive [`Frame`]s, also one per line:
//!
//! ```json
//! {"header": {"msg_id": "1", "msg_type": "execute_request", "session": "s"}, "content": {"code": "echo hi"}}
//! ```
//!
//! ```json
//! {"channel": "iopub", "message": {"header": {"msg_type": "status", ...}, "content": {"execution_state": "busy"}}}
//! ```
//!
//! Every connected peer sees every frame. Requests from one peer run in
//! arrival order, except `interrupt_request` and `shutdown_request`, which
//! are dispatched immediately so they can reach a busy kernel.
//!
//! Stopping the transport ends the accept loop and the peer readers, but
//! peer writers keep delivering frames until [`Transport::flush`] closes the
//! frame channel. Frames published during teardown (`comm_close`, the last
//! outputs, the final idle) therefore still reach the peers.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{Channel, Frame, OnClose, Transport, TransportFactory};
use crate::codec::LineCodec;
use crate::kernel::Kernel;
use crate::message::{Message, MessageType};
use crate::{AppError, Result};

/// Frames buffered per peer before a slow peer starts losing them.
const FRAME_BUFFER: usize = 1024;

/// Upper bound on waiting for peers to take their last frames.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates [`IpcTransport`]s listening on one socket name.
#[derive(Debug, Clone)]
pub struct IpcTransportFactory {
    name: String,
}

impl IpcTransportFactory {
    /// Factory for the socket `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TransportFactory for IpcTransportFactory {
    fn create(
        &self,
        kernel: Arc<Kernel>,
        stop: CancellationToken,
        on_close: OnClose,
    ) -> Result<Arc<dyn Transport>> {
        if self.name.trim().is_empty() {
            return Err(AppError::Transport("ipc socket name is empty".into()));
        }
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        let (writer_guard, writers_done) = mpsc::channel(1);
        Ok(Arc::new(IpcTransport {
            name: self.name.clone(),
            kernel: Mutex::new(Some(kernel)),
            stop,
            on_close: Mutex::new(Some(on_close)),
            frames: Mutex::new(Some(frames)),
            writer_guard: Mutex::new(Some(writer_guard)),
            writers_done: tokio::sync::Mutex::new(writers_done),
            server: Mutex::new(None),
        }))
    }
}

/// Transport serving one kernel over a local socket.
pub struct IpcTransport {
    name: String,
    kernel: Mutex<Option<Arc<Kernel>>>,
    stop: CancellationToken,
    on_close: Mutex<Option<OnClose>>,
    /// `None` once flushed.
    frames: Mutex<Option<broadcast::Sender<String>>>,
    /// Every peer writer holds a clone; the receiver sees `None` when the
    /// last one has finished.
    writer_guard: Mutex<Option<mpsc::Sender<()>>>,
    writers_done: tokio::sync::Mutex<mpsc::Receiver<()>>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl IpcTransport {
    fn broadcast(&self, channel: Channel, message: Message) -> Result<()> {
        let line = serde_json::to_string(&Frame { channel, message })?;
        let frames = self
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match frames {
            Some(frames) => {
                if frames.send(line).is_err() {
                    debug!(?channel, "no peer connected; frame dropped");
                }
            }
            None => debug!(?channel, "transport flushed; frame dropped"),
        }
        Ok(())
    }

    fn run_on_close(&self) {
        let on_close = self
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(on_close) = on_close {
            on_close();
        }
    }
}

impl Transport for IpcTransport {
    fn start(&self) -> Result<()> {
        let kernel = self
            .kernel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| AppError::Transport("ipc transport already started".into()))?;

        let name = self.name.clone();
        let listener_name = name
            .clone()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| AppError::Transport(format!("invalid ipc socket name '{name}': {err}")))?;
        let listener = ListenerOptions::new()
            .name(listener_name)
            .create_tokio()
            .map_err(|err| AppError::Transport(format!("failed to create ipc listener: {err}")))?;

        info!(ipc_name = %name, "ipc transport listening");

        let frames = self
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| AppError::Transport("ipc transport already flushed".into()))?;
        let writer_guard = self
            .writer_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| AppError::Transport("ipc transport already flushed".into()))?;

        let stop = self.stop.clone();
        let handle = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = stop.cancelled() => {
                            info!("ipc transport shutting down");
                            break;
                        }
                        accepted = listener.accept() => match accepted {
                            Ok(stream) => {
                                tokio::spawn(serve_peer(
                                    stream,
                                    Arc::clone(&kernel),
                                    frames.subscribe(),
                                    writer_guard.clone(),
                                    stop.clone(),
                                ));
                            }
                            Err(err) => warn!(%err, "ipc accept failed"),
                        },
                    }
                }
            }
            .instrument(info_span!("ipc_server", name = %self.name)),
        );

        *self.server.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    fn join(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let server = self
                .server
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let outcome = match server {
                Some(handle) => handle.await.map_err(|err| {
                    AppError::TransportInterrupted(format!("ipc server task failed: {err}"))
                }),
                None => Err(AppError::Transport("ipc transport was not started".into())),
            };
            self.run_on_close();
            outcome
        })
    }

    fn publish(&self, messages: Vec<Message>) -> Result<()> {
        for message in messages {
            self.broadcast(Channel::Iopub, message)?;
        }
        Ok(())
    }

    fn send(&self, message: Message) -> Result<()> {
        self.broadcast(Channel::Shell, message)
    }

    fn flush(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.frames
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            self.writer_guard
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();

            let mut writers_done = self.writers_done.lock().await;
            if tokio::time::timeout(FLUSH_TIMEOUT, writers_done.recv())
                .await
                .is_err()
            {
                warn!("peers did not take their last frames in time");
            } else {
                debug!("ipc frames flushed to peers");
            }
        })
    }
}

/// Requests that bypass the per-peer queue.
fn is_control(msg_type: MessageType) -> bool {
    matches!(
        msg_type,
        MessageType::InterruptRequest | MessageType::ShutdownRequest
    )
}

async fn serve_peer(
    stream: interprocess::local_socket::tokio::Stream,
    kernel: Arc<Kernel>,
    mut frames: broadcast::Receiver<String>,
    writer_guard: mpsc::Sender<()>,
    stop: CancellationToken,
) {
    let span = info_span!("ipc_peer");
    async move {
        let (reader, writer) = stream.split();
        let mut lines = FramedRead::new(reader, LineCodec::new());
        let mut sink = FramedWrite::new(writer, LineCodec::new());

        // Runs until the frame channel closes at flush, not until stop.
        let writer_task = tokio::spawn(async move {
            let _guard = writer_guard;
            loop {
                match frames.recv().await {
                    Ok(line) => {
                        if let Err(err) = sink.send(line).await {
                            warn!(%err, "failed to write frame to peer");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "peer too slow; frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let (queue, mut requests) = mpsc::unbounded_channel::<Message>();
        let queue_kernel = Arc::clone(&kernel);
        let queue_task = tokio::spawn(async move {
            while let Some(message) = requests.recv().await {
                dispatch(&queue_kernel, message).await;
            }
        });

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        match serde_json::from_str::<Message>(&line) {
                            Ok(message) if is_control(message.msg_type()) => {
                                let kernel = Arc::clone(&kernel);
                                tokio::spawn(async move { dispatch(&kernel, message).await });
                            }
                            Ok(message) => {
                                if queue.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!(%err, "invalid message from peer"),
                        }
                    }
                    Some(Err(err)) => {
                        warn!(%err, "ipc read error");
                        break;
                    }
                    None => break,
                },
            }
        }

        drop(queue);
        if stop.is_cancelled() {
            queue_task.abort();
        } else if let Err(err) = queue_task.await {
            debug!(%err, "peer request queue ended");
        }
        if !stop.is_cancelled() {
            writer_task.abort();
        } else if let Err(err) = writer_task.await {
            debug!(%err, "peer writer ended");
        }
        info!("ipc peer disconnected");
    }
    .instrument(span)
    .await;
}

async fn dispatch(kernel: &Arc<Kernel>, message: Message) {
    let msg_type = message.msg_type();
    let Some(handler) = kernel.get_handler(msg_type) else {
        warn!(msg_type = msg_type.as_str(), "no handler for message type");
        return;
    };
    if let Err(err) = handler.handle(kernel, message).await {
        warn!(msg_type = msg_type.as_str(), %err, "handler failed");
    }
}
