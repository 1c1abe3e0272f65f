//! Comm lifecycle handlers: open, message, close and info.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::Handler;
use crate::kernel::comm::KernelComm;
use crate::kernel::Kernel;
use crate::message::{Message, MessageType};
use crate::{AppError, Result};

/// Content key naming the sub-kernel a comm belongs to.
pub const KERNEL_KEY: &str = "kernel";

fn comm_id(message: &Message) -> Result<String> {
    message
        .content_str("comm_id")
        .map(str::to_owned)
        .ok_or_else(|| {
            AppError::Protocol(format!("{} without comm_id", message.msg_type().as_str()))
        })
}

fn data(message: &Message) -> Value {
    message
        .content
        .get("data")
        .cloned()
        .unwrap_or_else(|| json!({}))
}

/// Registers comms opened by the peer.
///
/// When the open payload names a sub-kernel under `data.kernel`, the comm
/// is routed to that sub-kernel from then on.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommOpenHandler;

impl Handler for CommOpenHandler {
    fn handle<'a>(
        &'a self,
        kernel: &'a Arc<Kernel>,
        message: Message,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let id = comm_id(&message)?;
            let target = message.content_str("target_name").unwrap_or_default().to_owned();
            let data = data(&message);

            if kernel.is_comm_present(&id) {
                warn!(comm_id = %id, "comm_open for an existing comm; keeping the original");
                return Ok(());
            }

            if let Some(name) = data.get(KERNEL_KEY).and_then(Value::as_str) {
                kernel.get_or_create_sub_kernel(name);
                kernel.associate_comm_with_kernel(&id, name);
            }

            let comm = KernelComm::new(
                id.clone(),
                target.clone(),
                kernel.session_id().to_owned(),
                data,
                kernel.output_sink(),
            );
            kernel.add_comm(&id, Arc::new(comm));
            info!(comm_id = %id, target_name = %target, "comm opened");
            Ok(())
        })
    }
}

/// Delivers `comm_msg` payloads to the owning sub-kernel or local comm.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommMsgHandler;

impl Handler for CommMsgHandler {
    fn handle<'a>(
        &'a self,
        kernel: &'a Arc<Kernel>,
        message: Message,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let id = comm_id(&message)?;
            let data = data(&message);

            if let Some(manager) = kernel.sub_kernel_by_comm(&id) {
                debug!(comm_id = %id, kernel = %manager.name(), "routing comm_msg to sub-kernel");
                let entry = manager.entry_point().await?;
                return entry.send_comm_message(id, data).await;
            }

            let comm = kernel
                .get_comm(Some(&id))
                .ok_or_else(|| AppError::NotFound(format!("comm {id}")))?;
            comm.handle_message(data)
        })
    }
}

/// Forgets comms the peer has closed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommCloseHandler;

impl Handler for CommCloseHandler {
    fn handle<'a>(
        &'a self,
        kernel: &'a Arc<Kernel>,
        message: Message,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let id = comm_id(&message)?;
            if !kernel.is_comm_present(&id) {
                debug!(comm_id = %id, "comm_close for unknown comm");
            }
            kernel.remove_comm(Some(&id));
            Ok(())
        })
    }
}

/// Lists open comms, optionally filtered by `target_name`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommInfoHandler;

impl Handler for CommInfoHandler {
    fn handle<'a>(
        &'a self,
        kernel: &'a Arc<Kernel>,
        message: Message,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let filter = message.content_str("target_name");
            let mut comms = Map::new();
            for id in kernel.comm_ids() {
                let Some(comm) = kernel.get_comm(Some(&id)) else {
                    continue;
                };
                if filter.is_some_and(|target| target != comm.target_name()) {
                    continue;
                }
                comms.insert(id, json!({ "target_name": comm.target_name() }));
            }
            kernel.send(message.reply(
                MessageType::CommInfoReply,
                json!({ "status": "ok", "comms": comms }),
            ))
        })
    }
}
