//! Request/reply handlers that do not run code.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::json;
use tracing::info;

use super::Handler;
use crate::kernel::Kernel;
use crate::message::{Message, MessageType, PROTOCOL_VERSION};
use crate::Result;

fn cursor(message: &Message, code: &str) -> usize {
    message
        .content
        .get("cursor_pos")
        .and_then(serde_json::Value::as_u64)
        .and_then(|pos| usize::try_from(pos).ok())
        .unwrap_or(code.len())
}

/// Answers `kernel_info_request` with static kernel metadata.
#[derive(Debug, Clone)]
pub struct KernelInfoHandler {
    /// Implementation name.
    pub implementation: String,
    /// Implementation version.
    pub implementation_version: String,
    /// Language served by the evaluator.
    pub language: String,
    /// File extension of that language.
    pub file_extension: String,
    /// Banner shown by front-ends.
    pub banner: String,
}

impl Default for KernelInfoHandler {
    fn default() -> Self {
        Self {
            implementation: env!("CARGO_PKG_NAME").into(),
            implementation_version: env!("CARGO_PKG_VERSION").into(),
            language: "shell".into(),
            file_extension: ".sh".into(),
            banner: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Handler for KernelInfoHandler {
    fn handle<'a>(
        &'a self,
        kernel: &'a Arc<Kernel>,
        message: Message,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            kernel.send(message.reply(
                MessageType::KernelInfoReply,
                json!({
                    "status": "ok",
                    "protocol_version": PROTOCOL_VERSION,
                    "implementation": self.implementation,
                    "implementation_version": self.implementation_version,
                    "language_info": {
                        "name": self.language,
                        "file_extension": self.file_extension,
                    },
                    "banner": self.banner,
                }),
            ))
        })
    }
}

/// Answers `complete_request` through the evaluator.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompleteHandler;

impl Handler for CompleteHandler {
    fn handle<'a>(
        &'a self,
        kernel: &'a Arc<Kernel>,
        message: Message,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let code = message.content_str("code").unwrap_or_default();
            let result = kernel.autocomplete(code, cursor(&message, code));
            kernel.send(message.reply(
                MessageType::CompleteReply,
                json!({
                    "status": "ok",
                    "matches": result.matches,
                    "cursor_start": result.cursor_start,
                    "cursor_end": result.cursor_end,
                    "metadata": {},
                }),
            ))
        })
    }
}

/// Answers `inspect_request` through the evaluator.
#[derive(Debug, Default, Clone, Copy)]
pub struct InspectHandler;

impl Handler for InspectHandler {
    fn handle<'a>(
        &'a self,
        kernel: &'a Arc<Kernel>,
        message: Message,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let code = message.content_str("code").unwrap_or_default();
            let result = kernel.inspect(code, cursor(&message, code));
            let data = if result.found {
                json!({ "text/plain": result.text })
            } else {
                json!({})
            };
            kernel.send(message.reply(
                MessageType::InspectReply,
                json!({
                    "status": "ok",
                    "found": result.found,
                    "data": data,
                    "metadata": {},
                }),
            ))
        })
    }
}

/// Cancels in-flight execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptHandler;

impl Handler for InterruptHandler {
    fn handle<'a>(
        &'a self,
        kernel: &'a Arc<Kernel>,
        message: Message,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            info!("interrupt requested");
            kernel.cancel_execution();
            kernel.send(message.reply(MessageType::InterruptReply, json!({ "status": "ok" })))
        })
    }
}

/// Replies, then asks the kernel to stop.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShutdownHandler;

impl Handler for ShutdownHandler {
    fn handle<'a>(
        &'a self,
        kernel: &'a Arc<Kernel>,
        message: Message,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let restart = message
                .content
                .get("restart")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            info!(restart, "shutdown requested");
            let sent = kernel.send(message.reply(
                MessageType::ShutdownReply,
                json!({ "status": "ok", "restart": restart }),
            ));
            kernel.request_stop();
            sent
        })
    }
}
