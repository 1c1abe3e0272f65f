//! Message handlers, one per request type.
//!
//! The [`HandlerTable`] is built once per kernel and consulted by the
//! transport for every inbound message.

pub mod comm;
pub mod execute;
pub mod info;

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::warn;

use crate::kernel::Kernel;
use crate::message::{Message, MessageType};
use crate::{AppError, Result};

use self::comm::{CommCloseHandler, CommInfoHandler, CommMsgHandler};
use self::execute::ExecuteRequestHandler;
use self::info::{CompleteHandler, InspectHandler, InterruptHandler, ShutdownHandler};

/// Handles one inbound message type.
pub trait Handler: Send + Sync {
    /// Process `message` on behalf of `kernel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is malformed or the reply cannot be
    /// delivered.
    fn handle<'a>(&'a self, kernel: &'a Arc<Kernel>, message: Message)
        -> BoxFuture<'a, Result<()>>;

    /// Release handler resources. Called once during kernel teardown.
    ///
    /// # Errors
    ///
    /// Returns an error if resources could not be released.
    fn exit(&self) -> Result<()> {
        Ok(())
    }
}

/// Message type → handler map.
pub struct HandlerTable {
    handlers: HashMap<MessageType, Arc<dyn Handler>>,
}

impl HandlerTable {
    /// Build the stock table around the customizable `comm_open` and
    /// `kernel_info_request` handlers.
    #[must_use]
    pub fn new(comm_open: Arc<dyn Handler>, kernel_info: Arc<dyn Handler>) -> Self {
        let mut handlers: HashMap<MessageType, Arc<dyn Handler>> = HashMap::new();
        handlers.insert(
            MessageType::ExecuteRequest,
            Arc::new(ExecuteRequestHandler::new()),
        );
        handlers.insert(MessageType::KernelInfoRequest, kernel_info);
        handlers.insert(MessageType::CompleteRequest, Arc::new(CompleteHandler));
        handlers.insert(MessageType::InspectRequest, Arc::new(InspectHandler));
        handlers.insert(MessageType::CommOpen, comm_open);
        handlers.insert(MessageType::CommMsg, Arc::new(CommMsgHandler));
        handlers.insert(MessageType::CommClose, Arc::new(CommCloseHandler));
        handlers.insert(MessageType::CommInfoRequest, Arc::new(CommInfoHandler));
        handlers.insert(MessageType::InterruptRequest, Arc::new(InterruptHandler));
        handlers.insert(MessageType::ShutdownRequest, Arc::new(ShutdownHandler));
        Self { handlers }
    }

    /// Handler for `msg_type`.
    #[must_use]
    pub fn get(&self, msg_type: MessageType) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&msg_type).cloned()
    }

    /// Exit every handler, continuing past failures.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Teardown` listing the handlers that failed.
    pub fn exit(&self) -> Result<()> {
        let mut failures = Vec::new();
        for (msg_type, handler) in &self.handlers {
            if let Err(err) = handler.exit() {
                warn!(msg_type = msg_type.as_str(), %err, "handler failed to exit");
                failures.push(format!("{}: {err}", msg_type.as_str()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AppError::Teardown(failures.join("; ")))
        }
    }
}
