//! Protocol message model and reply builders.
//!
//! Messages follow the kernel messaging protocol shape: a header, the
//! parent header of the request being answered, free-form metadata, and a
//! type-specific content object. The transport frames them as JSON; the
//! orchestrator never depends on the framing.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol version stamped on every header the kernel creates.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Message types understood by the kernel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Request for kernel metadata.
    KernelInfoRequest,
    /// Kernel metadata reply.
    KernelInfoReply,
    /// Request to execute a cell.
    ExecuteRequest,
    /// Final reply to an execute request.
    ExecuteReply,
    /// Broadcast of the code being executed.
    ExecuteInput,
    /// Value produced by an execution.
    ExecuteResult,
    /// Completion request.
    CompleteRequest,
    /// Completion reply.
    CompleteReply,
    /// Inspection request.
    InspectRequest,
    /// Inspection reply.
    InspectReply,
    /// Peer opens a comm.
    CommOpen,
    /// Message on an open comm.
    CommMsg,
    /// Comm closed by either side.
    CommClose,
    /// Request for the list of open comms.
    CommInfoRequest,
    /// Reply listing open comms.
    CommInfoReply,
    /// Request to shut the kernel down.
    ShutdownRequest,
    /// Reply to a shutdown request.
    ShutdownReply,
    /// Request to interrupt in-flight execution.
    InterruptRequest,
    /// Reply to an interrupt request.
    InterruptReply,
    /// Kernel busy/idle status.
    Status,
    /// Captured stdout/stderr text.
    Stream,
    /// Execution error.
    Error,
}

impl MessageType {
    /// Wire name of this message type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KernelInfoRequest => "kernel_info_request",
            Self::KernelInfoReply => "kernel_info_reply",
            Self::ExecuteRequest => "execute_request",
            Self::ExecuteReply => "execute_reply",
            Self::ExecuteInput => "execute_input",
            Self::ExecuteResult => "execute_result",
            Self::CompleteRequest => "complete_request",
            Self::CompleteReply => "complete_reply",
            Self::InspectRequest => "inspect_request",
            Self::InspectReply => "inspect_reply",
            Self::CommOpen => "comm_open",
            Self::CommMsg => "comm_msg",
            Self::CommClose => "comm_close",
            Self::CommInfoRequest => "comm_info_request",
            Self::CommInfoReply => "comm_info_reply",
            Self::ShutdownRequest => "shutdown_request",
            Self::ShutdownReply => "shutdown_reply",
            Self::InterruptRequest => "interrupt_request",
            Self::InterruptReply => "interrupt_reply",
            Self::Status => "status",
            Self::Stream => "stream",
            Self::Error => "error",
        }
    }
}

/// Message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Unique message identifier.
    pub msg_id: String,
    /// Message type.
    pub msg_type: MessageType,
    /// Session that produced the message.
    pub session: String,
    /// User name of the producer.
    #[serde(default)]
    pub username: String,
    /// RFC 3339 creation timestamp.
    #[serde(default)]
    pub date: String,
    /// Protocol version.
    #[serde(default)]
    pub version: String,
}

impl Header {
    /// Build a fresh header for `msg_type` in `session`.
    #[must_use]
    pub fn new(msg_type: MessageType, session: &str) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            msg_type,
            session: session.to_owned(),
            username: "kernel".into(),
            date: chrono::Utc::now().to_rfc3339(),
            version: PROTOCOL_VERSION.into(),
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Header of this message.
    pub header: Header,
    /// Header of the request this message answers, if any.
    #[serde(default)]
    pub parent_header: Option<Header>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Value,
    /// Type-specific content.
    #[serde(default)]
    pub content: Value,
}

impl Message {
    /// Build a new top-level message.
    #[must_use]
    pub fn new(msg_type: MessageType, session: &str, content: Value) -> Self {
        Self {
            header: Header::new(msg_type, session),
            parent_header: None,
            metadata: json!({}),
            content,
        }
    }

    /// Build a message answering `self` with the given type and content.
    ///
    /// The reply is stamped with the parent's session so the peer can
    /// correlate it.
    #[must_use]
    pub fn reply(&self, msg_type: MessageType, content: Value) -> Self {
        Self {
            header: Header::new(msg_type, &self.header.session),
            parent_header: Some(self.header.clone()),
            metadata: json!({}),
            content,
        }
    }

    /// Message type shortcut.
    #[must_use]
    pub fn msg_type(&self) -> MessageType {
        self.header.msg_type
    }

    /// String field from the content object.
    #[must_use]
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}

/// Kernel execution state reported through `status` messages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExecutionState {
    /// Kernel is working on a request.
    Busy,
    /// Kernel finished the request.
    Idle,
}

/// `status` message for `parent`.
#[must_use]
pub fn status(parent: &Message, state: ExecutionState) -> Message {
    let state = match state {
        ExecutionState::Busy => "busy",
        ExecutionState::Idle => "idle",
    };
    parent.reply(MessageType::Status, json!({ "execution_state": state }))
}

/// `stream` message carrying captured output.
#[must_use]
pub fn stream(parent: &Message, name: &str, text: &str) -> Message {
    parent.reply(MessageType::Stream, json!({ "name": name, "text": text }))
}

/// `execute_input` broadcast echoing the code about to run.
#[must_use]
pub fn execute_input(parent: &Message, execution_count: u64, code: &str) -> Message {
    parent.reply(
        MessageType::ExecuteInput,
        json!({ "code": code, "execution_count": execution_count }),
    )
}

/// `execute_result` message carrying a plain-text value.
#[must_use]
pub fn execute_result(parent: &Message, execution_count: u64, value: &Value) -> Message {
    parent.reply(
        MessageType::ExecuteResult,
        json!({
            "execution_count": execution_count,
            "data": { "text/plain": display_text(value) },
            "metadata": {},
        }),
    )
}

/// `error` message.
#[must_use]
pub fn error(parent: &Message, ename: &str, evalue: &str) -> Message {
    parent.reply(
        MessageType::Error,
        json!({ "ename": ename, "evalue": evalue, "traceback": [] }),
    )
}

/// `execute_reply` message; `error` carries `(ename, evalue)` on failure.
#[must_use]
pub fn execute_reply(
    parent: &Message,
    execution_count: u64,
    error: Option<(&str, &str)>,
) -> Message {
    let content = match error {
        None => json!({ "status": "ok", "execution_count": execution_count }),
        Some((ename, evalue)) => json!({
            "status": "error",
            "execution_count": execution_count,
            "ename": ename,
            "evalue": evalue,
            "traceback": [],
        }),
    };
    parent.reply(MessageType::ExecuteReply, content)
}

/// Unsolicited `comm_close` message for `comm_id`.
#[must_use]
pub fn comm_close(session: &str, comm_id: &str) -> Message {
    Message::new(
        MessageType::CommClose,
        session,
        json!({ "comm_id": comm_id, "data": {} }),
    )
}

fn display_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
