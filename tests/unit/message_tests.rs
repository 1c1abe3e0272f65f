//! Unit tests for the protocol message model and reply builders.

use kernel_orchestrator::message::{
    self, ExecutionState, Message, MessageType, PROTOCOL_VERSION,
};
use serde_json::json;

fn execute_request() -> Message {
    Message::new(MessageType::ExecuteRequest, "front-end", json!({ "code": "1" }))
}

#[test]
fn new_message_has_fresh_header() {
    let a = execute_request();
    let b = execute_request();

    assert_ne!(a.header.msg_id, b.header.msg_id);
    assert_eq!(a.header.version, PROTOCOL_VERSION);
    assert_eq!(a.header.session, "front-end");
    assert!(a.parent_header.is_none());
}

#[test]
fn reply_carries_parent_header_and_session() {
    let req = execute_request();
    let reply = req.reply(MessageType::ExecuteReply, json!({ "status": "ok" }));

    assert_eq!(reply.msg_type(), MessageType::ExecuteReply);
    assert_eq!(reply.parent_header.as_ref(), Some(&req.header));
    assert_eq!(reply.header.session, req.header.session);
    assert_ne!(reply.header.msg_id, req.header.msg_id);
}

#[test]
fn message_type_serializes_to_wire_name() {
    for msg_type in [
        MessageType::KernelInfoRequest,
        MessageType::ExecuteRequest,
        MessageType::CommOpen,
        MessageType::CommInfoReply,
        MessageType::InterruptRequest,
        MessageType::Status,
    ] {
        let encoded = serde_json::to_value(msg_type).expect("serialize");
        assert_eq!(encoded, json!(msg_type.as_str()));
    }
}

#[test]
fn parses_minimal_inbound_message() {
    let raw = r#"{"header":{"msg_id":"m1","msg_type":"comm_open","session":"s"},"content":{"comm_id":"c"}}"#;
    let msg: Message = serde_json::from_str(raw).expect("parse");

    assert_eq!(msg.msg_type(), MessageType::CommOpen);
    assert_eq!(msg.content_str("comm_id"), Some("c"));
    assert_eq!(msg.content_str("missing"), None);
    assert!(msg.parent_header.is_none());
}

#[test]
fn unknown_message_type_is_rejected() {
    let raw = r#"{"header":{"msg_id":"m1","msg_type":"history_request","session":"s"}}"#;
    assert!(serde_json::from_str::<Message>(raw).is_err());
}

#[test]
fn status_reports_execution_state() {
    let req = execute_request();
    let busy = message::status(&req, ExecutionState::Busy);
    let idle = message::status(&req, ExecutionState::Idle);

    assert_eq!(busy.content["execution_state"], "busy");
    assert_eq!(idle.content["execution_state"], "idle");
    assert_eq!(idle.parent_header.as_ref(), Some(&req.header));
}

#[test]
fn execute_result_renders_strings_without_quotes() {
    let req = execute_request();
    let text = message::execute_result(&req, 3, &json!("hi"));
    let number = message::execute_result(&req, 3, &json!([1, 2]));

    assert_eq!(text.content["data"]["text/plain"], "hi");
    assert_eq!(number.content["data"]["text/plain"], "[1,2]");
    assert_eq!(text.content["execution_count"], 3);
}

#[test]
fn execute_reply_reports_error_details() {
    let req = execute_request();
    let ok = message::execute_reply(&req, 1, None);
    let failed = message::execute_reply(&req, 2, Some(("EvaluationError", "boom")));

    assert_eq!(ok.content["status"], "ok");
    assert_eq!(failed.content["status"], "error");
    assert_eq!(failed.content["ename"], "EvaluationError");
    assert_eq!(failed.content["evalue"], "boom");
}

#[test]
fn comm_close_is_unsolicited() {
    let close = message::comm_close("kernel-session", "c1");

    assert_eq!(close.msg_type(), MessageType::CommClose);
    assert_eq!(close.content["comm_id"], "c1");
    assert_eq!(close.header.session, "kernel-session");
    assert!(close.parent_header.is_none());
}
