//! Unit tests for `CommRegistry` and `KernelComm`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kernel_orchestrator::kernel::comm::{Comm, CommRegistry, KernelComm};
use kernel_orchestrator::message::{Message, MessageType};
use kernel_orchestrator::sender::OutputSink;
use kernel_orchestrator::{AppError, Result};
use serde_json::{json, Value};

struct TallyComm {
    id: String,
    closes: AtomicUsize,
}

impl TallyComm {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            closes: AtomicUsize::new(0),
        })
    }
}

impl Comm for TallyComm {
    fn id(&self) -> &str {
        &self.id
    }

    fn target_name(&self) -> &str {
        "tally"
    }

    fn handle_message(&self, _data: Value) -> Result<()> {
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<Message>>,
}

impl OutputSink for RecordingSink {
    fn publish(&self, messages: Vec<Message>) -> Result<()> {
        self.published.lock().unwrap().extend(messages);
        Ok(())
    }
}

#[test]
fn add_is_first_writer_wins() {
    let registry = CommRegistry::new();
    let first = TallyComm::new("x");
    let second = TallyComm::new("x");

    assert!(registry.add("x", first.clone()));
    assert!(!registry.add("x", second.clone()));

    registry.close_all();
    assert_eq!(first.closes.load(Ordering::SeqCst), 1);
    assert_eq!(second.closes.load(Ordering::SeqCst), 0);
}

#[test]
fn remove_twice_is_a_no_op() {
    let registry = CommRegistry::new();
    registry.add("x", TallyComm::new("x"));

    assert!(registry.remove(Some("x")).is_some());
    assert!(registry.remove(Some("x")).is_none());
    assert!(registry.is_empty());
}

#[test]
fn remove_none_never_removes_empty_id() {
    let registry = CommRegistry::new();
    registry.add("", TallyComm::new(""));

    assert!(registry.remove(None).is_none());
    assert!(registry.is_present(""));
}

#[test]
fn get_none_equals_get_empty() {
    let registry = CommRegistry::new();
    assert!(registry.get(None).is_none());
    assert!(registry.get(Some("")).is_none());

    registry.add("", TallyComm::new(""));
    let a = registry.get(None).expect("none");
    let b = registry.get(Some("")).expect("empty");
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn close_all_closes_each_once_and_keeps_entries() {
    let registry = CommRegistry::new();
    let a = TallyComm::new("a");
    let b = TallyComm::new("b");
    registry.add("a", a.clone());
    registry.add("b", b.clone());

    registry.close_all();

    assert_eq!(a.closes.load(Ordering::SeqCst), 1);
    assert_eq!(b.closes.load(Ordering::SeqCst), 1);
    assert_eq!(registry.len(), 2);
}

#[test]
fn close_all_on_empty_registry_is_fine() {
    CommRegistry::new().close_all();
}

#[test]
fn kernel_comm_close_notifies_peer_once() {
    let sink = Arc::new(RecordingSink::default());
    let comm = KernelComm::new(
        "c1".into(),
        "widgets".into(),
        "session".into(),
        json!({ "v": 1 }),
        sink.clone(),
    );

    comm.close();
    comm.close();

    let published = sink.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].msg_type(), MessageType::CommClose);
    assert_eq!(published[0].content["comm_id"], "c1");
    assert!(comm.is_closed());
}

#[test]
fn kernel_comm_tracks_latest_state_until_closed() {
    let sink = Arc::new(RecordingSink::default());
    let comm = KernelComm::new(
        "c1".into(),
        "widgets".into(),
        "session".into(),
        json!({ "v": 1 }),
        sink,
    );
    assert_eq!(comm.state(), json!({ "v": 1 }));

    comm.handle_message(json!({ "v": 2 })).expect("open comm accepts");
    assert_eq!(comm.state(), json!({ "v": 2 }));

    comm.close();
    let rejected = comm.handle_message(json!({ "v": 3 }));
    assert!(matches!(rejected, Err(AppError::Protocol(_))));
    assert_eq!(comm.state(), json!({ "v": 2 }));
}
