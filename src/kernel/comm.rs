//! Comm channels and the registry that tracks them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::message;
use crate::sender::OutputSink;
use crate::Result;

/// A bidirectional, identifier-keyed channel to the peer.
pub trait Comm: Send + Sync {
    /// Peer-supplied identifier.
    fn id(&self) -> &str;

    /// Target the peer opened the comm for.
    fn target_name(&self) -> &str;

    /// Handle a `comm_msg` payload from the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is rejected.
    fn handle_message(&self, data: Value) -> Result<()>;

    /// Close the comm. Must tolerate being called on an already closed comm.
    fn close(&self);
}

/// Registry of open comms keyed by identifier.
///
/// All operations are serialized by one lock that is never held while a
/// comm callback runs.
#[derive(Default)]
pub struct CommRegistry {
    comms: Mutex<HashMap<String, Arc<dyn Comm>>>,
}

impl CommRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Comm>>> {
        self.comms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn is_present(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Register `comm` under `id` unless `id` is taken. Returns whether the
    /// comm was inserted.
    pub fn add(&self, id: &str, comm: Arc<dyn Comm>) -> bool {
        let mut comms = self.lock();
        if comms.contains_key(id) {
            debug!(comm_id = id, "comm already registered; keeping first");
            return false;
        }
        comms.insert(id.to_owned(), comm);
        true
    }

    /// Look up a comm. `None` is treated as the empty identifier.
    #[must_use]
    pub fn get(&self, id: Option<&str>) -> Option<Arc<dyn Comm>> {
        self.lock().get(id.unwrap_or("")).cloned()
    }

    /// Remove `id` if present. `None` is a no-op.
    pub fn remove(&self, id: Option<&str>) -> Option<Arc<dyn Comm>> {
        let id = id?;
        self.lock().remove(id)
    }

    /// Snapshot of registered identifiers.
    #[must_use]
    pub fn ids(&self) -> HashSet<String> {
        self.lock().keys().cloned().collect()
    }

    /// Number of registered comms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no comm is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Close every registered comm. Entries stay in the registry.
    pub fn close_all(&self) {
        let snapshot: Vec<Arc<dyn Comm>> = self.lock().values().cloned().collect();
        info!(count = snapshot.len(), "closing comms");
        for comm in snapshot {
            comm.close();
        }
    }
}

/// Comm opened by the peer through `comm_open`.
pub struct KernelComm {
    id: String,
    target_name: String,
    session: String,
    state: Mutex<Value>,
    closed: AtomicBool,
    sink: Arc<dyn OutputSink>,
}

impl KernelComm {
    /// Create a comm with its initial `data` payload.
    #[must_use]
    pub fn new(
        id: String,
        target_name: String,
        session: String,
        data: Value,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            id,
            target_name,
            session,
            state: Mutex::new(data),
            closed: AtomicBool::new(false),
            sink,
        }
    }

    /// Latest payload received from the peer.
    #[must_use]
    pub fn state(&self) -> Value {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the comm has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Comm for KernelComm {
    fn id(&self) -> &str {
        &self.id
    }

    fn target_name(&self) -> &str {
        &self.target_name
    }

    fn handle_message(&self, data: Value) -> Result<()> {
        if self.is_closed() {
            return Err(crate::AppError::Protocol(format!(
                "comm {} is closed",
                self.id
            )));
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = data;
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let msg = message::comm_close(&self.session, &self.id);
        if let Err(err) = self.sink.publish(vec![msg]) {
            warn!(comm_id = %self.id, %err, "failed to notify peer of comm close");
        }
    }
}
