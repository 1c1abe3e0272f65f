//! Shared fakes for kernel-level integration tests.
//!
//! Provides a scriptable evaluator, an in-memory transport, a counting comm,
//! a recording close action and a fake sub-kernel launcher. Collaborators
//! that take part in teardown write to a shared [`Journal`] so tests can
//! assert on ordering.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use kernel_orchestrator::evaluator::{
    AutocompleteResult, EvaluationObject, Evaluator, EvaluatorParameters, ExecutionContext,
    InspectResult, TryResult,
};
use kernel_orchestrator::handlers::info::KernelInfoHandler;
use kernel_orchestrator::handlers::Handler;
use kernel_orchestrator::kernel::comm::Comm;
use kernel_orchestrator::kernel::customizer::KernelCustomizer;
use kernel_orchestrator::kernel::lifecycle::CloseKernelAction;
use kernel_orchestrator::kernel::Kernel;
use kernel_orchestrator::message::{Message, MessageType};
use kernel_orchestrator::subkernel::{SubKernelEntryPoint, SubKernelLauncher};
use kernel_orchestrator::transport::{Channel, Frame, OnClose, Transport, TransportFactory};
use kernel_orchestrator::{AppError, KernelBuilder, Result};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Ordered log of teardown-relevant events.
#[derive(Default, Clone)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event {event} not recorded: {:?}", self.events()))
    }
}

/// How a collaborator behaves when asked to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitBehavior {
    Succeed,
    Fail,
    Panic,
}

/// Evaluator driven by a tiny command language:
///
/// - `value:<json>` yields the parsed value
/// - `print:<text>` writes `text` to stdout and yields nothing
/// - `fail:<msg>` fails with `AppError::Evaluation`
/// - `wait` blocks until `cancel_execution`
pub struct ScriptedEvaluator {
    journal: Journal,
    exit_behavior: ExitBehavior,
    pub codes: Mutex<Vec<String>>,
    pub cancels: AtomicUsize,
    pub params: Mutex<Vec<EvaluatorParameters>>,
    cancel: Notify,
    context: ExecutionContext,
}

impl ScriptedEvaluator {
    pub fn new(journal: Journal) -> Self {
        Self::with_exit(journal, ExitBehavior::Succeed)
    }

    pub fn with_exit(journal: Journal, exit_behavior: ExitBehavior) -> Self {
        Self {
            journal,
            exit_behavior,
            codes: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            params: Mutex::new(Vec::new()),
            cancel: Notify::new(),
            context: ExecutionContext {
                session_id: "test-session".into(),
                temp_folder: std::env::temp_dir().join("kernel-orchestrator-tests"),
                env: std::collections::HashMap::new(),
            },
        }
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(&self, seo: EvaluationObject, code: String) -> BoxFuture<'_, TryResult> {
        Box::pin(async move {
            self.codes.lock().unwrap().push(code.clone());
            if let Some(raw) = code.strip_prefix("value:") {
                return Ok(Some(serde_json::from_str(raw)?));
            }
            if let Some(text) = code.strip_prefix("print:") {
                seo.stdout(text);
                return Ok(None);
            }
            if let Some(msg) = code.strip_prefix("fail:") {
                return Err(AppError::Evaluation(msg.to_owned()));
            }
            if code == "wait" {
                self.cancel.notified().await;
                return Err(AppError::Cancelled("interrupted".into()));
            }
            Ok(None)
        })
    }

    fn autocomplete(&self, code: &str, cursor: usize) -> AutocompleteResult {
        AutocompleteResult {
            matches: vec![format!("{code}_completion")],
            cursor_start: 0,
            cursor_end: cursor,
        }
    }

    fn inspect(&self, code: &str, _cursor: usize) -> InspectResult {
        InspectResult {
            found: !code.is_empty(),
            text: format!("doc for {code}"),
        }
    }

    fn cancel_execution(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancel.notify_one();
    }

    fn exit(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.journal.record("evaluator.exit");
            match self.exit_behavior {
                ExitBehavior::Succeed => Ok(()),
                ExitBehavior::Fail => Err(AppError::Evaluation("exit failed".into())),
                ExitBehavior::Panic => panic!("evaluator exit panicked"),
            }
        })
    }

    fn update_parameters(&self, params: EvaluatorParameters) -> Result<()> {
        if params.params.contains_key("reject") {
            return Err(AppError::Evaluation("rejected parameters".into()));
        }
        self.params.lock().unwrap().push(params);
        Ok(())
    }

    fn execution_context(&self) -> ExecutionContext {
        self.context.clone()
    }
}

/// Transport factory recording every frame in memory.
#[derive(Default)]
pub struct FakeTransportFactory {
    pub frames: Arc<Mutex<Vec<Frame>>>,
    pub started: Arc<Notify>,
    pub fail_create: bool,
    pub fail_start: bool,
    pub join_error: Mutex<Option<AppError>>,
    pub created: AtomicUsize,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    /// Messages of `msg_type` answering `parent`.
    pub fn replies_to(&self, parent: &Message, msg_type: MessageType) -> Vec<Frame> {
        self.frames()
            .into_iter()
            .filter(|f| {
                f.message.msg_type() == msg_type
                    && f.message
                        .parent_header
                        .as_ref()
                        .is_some_and(|h| h.msg_id == parent.header.msg_id)
            })
            .collect()
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create(
        &self,
        _kernel: Arc<Kernel>,
        stop: CancellationToken,
        on_close: OnClose,
    ) -> Result<Arc<dyn Transport>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(AppError::Transport("cannot bind".into()));
        }
        Ok(Arc::new(FakeTransport {
            frames: Arc::clone(&self.frames),
            started: Arc::clone(&self.started),
            fail_start: self.fail_start,
            stop,
            on_close: Mutex::new(Some(on_close)),
            join_error: Mutex::new(self.join_error.lock().unwrap().take()),
        }))
    }
}

struct FakeTransport {
    frames: Arc<Mutex<Vec<Frame>>>,
    started: Arc<Notify>,
    fail_start: bool,
    stop: CancellationToken,
    on_close: Mutex<Option<OnClose>>,
    join_error: Mutex<Option<AppError>>,
}

impl Transport for FakeTransport {
    fn start(&self) -> Result<()> {
        if self.fail_start {
            return Err(AppError::Transport("start failed".into()));
        }
        self.started.notify_one();
        Ok(())
    }

    fn join(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let injected = self.join_error.lock().unwrap().take();
            if injected.is_none() {
                self.stop.cancelled().await;
            }
            if let Some(on_close) = self.on_close.lock().unwrap().take() {
                on_close();
            }
            injected.map_or(Ok(()), Err)
        })
    }

    fn publish(&self, messages: Vec<Message>) -> Result<()> {
        let mut frames = self.frames.lock().unwrap();
        for message in messages {
            frames.push(Frame {
                channel: Channel::Iopub,
                message,
            });
        }
        Ok(())
    }

    fn send(&self, message: Message) -> Result<()> {
        self.frames.lock().unwrap().push(Frame {
            channel: Channel::Shell,
            message,
        });
        Ok(())
    }
}

/// Comm counting how often it was closed.
pub struct CountingComm {
    id: String,
    pub closes: AtomicUsize,
    pub messages: Mutex<Vec<Value>>,
}

impl CountingComm {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            closes: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Comm for CountingComm {
    fn id(&self) -> &str {
        &self.id
    }

    fn target_name(&self) -> &str {
        "counting"
    }

    fn handle_message(&self, data: Value) -> Result<()> {
        self.messages.lock().unwrap().push(data);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Close action that records itself instead of exiting.
pub struct RecordingCloseAction {
    journal: Journal,
    sender: Mutex<Option<Arc<kernel_orchestrator::sender::ExecutionResultSender>>>,
    pub sender_was_running: AtomicBool,
    pub calls: AtomicUsize,
    panics: bool,
}

impl RecordingCloseAction {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            sender: Mutex::new(None),
            sender_was_running: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            panics: false,
        })
    }

    pub fn panicking(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            sender: Mutex::new(None),
            sender_was_running: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            panics: true,
        })
    }

    /// Observe whether the kernel's result sender is still running when the
    /// close action fires.
    pub fn watch_sender(&self, kernel: &Kernel) {
        *self.sender.lock().unwrap() = Some(kernel.execution_result_sender());
    }
}

impl CloseKernelAction for RecordingCloseAction {
    fn close(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.journal.record("close_action");
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            self.sender_was_running
                .store(sender.is_running(), Ordering::SeqCst);
        }
        assert!(!self.panics, "close action panicked");
        Ok(())
    }
}

/// Kernel info handler that journals its exit.
pub struct JournalingInfoHandler {
    inner: KernelInfoHandler,
    journal: Journal,
    fail_exit: bool,
}

impl Handler for JournalingInfoHandler {
    fn handle<'a>(
        &'a self,
        kernel: &'a Arc<Kernel>,
        message: Message,
    ) -> BoxFuture<'a, Result<()>> {
        self.inner.handle(kernel, message)
    }

    fn exit(&self) -> Result<()> {
        self.journal.record("handlers.exit");
        if self.fail_exit {
            Err(AppError::Teardown("handler exit failed".into()))
        } else {
            Ok(())
        }
    }
}

/// Customizer that installs a [`JournalingInfoHandler`].
pub struct JournalingCustomizer {
    pub journal: Journal,
    pub fail_handler_exit: bool,
}

impl KernelCustomizer for JournalingCustomizer {
    fn kernel_info_handler(&self) -> Arc<dyn Handler> {
        Arc::new(JournalingInfoHandler {
            inner: KernelInfoHandler::default(),
            journal: self.journal.clone(),
            fail_exit: self.fail_handler_exit,
        })
    }
}

/// Sub-kernel entry point that echoes evaluations and journals shutdown.
pub struct FakeEntryPoint {
    name: String,
    journal: Journal,
    fail_shutdown: bool,
    pub comm_messages: Mutex<Vec<(String, Value)>>,
}

impl SubKernelEntryPoint for FakeEntryPoint {
    fn evaluate(&self, code: String) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { Ok(json!({ "kernel": self.name, "echo": code })) })
    }

    fn send_comm_message(&self, comm_id: String, data: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.comm_messages.lock().unwrap().push((comm_id, data));
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.journal.record(format!("subkernel.shutdown:{}", self.name));
            if self.fail_shutdown {
                Err(AppError::SubKernel(format!("{} refused to stop", self.name)))
            } else {
                Ok(())
            }
        })
    }
}

/// Launcher serving a fixed set of names with [`FakeEntryPoint`]s.
pub struct FakeLauncher {
    names: Vec<String>,
    journal: Journal,
    failing_shutdown: Vec<String>,
    pub launches: AtomicUsize,
    pub entries: Mutex<Vec<Arc<FakeEntryPoint>>>,
}

impl FakeLauncher {
    pub fn new(names: &[&str], journal: Journal) -> Arc<Self> {
        Self::with_failing_shutdown(names, &[], journal)
    }

    pub fn with_failing_shutdown(names: &[&str], failing: &[&str], journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            names: names.iter().map(|n| (*n).to_owned()).collect(),
            journal,
            failing_shutdown: failing.iter().map(|n| (*n).to_owned()).collect(),
            launches: AtomicUsize::new(0),
            entries: Mutex::new(Vec::new()),
        })
    }

    pub fn entry(&self, name: &str) -> Arc<FakeEntryPoint> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .unwrap_or_else(|| panic!("{name} was never launched"))
    }
}

impl SubKernelLauncher for FakeLauncher {
    fn is_available(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    fn launch<'a>(
        &'a self,
        name: &'a str,
        _context: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Arc<dyn SubKernelEntryPoint>>> {
        Box::pin(async move {
            if !self.is_available(name) {
                return Err(AppError::NoSuchSubKernel(name.to_owned()));
            }
            self.launches.fetch_add(1, Ordering::SeqCst);
            let entry = Arc::new(FakeEntryPoint {
                name: name.to_owned(),
                journal: self.journal.clone(),
                fail_shutdown: self.failing_shutdown.iter().any(|n| n == name),
                comm_messages: Mutex::new(Vec::new()),
            });
            self.entries.lock().unwrap().push(Arc::clone(&entry));
            Ok(entry as Arc<dyn SubKernelEntryPoint>)
        })
    }
}

/// Builder preloaded with test-safe defaults: no signal bridge and a close
/// action that does not exit the process.
pub fn test_builder(
    evaluator: Arc<ScriptedEvaluator>,
    factory: Arc<FakeTransportFactory>,
    close: Arc<RecordingCloseAction>,
) -> KernelBuilder {
    KernelBuilder::new("test-session", evaluator, factory)
        .close_action(close)
        .signal_bridge(false)
}

/// Build a message of `msg_type` as a front-end would send it.
pub fn request(msg_type: MessageType, content: Value) -> Message {
    Message::new(msg_type, "front-end", content)
}

/// Spawn `kernel.run()` and wait until the transport has started.
pub async fn start(
    kernel: &Arc<Kernel>,
    factory: &FakeTransportFactory,
) -> tokio::task::JoinHandle<Result<()>> {
    let runner = Arc::clone(kernel);
    let handle = tokio::spawn(async move { runner.run().await });
    tokio::time::timeout(Duration::from_secs(5), factory.started.notified())
        .await
        .expect("transport did not start");
    handle
}

/// Dispatch `message` the way a transport would.
pub async fn dispatch(kernel: &Arc<Kernel>, message: Message) -> Result<()> {
    let handler = kernel
        .get_handler(message.msg_type())
        .unwrap_or_else(|| panic!("no handler for {:?}", message.msg_type()));
    handler.handle(kernel, message).await
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
