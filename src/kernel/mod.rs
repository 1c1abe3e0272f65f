//! Kernel session orchestrator.
//!
//! A [`Kernel`] owns the comm registry, the sub-kernel registry, the magic
//! command catalog and the execution result sender, and drives the injected
//! evaluator, handler table and transport through one lifecycle:
//!
//! ```text
//! Created --run()--> Running --transport stops--> ShuttingDown --> Terminated
//! ```
//!
//! Registry accessors may be called from any task. Their locks are held only
//! for map operations, never across evaluator or transport calls.

pub mod comm;
pub mod customizer;
pub mod directory;
pub mod lifecycle;
pub mod signal;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::evaluator::{
    AddImportStatus, AutocompleteResult, CancelHook, EvaluationObject, Evaluator,
    EvaluatorParameters, ImportPath, InspectResult, ResolvedClass, TryResult,
};
use crate::handlers::{Handler, HandlerTable};
use crate::magic::{MagicCatalog, MagicCommandType};
use crate::message::{self, ExecutionState, Message, MessageType};
use crate::sender::{ExecutionResultSender, OutputSink};
use crate::subkernel::{
    NoSubKernels, SubKernelEntryPoint, SubKernelLauncher, SubKernelManager, SubKernelRegistry,
};
use crate::transport::{OnClose, Transport, TransportFactory};
use crate::{AppError, Result};

use self::comm::{Comm, CommRegistry};
use self::customizer::{DefaultCustomizer, KernelCustomizer};
use self::directory::KernelDirectory;
use self::lifecycle::{
    run_teardown, CloseKernelAction, ExitProcess, KernelState, ShutdownReport, TeardownStep,
};
use self::signal::SignalBridge;

/// Builder for a [`Kernel`].
pub struct KernelBuilder {
    session_id: String,
    evaluator: Arc<dyn Evaluator>,
    transport_factory: Arc<dyn TransportFactory>,
    close_action: Arc<dyn CloseKernelAction>,
    customizer: Arc<dyn KernelCustomizer>,
    launcher: Arc<dyn SubKernelLauncher>,
    directory: Arc<KernelDirectory>,
    cache_folder: PathBuf,
    show_null_execution_result: bool,
    install_signal_bridge: bool,
}

impl KernelBuilder {
    /// Start building a kernel for `session_id`.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        evaluator: Arc<dyn Evaluator>,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            evaluator,
            transport_factory,
            close_action: Arc::new(ExitProcess),
            customizer: Arc::new(DefaultCustomizer),
            launcher: Arc::new(NoSubKernels),
            directory: Arc::new(KernelDirectory::new()),
            cache_folder: std::env::temp_dir().join("kernel-orchestrator-cache"),
            show_null_execution_result: true,
            install_signal_bridge: true,
        }
    }

    /// Action run last during shutdown. Defaults to exiting the process.
    #[must_use]
    pub fn close_action(mut self, action: Arc<dyn CloseKernelAction>) -> Self {
        self.close_action = action;
        self
    }

    /// Deployment hooks.
    #[must_use]
    pub fn customizer(mut self, customizer: Arc<dyn KernelCustomizer>) -> Self {
        self.customizer = customizer;
        self
    }

    /// Launcher for secondary runtimes.
    #[must_use]
    pub fn sub_kernel_launcher(mut self, launcher: Arc<dyn SubKernelLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Directory the kernel registers itself in when it starts running.
    #[must_use]
    pub fn directory(mut self, directory: Arc<KernelDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Folder for cached artifacts.
    #[must_use]
    pub fn cache_folder(mut self, folder: PathBuf) -> Self {
        self.cache_folder = folder;
        self
    }

    /// Whether evaluations without a value still publish a result.
    #[must_use]
    pub fn show_null_execution_result(mut self, show: bool) -> Self {
        self.show_null_execution_result = show;
        self
    }

    /// Whether to bind process signals to the kernel. Defaults to `true`.
    #[must_use]
    pub fn signal_bridge(mut self, install: bool) -> Self {
        self.install_signal_bridge = install;
        self
    }

    /// Build the kernel in the `Created` state.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lifecycle` if the execution result sender cannot
    /// be started.
    pub fn build(self) -> Result<Arc<Kernel>> {
        let magic_commands = MagicCatalog::with_defaults();
        for magic in self.customizer.custom_magic_commands() {
            magic_commands.register(magic);
        }
        self.customizer.configure_magic_commands(&magic_commands);
        self.customizer.configure_display();

        let handlers = HandlerTable::new(
            self.customizer.comm_open_handler(),
            self.customizer.kernel_info_handler(),
        );
        let install_signal_bridge = self.install_signal_bridge;

        let kernel = Arc::new_cyclic(|weak: &Weak<Kernel>| Kernel {
            session_id: self.session_id,
            evaluator: self.evaluator,
            transport_factory: self.transport_factory,
            handlers,
            comms: CommRegistry::new(),
            sub_kernels: SubKernelRegistry::new(self.launcher),
            magic_commands,
            sender: Arc::new(ExecutionResultSender::new()),
            close_action: self.close_action,
            directory: self.directory,
            signal_bridge: if install_signal_bridge {
                SignalBridge::install(weak.clone())
            } else {
                SignalBridge::disabled()
            },
            control: Mutex::new(()),
            state: Mutex::new(KernelState::Created),
            transport: Mutex::new(None),
            stop: CancellationToken::new(),
            cache_folder: self.cache_folder,
            show_null_execution_result: self.show_null_execution_result,
            self_ref: weak.clone(),
        });

        kernel.sender.start(kernel.output_sink())?;
        info!(session_id = %kernel.session_id, "kernel created");
        Ok(kernel)
    }
}

/// Kernel session orchestrator.
pub struct Kernel {
    session_id: String,
    evaluator: Arc<dyn Evaluator>,
    transport_factory: Arc<dyn TransportFactory>,
    handlers: HandlerTable,
    comms: CommRegistry,
    sub_kernels: SubKernelRegistry,
    magic_commands: MagicCatalog,
    sender: Arc<ExecutionResultSender>,
    close_action: Arc<dyn CloseKernelAction>,
    directory: Arc<KernelDirectory>,
    signal_bridge: SignalBridge,
    control: Mutex<()>,
    state: Mutex<KernelState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    stop: CancellationToken,
    cache_folder: PathBuf,
    show_null_execution_result: bool,
    self_ref: Weak<Kernel>,
}

/// Publishes through whichever transport the kernel currently has.
struct KernelSink(Weak<Kernel>);

impl OutputSink for KernelSink {
    fn publish(&self, messages: Vec<Message>) -> Result<()> {
        self.0
            .upgrade()
            .ok_or_else(|| AppError::Lifecycle("kernel has been dropped".into()))?
            .publish(messages)
    }
}

impl Kernel {
    // ── Lifecycle ───────────────────────────────────────

    /// Serve the session until the transport stops, then tear down.
    ///
    /// Registers the kernel in its directory, creates and starts the
    /// transport, and suspends until the transport finishes. Teardown then
    /// closes sub-kernels, exits the evaluator, the handler table and the
    /// result sender, and finally runs the close-kernel action. Each step
    /// runs even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lifecycle` if the kernel is not in `Created`,
    /// `AppError::Transport` if the transport cannot be created or started
    /// (no teardown runs in that case), and the transport's own error,
    /// typically `AppError::TransportInterrupted`, if serving ended
    /// abnormally (teardown has run).
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.transition(KernelState::Created, KernelState::Running)?;
        self.directory.register(self);

        let span = info_span!("kernel", session_id = %self.session_id);
        async move {
            debug!("kernel starting");
            let transport = match self.start_transport() {
                Ok(transport) => transport,
                Err(err) => {
                    error!(%err, "transport failed to start");
                    self.set_state(KernelState::Terminated);
                    return Err(err);
                }
            };
            info!("kernel running");

            let outcome = transport.join().await;
            match &outcome {
                Ok(()) => info!("transport stopped"),
                Err(err) => error!(%err, "transport terminated abnormally"),
            }
            drop(transport);

            let report = self.shutdown().await;
            if !report.is_clean() {
                error!(failures = report.failures.len(), "kernel shut down with errors");
            }
            // Peer tasks hold the kernel; release the transport once outputs drained.
            self.lock_transport().take();
            debug!("kernel shut down");
            outcome
        }
        .instrument(span)
        .await
    }

    fn start_transport(self: &Arc<Self>) -> Result<Arc<dyn Transport>> {
        let weak = Arc::downgrade(self);
        let on_close: OnClose = Box::new(move || {
            if let Some(kernel) = weak.upgrade() {
                kernel.close_all_comms();
            }
        });

        let transport =
            self.transport_factory
                .create(Arc::clone(self), self.stop.clone(), on_close)?;
        *self.lock_transport() = Some(Arc::clone(&transport));

        if let Err(err) = transport.start() {
            self.lock_transport().take();
            return Err(err);
        }
        Ok(transport)
    }

    async fn shutdown(&self) -> ShutdownReport {
        self.set_state(KernelState::ShuttingDown);
        info!("kernel shutting down");

        let steps = vec![
            TeardownStep::new(
                "close sub-kernels",
                Box::pin(async move { self.sub_kernels.close_all().await }),
            ),
            TeardownStep::new(
                "evaluator exit",
                Box::pin(async move { self.evaluator.exit().await }),
            ),
            TeardownStep::new(
                "handlers exit",
                Box::pin(async move { self.handlers.exit() }),
            ),
            TeardownStep::new(
                "result sender exit",
                Box::pin(async move {
                    let drained = self.sender.exit().await;
                    self.flush_transport().await;
                    drained
                }),
            ),
            TeardownStep::new(
                "close kernel action",
                Box::pin(async move { self.close_action.close() }),
            ),
        ];

        let report = run_teardown(steps).await;
        self.set_state(KernelState::Terminated);
        report
    }

    async fn flush_transport(&self) {
        let transport = self.lock_transport().clone();
        if let Some(transport) = transport {
            transport.flush().await;
        }
    }

    /// Ask the transport to stop serving; `run` then tears down.
    pub fn request_stop(&self) {
        info!(session_id = %self.session_id, "kernel stop requested");
        self.stop.cancel();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> KernelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: KernelState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn transition(&self, from: KernelState, to: KernelState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(AppError::Lifecycle(format!(
                "cannot move to {to:?} from {:?}",
                *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn lock_transport(&self) -> MutexGuard<'_, Option<Arc<dyn Transport>>> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Identity and wiring ─────────────────────────────

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Directory this kernel registers in.
    #[must_use]
    pub fn directory(&self) -> &Arc<KernelDirectory> {
        &self.directory
    }

    /// Whether process signals are bound to this kernel.
    #[must_use]
    pub fn has_signal_bridge(&self) -> bool {
        self.signal_bridge.is_active()
    }

    /// Handler for `msg_type`.
    #[must_use]
    pub fn get_handler(&self, msg_type: MessageType) -> Option<Arc<dyn Handler>> {
        self.handlers.get(msg_type)
    }

    /// Execution result sender.
    #[must_use]
    pub fn execution_result_sender(&self) -> Arc<ExecutionResultSender> {
        Arc::clone(&self.sender)
    }

    /// Sink publishing through this kernel's transport.
    #[must_use]
    pub fn output_sink(&self) -> Arc<dyn OutputSink> {
        Arc::new(KernelSink(self.self_ref.clone()))
    }

    /// Whether evaluations without a value still publish a result.
    #[must_use]
    pub fn show_null_execution_result(&self) -> bool {
        self.show_null_execution_result
    }

    /// Folder for cached artifacts.
    #[must_use]
    pub fn cache_folder(&self) -> PathBuf {
        self.cache_folder.clone()
    }

    // ── Comm registry ───────────────────────────────────

    /// Whether a comm is registered under `id`.
    #[must_use]
    pub fn is_comm_present(&self, id: &str) -> bool {
        self.comms.is_present(id)
    }

    /// Register `comm` under `id` unless the id is taken.
    pub fn add_comm(&self, id: &str, comm: Arc<dyn Comm>) {
        if self.comms.add(id, comm) {
            debug!(comm_id = id, "comm registered");
        }
    }

    /// Comm registered under `id`; `None` looks up the empty id.
    #[must_use]
    pub fn get_comm(&self, id: Option<&str>) -> Option<Arc<dyn Comm>> {
        self.comms.get(id)
    }

    /// Remove the comm under `id`, if any.
    pub fn remove_comm(&self, id: Option<&str>) {
        if self.comms.remove(id).is_some() {
            debug!(comm_id = ?id, "comm removed");
        }
    }

    /// Snapshot of registered comm ids.
    #[must_use]
    pub fn comm_ids(&self) -> HashSet<String> {
        self.comms.ids()
    }

    /// Close every registered comm.
    pub fn close_all_comms(&self) {
        self.comms.close_all();
    }

    // ── Sub-kernels ─────────────────────────────────────

    /// Manager for `name`, created on first request.
    pub fn get_or_create_sub_kernel(&self, name: &str) -> Arc<SubKernelManager> {
        self.sub_kernels
            .get_or_create(name, || self.evaluator.execution_context())
    }

    /// Entry point into the sub-kernel `name`, launching it if needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NoSuchSubKernel` if `name` cannot be resolved to
    /// a runtime, or the launcher's startup error.
    pub async fn sub_kernel_entry_point(
        &self,
        name: &str,
    ) -> Result<Arc<dyn SubKernelEntryPoint>> {
        if self.sub_kernels.get(name).is_none() && !self.sub_kernels.launcher().is_available(name)
        {
            return Err(AppError::NoSuchSubKernel(name.to_owned()));
        }
        self.get_or_create_sub_kernel(name).entry_point().await
    }

    /// Manager owning `comm_id`.
    #[must_use]
    pub fn sub_kernel_by_comm(&self, comm_id: &str) -> Option<Arc<SubKernelManager>> {
        self.sub_kernels.by_comm(comm_id)
    }

    /// Route `comm_id` to the sub-kernel `kernel_name`.
    pub fn associate_comm_with_kernel(&self, comm_id: &str, kernel_name: &str) {
        self.sub_kernels.associate_comm(comm_id, kernel_name);
    }

    // ── Magic commands ──────────────────────────────────

    /// Append a magic command descriptor.
    pub fn register_magic_command_type(&self, magic: MagicCommandType) {
        self.magic_commands.register(magic);
    }

    /// Copy of the magic command catalog.
    #[must_use]
    pub fn magic_command_types(&self) -> Vec<MagicCommandType> {
        self.magic_commands.snapshot()
    }

    // ── Evaluator façade ────────────────────────────────

    /// Ask the evaluator to cancel in-flight execution.
    pub fn cancel_execution(&self) {
        let _control = self.control();
        self.evaluator.cancel_execution();
    }

    /// Push runtime parameters to the evaluator.
    ///
    /// # Errors
    ///
    /// Returns the evaluator's rejection.
    pub fn update_evaluator_parameters(&self, params: EvaluatorParameters) -> Result<()> {
        let _control = self.control();
        self.evaluator.update_parameters(params)
    }

    /// Execute `code` with output bound to `seo`.
    pub async fn execute_code(&self, code: String, seo: EvaluationObject) -> TryResult {
        self.evaluator.evaluate(seo, code).await
    }

    /// Completion candidates.
    #[must_use]
    pub fn autocomplete(&self, code: &str, cursor: usize) -> AutocompleteResult {
        self.evaluator.autocomplete(code, cursor)
    }

    /// Inspection result.
    #[must_use]
    pub fn inspect(&self, code: &str, cursor: usize) -> InspectResult {
        self.evaluator.inspect(code, cursor)
    }

    /// Evaluator classpath.
    #[must_use]
    pub fn classpath(&self) -> Vec<PathBuf> {
        self.evaluator.classpath()
    }

    /// Add classpath entries, returning those added.
    pub fn add_jars_to_classpath(&self, paths: Vec<PathBuf>) -> Vec<PathBuf> {
        self.evaluator.add_jars_to_classpath(paths)
    }

    /// Evaluator imports.
    #[must_use]
    pub fn imports(&self) -> Vec<ImportPath> {
        self.evaluator.imports()
    }

    /// Add an import.
    pub fn add_import(&self, import: ImportPath) -> AddImportStatus {
        self.evaluator.add_import(import)
    }

    /// Remove an import.
    pub fn remove_import(&self, import: &ImportPath) {
        self.evaluator.remove_import(import);
    }

    /// Evaluator scratch folder.
    #[must_use]
    pub fn temp_folder(&self) -> PathBuf {
        self.evaluator.temp_folder()
    }

    /// Evaluator output folder.
    #[must_use]
    pub fn out_dir(&self) -> PathBuf {
        self.evaluator.out_dir()
    }

    /// Resolve a class or symbol through the evaluator.
    ///
    /// # Errors
    ///
    /// Forwards `AppError::ClassResolution` unchanged.
    pub fn resolve_class(&self, name: &str) -> Result<ResolvedClass> {
        self.evaluator.resolve_class(name)
    }

    /// Register a hook run on cancellation.
    pub fn register_cancel_hook(&self, hook: CancelHook) {
        self.evaluator.register_cancel_hook(hook);
    }

    // ── Messaging ───────────────────────────────────────

    /// Broadcast messages through the transport.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` when the kernel is not running.
    pub fn publish(&self, messages: Vec<Message>) -> Result<()> {
        let transport = self.lock_transport().clone();
        transport
            .ok_or_else(|| AppError::Transport("kernel is not running".into()))?
            .publish(messages)
    }

    /// Send a reply through the transport.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` when the kernel is not running.
    pub fn send(&self, message: Message) -> Result<()> {
        let transport = self.lock_transport().clone();
        transport
            .ok_or_else(|| AppError::Transport("kernel is not running".into()))?
            .send(message)
    }

    /// Publish `status: busy` for `parent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` when the kernel is not running.
    pub fn send_busy_message(&self, parent: &Message) -> Result<()> {
        self.publish(vec![message::status(parent, ExecutionState::Busy)])
    }

    /// Publish `status: idle` for `parent`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` when the kernel is not running.
    pub fn send_idle_message(&self, parent: &Message) -> Result<()> {
        self.publish(vec![message::status(parent, ExecutionState::Idle)])
    }
}
