//! Evaluator that runs each cell through an external interpreter.
//!
//! The cell source is appended as the last argument of the configured
//! program (`python3 -c <code>`, `bash -c <code>`). Output is streamed line
//! by line while the process runs. On Unix each cell runs in its own process
//! group; cancellation sends `SIGINT` to the group and kills the group if it
//! ignores the signal. Elsewhere the child is killed.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    AutocompleteResult, CancelHook, EvaluationObject, Evaluator, EvaluatorParameters,
    ExecutionContext, InspectResult, TryResult,
};
use crate::config::EvaluatorConfig;
use crate::{AppError, Result};

/// How long an interrupted child gets to exit before it is killed.
const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// How long output forwarders may keep reading once the cell has ended.
/// Descendants that still hold the pipes are not waited for past this.
const FORWARD_GRACE: Duration = Duration::from_secs(2);

/// Interpreter-backed evaluator.
pub struct ProcessEvaluator {
    config: EvaluatorConfig,
    context: ExecutionContext,
    current: Mutex<Option<CancellationToken>>,
    cancel_hooks: Mutex<Vec<CancelHook>>,
    exited: AtomicBool,
}

impl ProcessEvaluator {
    /// Create an evaluator for `session_id`.
    #[must_use]
    pub fn new(config: EvaluatorConfig, session_id: &str) -> Self {
        let temp_folder = std::env::temp_dir().join(format!("kernel-{session_id}"));
        Self {
            config,
            context: ExecutionContext {
                session_id: session_id.to_owned(),
                temp_folder,
                env: std::collections::HashMap::new(),
            },
            current: Mutex::new(None),
            cancel_hooks: Mutex::new(Vec::new()),
            exited: AtomicBool::new(false),
        }
    }

    async fn run_cell(&self, seo: EvaluationObject, code: String) -> TryResult {
        if self.exited.load(Ordering::SeqCst) {
            return Err(AppError::Evaluation("evaluator has exited".into()));
        }

        let token = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        let outcome = self.spawn_and_wait(&seo, code, &token).await;
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        outcome
    }

    async fn spawn_and_wait(
        &self,
        seo: &EvaluationObject,
        code: String,
        token: &CancellationToken,
    ) -> TryResult {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(code)
            .envs(&self.context.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Evaluation(format!("failed to spawn {}: {err}", self.config.program))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = stdout.map(|s| tokio::spawn(forward_lines(s, seo.clone(), false)));
        let err_task = stderr.map(|s| tokio::spawn(forward_lines(s, seo.clone(), true)));

        let finished = tokio::select! {
            status = child.wait() => Some(status),
            () = token.cancelled() => None,
        };

        let status = match finished {
            Some(status) => status?,
            None => {
                interrupt(&mut child).await;
                join_forwarders(out_task, err_task).await;
                return Err(AppError::Cancelled("execution interrupted".into()));
            }
        };
        join_forwarders(out_task, err_task).await;

        debug!(?status, "cell process finished");
        if status.success() {
            Ok(None)
        } else {
            Err(AppError::Evaluation(format!(
                "{} exited with {status}",
                self.config.program
            )))
        }
    }
}

impl Evaluator for ProcessEvaluator {
    fn evaluate(&self, seo: EvaluationObject, code: String) -> BoxFuture<'_, TryResult> {
        Box::pin(self.run_cell(seo, code))
    }

    fn autocomplete(&self, _code: &str, cursor: usize) -> AutocompleteResult {
        AutocompleteResult {
            matches: Vec::new(),
            cursor_start: cursor,
            cursor_end: cursor,
        }
    }

    fn inspect(&self, _code: &str, _cursor: usize) -> InspectResult {
        InspectResult::default()
    }

    fn cancel_execution(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(token) = current {
            info!("cancelling running cell");
            token.cancel();
        }
        for hook in self
            .cancel_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            hook();
        }
    }

    fn exit(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.exited.store(true, Ordering::SeqCst);
            self.cancel_execution();
            info!("process evaluator exited");
            Ok(())
        })
    }

    fn execution_context(&self) -> ExecutionContext {
        self.context.clone()
    }

    fn update_parameters(&self, params: EvaluatorParameters) -> Result<()> {
        debug!(count = params.params.len(), "ignoring evaluator parameters");
        Ok(())
    }

    fn register_cancel_hook(&self, hook: CancelHook) {
        self.cancel_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    fn temp_folder(&self) -> PathBuf {
        self.context.temp_folder.clone()
    }
}

async fn forward_lines<R>(reader: R, seo: EvaluationObject, to_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(mut line)) => {
                line.push('\n');
                if to_stderr {
                    seo.stderr(line);
                } else {
                    seo.stdout(line);
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "failed to read cell output");
                break;
            }
        }
    }
}

async fn join_forwarders(
    out_task: Option<tokio::task::JoinHandle<()>>,
    err_task: Option<tokio::task::JoinHandle<()>>,
) {
    for mut task in [out_task, err_task].into_iter().flatten() {
        match tokio::time::timeout(FORWARD_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%err, "output forwarder failed"),
            Err(_) => {
                debug!("cell output still open after exit; detaching");
                task.abort();
            }
        }
    }
}

async fn interrupt(child: &mut Child) {
    #[cfg(unix)]
    let exited = interrupt_group(child).await;
    #[cfg(not(unix))]
    let exited = false;

    if !exited {
        if let Err(err) = child.kill().await {
            warn!(%err, "failed to kill cell process");
        }
    }
}

/// Send `SIGINT` to the cell's process group, then sweep whatever is left
/// of the group with `SIGKILL`. Returns whether the direct child exited
/// within the grace period.
#[cfg(unix)]
async fn interrupt_group(child: &mut Child) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    let group = Pid::from_raw(pgid);

    let exited = match killpg(group, Signal::SIGINT) {
        Ok(()) => matches!(
            tokio::time::timeout(INTERRUPT_GRACE, child.wait()).await,
            Ok(Ok(_))
        ),
        Err(err) => {
            warn!(pgid, %err, "failed to interrupt cell process group");
            false
        }
    };

    if let Err(err) = killpg(group, Signal::SIGKILL) {
        debug!(pgid, %err, "cell process group already gone");
    }
    exited
}
