//! Sub-kernels hosted in child processes.
//!
//! Each configured kernel name maps to a program that speaks a small NDJSON
//! request/response protocol on stdin/stdout:
//!
//! ```json
//! {"op": "evaluate", "code": "1 + 1"}
//! {"op": "comm_msg", "comm_id": "abc", "data": {}}
//! {"op": "shutdown"}
//! ```
//!
//! Every request is answered by exactly one line:
//!
//! ```json
//! {"ok": true, "result": 2}
//! {"ok": false, "error": "NameError: x"}
//! ```
//!
//! The child signals readiness by writing any line before the first request.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{info, warn};

use super::{SubKernelEntryPoint, SubKernelLauncher};
use crate::codec::LineCodec;
use crate::config::SubKernelConfig;
use crate::evaluator::ExecutionContext;
use crate::{AppError, Result};

/// Launches configured sub-kernel programs.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    kernels: HashMap<String, SubKernelConfig>,
}

impl ProcessLauncher {
    /// Create a launcher for the given name → program table.
    #[must_use]
    pub fn new(kernels: HashMap<String, SubKernelConfig>) -> Self {
        Self { kernels }
    }
}

impl SubKernelLauncher for ProcessLauncher {
    fn is_available(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    fn launch<'a>(
        &'a self,
        name: &'a str,
        context: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Arc<dyn SubKernelEntryPoint>>> {
        Box::pin(async move {
            let config = self
                .kernels
                .get(name)
                .ok_or_else(|| AppError::NoSuchSubKernel(name.to_owned()))?;
            let entry = spawn_sub_kernel(name, config, context).await?;
            Ok(Arc::new(entry) as Arc<dyn SubKernelEntryPoint>)
        })
    }
}

/// Response line written by a sub-kernel process.
#[derive(Debug, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

struct ProcessIo {
    writer: FramedWrite<ChildStdin, LineCodec>,
    reader: FramedRead<ChildStdout, LineCodec>,
}

/// Entry point into a sub-kernel child process.
///
/// Requests are serialized; each holds the stream lock until its reply
/// line arrives. The child handle sits behind its own lock so shutdown can
/// kill a process whose request never completes.
pub struct ProcessEntryPoint {
    name: String,
    grace: Duration,
    io: Mutex<ProcessIo>,
    child: Mutex<Child>,
}

async fn spawn_sub_kernel(
    name: &str,
    config: &SubKernelConfig,
    context: &ExecutionContext,
) -> Result<ProcessEntryPoint> {
    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args)
        .envs(&context.env)
        .env("KERNEL_SESSION_ID", &context.session_id)
        .env("KERNEL_TEMP_FOLDER", &context.temp_folder)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::SubKernel(format!("failed to spawn {name}: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::SubKernel(format!("failed to capture {name} stdin")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::SubKernel(format!("failed to capture {name} stdout")))?;

    let mut reader = FramedRead::new(stdout, LineCodec::new());
    let ready = tokio::time::timeout(config.startup_timeout(), reader.next()).await;
    match ready {
        Ok(Some(Ok(_))) => {}
        Ok(Some(Err(err))) => {
            return Err(AppError::SubKernel(format!(
                "{name} failed before ready signal: {err}"
            )));
        }
        Ok(None) => {
            return Err(AppError::SubKernel(format!(
                "{name} exited before ready signal"
            )));
        }
        Err(_) => {
            if let Err(err) = child.kill().await {
                warn!(kernel = name, %err, "failed to kill unresponsive sub-kernel");
            }
            return Err(AppError::SubKernel(format!(
                "{name} startup timeout after {}s",
                config.startup_timeout_seconds
            )));
        }
    }

    info!(kernel = name, pid = ?child.id(), "sub-kernel ready");

    Ok(ProcessEntryPoint {
        name: name.to_owned(),
        grace: config.shutdown_timeout(),
        io: Mutex::new(ProcessIo {
            writer: FramedWrite::new(stdin, LineCodec::new()),
            reader,
        }),
        child: Mutex::new(child),
    })
}

impl ProcessEntryPoint {
    async fn request(&self, request: Value) -> Result<Value> {
        let mut io = self.io.lock().await;
        io.writer.send(request.to_string()).await?;

        let line = io
            .reader
            .next()
            .await
            .ok_or_else(|| AppError::SubKernel(format!("{} closed its output", self.name)))??;
        let reply: Reply = serde_json::from_str(&line)?;

        if reply.ok {
            Ok(reply.result)
        } else {
            Err(AppError::SubKernel(format!(
                "{}: {}",
                self.name,
                reply.error.unwrap_or_else(|| "unknown error".into())
            )))
        }
    }
}

impl SubKernelEntryPoint for ProcessEntryPoint {
    fn evaluate(&self, code: String) -> BoxFuture<'_, Result<Value>> {
        Box::pin(self.request(json!({ "op": "evaluate", "code": code })))
    }

    fn send_comm_message(&self, comm_id: String, data: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.request(json!({ "op": "comm_msg", "comm_id": comm_id, "data": data }))
                .await
                .map(|_| ())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let request = self.request(json!({ "op": "shutdown" }));
            match tokio::time::timeout(self.grace, request).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!(kernel = %self.name, %err, "sub-kernel rejected shutdown request");
                }
                Err(_) => warn!(kernel = %self.name, "sub-kernel did not answer shutdown request"),
            }

            let mut child = self.child.lock().await;
            match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(kernel = %self.name, ?status, "sub-kernel exited");
                    Ok(())
                }
                Ok(Err(err)) => Err(AppError::SubKernel(format!(
                    "error waiting for {}: {err}",
                    self.name
                ))),
                Err(_) => {
                    warn!(kernel = %self.name, "sub-kernel did not exit within grace period, forcing kill");
                    child
                        .kill()
                        .await
                        .map_err(|err| AppError::SubKernel(format!("failed to kill {}: {err}", self.name)))
                }
            }
        })
    }
}
