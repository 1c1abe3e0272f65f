//! `execute_request` handling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

use super::Handler;
use crate::evaluator::EvaluationObject;
use crate::kernel::Kernel;
use crate::message::{self, ExecutionState, Message};
use crate::sender::ExecutionOutput;
use crate::{AppError, Result};

/// Runs cells one at a time and numbers them.
///
/// Publishes `busy`, `execute_input`, then hands the code to the evaluator.
/// The value or error is queued on the result sender together with the
/// final `idle`, so `idle` always follows the outputs of the cell.
#[derive(Default)]
pub struct ExecuteRequestHandler {
    execution_count: AtomicU64,
    turn: Mutex<()>,
    closed: AtomicBool,
}

impl ExecuteRequestHandler {
    /// Handler with the execution counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cells executed so far.
    #[must_use]
    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::SeqCst)
    }

    async fn execute(&self, kernel: &Arc<Kernel>, request: Message) -> Result<()> {
        let code = request
            .content_str("code")
            .ok_or_else(|| AppError::Protocol("execute_request without code".into()))?
            .to_owned();

        let _turn = self.turn.lock().await;
        let count = self.execution_count.fetch_add(1, Ordering::SeqCst) + 1;

        kernel.send_busy_message(&request)?;
        kernel.publish(vec![message::execute_input(&request, count, &code)])?;

        let sender = kernel.execution_result_sender();
        let seo = EvaluationObject::new(request.clone(), count, Arc::clone(&sender));
        let outcome = kernel.execute_code(code, seo.clone()).await;

        let reply = match outcome {
            Ok(Some(value)) => {
                seo.result(value);
                message::execute_reply(&request, count, None)
            }
            Ok(None) => {
                if kernel.show_null_execution_result() {
                    seo.result(Value::Null);
                }
                message::execute_reply(&request, count, None)
            }
            Err(err) => {
                let ename = error_name(&err);
                let evalue = err.to_string();
                debug!(ename, %evalue, "execution failed");
                seo.error(ename, evalue.clone());
                message::execute_reply(&request, count, Some((ename, &evalue)))
            }
        };

        let sent = kernel.send(reply);
        sender.update(
            request,
            count,
            ExecutionOutput::Status(ExecutionState::Idle),
        );
        sent
    }
}

impl Handler for ExecuteRequestHandler {
    fn handle<'a>(
        &'a self,
        kernel: &'a Arc<Kernel>,
        message: Message,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                warn!("execute_request after handler exit; ignoring");
                return Err(AppError::Lifecycle("execute handler has exited".into()));
            }
            let span = info_span!("execute", msg_id = %message.header.msg_id);
            self.execute(kernel, message).instrument(span).await
        })
    }

    fn exit(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Error name reported to the peer for a failed execution.
fn error_name(err: &AppError) -> &'static str {
    match err {
        AppError::Cancelled(_) => "KeyboardInterrupt",
        AppError::Evaluation(_) => "EvaluationError",
        AppError::ClassResolution(_) => "ClassNotFound",
        AppError::NoSuchSubKernel(_) | AppError::SubKernel(_) => "SubKernelError",
        _ => "KernelError",
    }
}
