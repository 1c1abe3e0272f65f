//! Evaluator abstraction consumed by the kernel.
//!
//! The [`Evaluator`] trait decouples the orchestrator from whatever actually
//! runs code. The kernel forwards execution, completion, inspection and
//! cancellation to it and never interprets the results.

pub mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::message::Message;
use crate::sender::{ExecutionOutput, ExecutionResultSender};
use crate::{AppError, Result};

/// Outcome of one evaluation: an optional value or a failure.
pub type TryResult = Result<Option<Value>>;

/// Callback run when execution is cancelled.
pub type CancelHook = Box<dyn Fn() + Send + Sync>;

/// Environment shared with secondary runtimes launched by the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Session the context belongs to.
    pub session_id: String,
    /// Scratch folder owned by the evaluator.
    pub temp_folder: PathBuf,
    /// Extra environment variables for child runtimes.
    pub env: HashMap<String, String>,
}

/// Handle an evaluator uses to stream output for one execution.
#[derive(Clone)]
pub struct EvaluationObject {
    parent: Message,
    execution_count: u64,
    sender: Arc<ExecutionResultSender>,
}

impl EvaluationObject {
    /// Bind an execution of `parent` to the kernel's result sender.
    #[must_use]
    pub fn new(parent: Message, execution_count: u64, sender: Arc<ExecutionResultSender>) -> Self {
        Self {
            parent,
            execution_count,
            sender,
        }
    }

    /// Request being executed.
    #[must_use]
    pub fn parent(&self) -> &Message {
        &self.parent
    }

    /// Execution counter for this request.
    #[must_use]
    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    /// Stream text to the peer's stdout.
    pub fn stdout(&self, text: impl Into<String>) {
        self.emit(ExecutionOutput::Stdout(text.into()));
    }

    /// Stream text to the peer's stderr.
    pub fn stderr(&self, text: impl Into<String>) {
        self.emit(ExecutionOutput::Stderr(text.into()));
    }

    /// Publish the value of the execution.
    pub fn result(&self, value: Value) {
        self.emit(ExecutionOutput::Result(value));
    }

    /// Publish an execution error.
    pub fn error(&self, ename: impl Into<String>, evalue: impl Into<String>) {
        self.emit(ExecutionOutput::Error {
            ename: ename.into(),
            evalue: evalue.into(),
        });
    }

    fn emit(&self, output: ExecutionOutput) {
        self.sender
            .update(self.parent.clone(), self.execution_count, output);
    }
}

/// Completion candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutocompleteResult {
    /// Candidate completions.
    pub matches: Vec<String>,
    /// Start of the replaced range.
    pub cursor_start: usize,
    /// End of the replaced range.
    pub cursor_end: usize,
}

/// Inspection outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectResult {
    /// Whether anything was found at the cursor.
    pub found: bool,
    /// Plain-text documentation.
    pub text: String,
}

/// Runtime parameters pushed to the evaluator by the peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluatorParameters {
    /// Raw parameter map.
    pub params: HashMap<String, Value>,
}

/// Import path such as `java.util.List` or `os.path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImportPath(pub String);

/// Result of adding an import.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddImportStatus {
    /// Import was added.
    Added,
    /// Import was already present.
    Exists,
}

/// A class or symbol resolved by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClass {
    /// Fully qualified name.
    pub name: String,
    /// Where the definition was found, when known.
    pub location: Option<PathBuf>,
}

/// Code evaluator driven by the kernel.
///
/// Only `evaluate`, `autocomplete`, `inspect`, `cancel_execution`, `exit`
/// and `execution_context` are required; classpath, import and folder
/// accessors default to an evaluator without those concepts.
pub trait Evaluator: Send + Sync {
    /// Execute `code`, streaming output through `seo`.
    fn evaluate(&self, seo: EvaluationObject, code: String) -> BoxFuture<'_, TryResult>;

    /// Completion candidates for `code` at `cursor`.
    fn autocomplete(&self, code: &str, cursor: usize) -> AutocompleteResult;

    /// Documentation for the symbol at `cursor`.
    fn inspect(&self, code: &str, cursor: usize) -> InspectResult;

    /// Ask in-flight execution to stop.
    fn cancel_execution(&self);

    /// Stop in-flight and future executions.
    ///
    /// # Errors
    ///
    /// Returns an error if evaluator resources could not be released.
    fn exit(&self) -> BoxFuture<'_, Result<()>>;

    /// Context handed to sub-kernels launched on behalf of this evaluator.
    fn execution_context(&self) -> ExecutionContext;

    /// Apply runtime parameters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Evaluation` if the parameters are rejected.
    fn update_parameters(&self, _params: EvaluatorParameters) -> Result<()> {
        Ok(())
    }

    /// Register a hook run on cancellation.
    fn register_cancel_hook(&self, _hook: CancelHook) {}

    /// Current classpath entries.
    fn classpath(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Add entries to the classpath, returning those actually added.
    fn add_jars_to_classpath(&self, _paths: Vec<PathBuf>) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Current imports.
    fn imports(&self) -> Vec<ImportPath> {
        Vec::new()
    }

    /// Add an import.
    fn add_import(&self, _import: ImportPath) -> AddImportStatus {
        AddImportStatus::Exists
    }

    /// Remove an import.
    fn remove_import(&self, _import: &ImportPath) {}

    /// Scratch folder.
    fn temp_folder(&self) -> PathBuf {
        self.execution_context().temp_folder
    }

    /// Output folder for compiled artifacts.
    fn out_dir(&self) -> PathBuf {
        self.temp_folder().join("out")
    }

    /// Resolve a class or symbol by name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ClassResolution` when the name is unknown.
    fn resolve_class(&self, name: &str) -> Result<ResolvedClass> {
        Err(AppError::ClassResolution(name.to_owned()))
    }
}
