//! Kernel configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Interpreter used by the process evaluator for every cell.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EvaluatorConfig {
    /// Interpreter binary (e.g., `python3`, `bash`).
    pub program: String,
    /// Arguments placed before the cell source (e.g., `["-c"]`).
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for evaluations; defaults to the process cwd.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// Launch settings for one named sub-kernel.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SubKernelConfig {
    /// Binary that hosts the secondary runtime.
    pub program: String,
    /// Arguments passed to the binary.
    #[serde(default)]
    pub args: Vec<String>,
    /// Seconds to wait for the ready line after spawning.
    #[serde(default = "default_startup_timeout_seconds")]
    pub startup_timeout_seconds: u64,
    /// Seconds to wait for each shutdown phase (reply, then exit) before
    /// the child is killed.
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
}

impl SubKernelConfig {
    /// Startup timeout as a [`Duration`].
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    /// Shutdown grace period as a [`Duration`].
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

fn default_startup_timeout_seconds() -> u64 {
    30
}

fn default_shutdown_timeout_seconds() -> u64 {
    5
}

fn default_ipc_name() -> String {
    "kernel-orchestrator".into()
}

fn default_true() -> bool {
    true
}

/// Kernel configuration parsed from `kernel.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct KernelConfig {
    /// Session identifier; generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Named pipe / Unix socket identifier the transport listens on.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Folder for cached artifacts; defaults to a folder under the temp dir.
    #[serde(default)]
    pub cache_folder: Option<PathBuf>,
    /// Whether an evaluation that yields no value still publishes a result.
    #[serde(default = "default_true")]
    pub show_null_execution_result: bool,
    /// Primary evaluator settings.
    pub evaluator: EvaluatorConfig,
    /// Secondary runtimes addressable by name.
    #[serde(default)]
    pub sub_kernels: HashMap<String, SubKernelConfig>,
}

impl KernelConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Session identifier, generating a fresh one if none was configured.
    #[must_use]
    pub fn resolve_session_id(&self) -> String {
        self.session_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Effective cache folder.
    #[must_use]
    pub fn cache_folder(&self) -> PathBuf {
        self.cache_folder
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("kernel-orchestrator-cache"))
    }

    fn validate(&self) -> Result<()> {
        if self.ipc_name.trim().is_empty() {
            return Err(AppError::Config("ipc_name must not be empty".into()));
        }

        if self.evaluator.program.trim().is_empty() {
            return Err(AppError::Config(
                "evaluator.program must not be empty".into(),
            ));
        }

        for (name, sub_kernel) in &self.sub_kernels {
            if sub_kernel.program.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "sub_kernels.{name}.program must not be empty"
                )));
            }
        }

        Ok(())
    }
}
