#![forbid(unsafe_code)]

//! `kernel-orchestrator`: interactive kernel binary.
//!
//! Loads the kernel configuration, builds a kernel around the process
//! evaluator and the local-socket transport, and serves the session until a
//! front-end sends `shutdown_request` or the process receives `SIGTERM`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use kernel_orchestrator::evaluator::process::ProcessEvaluator;
use kernel_orchestrator::subkernel::process::ProcessLauncher;
use kernel_orchestrator::transport::ipc::IpcTransportFactory;
use kernel_orchestrator::{AppError, KernelBuilder, KernelConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "kernel-orchestrator", about = "Interactive kernel session", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured session identifier.
    #[arg(long)]
    session_id: Option<String>,

    /// Override the configured IPC socket name.
    #[arg(long)]
    ipc_name: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("kernel-orchestrator bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = KernelConfig::load_from_path(&args.config)?;
    if let Some(session_id) = args.session_id {
        config.session_id = Some(session_id);
    }
    if let Some(ipc_name) = args.ipc_name {
        config.ipc_name = ipc_name;
    }
    let session_id = config.resolve_session_id();
    info!(%session_id, ipc_name = %config.ipc_name, "configuration loaded");

    // ── Build the kernel ────────────────────────────────
    let evaluator = Arc::new(ProcessEvaluator::new(config.evaluator.clone(), &session_id));
    let transport = Arc::new(IpcTransportFactory::new(config.ipc_name.clone()));
    let launcher = Arc::new(ProcessLauncher::new(config.sub_kernels.clone()));

    let kernel = KernelBuilder::new(session_id, evaluator, transport)
        .sub_kernel_launcher(launcher)
        .cache_folder(config.cache_folder())
        .show_null_execution_result(config.show_null_execution_result)
        .build()?;

    // ── Serve until the transport stops ─────────────────
    kernel.run().await
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
