//! Error types shared across the kernel.

use std::fmt::{Display, Formatter};

/// Shared kernel result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Kernel error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Transport could not be created, bound, or driven.
    Transport(String),
    /// The blocking wait on the transport was interrupted.
    TransportInterrupted(String),
    /// Malformed or unroutable protocol message.
    Protocol(String),
    /// Lifecycle operation invoked in the wrong state.
    Lifecycle(String),
    /// Requested sub-kernel name has no resolvable entry point.
    NoSuchSubKernel(String),
    /// A running sub-kernel failed to answer a request.
    SubKernel(String),
    /// The evaluator could not resolve a class or symbol by name.
    ClassResolution(String),
    /// Code evaluation failed inside the evaluator.
    Evaluation(String),
    /// Evaluation was cancelled before it completed.
    Cancelled(String),
    /// A shutdown step failed.
    Teardown(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::TransportInterrupted(msg) => write!(f, "transport interrupted: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Lifecycle(msg) => write!(f, "lifecycle: {msg}"),
            Self::NoSuchSubKernel(msg) => write!(f, "no such sub-kernel: {msg}"),
            Self::SubKernel(msg) => write!(f, "sub-kernel: {msg}"),
            Self::ClassResolution(msg) => write!(f, "class resolution: {msg}"),
            Self::Evaluation(msg) => write!(f, "evaluation: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Teardown(msg) => write!(f, "teardown: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
