#![forbid(unsafe_code)]

//! Kernel session orchestrator.
//!
//! Wires a code evaluator, a transport and optional sub-kernels into one
//! interactive session and owns the shared comm and sub-kernel state.

pub mod codec;
pub mod config;
pub mod errors;
pub mod evaluator;
pub mod handlers;
pub mod kernel;
pub mod magic;
pub mod message;
pub mod sender;
pub mod subkernel;
pub mod transport;

pub use config::KernelConfig;
pub use errors::{AppError, Result};
pub use kernel::{Kernel, KernelBuilder};
