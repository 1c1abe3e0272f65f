//! Deployment-specific hooks applied while a kernel is built.

use std::sync::Arc;

use crate::handlers::comm::CommOpenHandler;
use crate::handlers::info::KernelInfoHandler;
use crate::handlers::Handler;
use crate::magic::{MagicCatalog, MagicCommandType};

/// Hooks a deployment uses to specialise the kernel.
///
/// Every method has a default, so an empty impl yields a stock kernel.
pub trait KernelCustomizer: Send + Sync {
    /// Handler for `comm_open`.
    fn comm_open_handler(&self) -> Arc<dyn Handler> {
        Arc::new(CommOpenHandler)
    }

    /// Handler for `kernel_info_request`.
    fn kernel_info_handler(&self) -> Arc<dyn Handler> {
        Arc::new(KernelInfoHandler::default())
    }

    /// Extra magic commands appended after the defaults.
    fn custom_magic_commands(&self) -> Vec<MagicCommandType> {
        Vec::new()
    }

    /// Last chance to adjust the catalog.
    fn configure_magic_commands(&self, _catalog: &MagicCatalog) {}

    /// Register display defaults for values produced by this kernel.
    fn configure_display(&self) {}
}

/// Stock customizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCustomizer;

impl KernelCustomizer for DefaultCustomizer {}
