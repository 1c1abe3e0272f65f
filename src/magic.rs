//! Magic command catalog.
//!
//! The kernel only catalogues descriptors; parsing cells and running the
//! commands belongs to the command dispatcher.

use std::sync::{Mutex, PoisonError};

use tracing::debug;

/// Whether a magic applies to one line or the whole cell.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MagicKind {
    /// `%name args` on a single line.
    Line,
    /// `%%name args` on the first line of a cell.
    Cell,
}

/// Descriptor of one registered magic command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicCommandType {
    /// Command token including its `%`/`%%` prefix.
    pub command: String,
    /// Parameter synopsis shown by `%lsmagic`.
    pub parameters: String,
    /// Line or cell magic.
    pub kind: MagicKind,
}

impl MagicCommandType {
    /// Build a descriptor.
    #[must_use]
    pub fn new(command: impl Into<String>, parameters: impl Into<String>, kind: MagicKind) -> Self {
        Self {
            command: command.into(),
            parameters: parameters.into(),
            kind,
        }
    }
}

/// Built-in descriptors registered for every kernel.
#[must_use]
pub fn default_magic_commands() -> Vec<MagicCommandType> {
    vec![
        MagicCommandType::new("%lsmagic", "", MagicKind::Line),
        MagicCommandType::new("%time", "<code>", MagicKind::Line),
        MagicCommandType::new("%%time", "", MagicKind::Cell),
        MagicCommandType::new("%timeit", "<code>", MagicKind::Line),
        MagicCommandType::new("%%timeit", "", MagicKind::Cell),
        MagicCommandType::new("%%bash", "", MagicKind::Cell),
        MagicCommandType::new("%classpath add jar", "<jar path>", MagicKind::Line),
        MagicCommandType::new("%import", "<import path>", MagicKind::Line),
        MagicCommandType::new("%unimport", "<import path>", MagicKind::Line),
        MagicCommandType::new("%%kernel", "<kernel name>", MagicKind::Cell),
    ]
}

/// Append-mostly catalog with copy-on-read snapshots.
#[derive(Debug, Default)]
pub struct MagicCatalog {
    types: Mutex<Vec<MagicCommandType>>,
}

impl MagicCatalog {
    /// Catalog seeded with [`default_magic_commands`].
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            types: Mutex::new(default_magic_commands()),
        }
    }

    /// Append a descriptor. Duplicates are kept.
    pub fn register(&self, magic: MagicCommandType) {
        debug!(command = %magic.command, "magic command registered");
        self.types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(magic);
    }

    /// Copy of the current catalog.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MagicCommandType> {
        self.types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
