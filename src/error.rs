//! Error taxonomy for the shell.
//!
//! None of these are fatal to the host: the supervisor and the window
//! controller turn them into log lines and an empty result at their public
//! boundary.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("backend directory not found: {}", .0.display())]
    BackendDirMissing(PathBuf),

    #[error("packaged backend binary not found: {}", .0.display())]
    BinaryMissing(PathBuf),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend start already in progress")]
    StartInProgress,

    #[error("backend start cancelled by a stop request")]
    StartCancelled,

    #[error("shortcut {0} is already registered")]
    ShortcutTaken(String),

    #[error("failed to register shortcut {accelerator}: {reason}")]
    Shortcut { accelerator: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ShellError>;
