//! The closed error sum for the engine.
//!
//! Everything below the orchestrator converts failures into one of these
//! variants; only the daemon decides process exit codes from them.

use std::path::PathBuf;

/// Engine-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The accounting tool kept failing after all backoff attempts.
    #[error("accounting fetch failed after {attempts} attempts: {message}")]
    Fetch { attempts: u32, message: String },

    /// Another poller holds this cluster's lock. Not a failure; the caller
    /// exits with the distinguished lock-held status.
    #[error("cluster lock held by another poller")]
    LockHeld,

    /// A persisted state file failed validation (bad magic, truncated body,
    /// unparseable JSON) and could not be quarantined.
    #[error("corrupt state file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
