//! Path-addressed blob store capability.
//!
//! The pipeline only ever needs five operations from the remote folder tree:
//! list, read, write, move and ensure-dir. Adapters report failures through
//! [`StoreError`] so callers can tell a missing file apart from a revoked
//! credential.
use std::thread;
use std::time::Duration;
use thiserror::Error;

pub mod dropbox;
pub mod local;
#[cfg(test)]
pub mod memory;
pub mod path;

pub use dropbox::{DropboxAuth, DropboxStore};
pub use local::LocalStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures surfaced by a [`BlobStore`] adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The path does not exist.
    #[error("not found: {path}")]
    NotFound { path: String },
    /// The destination already exists and overwriting was not requested.
    #[error("conflict: {path} already exists")]
    Conflict { path: String },
    /// A failure that may succeed on retry (throttling, 5xx, transport).
    #[error("transient store failure during {operation}: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },
    /// A failure no retry will fix (bad credentials, rejected request).
    #[error("fatal store failure during {operation}: {message}")]
    Fatal {
        operation: &'static str,
        message: String,
    },
    /// Local filesystem failures.
    #[error("store io failure during {operation} on {path}")]
    Io {
        operation: &'static str,
        path: String,
        source: std::io::Error,
    },
    /// A response body the adapter could not decode.
    #[error("store response decode failure during {operation}: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    /// Whether the whole run should stop rather than skip the current file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Fatal { .. })
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// A remote file as discovered by listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Absolute, normalized store path.
    pub path: String,
    /// Base file name.
    pub name: String,
    /// Opaque version token assigned by the store on write.
    pub revision: Option<String>,
    /// Byte length; informational only.
    pub size: u64,
}

/// Write behavior when the destination already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    /// Fail with [`StoreError::Conflict`] instead of clobbering.
    Create,
}

/// The operations the pipeline consumes from a remote folder tree.
///
/// All paths are store paths; adapters normalize them with
/// [`path::normalize`] before use.
pub trait BlobStore {
    /// List the files (not folders) directly under `dir`, following
    /// pagination. A missing directory lists as empty.
    fn list(&self, dir: &str) -> StoreResult<Vec<FileEntry>>;

    /// Read a whole file.
    fn read(&self, path: &str) -> StoreResult<Vec<u8>>;

    /// Write a whole file, creating parent directories as needed.
    fn write(&self, path: &str, bytes: &[u8], mode: WriteMode) -> StoreResult<()>;

    /// Rename `src` to `dst`; fails with `Conflict` if `dst` exists.
    fn move_file(&self, src: &str, dst: &str) -> StoreResult<()>;

    /// Create `dir` (and its parents) if it does not exist yet.
    fn ensure_dir(&self, dir: &str) -> StoreResult<()>;

    /// Short adapter label for logs.
    fn describe(&self) -> String;
}

/// Number of attempts for calls that fail transiently.
pub const MAX_ATTEMPTS: u32 = 3;

/// Run `op`, retrying transient failures with linear backoff.
///
/// Non-transient errors are returned immediately.
pub fn with_retry<T>(
    operation: &'static str,
    backoff: Duration,
    mut op: impl FnMut() -> StoreResult<T>,
) -> StoreResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                tracing::warn!(operation, attempt, error = %err, "retrying store call");
                thread::sleep(backoff * attempt);
                attempt += 1;
            }
            other => return other,
        }
    }
}
