use std::path::PathBuf;

use crate::hash::CommitId;

/// one attempted silo and why it was skipped
#[derive(Debug, Clone)]
pub struct SiloAttempt {
    pub uri: String,
    pub reason: String,
}

impl std::fmt::Display for SiloAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.uri, self.reason)
    }
}

/// error type for repeatr core operations
///
/// this is the taxonomy a caller branches on; raw OS errors always arrive
/// wrapped with the offending path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("no warehouse responded during {during} ({} tried)", .tried.len())]
    WarehouseUnavailable {
        during: &'static str,
        tried: Vec<SiloAttempt>,
    },

    #[error("hash mismatch: expected {expected}, observed {observed}")]
    HashMismatch {
        expected: CommitId,
        observed: CommitId,
    },

    #[error("data corruption from warehouse: {0}")]
    DataCorruption(String),

    #[error("unsupported node type {node_type} at {path}")]
    UnsupportedNode {
        path: PathBuf,
        node_type: &'static str,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

impl<T> IoResultExt<T> for std::result::Result<T, nix::errno::Errno> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|errno| Error::Io {
            path: path.into(),
            source: std::io::Error::from_raw_os_error(errno as i32),
        })
    }
}
