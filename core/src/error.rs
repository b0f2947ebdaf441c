use crate::record::{ScanId, ScanStatus};
use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("scan {0} not found")]
    RecordNotFound(ScanId),
    #[error("cannot {action} scan {id}: status is {from}")]
    InvalidTransition {
        id: ScanId,
        from: ScanStatus,
        action: &'static str,
    },
    #[error("invalid scan target '{0}'")]
    InvalidTarget(String),
    #[error("failed to spawn '{program}': {source}")]
    ProcessSpawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("scan {id} tool execution failed: {reason}")]
    ToolExecution { id: ScanId, reason: String },
    #[error("malformed report {path:?}: {reason}")]
    MalformedReport { path: PathBuf, reason: String },
    #[error("invalid tool command: {0}")]
    InvalidCommand(String),
    #[error("scan store error: {0}")]
    Store(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ScanError {
    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedReport {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
