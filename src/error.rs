//! Run-level error taxonomy and the diagnostic record kept after a run fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::camera::FrameSourceError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Config,
    FrameSource,
    Resume,
    WatchdogTimeout,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "ConfigError",
            ErrorKind::FrameSource => "FrameSourceError",
            ErrorKind::Resume => "ResumeError",
            ErrorKind::WatchdogTimeout => "WatchdogTimeout",
            ErrorKind::Storage => "StorageError",
        }
    }
}

/// Malformed run configuration. Raised before any hardware is touched and
/// never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Append-mode continuity could not be established from the existing store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ResumeError(pub String);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid run configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("frame acquisition failed: {0}")]
    FrameSource(#[from] FrameSourceError),
    #[error("cannot resume result store: {0}")]
    Resume(#[from] ResumeError),
    #[error("{0}")]
    WatchdogTimeout(String),
    #[error("result store failure: {0}")]
    Storage(String),
    #[error("a run is already active (run_id {0})")]
    AlreadyActive(String),
}

impl RunError {
    pub fn storage(err: anyhow::Error) -> Self {
        RunError::Storage(format!("{err:#}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Config(_) | RunError::AlreadyActive(_) => ErrorKind::Config,
            RunError::FrameSource(_) => ErrorKind::FrameSource,
            RunError::Resume(_) => ErrorKind::Resume,
            RunError::WatchdogTimeout(_) => ErrorKind::WatchdogTimeout,
            RunError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn diagnostic(&self) -> Diagnostic {
        Diagnostic::new(self.kind(), self.to_string())
    }
}

/// The last fatal error of a run, kept in the session so it can be read back
/// through `status()` after the run has terminated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
