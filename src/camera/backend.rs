use std::sync::Arc;

use image::GrayImage;
use thiserror::Error;

/// A failure reported by a driver. Its message is what incompatibility
/// signatures are matched against.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for BackendError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// An opened camera. Lives on its grabber thread for its whole life, so
/// blocking calls are fine here.
pub trait CaptureBackend: Send {
    /// `Ok(None)` means the stream has ended (finite sources only).
    fn grab(&mut self) -> Result<Option<GrayImage>, BackendError>;

    /// Whether a failed grab leaves the handle unusable. When `false` the
    /// backend stays open and the next grab carries on past the failure.
    fn reopen_after_error(&self) -> bool {
        true
    }

    fn close(&mut self) {}
}

/// One acquisition strategy: knows how to open its backend, possibly many
/// times during a run.
pub trait BackendFactory: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self) -> Result<Box<dyn CaptureBackend>, BackendError>;
}

struct FnFactory<F> {
    name: String,
    open: F,
}

impl<F> BackendFactory for FnFactory<F>
where
    F: Fn() -> Result<Box<dyn CaptureBackend>, BackendError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<Box<dyn CaptureBackend>, BackendError> {
        (self.open)()
    }
}

pub fn backend_factory<F>(name: &str, open: F) -> Arc<dyn BackendFactory>
where
    F: Fn() -> Result<Box<dyn CaptureBackend>, BackendError> + Send + Sync + 'static,
{
    Arc::new(FnFactory {
        name: name.to_string(),
        open,
    })
}

/// Lower-cased substrings that identify a driver which can never work on this
/// host.
#[derive(Debug, Clone, Default)]
pub struct FailureSignatures {
    patterns: Vec<String>,
}

impl FailureSignatures {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|pattern| pattern.as_ref().trim().to_lowercase())
                .filter(|pattern| !pattern.is_empty())
                .collect(),
        }
    }

    pub fn matching(&self, message: &str) -> Option<&str> {
        let lowered = message.to_lowercase();
        self.patterns
            .iter()
            .find(|pattern| lowered.contains(pattern.as_str()))
            .map(String::as_str)
    }
}
