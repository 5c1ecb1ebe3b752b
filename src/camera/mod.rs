mod backend;
mod directory;
mod frame;
mod grabber;
mod source;
mod synthetic;

pub use backend::{backend_factory, BackendError, BackendFactory, CaptureBackend, FailureSignatures};
pub use directory::DirectoryCamera;
pub use frame::Frame;
pub use source::{Acquisition, AcquisitionPolicy, FrameSource, FrameSourceError};
pub use synthetic::SyntheticCamera;

use std::sync::Arc;

use crate::config::{BackendConfig, CameraConfig};
use crate::error::ConfigError;

/// Turns the camera section of a run configuration into acquisition
/// strategies. Physical drivers plug in by providing their own implementation.
pub trait CameraProvider: Send + Sync {
    fn strategies(&self, config: &CameraConfig) -> Result<Vec<Arc<dyn BackendFactory>>, ConfigError>;
}

/// Provider for the backends that ship with the agent.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCameras;

impl CameraProvider for BuiltinCameras {
    fn strategies(&self, config: &CameraConfig) -> Result<Vec<Arc<dyn BackendFactory>>, ConfigError> {
        build_strategies(config)
    }
}

pub fn build_strategies(config: &CameraConfig) -> Result<Vec<Arc<dyn BackendFactory>>, ConfigError> {
    if config.backends.is_empty() {
        return Err(ConfigError::new("camera.backends must list at least one backend"));
    }

    let strategies = config
        .backends
        .iter()
        .map(|backend| match backend.clone() {
            BackendConfig::Synthetic(cfg) => backend_factory("synthetic", move || {
                Ok(Box::new(SyntheticCamera::new(cfg.clone())) as Box<dyn CaptureBackend>)
            }),
            BackendConfig::Directory(cfg) => backend_factory("directory", move || {
                let camera = DirectoryCamera::open(&cfg)?;
                Ok(Box::new(camera) as Box<dyn CaptureBackend>)
            }),
        })
        .collect();
    Ok(strategies)
}
