//! Run configuration as handed over by the control surface.

use std::{collections::HashSet, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tracking::geometry::Geometry;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub regions: Vec<RegionConfig>,
    pub tracker: TrackerConfig,
    pub result_store: ResultStoreConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub experiment: ExperimentInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionConfig {
    pub id: u32,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerConfig {
    pub name: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    Fresh,
    Append,
}

impl StoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreMode::Fresh => "fresh",
            StoreMode::Append => "append",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultStoreConfig {
    pub path: PathBuf,
    pub mode: StoreMode,
    /// Overrides `AgentSettings::sampling_interval_ms` for this run.
    #[serde(default)]
    pub sampling_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    /// Tried in order; later entries are fallbacks for earlier ones.
    pub backends: Vec<BackendConfig>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backends: vec![BackendConfig::Synthetic(SyntheticCameraConfig::default())],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Synthetic(SyntheticCameraConfig),
    Directory(DirectoryCameraConfig),
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Synthetic(_) => "synthetic",
            BackendConfig::Directory(_) => "directory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyntheticCameraConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub subjects: u32,
    pub seed: u64,
}

impl Default for SyntheticCameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 10,
            subjects: 10,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectoryCameraConfig {
    pub path: PathBuf,
    #[serde(default = "default_directory_fps")]
    pub fps: u32,
    #[serde(default)]
    pub loop_playback: bool,
}

fn default_directory_fps() -> u32 {
    10
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExperimentInfo {
    pub name: String,
    pub location: String,
    pub code: String,
}

impl RunConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|err| ConfigError::new(format!("malformed run configuration: {err}")))
    }

    /// Structural checks that need no hardware. Tracker names are resolved
    /// separately against the registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.regions.is_empty() {
            return Err(ConfigError::new("at least one region is required"));
        }

        let mut seen = HashSet::new();
        for region in &self.regions {
            if !seen.insert(region.id) {
                return Err(ConfigError::new(format!("duplicate region id {}", region.id)));
            }
            region
                .geometry
                .validate()
                .map_err(|reason| ConfigError::new(format!("region {}: {reason}", region.id)))?;
        }

        if self.tracker.name.trim().is_empty() {
            return Err(ConfigError::new("tracker.name must not be empty"));
        }

        if self.result_store.path.as_os_str().is_empty() {
            return Err(ConfigError::new("result_store.path must not be empty"));
        }
        if self.result_store.sampling_interval_ms == Some(0) {
            return Err(ConfigError::new("result_store.sampling_interval_ms must be positive"));
        }

        if self.camera.backends.is_empty() {
            return Err(ConfigError::new("camera.backends must list at least one backend"));
        }
        for backend in &self.camera.backends {
            match backend {
                BackendConfig::Synthetic(cfg) => {
                    if cfg.width == 0 || cfg.height == 0 || cfg.fps == 0 {
                        return Err(ConfigError::new(
                            "synthetic camera needs non-zero width, height and fps",
                        ));
                    }
                }
                BackendConfig::Directory(cfg) => {
                    if cfg.fps == 0 {
                        return Err(ConfigError::new("directory camera needs a non-zero fps"));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn region_ids(&self) -> Vec<u32> {
        self.regions.iter().map(|region| region.id).collect()
    }
}
