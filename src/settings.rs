use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

/// Per-device tuning for the acquisition loop. These are operational constants
/// of a deployment, not of an experiment, so they live outside `RunConfig`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    pub machine_id: String,
    pub machine_name: String,
    /// Budget for one acquisition attempt on one backend.
    pub acquisition_timeout_ms: u64,
    pub attempts_per_backend: u32,
    /// Lower-cased substrings of a backend error that mean "this driver can
    /// never work here"; matching failures skip straight to the next backend.
    pub incompatibility_signatures: Vec<String>,
    pub watchdog_deadline_ms: u64,
    pub watchdog_grace_ms: u64,
    pub flush_interval_ms: u64,
    pub flush_max_rows: usize,
    /// A region is frozen once it fails more than this many frames in a row.
    pub region_failure_threshold: u32,
    /// Default sampling interval; also the gap inserted after `T_last` when a
    /// store is resumed in append mode.
    pub sampling_interval_ms: u64,
    /// How long `stop()` waits for the run loop to hand back the camera.
    pub stop_timeout_ms: u64,
    /// Where the active-run state file lives. `None` disables crash resume.
    pub state_dir: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            machine_id: "unknown".into(),
            machine_name: "ethotrack".into(),
            acquisition_timeout_ms: 30_000,
            attempts_per_backend: 2,
            incompatibility_signatures: vec![
                "allocator".into(),
                "libbcm_host".into(),
                "mmal".into(),
            ],
            watchdog_deadline_ms: 120_000,
            watchdog_grace_ms: 10_000,
            flush_interval_ms: 5_000,
            flush_max_rows: 500,
            region_failure_threshold: 100,
            sampling_interval_ms: 100,
            stop_timeout_ms: 35_000,
            state_dir: None,
        }
    }
}

impl AgentSettings {
    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition_timeout_ms)
    }

    pub fn watchdog_deadline(&self) -> Duration {
        Duration::from_millis(self.watchdog_deadline_ms)
    }

    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_millis(self.watchdog_grace_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Applies `ETHOTRACK_DEBUG`: flush almost every frame so a developer can
    /// watch rows land in the store.
    pub fn with_env_overrides(mut self) -> Self {
        let debug_mode = std::env::var("ETHOTRACK_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if debug_mode {
            self.flush_interval_ms = self.flush_interval_ms.min(500);
            self.flush_max_rows = self.flush_max_rows.min(16);
        }
        self
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<AgentSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!(
                        "Ignoring malformed settings file {} ({err}); using defaults",
                        path.display()
                    );
                    AgentSettings::default()
                }
            }
        } else {
            AgentSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> AgentSettings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, settings: AgentSettings) -> Result<()> {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.persist(&settings)?;
        *guard = settings;
        Ok(())
    }

    fn persist(&self, data: &AgentSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
