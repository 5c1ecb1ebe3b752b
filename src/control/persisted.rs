//! The active-run state file. Present while a run is live so that an agent
//! restarted after a crash or a watchdog kill can pick the run back up.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;

const STATE_FILE_NAME: &str = "active_run.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRun {
    pub run_id: String,
    pub saved_at: DateTime<Utc>,
    pub config: RunConfig,
}

#[derive(Debug, Clone)]
pub struct RunStateFile {
    path: PathBuf,
}

impl RunStateFile {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Written to a temporary file first so a crash mid-write never leaves a
    /// truncated state file behind.
    pub fn save(&self, run: &PersistedRun) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(run)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move state file into {}", self.path.display()))
    }

    /// `Ok(None)` when there is no state file. A malformed one is reported and
    /// treated as absent, since nothing can be resumed from it.
    pub fn load(&self) -> Result<Option<PersistedRun>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        match serde_json::from_str(&contents) {
            Ok(run) => Ok(Some(run)),
            Err(err) => {
                warn!("ignoring malformed state file {}: {err}", self.path.display());
                Ok(None)
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResultStoreConfig, StoreMode, TrackerConfig, RegionConfig};
    use crate::tracking::geometry::{Geometry, Rect};

    fn persisted() -> PersistedRun {
        PersistedRun {
            run_id: "run-1".into(),
            saved_at: Utc::now(),
            config: RunConfig {
                regions: vec![RegionConfig {
                    id: 1,
                    geometry: Geometry::Rect(Rect {
                        x: 0,
                        y: 0,
                        width: 10,
                        height: 10,
                    }),
                }],
                tracker: TrackerConfig {
                    name: "centroid".into(),
                    parameters: serde_json::Value::Null,
                },
                result_store: ResultStoreConfig {
                    path: "/var/lib/ethotrack/run.db".into(),
                    mode: StoreMode::Fresh,
                    sampling_interval_ms: None,
                },
                camera: Default::default(),
                start_time: None,
                experiment: Default::default(),
            },
        }
    }

    #[test]
    fn save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let file = RunStateFile::in_dir(&dir.path().join("state"));
        assert_eq!(file.load().unwrap(), None);

        let run = persisted();
        file.save(&run).unwrap();
        assert_eq!(file.load().unwrap(), Some(run));
        assert!(!file.path().with_extension("json.tmp").exists());

        file.clear().unwrap();
        file.clear().unwrap();
        assert_eq!(file.load().unwrap(), None);
    }

    #[test]
    fn malformed_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let file = RunStateFile::in_dir(dir.path());
        fs::write(file.path(), "{ not json").unwrap();
        assert_eq!(file.load().unwrap(), None);
    }
}
