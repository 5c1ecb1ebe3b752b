use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracking::slot::Features;

/// One row of a region table. `features == None` marks the frame as missing
/// for that region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub region_id: u32,
    pub t: i64,
    pub features: Option<Features>,
}

impl Reading {
    pub fn missing(region_id: u32, t: i64) -> Self {
        Self {
            region_id,
            t,
            features: None,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.features.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunRecordStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl RunRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunRecordStatus::Running => "Running",
            RunRecordStatus::Completed => "Completed",
            RunRecordStatus::Failed => "Failed",
            RunRecordStatus::Interrupted => "Interrupted",
        }
    }
}

impl std::str::FromStr for RunRecordStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Running" => Ok(RunRecordStatus::Running),
            "Completed" => Ok(RunRecordStatus::Completed),
            "Failed" => Ok(RunRecordStatus::Failed),
            "Interrupted" => Ok(RunRecordStatus::Interrupted),
            _ => Err(anyhow::anyhow!("unknown run status '{value}'")),
        }
    }
}

/// Row of the RUNS table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub status: RunRecordStatus,
    pub time_offset: i64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartEvent {
    Fresh,
    Append,
    CrashRecovery,
}

impl StartEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartEvent::Fresh => "fresh",
            StartEvent::Append => "append",
            StartEvent::CrashRecovery => "crash_recovery",
        }
    }
}
