use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timings of one acquire/track/persist cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleMetrics {
    pub timestamp: DateTime<Utc>,
    pub frame_index: u64,
    pub t: i64,
    pub acquire_ms: u64,
    pub track_ms: u64,
    pub persist_ms: u64,
    pub total_ms: u64,
    pub readings: u32,
    pub missing: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub recent_cycles: Vec<CycleMetrics>,
    pub frame_count: u64,
    pub reading_count: u64,
    pub missing_count: u64,
    pub frozen_regions: Vec<u32>,
    pub flush_count: u64,
    pub rows_written: u64,
}
