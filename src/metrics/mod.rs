mod types;

pub use types::{CycleMetrics, MetricsSnapshot, SystemMetrics};

use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

const MAX_RECENT_CYCLES: usize = 20;

#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    recent_cycles: Vec<CycleMetrics>,
    frame_count: u64,
    reading_count: u64,
    missing_count: u64,
    frozen_regions: Vec<u32>,
    flush_count: u64,
    rows_written: u64,
    system: System,
    pid: Pid,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // CPU usage is a delta between refreshes; take the baseline now
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                recent_cycles: Vec::with_capacity(MAX_RECENT_CYCLES),
                frame_count: 0,
                reading_count: 0,
                missing_count: 0,
                frozen_regions: Vec::new(),
                flush_count: 0,
                rows_written: 0,
                system,
                pid,
            })),
        }
    }

    pub async fn record_cycle(&self, metrics: CycleMetrics) {
        let mut state = self.inner.lock().await;

        state.frame_count += 1;
        state.reading_count += metrics.readings as u64;
        state.missing_count += metrics.missing as u64;

        state.recent_cycles.push(metrics);
        if state.recent_cycles.len() > MAX_RECENT_CYCLES {
            state.recent_cycles.remove(0);
        }
    }

    pub async fn record_frozen(&self, region_id: u32) {
        let mut state = self.inner.lock().await;
        if !state.frozen_regions.contains(&region_id) {
            state.frozen_regions.push(region_id);
        }
    }

    pub async fn record_store(&self, flush_count: u64, rows_written: u64) {
        let mut state = self.inner.lock().await;
        state.flush_count = flush_count;
        state.rows_written = rows_written;
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let pid = state.pid;

        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let system = match state.system.process(pid) {
            Some(process) => SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            },
            None => SystemMetrics::default(),
        };

        MetricsSnapshot {
            system,
            recent_cycles: state.recent_cycles.clone(),
            frame_count: state.frame_count,
            reading_count: state.reading_count,
            missing_count: state.missing_count,
            frozen_regions: state.frozen_regions.clone(),
            flush_count: state.flush_count,
            rows_written: state.rows_written,
        }
    }

    pub async fn reset(&self) {
        let mut state = self.inner.lock().await;
        let pid = state.pid;
        state.recent_cycles.clear();
        state.frame_count = 0;
        state.reading_count = 0;
        state.missing_count = 0;
        state.frozen_regions.clear();
        state.flush_count = 0;
        state.rows_written = 0;
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    }
}
