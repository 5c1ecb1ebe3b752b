use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use log::error;
use tokio_util::sync::CancellationToken;

use crate::camera::{
    Acquisition, AcquisitionPolicy, BackendFactory, Frame, FrameSource, FrameSourceError,
};
use crate::config::RunConfig;
use crate::error::RunError;
use crate::metrics::{CycleMetrics, MetricsCollector};
use crate::settings::AgentSettings;
use crate::store::{Reading, ResultLog, ResultLogOptions, RunRecord, RunRecordStatus, StartEvent};
use crate::tracking::{Region, RegionOutcome, TrackerSlot};

use super::persisted::RunStateFile;
use super::state::{RunPhase, StatusCell};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Everything a run needs, resolved by the controller before any hardware is
/// touched.
pub struct RunContext {
    pub run_id: String,
    pub config: RunConfig,
    pub settings: AgentSettings,
    pub tracker: Arc<dyn TrackerSlot>,
    pub strategies: Vec<Arc<dyn BackendFactory>>,
    pub status: StatusCell,
    pub metrics: MetricsCollector,
    pub start_event: StartEvent,
    pub state_file: Option<RunStateFile>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Processed { t: i64 },
    EndOfStream,
    Cancelled,
}

/// How the loop ended when it ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Cancelled,
    EndOfStream,
}

pub struct RunLoop {
    run_id: String,
    status: StatusCell,
    metrics: MetricsCollector,
    source: FrameSource,
    tracker: Arc<dyn TrackerSlot>,
    regions: Vec<Region>,
    frame_size: Option<(u32, u32)>,
    log: ResultLog,
    failure_threshold: u32,
    last_t: Option<i64>,
}

impl RunLoop {
    /// Opens the result store and records the run in it. The camera is not
    /// touched yet.
    pub async fn open(ctx: &RunContext) -> Result<Self, RunError> {
        let store = &ctx.config.result_store;
        ctx.status.set_activity(
            &ctx.run_id,
            Some(format!("opening result store {}", store.path.display())),
        );

        let options = ResultLogOptions::from_settings(&ctx.settings, store.sampling_interval_ms);
        let log = ResultLog::open(
            &store.path,
            store.mode,
            &ctx.config.region_ids(),
            &ctx.tracker.columns(),
            options,
        )
        .await?;
        ctx.status.set_time_offset(&ctx.run_id, log.time_offset());

        let now = Utc::now();
        log.begin_run(&RunRecord {
            run_id: ctx.run_id.clone(),
            started_at: ctx.config.start_time.unwrap_or(now),
            stopped_at: None,
            status: RunRecordStatus::Running,
            time_offset: log.time_offset(),
            last_error: None,
            updated_at: now,
        })
        .await?;
        log.record_start_event(log.time_offset(), ctx.start_event, &ctx.run_id)
            .await?;

        let mut source = FrameSource::new(
            ctx.strategies.clone(),
            AcquisitionPolicy::from_settings(&ctx.settings),
        );
        let status = ctx.status.clone();
        let run_id = ctx.run_id.clone();
        source.set_observer(Arc::new(move |activity: String| {
            status.set_activity(&run_id, Some(activity));
        }));

        Ok(Self {
            run_id: ctx.run_id.clone(),
            status: ctx.status.clone(),
            metrics: ctx.metrics.clone(),
            source,
            tracker: Arc::clone(&ctx.tracker),
            regions: Vec::new(),
            frame_size: None,
            log,
            failure_threshold: ctx.settings.region_failure_threshold,
            last_t: None,
        })
    }

    /// Waits for the first usable frame, builds the regions against its size
    /// and moves the run to `Running`.
    async fn initialise(&mut self, ctx: &RunContext) -> Result<Option<LoopExit>, RunError> {
        let started = Instant::now();
        let first = match self.acquire(&ctx.cancel).await? {
            Acquisition::Frame(frame) => frame,
            Acquisition::EndOfStream => return Ok(Some(LoopExit::EndOfStream)),
            Acquisition::Cancelled => return Ok(Some(LoopExit::Cancelled)),
        };
        let acquire_ms = started.elapsed();

        self.status.set_activity(&self.run_id, Some("building regions".into()));
        let mut regions = Vec::with_capacity(ctx.config.regions.len());
        for region in &ctx.config.regions {
            regions.push(Region::new(
                region,
                self.tracker.as_ref(),
                first.width(),
                first.height(),
            )?);
        }
        self.regions = regions;
        self.frame_size = Some((first.width(), first.height()));

        self.write_metadata(ctx, &first).await?;

        if ctx.cancel.is_cancelled() {
            return Ok(Some(LoopExit::Cancelled));
        }
        if self.status.transition(&self.run_id, RunPhase::Running).is_err() {
            // Stopped or failed by someone else while we were starting up.
            return Ok(Some(LoopExit::Cancelled));
        }
        self.status.set_activity(&self.run_id, Some("tracking".into()));
        log_info!(
            "run {} running: {} regions, tracker '{}', backend '{}', time offset {}ms",
            self.run_id,
            self.regions.len(),
            self.tracker.name(),
            self.source.active_backend().unwrap_or("?"),
            self.log.time_offset()
        );

        self.process_frame(first, acquire_ms).await?;
        Ok(None)
    }

    /// Acquires exactly one frame and runs it through every region and into the
    /// store.
    pub async fn step(&mut self, cancel: &CancellationToken) -> Result<StepOutcome, RunError> {
        let started = Instant::now();
        let frame = match self.acquire(cancel).await? {
            Acquisition::Frame(frame) => frame,
            Acquisition::EndOfStream => return Ok(StepOutcome::EndOfStream),
            Acquisition::Cancelled => return Ok(StepOutcome::Cancelled),
        };
        let t = self.process_frame(frame, started.elapsed()).await?;
        Ok(StepOutcome::Processed { t })
    }

    async fn acquire(&mut self, cancel: &CancellationToken) -> Result<Acquisition, RunError> {
        loop {
            let deadline = self.source.worst_case_wait();
            match self.source.next(deadline, cancel).await {
                Ok(acquisition) => return Ok(acquisition),
                Err(err) if err.retryable && !err.exhausted => {
                    // Budget left on the source; the next call resumes the attempt count.
                    log_warn!("run {}: {err}; retrying", self.run_id);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Run-clock timestamp for a frame: frame time shifted by the resume
    /// offset, forced strictly above the previous one.
    fn clock(&mut self, frame_timestamp: i64) -> i64 {
        let candidate = frame_timestamp + self.log.time_offset();
        let t = match self.last_t {
            Some(last) => candidate.max(last + 1),
            None => candidate,
        };
        self.last_t = Some(t);
        t
    }

    async fn process_frame(&mut self, frame: Frame, acquire: Duration) -> Result<i64, RunError> {
        if let Some((width, height)) = self.frame_size {
            if (frame.width(), frame.height()) != (width, height) {
                return Err(FrameSourceError::fatal(format!(
                    "frame {} from backend '{}' is {}x{}; the run started at {}x{}",
                    frame.index,
                    self.source.active_backend().unwrap_or("?"),
                    frame.width(),
                    frame.height(),
                    width,
                    height
                ))
                .into());
            }
        }
        let cycle_start = Instant::now();
        let t = self.clock(frame.timestamp_ms);

        let mut readings: Vec<Reading> = Vec::with_capacity(self.regions.len());
        let mut missing = 0u32;
        let mut newly_frozen = Vec::new();
        for region in &mut self.regions {
            let was_frozen = region.is_frozen();
            match region.process(self.tracker.as_ref(), &frame.image, t, self.failure_threshold) {
                RegionOutcome::Reading(reading) => {
                    if reading.is_missing() {
                        missing += 1;
                    }
                    readings.push(reading);
                }
                RegionOutcome::Frozen => {}
            }
            if !was_frozen && region.is_frozen() {
                newly_frozen.push(region.id());
            }
        }
        let track = cycle_start.elapsed();

        for region_id in newly_frozen {
            self.metrics.record_frozen(region_id).await;
        }

        let persist_start = Instant::now();
        let count = readings.len() as u32;
        for reading in readings {
            self.log.append(reading).await?;
        }
        let persist = persist_start.elapsed();

        self.metrics
            .record_cycle(CycleMetrics {
                timestamp: Utc::now(),
                frame_index: frame.index,
                t,
                acquire_ms: acquire.as_millis() as u64,
                track_ms: track.as_millis() as u64,
                persist_ms: persist.as_millis() as u64,
                total_ms: (acquire + cycle_start.elapsed()).as_millis() as u64,
                readings: count,
                missing,
            })
            .await;
        self.metrics
            .record_store(self.log.flushes(), self.log.rows_written())
            .await;

        Ok(t)
    }

    async fn write_metadata(&self, ctx: &RunContext, first: &Frame) -> Result<(), RunError> {
        let regions = serde_json::to_string(&ctx.config.regions)
            .map_err(|err| RunError::Storage(format!("cannot serialise regions: {err}")))?;
        let start_time = ctx.config.start_time.unwrap_or_else(Utc::now);
        let entries = vec![
            ("run_id", ctx.run_id.clone()),
            ("machine_id", ctx.settings.machine_id.clone()),
            ("machine_name", ctx.settings.machine_name.clone()),
            ("experiment_name", ctx.config.experiment.name.clone()),
            ("experiment_location", ctx.config.experiment.location.clone()),
            ("experiment_code", ctx.config.experiment.code.clone()),
            ("tracker", self.tracker.name().to_string()),
            ("tracker_parameters", ctx.config.tracker.parameters.to_string()),
            ("camera_backend", self.source.active_backend().unwrap_or("").to_string()),
            ("frame_width", first.width().to_string()),
            ("frame_height", first.height().to_string()),
            ("regions", regions),
            ("date_time", start_time.to_rfc3339()),
            ("time_offset", self.log.time_offset().to_string()),
            ("agent_version", env!("CARGO_PKG_VERSION").to_string()),
        ];
        self.log
            .write_metadata(
                entries
                    .into_iter()
                    .map(|(field, value)| (field.to_string(), value))
                    .collect(),
            )
            .await
    }

    async fn main_loop(&mut self, ctx: &RunContext) -> Result<LoopExit, RunError> {
        if let Some(exit) = self.initialise(ctx).await? {
            return Ok(exit);
        }
        loop {
            match self.step(&ctx.cancel).await? {
                StepOutcome::Processed { .. } => {}
                StepOutcome::EndOfStream => return Ok(LoopExit::EndOfStream),
                StepOutcome::Cancelled => return Ok(LoopExit::Cancelled),
            }
        }
    }

    /// Final flush, run row update and camera release. Always runs, whatever
    /// ended the loop.
    async fn shutdown(&mut self, failure: Option<String>) -> Result<(), RunError> {
        self.source.release();

        let close_result = self.log.close().await;
        self.metrics
            .record_store(self.log.flushes(), self.log.rows_written())
            .await;

        let close_error = close_result.as_ref().err().map(|err| err.to_string());
        let last_error = failure.or(close_error);
        let status = if last_error.is_some() {
            RunRecordStatus::Failed
        } else {
            RunRecordStatus::Completed
        };
        if let Err(err) = self.log.finish_run(&self.run_id, status, last_error).await {
            error!("run {}: failed to update run record: {err}", self.run_id);
        }
        close_result
    }
}

/// Body of the run task. `finished` is cancelled when this returns, however it
/// returns, so the watchdog can tell a wound-down loop from a wedged one.
pub async fn drive_run(ctx: RunContext, finished: CancellationToken) {
    let _finished = finished.drop_guard();

    let mut run = match RunLoop::open(&ctx).await {
        Ok(run) => run,
        Err(err) => {
            report_failure(&ctx, &err);
            clear_state_file(&ctx);
            return;
        }
    };

    let outcome = run.main_loop(&ctx).await;
    if let Err(err) = &outcome {
        report_failure(&ctx, err);
    }

    let failure = match &outcome {
        Err(err) => Some(err.to_string()),
        Ok(_) => recorded_failure(&ctx),
    };
    if let Err(err) = run.shutdown(failure).await {
        report_failure(&ctx, &err);
    }

    if let Ok(LoopExit::EndOfStream) = outcome {
        log_info!("run {} reached the end of its frame source", ctx.run_id);
        if let Err(err) = ctx.status.transition(&ctx.run_id, RunPhase::Stopped) {
            log_warn!("run {}: {err}", ctx.run_id);
        }
    }

    clear_state_file(&ctx);
}

fn report_failure(ctx: &RunContext, err: &RunError) {
    error!("run {} failed: {err}", ctx.run_id);
    ctx.status.fail(&ctx.run_id, err.diagnostic());
}

/// The diagnostic someone else (the watchdog) left on this run, if any.
fn recorded_failure(ctx: &RunContext) -> Option<String> {
    let session = ctx.status.snapshot();
    if session.run_id.as_deref() != Some(ctx.run_id.as_str()) || session.status != RunPhase::Error {
        return None;
    }
    session.last_error.map(|diagnostic| diagnostic.message)
}

fn clear_state_file(ctx: &RunContext) {
    if let Some(file) = &ctx.state_file {
        if let Err(err) = file.clear() {
            error!("failed to clear run state file: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{backend_factory, BackendError, CaptureBackend};
    use crate::config::{RegionConfig, ResultStoreConfig, StoreMode, TrackerConfig};
    use crate::store::inspect::{region_timestamps, summarize_store};
    use crate::tracking::geometry::{Geometry, Rect};
    use crate::tracking::TrackerRegistry;
    use image::{GrayImage, Luma};

    struct Blank;

    impl CaptureBackend for Blank {
        fn grab(&mut self) -> Result<Option<GrayImage>, BackendError> {
            let mut image = GrayImage::from_pixel(40, 20, Luma([230]));
            for y in 8..12 {
                for x in 8..12 {
                    image.put_pixel(x, y, Luma([5]));
                }
            }
            Ok(Some(image))
        }
    }

    /// Full-size frames for the first two grabs, then a narrower sensor mode.
    struct Shrinking {
        grabs: u32,
    }

    impl CaptureBackend for Shrinking {
        fn grab(&mut self) -> Result<Option<GrayImage>, BackendError> {
            self.grabs += 1;
            let width = if self.grabs > 2 { 30 } else { 40 };
            Ok(Some(GrayImage::from_pixel(width, 20, Luma([230]))))
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    fn context(dir: &std::path::Path) -> RunContext {
        let config = RunConfig {
            regions: vec![
                RegionConfig {
                    id: 1,
                    geometry: Geometry::Rect(Rect {
                        x: 0,
                        y: 0,
                        width: 20,
                        height: 20,
                    }),
                },
                RegionConfig {
                    id: 2,
                    geometry: Geometry::Rect(Rect {
                        x: 20,
                        y: 0,
                        width: 20,
                        height: 20,
                    }),
                },
            ],
            tracker: TrackerConfig {
                name: "centroid".into(),
                parameters: serde_json::Value::Null,
            },
            result_store: ResultStoreConfig {
                path: dir.join("run.db"),
                mode: StoreMode::Fresh,
                sampling_interval_ms: None,
            },
            camera: Default::default(),
            start_time: None,
            experiment: Default::default(),
        };
        let tracker = TrackerRegistry::with_builtins().build(&config.tracker).unwrap();
        RunContext {
            run_id: "loop-test".into(),
            config,
            settings: AgentSettings::default(),
            tracker,
            strategies: vec![backend_factory("blank", || {
                Ok(Box::new(Blank) as Box<dyn CaptureBackend>)
            })],
            status: StatusCell::new(),
            metrics: MetricsCollector::new(),
            start_event: StartEvent::Fresh,
            state_file: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn steps_produce_one_reading_per_region_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        ctx.status.begin(&ctx.run_id, Utc::now()).unwrap();

        let mut run = RunLoop::open(&ctx).await.unwrap();
        assert_eq!(run.initialise(&ctx).await.unwrap(), None);
        assert_eq!(ctx.status.snapshot().status, RunPhase::Running);

        let mut stamps = Vec::new();
        for _ in 0..4 {
            match run.step(&ctx.cancel).await.unwrap() {
                StepOutcome::Processed { t } => stamps.push(t),
                other => panic!("unexpected step outcome {other:?}"),
            }
        }
        assert!(stamps.windows(2).all(|pair| pair[1] > pair[0]));

        run.shutdown(None).await.unwrap();
        let path = dir.path().join("run.db");
        assert_eq!(region_timestamps(&path, 1).unwrap().len(), 5);
        let summary = summarize_store(&path).unwrap();
        assert_eq!(summary.region(1).unwrap().missing, 0);
        // region 2 sees only bright background
        assert_eq!(summary.region(2).unwrap().missing, 5);
        assert_eq!(summary.metadata_value("tracker"), Some("centroid"));
        assert_eq!(summary.metadata_value("frame_width"), Some("40"));
        assert_eq!(summary.runs[0].status, RunRecordStatus::Completed);
        assert_eq!(summary.start_events[0].event, "fresh");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn region_larger_than_the_frame_fails_initialisation() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.config.regions[1].geometry = Geometry::Rect(Rect {
            x: 30,
            y: 0,
            width: 20,
            height: 20,
        });
        ctx.status.begin(&ctx.run_id, Utc::now()).unwrap();

        drive_run(ctx, CancellationToken::new()).await;
        let summary = summarize_store(&dir.path().join("run.db")).unwrap();
        assert_eq!(summary.runs[0].status, RunRecordStatus::Failed);
        assert!(summary.runs[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("does not fit"));
    }

    #[test]
    fn run_task_is_spawnable() {
        let dir = tempfile::tempdir().unwrap();
        let task = drive_run(context(dir.path()), CancellationToken::new());
        assert_send(&task);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn a_frame_size_change_mid_run_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.strategies = vec![backend_factory("shrinking", || {
            Ok(Box::new(Shrinking { grabs: 0 }) as Box<dyn CaptureBackend>)
        })];
        let status = ctx.status.clone();
        status.begin(&ctx.run_id, Utc::now()).unwrap();

        drive_run(ctx, CancellationToken::new()).await;

        let session = status.snapshot();
        assert_eq!(session.status, RunPhase::Error);
        let diagnostic = session.last_error.unwrap();
        assert_eq!(diagnostic.kind, crate::error::ErrorKind::FrameSource);
        assert!(diagnostic.message.contains("is 30x20; the run started at 40x20"));

        let path = dir.path().join("run.db");
        // nothing cropped from the narrower frame reaches the store
        assert_eq!(region_timestamps(&path, 2).unwrap().len(), 2);
        let summary = summarize_store(&path).unwrap();
        assert_eq!(summary.runs[0].status, RunRecordStatus::Failed);
    }
}
