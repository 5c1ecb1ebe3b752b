use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::settings::AgentSettings;

use super::backend::{BackendFactory, FailureSignatures};
use super::frame::Frame;
use super::grabber::{GrabOutcome, Grabber};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct FrameSourceError {
    pub message: String,
    /// The caller may ask again; the retry budget is not spent yet.
    pub retryable: bool,
    /// Every backend has been tried and failed. Fatal to the run.
    pub exhausted: bool,
}

impl FrameSourceError {
    pub fn exhausted(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            exhausted: true,
        }
    }

    /// Frames are still arriving but cannot be used for this run.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            exhausted: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            exhausted: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionPolicy {
    pub attempt_timeout: Duration,
    pub attempts_per_backend: u32,
    pub signatures: FailureSignatures,
}

impl AcquisitionPolicy {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            attempt_timeout: settings.acquisition_timeout(),
            attempts_per_backend: settings.attempts_per_backend.max(1),
            signatures: FailureSignatures::new(&settings.incompatibility_signatures),
        }
    }
}

#[derive(Debug)]
pub enum Acquisition {
    Frame(Frame),
    /// A finite source (file replay) has nothing more to give.
    EndOfStream,
    Cancelled,
}

type ActivityObserver = Arc<dyn Fn(String) + Send + Sync>;

/// Ordered list of acquisition strategies with a per-backend retry budget.
/// Once a fallback backend delivers a frame it stays active for the run.
pub struct FrameSource {
    strategies: Vec<Arc<dyn BackendFactory>>,
    policy: AcquisitionPolicy,
    active: usize,
    attempts_on_active: u32,
    grabber: Option<Grabber>,
    epoch: Option<Instant>,
    last_timestamp: Option<i64>,
    frames: u64,
    fallback_announced: bool,
    last_failure: Option<String>,
    observer: Option<ActivityObserver>,
}

impl FrameSource {
    pub fn new(strategies: Vec<Arc<dyn BackendFactory>>, policy: AcquisitionPolicy) -> Self {
        Self {
            strategies,
            policy,
            active: 0,
            attempts_on_active: 0,
            grabber: None,
            epoch: None,
            last_timestamp: None,
            frames: 0,
            fallback_announced: false,
            last_failure: None,
            observer: None,
        }
    }

    /// Receives a human-readable description of what the source is waiting on.
    pub fn set_observer(&mut self, observer: ActivityObserver) {
        self.observer = Some(observer);
    }

    pub fn active_backend(&self) -> Option<&str> {
        self.strategies.get(self.active).map(|factory| factory.name())
    }

    pub fn frames_acquired(&self) -> u64 {
        self.frames
    }

    /// Longest `next` can take before the budget of every backend is spent.
    pub fn worst_case_wait(&self) -> Duration {
        let attempts = self.policy.attempts_per_backend * self.strategies.len() as u32;
        self.policy.attempt_timeout.saturating_mul(attempts.max(1))
    }

    /// Waits up to `deadline` for the next frame, retrying and falling back as
    /// the policy allows. A timed-out or failed attempt counts against the
    /// active backend's budget; it never silently skips a frame.
    pub async fn next(
        &mut self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Acquisition, FrameSourceError> {
        let started = Instant::now();

        loop {
            let factory = self.active_factory()?;
            let backend = factory.name().to_string();

            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(FrameSourceError::retryable(format!(
                    "no frame from backend '{backend}' within {}ms",
                    deadline.as_millis()
                )));
            }
            let budget = remaining.min(self.policy.attempt_timeout);

            if self.grabber.is_none() {
                let grabber = Grabber::spawn(Arc::clone(&factory))
                    .map_err(|err| FrameSourceError::exhausted(format!("{err:#}")))?;
                self.grabber = Some(grabber);
            }
            let Some(grabber) = self.grabber.as_ref() else {
                continue;
            };

            self.report(format!(
                "acquiring frame {} from backend '{backend}' (attempt {}/{})",
                self.frames,
                self.attempts_on_active + 1,
                self.policy.attempts_per_backend
            ));

            match grabber.grab(budget, cancel).await {
                GrabOutcome::Frame(image) => {
                    self.attempts_on_active = 0;
                    if self.active > 0 && !self.fallback_announced {
                        self.fallback_announced = true;
                        log_info!(
                            "camera fell back to backend '{backend}' after {}",
                            self.last_failure.as_deref().unwrap_or("earlier failures")
                        );
                    }
                    return Ok(Acquisition::Frame(self.stamp(image)));
                }
                GrabOutcome::EndOfStream => {
                    log_info!("backend '{backend}' reached end of stream");
                    return Ok(Acquisition::EndOfStream);
                }
                GrabOutcome::Cancelled => {
                    // The grab may still be running on the thread; start over next time.
                    self.grabber = None;
                    return Ok(Acquisition::Cancelled);
                }
                GrabOutcome::TimedOut => {
                    let message = format!(
                        "acquisition on backend '{backend}' timed out after {}ms",
                        budget.as_millis()
                    );
                    log_warn!("{message}; abandoning the grabber");
                    self.grabber = None;
                    self.record_failure(message)?;
                }
                GrabOutcome::Failed(err) => {
                    let message = format!("backend '{backend}' failed: {err}");
                    if let Some(signature) = self.policy.signatures.matching(&err.message).map(str::to_string) {
                        log_warn!(
                            "{message} (matches incompatibility signature '{signature}'); trying next backend"
                        );
                        self.last_failure = Some(message);
                        self.fall_back()?;
                    } else {
                        log_warn!("{message}");
                        self.record_failure(message)?;
                    }
                }
            }
        }
    }

    /// Shuts the grabber thread down. The source can be reused afterwards and
    /// will reopen the active backend on demand.
    pub fn release(&mut self) {
        if let Some(grabber) = self.grabber.take() {
            log_info!("releasing camera backend '{}'", grabber.backend());
        }
    }

    fn active_factory(&self) -> Result<Arc<dyn BackendFactory>, FrameSourceError> {
        self.strategies
            .get(self.active)
            .cloned()
            .ok_or_else(|| self.exhausted_error())
    }

    fn record_failure(&mut self, message: String) -> Result<(), FrameSourceError> {
        self.attempts_on_active += 1;
        self.last_failure = Some(message);
        if self.attempts_on_active >= self.policy.attempts_per_backend {
            self.fall_back()?;
        }
        Ok(())
    }

    fn fall_back(&mut self) -> Result<(), FrameSourceError> {
        self.grabber = None;
        self.attempts_on_active = 0;
        self.active += 1;
        match self.strategies.get(self.active) {
            Some(next) => {
                log_warn!("falling back to camera backend '{}'", next.name());
                Ok(())
            }
            None => Err(self.exhausted_error()),
        }
    }

    fn exhausted_error(&self) -> FrameSourceError {
        FrameSourceError::exhausted(format!(
            "all {} camera backends exhausted; last error: {}",
            self.strategies.len(),
            self.last_failure.as_deref().unwrap_or("none")
        ))
    }

    fn stamp(&mut self, image: image::GrayImage) -> Frame {
        let epoch = *self.epoch.get_or_insert_with(Instant::now);
        let elapsed = i64::try_from(epoch.elapsed().as_millis()).unwrap_or(i64::MAX);
        let timestamp_ms = match self.last_timestamp {
            Some(last) => elapsed.max(last + 1),
            None => elapsed,
        };
        self.last_timestamp = Some(timestamp_ms);

        let frame = Frame {
            index: self.frames,
            timestamp_ms,
            image,
        };
        self.frames += 1;
        frame
    }

    fn report(&self, activity: String) {
        if let Some(observer) = &self.observer {
            observer(activity);
        }
    }
}
