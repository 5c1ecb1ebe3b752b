//! Dedicated OS thread per opened backend. Driver calls may block forever, so
//! the async side only ever waits on a reply channel with a timeout.

use std::{
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use image::GrayImage;
use log::{debug, error};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::backend::{BackendError, BackendFactory, CaptureBackend};

type GrabReply = Result<Option<GrayImage>, BackendError>;

enum GrabCommand {
    Grab(oneshot::Sender<GrabReply>),
    Shutdown,
}

#[derive(Debug)]
pub enum GrabOutcome {
    Frame(GrayImage),
    EndOfStream,
    Failed(BackendError),
    TimedOut,
    Cancelled,
}

pub struct Grabber {
    backend: String,
    sender: mpsc::Sender<GrabCommand>,
}

impl Grabber {
    /// Spawns the worker thread. The backend itself is opened lazily by the
    /// first grab, so open failures are reported like any other grab failure.
    pub fn spawn(factory: Arc<dyn BackendFactory>) -> Result<Self> {
        let backend = factory.name().to_string();
        let (command_tx, command_rx) = mpsc::channel::<GrabCommand>();
        let thread_name = format!("ethotrack-grab-{backend}");

        thread::Builder::new()
            .name(thread_name)
            .spawn(move || grab_worker(factory, command_rx))
            .with_context(|| format!("failed to spawn grabber thread for backend '{backend}'"))?;

        Ok(Self {
            backend,
            sender: command_tx,
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub async fn grab(&self, budget: Duration, cancel: &CancellationToken) -> GrabOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.sender.send(GrabCommand::Grab(reply_tx)).is_err() {
            return GrabOutcome::Failed(BackendError::new(format!(
                "grabber thread for '{}' is gone",
                self.backend
            )));
        }

        tokio::select! {
            _ = cancel.cancelled() => GrabOutcome::Cancelled,
            reply = tokio::time::timeout(budget, reply_rx) => match reply {
                Err(_) => GrabOutcome::TimedOut,
                Ok(Err(_)) => GrabOutcome::Failed(BackendError::new(format!(
                    "grabber thread for '{}' terminated unexpectedly",
                    self.backend
                ))),
                Ok(Ok(Ok(Some(image)))) => GrabOutcome::Frame(image),
                Ok(Ok(Ok(None))) => GrabOutcome::EndOfStream,
                Ok(Ok(Err(err))) => GrabOutcome::Failed(err),
            },
        }
    }
}

impl Drop for Grabber {
    /// Never joins: a wedged driver call would block the caller forever. The
    /// thread closes the backend and exits once its current grab returns.
    fn drop(&mut self) {
        if self.sender.send(GrabCommand::Shutdown).is_err() {
            debug!("grabber thread for '{}' already exited", self.backend);
        }
    }
}

fn grab_worker(factory: Arc<dyn BackendFactory>, commands: mpsc::Receiver<GrabCommand>) {
    let mut backend: Option<Box<dyn CaptureBackend>> = None;

    while let Ok(command) = commands.recv() {
        match command {
            GrabCommand::Grab(reply) => {
                let result = grab_once(factory.as_ref(), &mut backend);
                if reply.send(result).is_err() {
                    // Caller gave up (timeout or cancellation); the frame is dropped.
                    debug!("grab reply for '{}' arrived after the caller left", factory.name());
                }
            }
            GrabCommand::Shutdown => break,
        }
    }

    if let Some(mut open) = backend.take() {
        open.close();
    }
    debug!("grabber thread for '{}' shutting down", factory.name());
}

fn grab_once(
    factory: &dyn BackendFactory,
    backend: &mut Option<Box<dyn CaptureBackend>>,
) -> GrabReply {
    if backend.is_none() {
        *backend = Some(factory.open()?);
    }
    let Some(open) = backend.as_mut() else {
        return Err(BackendError::new("backend not open"));
    };

    let result = open.grab();
    if let Err(err) = &result {
        error!("backend '{}' grab failed: {err}", factory.name());
        if open.reopen_after_error() {
            if let Some(mut broken) = backend.take() {
                broken.close();
            }
        }
    }
    result
}
