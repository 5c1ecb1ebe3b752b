//! Replays a directory of still images in file-name order, as a stand-in for
//! a recorded video.

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use image::GrayImage;

use crate::config::DirectoryCameraConfig;

use super::backend::{BackendError, CaptureBackend};

const EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tif"];

pub struct DirectoryCamera {
    files: Vec<PathBuf>,
    position: usize,
    loop_playback: bool,
    frame_interval: Duration,
    last_frame: Option<Instant>,
}

impl DirectoryCamera {
    pub fn open(config: &DirectoryCameraConfig) -> Result<Self> {
        let files = list_images(&config.path)?;
        if files.is_empty() {
            bail!("no image files in {}", config.path.display());
        }

        Ok(Self {
            files,
            position: 0,
            loop_playback: config.loop_playback,
            frame_interval: Duration::from_secs_f64(1.0 / config.fps.max(1) as f64),
            last_frame: None,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read frame directory {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to list {}", dir.display()))?
            .path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

impl CaptureBackend for DirectoryCamera {
    fn grab(&mut self) -> Result<Option<GrayImage>, BackendError> {
        if self.position >= self.files.len() {
            if !self.loop_playback {
                return Ok(None);
            }
            self.position = 0;
        }

        if let Some(last) = self.last_frame {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                thread::sleep(self.frame_interval - elapsed);
            }
        }
        self.last_frame = Some(Instant::now());

        let path = &self.files[self.position];
        self.position += 1;
        let image = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?;
        Ok(Some(image.to_luma8()))
    }

    /// Reopening would rewind to the first file and replay frames already
    /// delivered; an undecodable file is skipped instead.
    fn reopen_after_error(&self) -> bool {
        false
    }
}
