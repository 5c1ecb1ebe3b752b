//! Renders dark blobs wandering over a noisy bright background. Used for
//! bench testing a device without a camera attached.

use std::{
    thread,
    time::{Duration, Instant},
};

use image::{GrayImage, Luma};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::SyntheticCameraConfig;

use super::backend::{BackendError, CaptureBackend};

const BACKGROUND: u8 = 200;
const SUBJECT: u8 = 20;
const BLOB_RADIUS: f32 = 3.0;

struct Blob {
    x: f32,
    y: f32,
    vx: f32,
    vy: f32,
}

pub struct SyntheticCamera {
    config: SyntheticCameraConfig,
    rng: StdRng,
    blobs: Vec<Blob>,
    frame_interval: Duration,
    last_frame: Option<Instant>,
}

impl SyntheticCamera {
    pub fn new(config: SyntheticCameraConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let (width, height) = (config.width as f32, config.height as f32);
        let blobs = (0..config.subjects)
            .map(|_| Blob {
                x: rng.gen_range(0.0..width),
                y: rng.gen_range(0.0..height),
                vx: rng.gen_range(-2.0..2.0),
                vy: rng.gen_range(-2.0..2.0),
            })
            .collect();
        let frame_interval = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);

        Self {
            config,
            rng,
            blobs,
            frame_interval,
            last_frame: None,
        }
    }

    fn advance(&mut self) {
        let (width, height) = (self.config.width as f32, self.config.height as f32);
        for blob in &mut self.blobs {
            blob.vx = (blob.vx + self.rng.gen_range(-0.5..0.5)).clamp(-3.0, 3.0);
            blob.vy = (blob.vy + self.rng.gen_range(-0.5..0.5)).clamp(-3.0, 3.0);
            blob.x += blob.vx;
            blob.y += blob.vy;
            if blob.x < 0.0 || blob.x >= width {
                blob.vx = -blob.vx;
                blob.x = blob.x.clamp(0.0, width - 1.0);
            }
            if blob.y < 0.0 || blob.y >= height {
                blob.vy = -blob.vy;
                blob.y = blob.y.clamp(0.0, height - 1.0);
            }
        }
    }

    fn render(&mut self) -> GrayImage {
        let mut image = GrayImage::new(self.config.width, self.config.height);
        for pixel in image.pixels_mut() {
            let noise: i16 = self.rng.gen_range(-12..=12);
            *pixel = Luma([(BACKGROUND as i16 + noise).clamp(0, 255) as u8]);
        }

        for blob in &self.blobs {
            let radius = BLOB_RADIUS.ceil() as i64;
            let (cx, cy) = (blob.x.round() as i64, blob.y.round() as i64);
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    if ((dx * dx + dy * dy) as f32) > BLOB_RADIUS * BLOB_RADIUS {
                        continue;
                    }
                    let (x, y) = (cx + dx, cy + dy);
                    if x >= 0 && y >= 0 && x < self.config.width as i64 && y < self.config.height as i64 {
                        image.put_pixel(x as u32, y as u32, Luma([SUBJECT]));
                    }
                }
            }
        }
        image
    }
}

impl CaptureBackend for SyntheticCamera {
    fn grab(&mut self) -> Result<Option<GrayImage>, BackendError> {
        if let Some(last) = self.last_frame {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                thread::sleep(self.frame_interval - elapsed);
            }
        }
        self.last_frame = Some(Instant::now());

        self.advance();
        Ok(Some(self.render()))
    }
}
