use image::{imageops, GrayImage};

use crate::config::RegionConfig;
use crate::error::ConfigError;
use crate::store::models::Reading;

use super::geometry::{Geometry, Rect};
use super::slot::{Features, RegionalFailure, SubImage, TrackerSlot, TrackerState};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug)]
pub enum RegionOutcome {
    Reading(Reading),
    /// Region stopped producing readings after too many consecutive failures.
    Frozen,
}

#[derive(Debug)]
pub struct Region {
    id: u32,
    geometry: Geometry,
    rect: Rect,
    frame_size: (u32, u32),
    mask: Option<GrayImage>,
    state: TrackerState,
    consecutive_failures: u32,
    frozen: bool,
}

impl Region {
    pub fn new(
        config: &RegionConfig,
        slot: &dyn TrackerSlot,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Self, ConfigError> {
        config
            .geometry
            .validate()
            .map_err(|reason| ConfigError::new(format!("region {}: {reason}", config.id)))?;

        let rect = config.geometry.bounding_rect();
        if !rect.fits_within(frame_width, frame_height) {
            return Err(ConfigError::new(format!(
                "region {} ({}x{} at {},{}) does not fit in a {}x{} frame",
                config.id, rect.width, rect.height, rect.x, rect.y, frame_width, frame_height
            )));
        }

        Ok(Self {
            id: config.id,
            geometry: config.geometry.clone(),
            rect,
            frame_size: (frame_width, frame_height),
            mask: config.geometry.mask(),
            state: slot.initial_state(),
            consecutive_failures: 0,
            frozen: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Crops the frame, runs the tracker once and turns its answer into a
    /// reading. A failure yields a missing reading; once the region has failed
    /// more than `failure_threshold` frames in a row it is frozen for the rest
    /// of the run. A frame whose size differs from the one the region was
    /// built against counts as a failure rather than being cropped short.
    pub fn process(
        &mut self,
        slot: &dyn TrackerSlot,
        frame: &GrayImage,
        t: i64,
        failure_threshold: u32,
    ) -> RegionOutcome {
        if self.frozen {
            return RegionOutcome::Frozen;
        }

        let result = if frame.dimensions() == self.frame_size {
            self.track(slot, frame, t)
        } else {
            Err(RegionalFailure::new(format!(
                "frame is {}x{}, region was laid out on {}x{}",
                frame.width(),
                frame.height(),
                self.frame_size.0,
                self.frame_size.1
            )))
        };

        match result {
            Ok(features) => {
                if self.consecutive_failures > 0 {
                    log_info!(
                        "region {} recovered after {} failed frames",
                        self.id,
                        self.consecutive_failures
                    );
                }
                self.consecutive_failures = 0;
                RegionOutcome::Reading(Reading {
                    region_id: self.id,
                    t,
                    features: Some(features),
                })
            }
            Err(failure) => {
                self.consecutive_failures += 1;
                log_warn!(
                    "region {} tracker failure at t={} ({} in a row): {}",
                    self.id,
                    t,
                    self.consecutive_failures,
                    failure
                );
                if self.consecutive_failures > failure_threshold {
                    self.frozen = true;
                    log::warn!(
                        "region {} frozen after {} consecutive failures",
                        self.id,
                        self.consecutive_failures
                    );
                }
                RegionOutcome::Reading(Reading::missing(self.id, t))
            }
        }
    }

    fn track(
        &mut self,
        slot: &dyn TrackerSlot,
        frame: &GrayImage,
        t: i64,
    ) -> Result<Features, RegionalFailure> {
        let pixels = imageops::crop_imm(
            frame,
            self.rect.x,
            self.rect.y,
            self.rect.width,
            self.rect.height,
        )
        .to_image();
        let sub_image = SubImage {
            region_id: self.id,
            t,
            pixels,
            mask: self.mask.as_ref(),
        };

        let prior = std::mem::take(&mut self.state);
        let (next_state, result) = slot.update(prior, &sub_image);
        self.state = next_state;
        result
    }
}
