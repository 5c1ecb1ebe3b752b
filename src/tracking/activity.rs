//! Perceptual-hash activity tracker. Activity is the Hamming distance between
//! the hashes of two consecutive crops of the same region.

use image::{DynamicImage, GrayImage};
use image_hasher::{HashAlg, HasherConfig, ImageHash};
use serde::Deserialize;

use crate::error::ConfigError;

use super::slot::{
    FeatureColumn, FeatureValue, Features, RegionalFailure, SqlType, SubImage, TrackerSlot,
    TrackerState,
};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActivityParams {
    pub hash_size: u32,
}

impl Default for ActivityParams {
    fn default() -> Self {
        Self { hash_size: 8 }
    }
}

pub struct ActivityTracker {
    params: ActivityParams,
}

impl ActivityTracker {
    pub fn from_parameters(parameters: &serde_json::Value) -> Result<Self, ConfigError> {
        let params: ActivityParams = if parameters.is_null() {
            ActivityParams::default()
        } else {
            serde_json::from_value(parameters.clone()).map_err(|err| {
                ConfigError::new(format!("invalid activity tracker parameters: {err}"))
            })?
        };
        if !(2..=32).contains(&params.hash_size) {
            return Err(ConfigError::new(format!(
                "activity hash_size must be between 2 and 32, got {}",
                params.hash_size
            )));
        }
        Ok(Self { params })
    }

    fn compute_hash(&self, pixels: &GrayImage) -> ImageHash {
        let hasher = HasherConfig::new()
            .hash_alg(HashAlg::DoubleGradient)
            .hash_size(self.params.hash_size, self.params.hash_size)
            .to_hasher();
        hasher.hash_image(&DynamicImage::ImageLuma8(pixels.clone()))
    }
}

impl TrackerSlot for ActivityTracker {
    fn name(&self) -> &str {
        "activity"
    }

    fn columns(&self) -> Vec<FeatureColumn> {
        vec![
            FeatureColumn::new("activity", SqlType::Integer, "hamming_distance"),
            FeatureColumn::new("mean_intensity", SqlType::Real, "intensity"),
        ]
    }

    fn update(
        &self,
        prior: TrackerState,
        sub_image: &SubImage<'_>,
    ) -> (TrackerState, Result<Features, RegionalFailure>) {
        let (count, sum) = sub_image
            .region_pixels()
            .fold((0u64, 0u64), |(count, sum), (_, _, value)| {
                (count + 1, sum + value as u64)
            });
        if count == 0 {
            return (prior, Err(RegionalFailure::new("region mask covers no pixels")));
        }
        let (width, height) = sub_image.pixels.dimensions();
        if width < 2 || height < 2 {
            return (
                prior,
                Err(RegionalFailure::new(format!(
                    "crop {width}x{height} is too small to hash"
                ))),
            );
        }

        let hash = self.compute_hash(&sub_image.pixels);
        let activity = prior
            .get::<ImageHash>()
            .map(|previous| previous.dist(&hash))
            .unwrap_or(0);

        let features = Features::new()
            .with("activity", FeatureValue::Int(activity as i64))
            .with("mean_intensity", FeatureValue::Real(sum as f64 / count as f64));

        (TrackerState::new(hash), Ok(features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn sub_image(pixels: GrayImage) -> SubImage<'static> {
        SubImage {
            region_id: 2,
            t: 0,
            pixels,
            mask: None,
        }
    }

    fn gradient(flip: bool) -> GrayImage {
        GrayImage::from_fn(32, 32, |x, _| {
            let value = (x * 8) as u8;
            Luma([if flip { 255 - value } else { value }])
        })
    }

    #[test]
    fn identical_crops_have_no_activity() {
        let tracker = ActivityTracker::from_parameters(&serde_json::Value::Null).unwrap();
        let (state, _) = tracker.update(TrackerState::empty(), &sub_image(gradient(false)));
        let (_, result) = tracker.update(state, &sub_image(gradient(false)));
        assert_eq!(result.unwrap().get("activity"), Some(&FeatureValue::Int(0)));
    }

    #[test]
    fn changed_crop_reports_activity() {
        let tracker = ActivityTracker::from_parameters(&serde_json::Value::Null).unwrap();
        let (state, _) = tracker.update(TrackerState::empty(), &sub_image(gradient(false)));
        let (_, result) = tracker.update(state, &sub_image(gradient(true)));
        match result.unwrap().get("activity") {
            Some(FeatureValue::Int(distance)) => assert!(*distance > 0),
            other => panic!("unexpected activity value {other:?}"),
        }
    }

    #[test]
    fn rejects_out_of_range_hash_size() {
        let err = ActivityTracker::from_parameters(&serde_json::json!({"hash_size": 1}));
        assert!(err.is_err());
    }
}
