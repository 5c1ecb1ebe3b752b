//! Dark-pixel centroid tracker: the subject is whatever is darker than the
//! background, and its position is the mean of those pixels.

use serde::Deserialize;

use crate::error::ConfigError;

use super::slot::{
    FeatureColumn, FeatureValue, Features, RegionalFailure, SqlType, SubImage, TrackerSlot,
    TrackerState,
};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct CentroidParams {
    /// Pixels strictly below this value belong to the subject.
    pub threshold: u8,
    pub min_area: u32,
}

impl Default for CentroidParams {
    fn default() -> Self {
        Self {
            threshold: 80,
            min_area: 4,
        }
    }
}

pub struct CentroidTracker {
    params: CentroidParams,
}

impl CentroidTracker {
    pub fn new(params: CentroidParams) -> Self {
        Self { params }
    }

    pub fn from_parameters(parameters: &serde_json::Value) -> Result<Self, ConfigError> {
        let params = if parameters.is_null() {
            CentroidParams::default()
        } else {
            serde_json::from_value(parameters.clone()).map_err(|err| {
                ConfigError::new(format!("invalid centroid tracker parameters: {err}"))
            })?
        };
        if params.min_area == 0 {
            return Err(ConfigError::new("centroid min_area must be at least 1"));
        }
        Ok(Self::new(params))
    }
}

impl TrackerSlot for CentroidTracker {
    fn name(&self) -> &str {
        "centroid"
    }

    fn columns(&self) -> Vec<FeatureColumn> {
        vec![
            FeatureColumn::new("x", SqlType::Real, "x"),
            FeatureColumn::new("y", SqlType::Real, "y"),
            FeatureColumn::new("area", SqlType::Integer, "area"),
            FeatureColumn::new("moved", SqlType::Real, "distance"),
        ]
    }

    fn update(
        &self,
        prior: TrackerState,
        sub_image: &SubImage<'_>,
    ) -> (TrackerState, Result<Features, RegionalFailure>) {
        let mut area = 0u64;
        let mut sum_x = 0u64;
        let mut sum_y = 0u64;
        for (x, y, value) in sub_image.region_pixels() {
            if value < self.params.threshold {
                area += 1;
                sum_x += x as u64;
                sum_y += y as u64;
            }
        }

        if area < self.params.min_area as u64 {
            let failure = RegionalFailure::new(format!(
                "no subject found (area {area} < {})",
                self.params.min_area
            ));
            return (prior, Err(failure));
        }

        let cx = sum_x as f64 / area as f64;
        let cy = sum_y as f64 / area as f64;
        let moved = prior
            .get::<(f64, f64)>()
            .map(|(px, py)| ((cx - px).powi(2) + (cy - py).powi(2)).sqrt())
            .unwrap_or(0.0);

        let features = Features::new()
            .with("x", FeatureValue::Real(cx))
            .with("y", FeatureValue::Real(cy))
            .with("area", FeatureValue::Int(area as i64))
            .with("moved", FeatureValue::Real(moved));

        (TrackerState::new((cx, cy)), Ok(features))
    }
}
