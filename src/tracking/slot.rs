//! The capability boundary between the run loop and a tracking algorithm.

use std::{any::Any, collections::HashSet, fmt};

use image::GrayImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ConfigError;

/// Column names every region table carries regardless of the tracker.
pub const RESERVED_COLUMNS: [&str; 3] = ["id", "t", "missing"];

/// Opaque per-region state. The loop threads it through `TrackerSlot::update`
/// without ever looking inside.
#[derive(Default)]
pub struct TrackerState(Option<Box<dyn Any + Send + Sync>>);

impl TrackerState {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Box::new(value)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_ref().and_then(|value| value.downcast_ref::<T>())
    }

    pub fn take<T: Any>(self) -> Option<T> {
        self.0
            .and_then(|value| value.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }
}

impl fmt::Debug for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("TrackerState(empty)")
        } else {
            f.write_str("TrackerState(..)")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Int(i64),
    Real(f64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqlType {
    Integer,
    Real,
    Text,
}

impl SqlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub sql_type: SqlType,
    /// What the number means (`x`, `area`, `distance`...), recorded in VAR_MAP.
    pub functional_type: String,
}

impl FeatureColumn {
    pub fn new(name: &str, sql_type: SqlType, functional_type: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type,
            functional_type: functional_type.to_string(),
        }
    }
}

/// Ordered feature mapping produced for one region and one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Features(Vec<(String, FeatureValue)>);

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: FeatureValue) -> Self {
        self.insert(name, value);
        self
    }

    /// Replaces an existing value in place so the original order is kept.
    pub fn insert(&mut self, name: &str, value: FeatureValue) {
        if let Some(slot) = self.0.iter_mut().find(|(key, _)| key == name) {
            slot.1 = value;
        } else {
            self.0.push((name.to_string(), value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FeatureValue)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A tracker could not produce a reading for one region on one frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct RegionalFailure {
    pub reason: String,
}

impl RegionalFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Cropped pixels of one region with the polygon mask, if any, at the same size.
pub struct SubImage<'a> {
    pub region_id: u32,
    pub t: i64,
    pub pixels: GrayImage,
    pub mask: Option<&'a GrayImage>,
}

impl SubImage<'_> {
    pub fn is_inside(&self, x: u32, y: u32) -> bool {
        match self.mask {
            Some(mask) => mask.get_pixel(x, y)[0] > 0,
            None => true,
        }
    }

    /// Pixels that belong to the region, with their crop-local coordinates.
    pub fn region_pixels(&self) -> impl Iterator<Item = (u32, u32, u8)> + '_ {
        self.pixels
            .enumerate_pixels()
            .filter(move |(x, y, _)| self.is_inside(*x, *y))
            .map(|(x, y, pixel)| (x, y, pixel[0]))
    }
}

pub trait TrackerSlot: Send + Sync {
    fn name(&self) -> &str;

    /// Feature columns in the order they are stored.
    fn columns(&self) -> Vec<FeatureColumn>;

    fn initial_state(&self) -> TrackerState {
        TrackerState::empty()
    }

    /// Consumes the prior state and always hands a state back, even on failure,
    /// so the region can carry on with the next frame.
    fn update(
        &self,
        prior: TrackerState,
        sub_image: &SubImage<'_>,
    ) -> (TrackerState, Result<Features, RegionalFailure>);
}

pub fn validate_columns(columns: &[FeatureColumn]) -> Result<(), ConfigError> {
    if columns.is_empty() {
        return Err(ConfigError::new("tracker declares no feature columns"));
    }

    let mut seen = HashSet::new();
    for column in columns {
        let name = column.name.as_str();
        let well_formed = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !name.starts_with(|c: char| c.is_ascii_digit());
        if !well_formed {
            return Err(ConfigError::new(format!("invalid feature column name '{name}'")));
        }
        if RESERVED_COLUMNS.contains(&name) {
            return Err(ConfigError::new(format!(
                "feature column '{name}' clashes with a reserved column"
            )));
        }
        if !seen.insert(name) {
            return Err(ConfigError::new(format!("duplicate feature column '{name}'")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_state_round_trips_its_payload() {
        let state = TrackerState::new((3.5f64, 2.0f64));
        assert_eq!(state.get::<(f64, f64)>(), Some(&(3.5, 2.0)));
        assert!(state.get::<u32>().is_none());
        assert_eq!(state.take::<(f64, f64)>(), Some((3.5, 2.0)));
        assert!(TrackerState::empty().take::<u8>().is_none());
    }

    #[test]
    fn features_keep_insertion_order() {
        let mut features = Features::new()
            .with("x", FeatureValue::Real(1.0))
            .with("area", FeatureValue::Int(12));
        features.insert("x", FeatureValue::Real(2.0));

        let names: Vec<&str> = features.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["x", "area"]);
        assert_eq!(features.get("x"), Some(&FeatureValue::Real(2.0)));
    }

    #[test]
    fn reserved_and_malformed_columns_are_rejected() {
        let ok = vec![FeatureColumn::new("x", SqlType::Real, "x")];
        assert!(validate_columns(&ok).is_ok());

        let reserved = vec![FeatureColumn::new("t", SqlType::Integer, "time")];
        assert!(validate_columns(&reserved).is_err());

        let injected = vec![FeatureColumn::new("x); DROP TABLE", SqlType::Real, "x")];
        assert!(validate_columns(&injected).is_err());

        let duplicated = vec![
            FeatureColumn::new("x", SqlType::Real, "x"),
            FeatureColumn::new("x", SqlType::Integer, "x"),
        ];
        assert!(validate_columns(&duplicated).is_err());
    }
}
