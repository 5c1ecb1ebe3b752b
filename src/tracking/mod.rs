pub mod activity;
pub mod centroid;
pub mod geometry;
pub mod region;
pub mod registry;
pub mod slot;

pub use geometry::{Geometry, Rect};
pub use region::{Region, RegionOutcome};
pub use registry::TrackerRegistry;
pub use slot::{
    FeatureColumn, FeatureValue, Features, RegionalFailure, SqlType, SubImage, TrackerSlot,
    TrackerState,
};
