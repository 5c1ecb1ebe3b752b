use std::{collections::HashMap, sync::Arc};

use crate::config::TrackerConfig;
use crate::error::ConfigError;

use super::activity::ActivityTracker;
use super::centroid::CentroidTracker;
use super::slot::{validate_columns, TrackerSlot};

type TrackerConstructor =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn TrackerSlot>, ConfigError> + Send + Sync>;

/// Maps `tracker.name` to a constructor. The slot is built once per run at
/// `start()` and never swapped afterwards.
#[derive(Clone, Default)]
pub struct TrackerRegistry {
    constructors: HashMap<String, TrackerConstructor>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("centroid", |parameters| {
            Ok(Arc::new(CentroidTracker::from_parameters(parameters)?) as Arc<dyn TrackerSlot>)
        });
        registry.register("activity", |parameters| {
            Ok(Arc::new(ActivityTracker::from_parameters(parameters)?) as Arc<dyn TrackerSlot>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn TrackerSlot>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build(&self, config: &TrackerConfig) -> Result<Arc<dyn TrackerSlot>, ConfigError> {
        let constructor = self.constructors.get(&config.name).ok_or_else(|| {
            ConfigError::new(format!(
                "unknown tracker '{}' (available: {})",
                config.name,
                self.names().join(", ")
            ))
        })?;
        let slot = constructor(&config.parameters)?;
        validate_columns(&slot.columns())?;
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(name: &str) -> TrackerConfig {
        TrackerConfig {
            name: name.into(),
            parameters: serde_json::Value::Null,
        }
    }

    #[test]
    fn builds_builtin_trackers() {
        let registry = TrackerRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["activity", "centroid"]);
        assert_eq!(registry.build(&tracker("centroid")).unwrap().name(), "centroid");
        assert_eq!(registry.build(&tracker("activity")).unwrap().name(), "activity");
    }

    #[test]
    fn unknown_name_lists_the_alternatives() {
        let registry = TrackerRegistry::with_builtins();
        let err = registry.build(&tracker("adaptive_bg")).err().unwrap();
        assert!(err.0.contains("unknown tracker 'adaptive_bg'"));
        assert!(err.0.contains("centroid"));
    }
}
