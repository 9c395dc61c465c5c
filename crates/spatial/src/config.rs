//! # Spatial Configuration
//!
//! Central configuration for the spatial core.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{SpatialError, SpatialResult};

// ============================================================================
// Main Config
// ============================================================================

/// Main spatial configuration.
///
/// Validated once when a [`Universe`](crate::Universe) is constructed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    /// Space grid settings
    pub grid: GridConfig,

    /// Per-view proximity settings
    pub view: ViewConfig,

    /// Cache processor settings
    pub processor: ProcessorConfig,

    /// In-process executor settings
    pub executor: ExecutorConfig,
}

impl SpatialConfig {
    /// Reject configurations that would misbehave at traversal time.
    pub fn validate(&self) -> SpatialResult<()> {
        let size = self.grid.space_size;
        if !size.is_finite() || size <= 0.0 {
            return Err(SpatialError::config(format!(
                "grid.space_size must be positive and finite, got {size}"
            )));
        }

        let radius = self.view.proximity_radius;
        if !radius.is_finite() || radius <= 0.0 {
            return Err(SpatialError::config(format!(
                "view.proximity_radius must be positive and finite, got {radius}"
            )));
        }

        let max_lookup = self.grid.max_spaces_per_lookup;
        if max_lookup == 0 {
            return Err(SpatialError::config("grid.max_spaces_per_lookup must be non-zero"));
        }
        // A proximity sphere touches at most floor(2r / size) + 2 cells per axis
        let per_axis = (2.0 * f64::from(radius) / f64::from(size)).floor() + 2.0;
        if per_axis.powi(3) > max_lookup as f64 {
            return Err(SpatialError::config(format!(
                "view.proximity_radius {radius} spans more than grid.max_spaces_per_lookup ({max_lookup}) spaces"
            )));
        }

        if self.processor.interval_ms == 0 {
            return Err(SpatialError::config("processor.interval_ms must be non-zero"));
        }

        if self.executor.queue_capacity == 0 {
            return Err(SpatialError::config("executor.queue_capacity must be non-zero"));
        }

        Ok(())
    }

    /// Builder-style override of the space size
    pub fn with_space_size(mut self, space_size: f32) -> Self {
        self.grid.space_size = space_size;
        self
    }

    /// Builder-style override of the proximity radius
    pub fn with_proximity_radius(mut self, radius: f32) -> Self {
        self.view.proximity_radius = radius;
        self
    }

    /// Builder-style override of the delta ordering
    pub fn with_ordering(mut self, ordering: DeltaOrdering) -> Self {
        self.processor.ordering = ordering;
        self
    }
}

// ============================================================================
// Grid Configuration
// ============================================================================

/// Space grid settings.
///
/// Small spaces cause churn as views move; large spaces over-subscribe.
/// The default leans towards large.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Edge length of one space (world units)
    pub space_size: f32,

    /// Grid cells one bounds lookup may enumerate. Roots spanning more are
    /// held in the global space instead.
    pub max_spaces_per_lookup: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            space_size: 80.0,
            max_spaces_per_lookup: 4096,
        }
    }
}

impl GridConfig {
    /// Displacement after which a view recomputes its spaces
    pub fn revalidation_distance(&self) -> f32 {
        self.space_size / 4.0
    }
}

// ============================================================================
// View Configuration
// ============================================================================

/// Per-view proximity settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Radius of the proximity sphere around each view (world units)
    pub proximity_radius: f32,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self { proximity_radius: 35.0 }
    }
}

// ============================================================================
// Processor Configuration
// ============================================================================

/// Which queue owner a view's deltas are scheduled under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOrdering {
    /// One queue per view: LOAD/UNLOAD/REVALIDATE reach the client in the
    /// order they were computed
    #[default]
    PerView,
    /// One queue per delta: no ordering between deltas of the same view
    PerUpdate,
}

/// Cache processor settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Pause between drain cycles (ms)
    pub interval_ms: u64,

    /// Queue owner granularity for scheduled deltas
    pub ordering: DeltaOrdering,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            ordering: DeltaOrdering::PerView,
        }
    }
}

impl ProcessorConfig {
    /// Drain interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ============================================================================
// Executor Configuration
// ============================================================================

/// In-process executor settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Pending tasks accepted before new work is rejected
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { queue_capacity: 4096 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SpatialConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grid.revalidation_distance(), 20.0);
        assert_eq!(config.grid.max_spaces_per_lookup, 4096);
        assert_eq!(config.processor.interval(), Duration::from_millis(500));
        assert_eq!(config.processor.ordering, DeltaOrdering::PerView);
    }

    #[test]
    fn test_rejects_bad_grid() {
        let config = SpatialConfig::default().with_space_size(0.0);
        assert!(matches!(config.validate(), Err(SpatialError::InvalidConfig(_))));

        let config = SpatialConfig::default().with_space_size(f32::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_radius_and_interval() {
        let config = SpatialConfig::default().with_proximity_radius(-1.0);
        assert!(config.validate().is_err());

        let mut config = SpatialConfig::default();
        config.processor.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = SpatialConfig::default();
        config.executor.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_lookup_limit_below_view_sphere() {
        let mut config = SpatialConfig::default();
        config.grid.max_spaces_per_lookup = 0;
        assert!(config.validate().is_err());

        // Radius 35 on an 80 grid touches at most 2 cells per axis
        config.grid.max_spaces_per_lookup = 8;
        assert!(config.validate().is_ok());
        config.grid.max_spaces_per_lookup = 7;
        assert!(config.validate().is_err());

        let config = SpatialConfig::default().with_proximity_radius(1_000.0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_spaces_per_lookup"));
    }
}
