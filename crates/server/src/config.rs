//! Node configuration file.
//!
//! ```toml
//! [server]
//! node_name = "meridian-local"
//! status_interval_secs = 10
//! demo = false
//!
//! [spatial.grid]
//! space_size = 80.0
//! max_spaces_per_lookup = 4096
//!
//! [spatial.view]
//! proximity_radius = 35.0
//!
//! [spatial.processor]
//! interval_ms = 500
//! ordering = "per_view"
//!
//! [spatial.executor]
//! queue_capacity = 4096
//! ```

use anyhow::{Context, Result};
use meridian_spatial::SpatialConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Full node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub spatial: SpatialConfig,
}

/// Process-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Name reported in logs
    pub node_name: String,
    /// Seconds between status lines
    pub status_interval_secs: u64,
    /// Run the scripted demo world
    pub demo: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            node_name: "meridian-local".to_string(),
            status_interval_secs: 10,
            demo: false,
        }
    }
}

impl ServerSettings {
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }
}

impl ServerConfig {
    /// Read and validate a TOML file. Missing sections keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.spatial.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_spatial::DeltaOrdering;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(
            r#"
            [server]
            node_name = "east-1"

            [spatial.grid]
            space_size = 120.0

            [spatial.processor]
            ordering = "per_update"
            "#,
        );

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.server.node_name, "east-1");
        assert_eq!(config.server.status_interval_secs, 10);
        assert_eq!(config.spatial.grid.space_size, 120.0);
        assert_eq!(config.spatial.view.proximity_radius, 35.0);
        assert_eq!(config.spatial.processor.ordering, DeltaOrdering::PerUpdate);
        assert_eq!(config.spatial.processor.interval_ms, 500);
        assert_eq!(config.spatial.grid.max_spaces_per_lookup, 4096);
    }

    #[test]
    fn test_empty_file_is_default() {
        let file = write_config("");
        assert_eq!(ServerConfig::load(file.path()).unwrap(), ServerConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = write_config("[spatial.view]\nproximity_radius = -3.0\n");
        let err = ServerConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("proximity_radius"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_malformed_file() {
        let file = write_config("[spatial.grid\nspace_size = ");
        let err = ServerConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }
}
