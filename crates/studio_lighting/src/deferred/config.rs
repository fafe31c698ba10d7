//! Deferred lighting configuration.
//!
//! Grid dimensions and capacities are plain values passed at construction,
//! so a different cluster resolution or shadow budget is a config change:
//!
//! ```json
//! {
//!   "cluster": { "tiles_x": 16, "tiles_y": 9, "slices_z": 24, "max_lights_per_cluster": 32 },
//!   "max_lights": 256,
//!   "shadow": { "max_casters": 8, "resolution": 512 },
//!   "frames_in_flight": 2
//! }
//! ```
//!
//! Missing fields take their defaults.

use std::path::Path;

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use super::error::{DeferredError, DeferredResult};

/// Cluster grid dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterGridConfig {
    /// Screen-space tiles along X.
    pub tiles_x: u32,
    /// Screen-space tiles along Y.
    pub tiles_y: u32,
    /// Exponential depth slices along view Z.
    pub slices_z: u32,
    /// Maximum light indices stored per cell.
    pub max_lights_per_cluster: u32,
}

impl Default for ClusterGridConfig {
    fn default() -> Self {
        Self {
            tiles_x: 16,
            tiles_y: 9,
            slices_z: 24,
            max_lights_per_cluster: 32,
        }
    }
}

impl ClusterGridConfig {
    /// Total number of cells (`X * Y * Z`).
    pub fn cell_count(&self) -> usize {
        self.tiles_x as usize * self.tiles_y as usize * self.slices_z as usize
    }

    /// Size of the flat light-index table.
    pub fn index_capacity(&self) -> usize {
        self.cell_count() * self.max_lights_per_cluster as usize
    }
}

/// Point light shadow settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Number of lights (taken from the front of the light list) that get a cube map.
    pub max_casters: u32,
    /// Width and height of each cube face in texels.
    pub resolution: u32,
    /// Near plane of every face projection. The far plane is the light radius.
    pub near_plane: f32,
    /// Constant depth bias, in units of 2^-16 of the normalized light distance.
    pub depth_bias_constant: f32,
    /// Slope-scaled depth bias factor.
    pub depth_bias_slope: f32,
    /// World-space tolerance used by the manual depth compare at resolve time.
    pub compare_bias: f32,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            max_casters: 8,
            resolution: 512,
            near_plane: 0.1,
            depth_bias_constant: 1.25,
            depth_bias_slope: 1.75,
            compare_bias: 0.05,
        }
    }
}

/// Top-level configuration for [`DeferredLightingPlugin`](super::DeferredLightingPlugin).
#[derive(Resource, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferredConfig {
    pub cluster: ClusterGridConfig,
    /// Light store capacity and size of the GPU light array.
    pub max_lights: u32,
    pub shadow: ShadowConfig,
    /// Number of per-frame copies of the light, uniform, cluster, and index buffers.
    pub frames_in_flight: u32,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterGridConfig::default(),
            max_lights: 256,
            shadow: ShadowConfig::default(),
            frames_in_flight: 2,
        }
    }
}

impl DeferredConfig {
    /// Parse a config from JSON and validate it.
    pub fn from_json_str(json: &str) -> DeferredResult<Self> {
        let config: DeferredConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> DeferredResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Serialize to pretty JSON.
    pub fn to_json_string(&self) -> DeferredResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check that every dimension and capacity is usable.
    pub fn validate(&self) -> DeferredResult<()> {
        let grid = &self.cluster;
        if grid.tiles_x == 0 || grid.tiles_y == 0 || grid.slices_z == 0 {
            return Err(DeferredError::InvalidConfig(format!(
                "cluster grid must be non-empty (got {}x{}x{})",
                grid.tiles_x, grid.tiles_y, grid.slices_z
            )));
        }
        if grid.max_lights_per_cluster == 0 {
            return Err(DeferredError::InvalidConfig(
                "max_lights_per_cluster must be at least 1".into(),
            ));
        }
        if self.max_lights == 0 {
            return Err(DeferredError::InvalidConfig(
                "max_lights must be at least 1".into(),
            ));
        }
        if self.shadow.max_casters == 0 || self.shadow.resolution == 0 {
            return Err(DeferredError::InvalidConfig(
                "shadow max_casters and resolution must be at least 1".into(),
            ));
        }
        if !(self.shadow.near_plane > 0.0) {
            return Err(DeferredError::InvalidConfig(format!(
                "shadow near_plane must be positive (got {})",
                self.shadow.near_plane
            )));
        }
        if !(1..=3).contains(&self.frames_in_flight) {
            return Err(DeferredError::InvalidConfig(format!(
                "frames_in_flight must be 1..=3 (got {})",
                self.frames_in_flight
            )));
        }
        Ok(())
    }

    /// Number of shadow casters actually rendered for `light_count` lights.
    pub fn shadow_caster_count(&self, light_count: usize) -> usize {
        light_count.min(self.shadow.max_casters as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_grid() {
        let config = DeferredConfig::default();
        assert_eq!(config.cluster.cell_count(), 3456);
        assert_eq!(config.cluster.index_capacity(), 3456 * 32);
        assert_eq!(config.max_lights, 256);
        assert_eq!(config.shadow.max_casters, 8);
        assert_eq!(config.shadow.resolution, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            DeferredConfig::from_json_str(r#"{ "cluster": { "slices_z": 16 }, "max_lights": 64 }"#)
                .unwrap();
        assert_eq!(config.cluster.slices_z, 16);
        assert_eq!(config.cluster.tiles_x, 16);
        assert_eq!(config.max_lights, 64);
        assert_eq!(config.shadow, ShadowConfig::default());
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = DeferredConfig::default();
        config.shadow.max_casters = 4;
        config.frames_in_flight = 3;
        let json = config.to_json_string().unwrap();
        assert_eq!(DeferredConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DeferredConfig::default();
        config.cluster.tiles_y = 0;
        assert!(matches!(config.validate(), Err(DeferredError::InvalidConfig(_))));

        let mut config = DeferredConfig::default();
        config.frames_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = DeferredConfig::default();
        config.shadow.near_plane = 0.0;
        assert!(config.validate().is_err());

        assert!(DeferredConfig::from_json_str(r#"{ "max_lights": 0 }"#).is_err());
    }

    #[test]
    fn test_shadow_caster_count() {
        let config = DeferredConfig::default();
        assert_eq!(config.shadow_caster_count(3), 3);
        assert_eq!(config.shadow_caster_count(20), 8);
    }
}
