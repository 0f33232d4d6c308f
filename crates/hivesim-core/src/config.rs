//! Static configuration for simulations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What `create_agents` does when fewer initial-value maps than agents are supplied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InitialValuesPolicy {
    /// Cycle through the supplied maps.
    #[default]
    Repeat,
    /// Require exactly one map per agent (or none at all).
    Strict,
}

/// Runtime knobs applied to every simulation built from a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Edge length of grid cells in continuous topologies.
    pub cell_size: f64,
    /// Footprint radius given to agents whose species declares none.
    pub footprint_radius: f64,
    /// Handling of short initial-value sequences.
    pub initial_values: InitialValuesPolicy,
    /// Whether environments wrap when the model leaves it unspecified.
    pub torus: bool,
    /// Color used for agents drawn into display rasters.
    pub display_color: [u8; 4],
    /// Background color of display rasters.
    pub display_background: [u8; 4],
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            cell_size: 10.0,
            footprint_radius: 0.5,
            initial_values: InitialValuesPolicy::Repeat,
            torus: false,
            display_color: [220, 60, 40, 255],
            display_background: [255, 255, 255, 255],
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cell_size > 0.0) {
            return Err(ConfigError::Invalid("cell_size must be positive"));
        }
        if !(self.footprint_radius >= 0.0) {
            return Err(ConfigError::Invalid(
                "footprint_radius must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Settings for runs without a user interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeadlessConfig {
    /// Directory receiving display snapshots.
    pub images_dir: PathBuf,
    /// Print progress dots while running.
    pub show_progress: bool,
    /// Number of progress marks spread over a bounded run.
    pub progress_granularity: u32,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from("images"),
            show_progress: true,
            progress_granularity: 100,
        }
    }
}

impl HeadlessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.progress_granularity == 0 {
            return Err(ConfigError::Invalid(
                "progress_granularity must be at least 1",
            ));
        }
        Ok(())
    }

    /// Steps between two progress marks for a run bounded by `final_step`.
    #[must_use]
    pub fn progress_interval(&self, final_step: i64) -> u64 {
        let granularity = i64::from(self.progress_granularity.max(1));
        if final_step < granularity {
            1
        } else {
            (final_step / granularity) as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SimulationConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_cell_size() {
        let config = SimulationConfig {
            cell_size: 0.0,
            ..SimulationConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid("cell_size must be positive"))
        );
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: SimulationConfig =
            serde_json::from_str(r#"{"cell_size": 4.0, "initial_values": "strict"}"#)
                .expect("config");
        assert_eq!(config.cell_size, 4.0);
        assert_eq!(config.initial_values, InitialValuesPolicy::Strict);
        assert_eq!(config.footprint_radius, 0.5);
    }

    #[test]
    fn progress_interval_spreads_marks() {
        let headless = HeadlessConfig::default();
        assert_eq!(headless.progress_interval(-1), 1);
        assert_eq!(headless.progress_interval(50), 1);
        assert_eq!(headless.progress_interval(1_000), 10);
        assert!(
            HeadlessConfig {
                progress_granularity: 0,
                ..HeadlessConfig::default()
            }
            .validate()
            .is_err()
        );
    }
}
