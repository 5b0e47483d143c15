//! Engine configuration, read from TOML. Every section and field has a
//! default, so an empty file is a valid configuration.

use crate::drivers::{AttributionConfig, InsightConfig};
use crate::features::PipelineConfig;
use crate::models::TrainerConfig;
use crate::predict::PredictionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pipeline: PipelineConfig,
    pub training: TrainerConfig,
    pub attribution: AttributionConfig,
    pub insights: InsightConfig,
    pub prediction: PredictionConfig,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        log::info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| Err(ConfigError::Invalid { field, reason });

        let months = self.pipeline.exposure_months;
        if !(months.is_finite() && months > 0.0) {
            return invalid("pipeline.exposure_months", format!("must be positive, got {months}"));
        }
        if self.training.k_folds < 2 {
            return invalid(
                "training.k_folds",
                format!("needs at least 2 folds, got {}", self.training.k_folds),
            );
        }
        if self.training.candidates.is_empty() {
            return invalid("training.candidates", "at least one candidate is required".into());
        }
        if self.training.min_training_rows == 0 {
            return invalid("training.min_training_rows", "must be at least 1".into());
        }
        if self.training.background_size == 0 {
            return invalid("training.background_size", "must be at least 1".into());
        }
        if self.attribution.permutations == 0 {
            return invalid("attribution.permutations", "must be at least 1".into());
        }
        let tolerance = self.attribution.efficiency_tolerance;
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return invalid(
                "attribution.efficiency_tolerance",
                format!("must be positive, got {tolerance}"),
            );
        }
        let (high, medium) = (
            self.prediction.high_risk_ratio,
            self.prediction.medium_risk_ratio,
        );
        if !(medium.is_finite() && high.is_finite() && 0.0 <= medium && medium <= high) {
            return invalid(
                "prediction",
                format!("risk ratios must satisfy 0 <= medium ({medium}) <= high ({high})"),
            );
        }
        Ok(())
    }
}
