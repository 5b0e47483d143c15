use crate::artifact::ModelArtifact;
use crate::models::cv::CvScore;
use crate::models::family::ModelFamily;
use crate::types::{FeatureSchema, FeatureVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Relative-risk cut points for [`RiskTier`]; relative risk is predicted PMPM
/// over the training mean PMPM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub high_risk_ratio: f64,
    pub medium_risk_ratio: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            high_risk_ratio: 1.5,
            medium_risk_ratio: 0.75,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn from_relative_risk(relative: f64, config: &PredictionConfig) -> Self {
        if relative >= config.high_risk_ratio {
            RiskTier::High
        } else if relative >= config.medium_risk_ratio {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        }
    }
}

/// The features were built under a different ordering than the artifact was
/// trained on.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "Feature ordering does not match model artifact v{artifact_version}: first difference at position {position} (artifact has {expected:?}, input has {found:?}). Rebuild features with the artifact's pipeline or retrain."
)]
pub struct StaleArtifactError {
    pub artifact_version: u64,
    pub position: usize,
    pub expected: Option<String>,
    pub found: Option<String>,
}

/// Fails when `schema` is not the ordering `artifact` was trained on.
pub(crate) fn ensure_schema(
    artifact: &ModelArtifact,
    schema: &FeatureSchema,
) -> Result<(), StaleArtifactError> {
    let expected = &artifact.schema;
    match expected.first_mismatch(schema) {
        None => Ok(()),
        Some(position) => Err(StaleArtifactError {
            artifact_version: artifact.version,
            position,
            expected: expected.names().get(position).cloned(),
            found: schema.names().get(position).cloned(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionContext {
    pub artifact_version: u64,
    pub utilization_family: ModelFamily,
    pub cost_family: ModelFamily,
    pub utilization_cv: Option<CvScore>,
    pub cost_cv: Option<CvScore>,
    pub relative_risk: f64,
    pub risk_tier: RiskTier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub member_id: String,
    pub utilization_probability: f64,
    /// Expected PMPM given utilization, floored at zero.
    pub conditional_cost: f64,
    pub predicted_pmpm: f64,
    pub context: PredictionContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSet {
    pub artifact_version: u64,
    pub results: BTreeMap<String, PredictionResult>,
}

impl PredictionSet {
    pub fn get(&self, member_id: &str) -> Option<&PredictionResult> {
        self.results.get(member_id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Pure predictions against one pinned artifact.
#[derive(Debug, Clone)]
pub struct Predictor {
    artifact: Arc<ModelArtifact>,
    config: PredictionConfig,
}

impl Predictor {
    pub fn new(artifact: Arc<ModelArtifact>, config: PredictionConfig) -> Self {
        Self { artifact, config }
    }

    pub fn artifact(&self) -> &Arc<ModelArtifact> {
        &self.artifact
    }

    pub fn check_schema(&self, schema: &FeatureSchema) -> Result<(), StaleArtifactError> {
        ensure_schema(&self.artifact, schema)
    }

    pub fn predict(&self, features: &FeatureVector) -> Result<PredictionResult, StaleArtifactError> {
        self.check_schema(features.schema())?;
        Ok(self.predict_unchecked(features))
    }

    /// Member-parallel prediction. The first vector with a mismatched schema
    /// fails the whole batch.
    pub fn predict_batch(
        &self,
        features: &[FeatureVector],
    ) -> Result<PredictionSet, StaleArtifactError> {
        for vector in features {
            self.check_schema(vector.schema())?;
        }
        let results: BTreeMap<String, PredictionResult> = features
            .par_iter()
            .map(|v| (v.member_id().to_string(), self.predict_unchecked(v)))
            .collect();
        Ok(PredictionSet {
            artifact_version: self.artifact.version,
            results,
        })
    }

    fn predict_unchecked(&self, features: &FeatureVector) -> PredictionResult {
        let artifact = &self.artifact;
        let scaled = artifact.scale_row(features.values().view());
        let probability = artifact.utilization.predict_row(scaled.view());
        let conditional_cost = artifact.cost.predict_row(scaled.view()).max(0.0);
        let predicted_pmpm = probability * conditional_cost;

        let relative_risk = if artifact.training_mean_pmpm > 0.0 {
            predicted_pmpm / artifact.training_mean_pmpm
        } else {
            0.0
        };

        PredictionResult {
            member_id: features.member_id().to_string(),
            utilization_probability: probability,
            conditional_cost,
            predicted_pmpm,
            context: PredictionContext {
                artifact_version: artifact.version,
                utilization_family: artifact.utilization.family(),
                cost_family: artifact.cost.family(),
                utilization_cv: artifact.utilization.cv,
                cost_cv: artifact.cost.cv,
                relative_risk,
                risk_tier: RiskTier::from_relative_risk(relative_risk, &self.config),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_follow_relative_risk() {
        let config = PredictionConfig::default();
        assert_eq!(RiskTier::from_relative_risk(2.0, &config), RiskTier::High);
        assert_eq!(RiskTier::from_relative_risk(1.5, &config), RiskTier::High);
        assert_eq!(RiskTier::from_relative_risk(1.0, &config), RiskTier::Medium);
        assert_eq!(RiskTier::from_relative_risk(0.2, &config), RiskTier::Low);
    }
}
