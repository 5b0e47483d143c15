//! The end-to-end engine: rows in, artifacts, predictions and cost-driver
//! analyses out. Owns the only long-lived mutable state, the artifact store.

use crate::artifact::{ArtifactStore, ModelArtifact, StoreError};
use crate::config::{ConfigError, EngineConfig};
use crate::drivers::{CostDriverAnalysis, CostDriverDecomposer, InsightGenerator, analyze_batch};
use crate::features::{DataQualityReport, FeatureBatch, FeaturePipeline, ValidationError};
use crate::hcc::{ConditionTaxonomy, TaxonomyError};
use crate::models::{Trainer, TrainingError, TrainingSummary};
use crate::predict::{PredictionSet, Predictor, StaleArtifactError};
use crate::types::RawMemberRow;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Taxonomy(#[from] TaxonomyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Stale(#[from] StaleArtifactError),

    #[error("A training run is already in progress.")]
    TrainingInProgress,

    #[error("No model has been trained yet; run training first.")]
    NoArtifact,
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TrainingInProgress => EngineError::TrainingInProgress,
            StoreError::Training(e) => EngineError::Training(e),
        }
    }
}

/// What a successful training run hands back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub artifact_version: u64,
    pub summary: TrainingSummary,
    pub quality: DataQualityReport,
}

pub struct RiskEngine {
    config: EngineConfig,
    pipeline: FeaturePipeline,
    trainer: Trainer,
    store: ArtifactStore,
}

impl RiskEngine {
    /// Engine over the built-in taxonomy.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let taxonomy = Arc::new(ConditionTaxonomy::builtin()?);
        Self::with_taxonomy(config, taxonomy)
    }

    pub fn with_taxonomy(
        config: EngineConfig,
        taxonomy: Arc<ConditionTaxonomy>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        log::info!(
            "Risk engine using taxonomy {} ({} categories)",
            taxonomy.version(),
            taxonomy.categories().len()
        );
        Ok(Self {
            pipeline: FeaturePipeline::new(taxonomy, config.pipeline.clone()),
            trainer: Trainer::new(config.training.clone()),
            store: ArtifactStore::new(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &FeaturePipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn current_artifact(&self) -> Result<Arc<ModelArtifact>, EngineError> {
        self.store.current().ok_or(EngineError::NoArtifact)
    }

    pub fn featurize(&self, rows: &[RawMemberRow]) -> Result<FeatureBatch, EngineError> {
        Ok(self.pipeline.build_batch(rows)?)
    }

    /// Trains and publishes, waiting for any run already in flight.
    pub fn train(&self, rows: &[RawMemberRow]) -> Result<TrainingReport, EngineError> {
        let batch = self.featurize(rows)?;
        let artifact = self.store.train_and_publish(&self.trainer, &batch)?;
        Ok(report(&artifact, &batch))
    }

    /// Trains and publishes unless another run holds the training gate.
    pub fn try_train(&self, rows: &[RawMemberRow]) -> Result<TrainingReport, EngineError> {
        let batch = self.featurize(rows)?;
        let artifact = self.store.try_train_and_publish(&self.trainer, &batch)?;
        Ok(report(&artifact, &batch))
    }

    pub fn predictor(&self) -> Result<Predictor, EngineError> {
        Ok(Predictor::new(
            self.current_artifact()?,
            self.config.prediction.clone(),
        ))
    }

    pub fn predict(&self, rows: &[RawMemberRow]) -> Result<PredictionSet, EngineError> {
        let predictor = self.predictor()?;
        let batch = self.featurize(rows)?;
        Ok(predictor.predict_batch(batch.vectors())?)
    }

    /// Attributes every member's prediction and summarizes the cost drivers.
    /// The whole analysis is pinned to the artifact current at the call.
    pub fn analyze(&self, rows: &[RawMemberRow]) -> Result<CostDriverAnalysis, EngineError> {
        let artifact = self.current_artifact()?;
        let batch = self.featurize(rows)?;
        let decomposer = CostDriverDecomposer::new(artifact, self.config.attribution.clone());
        let insights = InsightGenerator::new(self.config.insights.clone());
        Ok(analyze_batch(&decomposer, &insights, &batch)?)
    }
}

fn report(artifact: &ModelArtifact, batch: &FeatureBatch) -> TrainingReport {
    TrainingReport {
        artifact_version: artifact.version,
        summary: artifact.summary.clone(),
        quality: batch.quality().clone(),
    }
}
