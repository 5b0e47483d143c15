//! The trained two-part model and the store that publishes it.
//!
//! An artifact is immutable once built. The store swaps whole artifacts behind
//! an `Arc`, so a reader that has cloned the current handle keeps a complete,
//! consistent model for as long as it needs one, while a concurrent training
//! run prepares the next version off to the side.

use crate::models::cv::CvScore;
use crate::models::family::{FittedModel, ModelFamily, Task};
use crate::models::scaling::FeatureScaling;
use crate::models::trainer::{Trainer, TrainingError, TrainingSummary};
use crate::features::FeatureBatch;
use crate::types::FeatureSchema;
use ndarray::{Array1, Array2, ArrayView1};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// One half of the two-part model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartModel {
    pub task: Task,
    pub model: FittedModel,
    /// Pooled out-of-fold score; `None` for a constant fallback.
    pub cv: Option<CvScore>,
}

impl PartModel {
    pub fn family(&self) -> ModelFamily {
        self.model.family()
    }

    pub fn predict_row(&self, x: ArrayView1<f64>) -> f64 {
        self.model.predict_row(x)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Assigned by [`ArtifactStore::publish`]; 0 until published.
    pub version: u64,
    pub schema: Arc<FeatureSchema>,
    pub scaling: FeatureScaling,
    pub utilization: PartModel,
    pub cost: PartModel,
    /// Scaled training rows used as the reference distribution for attribution.
    pub background: Array2<f64>,
    /// Mean observed PMPM over all training members.
    pub training_mean_pmpm: f64,
    pub seed: u64,
    pub summary: TrainingSummary,
}

impl ModelArtifact {
    /// `P(utilization) * max(E[cost | utilization], 0)` on a scaled row.
    pub fn combined_row(&self, scaled: ArrayView1<f64>) -> f64 {
        self.utilization.predict_row(scaled) * self.cost.predict_row(scaled).max(0.0)
    }

    pub fn scale_row(&self, raw: ArrayView1<f64>) -> Array1<f64> {
        self.scaling.transform_row(raw)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("A training run is already in progress; the current artifact is unchanged.")]
    TrainingInProgress,

    #[error(transparent)]
    Training(#[from] TrainingError),
}

/// Holds the active artifact. Readers clone the `Arc` and never hold the lock
/// while they work; at most one training run is admitted at a time.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    current: RwLock<Option<Arc<ModelArtifact>>>,
    training_gate: Mutex<()>,
    next_version: AtomicU64,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The active artifact, if one has been published.
    pub fn current(&self) -> Option<Arc<ModelArtifact>> {
        self.current.read().clone()
    }

    pub fn version(&self) -> Option<u64> {
        self.current.read().as_ref().map(|a| a.version)
    }

    /// Stamps `artifact` with the next version and makes it current.
    pub fn publish(&self, mut artifact: ModelArtifact) -> Arc<ModelArtifact> {
        artifact.version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        let artifact = Arc::new(artifact);
        *self.current.write() = Some(Arc::clone(&artifact));
        log::info!(
            "Published model artifact v{} ({} / {})",
            artifact.version,
            artifact.utilization.family(),
            artifact.cost.family()
        );
        artifact
    }

    /// Trains on `batch` and publishes the result. Waits for any run already
    /// in flight. A failed run leaves the current artifact untouched.
    pub fn train_and_publish(
        &self,
        trainer: &Trainer,
        batch: &FeatureBatch,
    ) -> Result<Arc<ModelArtifact>, StoreError> {
        let gate = self.training_gate.lock();
        let result = self.run_training(trainer, batch);
        drop(gate);
        result
    }

    /// Like [`train_and_publish`](Self::train_and_publish) but rejects instead
    /// of waiting when another run holds the gate.
    pub fn try_train_and_publish(
        &self,
        trainer: &Trainer,
        batch: &FeatureBatch,
    ) -> Result<Arc<ModelArtifact>, StoreError> {
        let Some(gate) = self.training_gate.try_lock() else {
            log::warn!("Rejected training request: another run is in progress");
            return Err(StoreError::TrainingInProgress);
        };
        let result = self.run_training(trainer, batch);
        drop(gate);
        result
    }

    fn run_training(
        &self,
        trainer: &Trainer,
        batch: &FeatureBatch,
    ) -> Result<Arc<ModelArtifact>, StoreError> {
        match trainer.train(batch) {
            Ok(artifact) => Ok(self.publish(artifact)),
            Err(e) => {
                log::warn!("Training failed; keeping the previous artifact: {e}");
                Err(e.into())
            }
        }
    }
}
