//! Two-part model training: a utilization classifier on every member and a
//! PMPM regression on utilizers, each chosen from the configured candidate
//! list by pooled cross-validated error.

use super::cv::{CvScore, cross_validate_score, derive_seed};
use super::family::{CandidateSpec, FitError, FittedModel, ModelFamily, Task};
use super::metrics::{r_squared, rmse};
use super::scaling::FeatureScaling;
use crate::artifact::{ModelArtifact, PartModel};
use crate::features::FeatureBatch;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Scores closer than this are treated as equal during selection.
pub const TIE_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Candidates in tie-break order.
    pub candidates: Vec<CandidateSpec>,
    pub k_folds: usize,
    pub seed: u64,
    pub min_training_rows: usize,
    /// Below this many utilizers the cost part falls back to the mean PMPM.
    pub min_positive_rows: usize,
    /// Scaled training rows kept in the artifact for attribution.
    pub background_size: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            candidates: CandidateSpec::default_candidates(),
            k_folds: 5,
            seed: 42,
            min_training_rows: 5,
            min_positive_rows: 3,
            background_size: 16,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingDataError {
    #[error("Training needs at least {required} members, but the batch has {found}.")]
    InsufficientRows { found: usize, required: usize },

    #[error("The feature schema is empty; there is nothing to train on.")]
    NoFeatures,

    #[error("Member '{member_id}' has a non-finite value for feature '{feature}'.")]
    NonFinite { member_id: String, feature: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPart {
    Utilization,
    Cost,
}

impl ModelPart {
    pub fn task(self) -> Task {
        match self {
            ModelPart::Utilization => Task::Classification,
            ModelPart::Cost => Task::Regression,
        }
    }

    fn stream(self) -> u64 {
        match self {
            ModelPart::Utilization => 1,
            ModelPart::Cost => 2,
        }
    }
}

impl fmt::Display for ModelPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelPart::Utilization => "utilization",
            ModelPart::Cost => "cost",
        })
    }
}

/// Every candidate of one part failed to cross-validate or refit.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Every candidate failed for the {part} model: {}", describe_failures(.failures))]
pub struct ModelTrainingFailure {
    pub part: ModelPart,
    pub failures: Vec<(ModelFamily, String)>,
}

fn describe_failures(failures: &[(ModelFamily, String)]) -> String {
    if failures.is_empty() {
        return "no candidates were configured".to_string();
    }
    failures
        .iter()
        .map(|(family, reason)| format!("{family}: {reason}"))
        .join("; ")
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error(transparent)]
    Data(#[from] TrainingDataError),

    #[error(transparent)]
    Model(#[from] ModelTrainingFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CandidateStatus {
    Scored { r2: f64, rmse: f64 },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateOutcome {
    pub family: ModelFamily,
    pub status: CandidateStatus,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartSummary {
    pub part: ModelPart,
    pub family: ModelFamily,
    pub cv_r2: Option<f64>,
    pub cv_rmse: Option<f64>,
    pub rows: usize,
    /// Candidates in configured order.
    pub leaderboard: Vec<CandidateOutcome>,
    /// Set when the part was not selected from candidates.
    pub constant_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub utilization: PartSummary,
    pub cost: PartSummary,
    /// In-sample fit of the combined PMPM prediction.
    pub combined_r2: f64,
    pub combined_rmse: f64,
    pub rows: usize,
    pub positive_rows: usize,
    pub seed: u64,
    /// Family of the cost part, which drives the PMPM magnitude.
    pub best_model: String,
    pub best_r2: f64,
    pub trained_at: DateTime<Utc>,
}

struct PartFit {
    model: FittedModel,
    cv: Option<CvScore>,
    summary: PartSummary,
}

#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Fits both parts on `batch` and assembles an unpublished artifact.
    pub fn train(&self, batch: &FeatureBatch) -> Result<ModelArtifact, TrainingError> {
        let schema = Arc::clone(batch.schema());
        if schema.is_empty() {
            return Err(TrainingDataError::NoFeatures.into());
        }
        let n = batch.len();
        if n < self.config.min_training_rows {
            return Err(TrainingDataError::InsufficientRows {
                found: n,
                required: self.config.min_training_rows,
            }
            .into());
        }

        let raw = batch.design_matrix();
        check_finite(batch, raw.view())?;
        let scaling = FeatureScaling::fit(raw.view());
        let x = scaling.transform_matrix(raw.view());

        log::info!(
            "Training two-part model on {n} members, {} features, {} candidates, {} folds",
            schema.len(),
            self.config.candidates.len(),
            self.config.k_folds
        );

        let utilized: Array1<f64> = batch
            .outcomes()
            .iter()
            .map(|o| if o.utilized { 1.0 } else { 0.0 })
            .collect();
        let pmpm: Array1<f64> = batch.outcomes().iter().map(|o| o.pmpm).collect();
        let positive: Vec<usize> = (0..n).filter(|&i| batch.outcomes()[i].utilized).collect();

        let utilization = match constant_value(utilized.view()) {
            Some(value) => constant_part(
                ModelPart::Utilization,
                value,
                n,
                format!("every member has utilized = {}", value > 0.5),
            ),
            None => self.select_part(ModelPart::Utilization, x.view(), utilized.view())?,
        };

        let cost = if positive.len() < self.config.min_positive_rows {
            let mean = positive.iter().map(|&i| pmpm[i]).sum::<f64>()
                / positive.len().max(1) as f64;
            constant_part(
                ModelPart::Cost,
                mean,
                positive.len(),
                format!(
                    "{} utilizers, fewer than the {} needed for a cost model",
                    positive.len(),
                    self.config.min_positive_rows
                ),
            )
        } else {
            let x_pos = x.select(Axis(0), &positive);
            let y_pos: Array1<f64> = positive.iter().map(|&i| pmpm[i]).collect();
            match constant_value(y_pos.view()) {
                Some(value) => constant_part(
                    ModelPart::Cost,
                    value,
                    positive.len(),
                    "every utilizer has the same PMPM".to_string(),
                ),
                None => self.select_part(ModelPart::Cost, x_pos.view(), y_pos.view())?,
            }
        };

        let combined: Array1<f64> = x
            .axis_iter(Axis(0))
            .map(|row| utilization.model.predict_row(row) * cost.model.predict_row(row).max(0.0))
            .collect();
        let combined_r2 = r_squared(pmpm.view(), combined.view());
        let combined_rmse = rmse(pmpm.view(), combined.view());
        let training_mean_pmpm = pmpm.mean().unwrap_or(0.0);
        let background = self.background_sample(x.view());

        log::info!(
            "Selected {} for utilization and {} for cost; combined in-sample R² {combined_r2:.4}, RMSE {combined_rmse:.2}",
            utilization.summary.family,
            cost.summary.family
        );

        let summary = TrainingSummary {
            best_model: cost.summary.family.to_string(),
            best_r2: cost.summary.cv_r2.unwrap_or(combined_r2),
            utilization: utilization.summary,
            cost: cost.summary,
            combined_r2,
            combined_rmse,
            rows: n,
            positive_rows: positive.len(),
            seed: self.config.seed,
            trained_at: Utc::now(),
        };

        Ok(ModelArtifact {
            version: 0,
            schema,
            scaling,
            utilization: PartModel {
                task: Task::Classification,
                model: utilization.model,
                cv: utilization.cv,
            },
            cost: PartModel {
                task: Task::Regression,
                model: cost.model,
                cv: cost.cv,
            },
            background,
            training_mean_pmpm,
            seed: self.config.seed,
            summary,
        })
    }

    /// Cross-validates every candidate in parallel, then refits the best one on
    /// all rows. A candidate whose refit fails yields to the next best.
    fn select_part(
        &self,
        part: ModelPart,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
    ) -> Result<PartFit, ModelTrainingFailure> {
        let task = part.task();
        let part_seed = derive_seed(self.config.seed, part.stream());
        let candidates = &self.config.candidates;

        let scores: Vec<Result<CvScore, FitError>> = candidates
            .par_iter()
            .enumerate()
            .map(|(i, spec)| {
                cross_validate_score(spec, x, y, task, self.config.k_folds, derive_seed(part_seed, i as u64))
            })
            .collect();

        let mut leaderboard: Vec<CandidateOutcome> = candidates
            .iter()
            .zip(&scores)
            .map(|(spec, score)| {
                let status = match score {
                    Ok(s) => {
                        log::debug!(
                            "{part} candidate {}: CV R² {:.4}, RMSE {:.4}",
                            spec.family(),
                            s.r2,
                            s.rmse
                        );
                        CandidateStatus::Scored {
                            r2: s.r2,
                            rmse: s.rmse,
                        }
                    }
                    Err(e) => {
                        log::warn!("{part} candidate {} skipped: {e}", spec.family());
                        CandidateStatus::Failed {
                            reason: e.to_string(),
                        }
                    }
                };
                CandidateOutcome {
                    family: spec.family(),
                    status,
                    selected: false,
                }
            })
            .collect();

        let scored: Vec<(usize, CvScore)> = scores
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().ok().map(|s| (i, *s)))
            .collect();

        for i in rank_candidates(&scored) {
            let spec = &candidates[i];
            match spec.fit(x, y, task, derive_seed(part_seed, i as u64)) {
                Ok(model) => {
                    leaderboard[i].selected = true;
                    let cv = scores[i].as_ref().ok().copied();
                    log::info!(
                        "{part} model: {} (CV R² {:.4}, RMSE {:.4}) on {} rows",
                        spec.family(),
                        cv.map_or(f64::NAN, |s| s.r2),
                        cv.map_or(f64::NAN, |s| s.rmse),
                        x.nrows()
                    );
                    return Ok(PartFit {
                        summary: PartSummary {
                            part,
                            family: model.family(),
                            cv_r2: cv.map(|s| s.r2),
                            cv_rmse: cv.map(|s| s.rmse),
                            rows: x.nrows(),
                            leaderboard,
                            constant_reason: None,
                        },
                        model,
                        cv,
                    });
                }
                Err(e) => {
                    log::warn!("{part} candidate {} failed to refit: {e}", spec.family());
                    leaderboard[i].status = CandidateStatus::Failed {
                        reason: format!("refit failed: {e}"),
                    };
                }
            }
        }

        let failures = leaderboard
            .into_iter()
            .filter_map(|c| match c.status {
                CandidateStatus::Failed { reason } => Some((c.family, reason)),
                CandidateStatus::Scored { .. } => None,
            })
            .collect();
        Err(ModelTrainingFailure { part, failures })
    }

    fn background_sample(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let n = x.nrows();
        let size = self.config.background_size.clamp(1, n);
        if size == n {
            return x.to_owned();
        }
        let mut rng = StdRng::seed_from_u64(derive_seed(self.config.seed, 3));
        let mut rows = index::sample(&mut rng, n, size).into_vec();
        rows.sort_unstable();
        x.select(Axis(0), &rows)
    }
}

/// Whether `a` beats `b`: lower RMSE, then higher R², with differences inside
/// [`TIE_TOLERANCE`] ignored.
fn outranks(a: &CvScore, b: &CvScore) -> bool {
    if (a.rmse - b.rmse).abs() > TIE_TOLERANCE {
        return a.rmse < b.rmse;
    }
    if (a.r2 - b.r2).abs() > TIE_TOLERANCE {
        return a.r2 > b.r2;
    }
    false
}

/// Candidate indices from best to worst. Full ties keep configured order.
fn rank_candidates(scored: &[(usize, CvScore)]) -> Vec<usize> {
    let mut remaining: Vec<(usize, CvScore)> = scored.to_vec();
    let mut order = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let mut best = 0;
        for k in 1..remaining.len() {
            if outranks(&remaining[k].1, &remaining[best].1) {
                best = k;
            }
        }
        order.push(remaining.remove(best).0);
    }
    order
}

fn constant_value(y: ArrayView1<f64>) -> Option<f64> {
    let first = *y.first()?;
    y.iter().all(|&v| v == first).then_some(first)
}

fn constant_part(part: ModelPart, value: f64, rows: usize, reason: String) -> PartFit {
    log::warn!("{part} model is a constant {value:.4}: {reason}");
    PartFit {
        model: FittedModel::Constant { value },
        cv: None,
        summary: PartSummary {
            part,
            family: ModelFamily::Constant,
            cv_r2: None,
            cv_rmse: None,
            rows,
            leaderboard: Vec::new(),
            constant_reason: Some(reason),
        },
    }
}

fn check_finite(batch: &FeatureBatch, x: ArrayView2<f64>) -> Result<(), TrainingDataError> {
    for (i, row) in x.axis_iter(Axis(0)).enumerate() {
        if let Some(j) = row.iter().position(|v| !v.is_finite()) {
            return Err(TrainingDataError::NonFinite {
                member_id: batch.records()[i].member_id.clone(),
                feature: batch.schema().names()[j].clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(r2: f64, rmse: f64) -> CvScore {
        CvScore { r2, rmse, folds: 5 }
    }

    #[test]
    fn lower_rmse_wins() {
        let order = rank_candidates(&[(0, score(0.9, 2.0)), (1, score(0.5, 1.0))]);
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn rmse_tie_falls_back_to_r2_then_list_order() {
        let order = rank_candidates(&[
            (0, score(0.4, 1.0)),
            (2, score(0.6, 1.0 + 1e-13)),
            (3, score(0.6, 1.0)),
        ]);
        assert_eq!(order, vec![2, 3, 0]);
    }

    #[test]
    fn failure_message_lists_every_candidate() {
        let failure = ModelTrainingFailure {
            part: ModelPart::Cost,
            failures: vec![
                (ModelFamily::Glm, "did not converge".into()),
                (ModelFamily::Gam, "singular".into()),
            ],
        };
        let text = failure.to_string();
        assert!(text.contains("cost"));
        assert!(text.contains("glm: did not converge"));
        assert!(text.contains("gam: singular"));
    }
}
