//! Candidate model families behind one fixed capability set: a `CandidateSpec`
//! fits, the resulting `FittedModel` predicts, and `cv::cross_validate_score`
//! scores any candidate the same way.

use super::basis::BasisError;
use super::boosting::{BoostedEnsemble, BoostingParams};
use super::elastic_net::{ElasticNetParams, fit_elastic_net};
use super::forest::{ForestParams, RandomForest};
use super::gam::{GamModel, GamParams};
use super::glm::{GlmParams, LinearModel, LinkFunction, fit_glm};
use super::linalg::LinalgError;
use super::tree::RegressionTree;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    ElasticNet,
    Glm,
    Gam,
    RandomForest,
    GradientBoosting,
    /// Baseline for degenerate targets; never a candidate.
    Constant,
}

impl ModelFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::ElasticNet => "elastic_net",
            ModelFamily::Glm => "glm",
            ModelFamily::Gam => "gam",
            ModelFamily::RandomForest => "random_forest",
            ModelFamily::GradientBoosting => "gradient_boosting",
            ModelFamily::Constant => "constant",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which half of the two-part model is being fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// Probability of any utilization; targets are 0/1.
    Classification,
    /// Cost given utilization.
    Regression,
}

impl Task {
    pub fn link(self) -> LinkFunction {
        match self {
            Task::Classification => LinkFunction::Logit,
            Task::Regression => LinkFunction::Identity,
        }
    }
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error("{family} did not converge after {iterations} iterations (last change {last_change:e}).")]
    DidNotConverge {
        family: ModelFamily,
        iterations: usize,
        last_change: f64,
    },

    #[error("{family} produced non-finite values during fitting.")]
    NonFinite { family: ModelFamily },

    #[error("{family} needs at least {required} rows to fit, but received {found}.")]
    TooFewRows {
        family: ModelFamily,
        found: usize,
        required: usize,
    },

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] LinalgError),

    #[error("Spline basis construction failed: {0}")]
    Basis(#[from] BasisError),
}

/// One entry of the ordered candidate list, with its hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum CandidateSpec {
    ElasticNet(ElasticNetParams),
    Glm(GlmParams),
    Gam(GamParams),
    RandomForest(ForestParams),
    GradientBoosting(BoostingParams),
}

impl CandidateSpec {
    /// The default candidate list, in tie-break order.
    pub fn default_candidates() -> Vec<CandidateSpec> {
        vec![
            CandidateSpec::ElasticNet(ElasticNetParams::default()),
            CandidateSpec::Glm(GlmParams::default()),
            CandidateSpec::Gam(GamParams::default()),
            CandidateSpec::RandomForest(ForestParams::default()),
            CandidateSpec::GradientBoosting(BoostingParams::default()),
        ]
    }

    pub fn family(&self) -> ModelFamily {
        match self {
            CandidateSpec::ElasticNet(_) => ModelFamily::ElasticNet,
            CandidateSpec::Glm(_) => ModelFamily::Glm,
            CandidateSpec::Gam(_) => ModelFamily::Gam,
            CandidateSpec::RandomForest(_) => ModelFamily::RandomForest,
            CandidateSpec::GradientBoosting(_) => ModelFamily::GradientBoosting,
        }
    }

    /// Fits this candidate. A constant target short-circuits to a constant
    /// model, which happens routinely inside small cross-validation folds.
    pub fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        task: Task,
        seed: u64,
    ) -> Result<FittedModel, FitError> {
        if y.is_empty() {
            return Err(FitError::TooFewRows {
                family: self.family(),
                found: 0,
                required: 1,
            });
        }
        if let Some(value) = constant_value(y) {
            return Ok(FittedModel::Constant { value });
        }

        let model = match self {
            CandidateSpec::ElasticNet(params) => {
                FittedModel::ElasticNet(fit_elastic_net(x, y, task, params)?)
            }
            CandidateSpec::Glm(params) => FittedModel::Glm(fit_glm(x, y, task, params)?),
            CandidateSpec::Gam(params) => FittedModel::Gam(GamModel::fit(x, y, task, params)?),
            CandidateSpec::RandomForest(params) => {
                FittedModel::RandomForest(RandomForest::fit(x, y, params, seed))
            }
            CandidateSpec::GradientBoosting(params) => {
                FittedModel::GradientBoosting(BoostedEnsemble::fit(x, y, task, params, seed))
            }
        };
        Ok(model)
    }
}

fn constant_value(y: ArrayView1<f64>) -> Option<f64> {
    let first = *y.first()?;
    y.iter().all(|&v| v == first).then_some(first)
}

/// Output of a fitted candidate. Predictions are probabilities for
/// classification and PMPM dollars for regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum FittedModel {
    ElasticNet(LinearModel),
    Glm(LinearModel),
    Gam(GamModel),
    RandomForest(RandomForest),
    GradientBoosting(BoostedEnsemble),
    Constant { value: f64 },
}

/// A model whose output is `bias + weight * sum(tree outputs)`.
pub struct TreeSum<'a> {
    pub trees: &'a [RegressionTree],
    pub weight: f64,
    pub bias: f64,
}

impl FittedModel {
    pub fn family(&self) -> ModelFamily {
        match self {
            FittedModel::ElasticNet(_) => ModelFamily::ElasticNet,
            FittedModel::Glm(_) => ModelFamily::Glm,
            FittedModel::Gam(_) => ModelFamily::Gam,
            FittedModel::RandomForest(_) => ModelFamily::RandomForest,
            FittedModel::GradientBoosting(_) => ModelFamily::GradientBoosting,
            FittedModel::Constant { .. } => ModelFamily::Constant,
        }
    }

    pub fn predict_row(&self, x: ArrayView1<f64>) -> f64 {
        match self {
            FittedModel::ElasticNet(m) | FittedModel::Glm(m) => m.predict_row(x),
            FittedModel::Gam(m) => m.predict_row(x),
            FittedModel::RandomForest(m) => m.predict_row(x),
            FittedModel::GradientBoosting(m) => m.predict_row(x),
            FittedModel::Constant { value } => *value,
        }
    }

    /// Row-parallel prediction.
    pub fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let values: Vec<f64> = x
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| self.predict_row(row))
            .collect();
        Array1::from(values)
    }

    /// Per-feature additive terms when the output is exactly
    /// `intercept + sum(terms)` on the response scale.
    pub fn additive_terms(&self, x: ArrayView1<f64>) -> Option<Array1<f64>> {
        match self {
            FittedModel::ElasticNet(m) | FittedModel::Glm(m)
                if m.link == LinkFunction::Identity =>
            {
                Some(m.terms(x))
            }
            FittedModel::Gam(m) if m.link() == LinkFunction::Identity => Some(m.terms(x)),
            _ => None,
        }
    }

    /// Tree view when the output is linear in the tree outputs.
    pub fn tree_sum(&self) -> Option<TreeSum<'_>> {
        match self {
            FittedModel::RandomForest(m) => Some(TreeSum {
                trees: m.trees(),
                weight: 1.0 / m.trees().len().max(1) as f64,
                bias: 0.0,
            }),
            FittedModel::GradientBoosting(m) if m.link() == LinkFunction::Identity => {
                Some(TreeSum {
                    trees: m.trees(),
                    weight: m.learning_rate(),
                    bias: m.init(),
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    #[test]
    fn constant_targets_short_circuit_every_family() {
        let x = Array2::from_shape_fn((6, 2), |(i, j)| (i * (j + 1)) as f64);
        let y = Array1::zeros(6);
        for spec in CandidateSpec::default_candidates() {
            let model = spec.fit(x.view(), y.view(), Task::Classification, 1).unwrap();
            assert_eq!(model, FittedModel::Constant { value: 0.0 });
            assert_eq!(model.predict_row(array![1.0, 2.0].view()), 0.0);
        }
    }

    #[test]
    fn candidate_list_round_trips_through_toml() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            candidates: Vec<CandidateSpec>,
        }
        let text = toml::to_string(&Wrapper {
            candidates: CandidateSpec::default_candidates(),
        })
        .unwrap();
        let parsed: Wrapper = toml::from_str(&text).unwrap();
        assert_eq!(parsed.candidates, CandidateSpec::default_candidates());

        let partial: Wrapper = toml::from_str(
            r#"
            [[candidates]]
            family = "random_forest"
            n_trees = 7
            "#,
        )
        .unwrap();
        match &partial.candidates[0] {
            CandidateSpec::RandomForest(p) => {
                assert_eq!(p.n_trees, 7);
                assert_eq!(p.max_depth, ForestParams::default().max_depth);
            }
            other => panic!("unexpected candidate {other:?}"),
        }
    }
}
