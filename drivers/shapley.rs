//! Per-member Shapley attribution of the combined PMPM prediction.
//!
//! The combined output `f = P * C` (utilization probability times floored
//! conditional cost) is split with the symmetric product rule
//!
//! ```text
//! phi_i = phiP_i * (C(x) + C_bar) / 2 + phiC_i * (P(x) + P_bar) / 2
//! ```
//!
//! where `phiP` and `phiC` attribute `P(x) - P_bar` and `C(x) - C_bar` against
//! the artifact's background rows. The identity
//! `P C - P_bar C_bar = (P - P_bar)(C + C_bar)/2 + (C - C_bar)(P + P_bar)/2`
//! makes the combination exact whenever the part attributions are.

use super::tree_shap::tree_sum_shap;
use crate::artifact::{ModelArtifact, PartModel};
use crate::models::cv::derive_seed;
use crate::models::family::FittedModel;
use crate::models::trainer::ModelPart;
use crate::predict::{StaleArtifactError, ensure_schema};
use crate::types::{FeatureVector, member_seed};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Permutations per member for sampled attribution, rounded up to an even
    /// number so every ordering is paired with its reverse.
    pub permutations: usize,
    /// Disabling sampling routes every non-exact part to the occlusion fallback.
    pub sampling: bool,
    /// Above this many features sampling is considered too expensive.
    pub max_sampled_features: usize,
    /// Relative tolerance on `sum(phi) + baseline = prediction`.
    pub efficiency_tolerance: f64,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            permutations: 32,
            sampling: true,
            max_sampled_features: 64,
            efficiency_tolerance: 1e-3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplainerKind {
    LinearExact,
    AdditiveExact,
    TreeExact,
    Constant,
    SampledPermutation,
    PermutationFallback,
}

impl ExplainerKind {
    pub fn is_exact(self) -> bool {
        matches!(
            self,
            ExplainerKind::LinearExact
                | ExplainerKind::AdditiveExact
                | ExplainerKind::TreeExact
                | ExplainerKind::Constant
        )
    }
}

/// Non-fatal: the attribution for this member is an occlusion approximation
/// rescaled to stay efficient, not a Shapley estimate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Member '{member_id}': {part} attribution fell back to permutation importance ({reason}).")]
pub struct AttributionFallbackWarning {
    pub member_id: String,
    pub part: ModelPart,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionMeta {
    pub utilization_method: ExplainerKind,
    pub cost_method: ExplainerKind,
    /// Set when any part used sampled permutations.
    pub seed: Option<u64>,
    pub permutations: Option<usize>,
    pub background_size: usize,
    pub artifact_version: u64,
    /// `sum(phi) + baseline - prediction`.
    pub efficiency_residual: f64,
    pub efficient: bool,
    pub fallback: Vec<AttributionFallbackWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContribution {
    pub feature: String,
    /// Unscaled feature value for this member.
    pub value: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub member_id: String,
    pub baseline: f64,
    pub prediction: f64,
    /// One entry per feature, in schema order.
    pub contributions: Vec<FeatureContribution>,
    pub meta: AttributionMeta,
}

impl AttributionRecord {
    pub fn contribution(&self, feature: &str) -> Option<f64> {
        self.contributions
            .iter()
            .find(|c| c.feature == feature)
            .map(|c| c.contribution)
    }

    pub fn total_contribution(&self) -> f64 {
        self.contributions.iter().map(|c| c.contribution).sum()
    }
}

/// Part-level work that does not depend on the member being explained.
struct PreparedPart {
    part: ModelPart,
    /// Exact explainer available when the zero floor does not bind.
    exact: Option<ExplainerKind>,
    /// Mean of each additive term over the background.
    term_means: Option<Array1<f64>>,
    /// Background mean of the (floored, for cost) part output.
    mean: f64,
    /// Some background row has a negative raw cost prediction.
    floor_binds: bool,
}

struct PartAttribution {
    phi: Array1<f64>,
    method: ExplainerKind,
    sampled: bool,
    fallback: Option<AttributionFallbackWarning>,
}

pub struct CostDriverDecomposer {
    artifact: Arc<ModelArtifact>,
    config: AttributionConfig,
    utilization: PreparedPart,
    cost: PreparedPart,
}

impl CostDriverDecomposer {
    pub fn new(artifact: Arc<ModelArtifact>, config: AttributionConfig) -> Self {
        let background = artifact.background.view();
        let utilization = prepare(ModelPart::Utilization, &artifact.utilization, background);
        let cost = prepare(ModelPart::Cost, &artifact.cost, background);
        log::debug!(
            "Attribution prepared against {} background rows (utilization {:?}, cost {:?}, cost floor binds: {})",
            background.nrows(),
            utilization.exact,
            cost.exact,
            cost.floor_binds
        );
        Self {
            artifact,
            config,
            utilization,
            cost,
        }
    }

    pub fn artifact(&self) -> &Arc<ModelArtifact> {
        &self.artifact
    }

    pub fn config(&self) -> &AttributionConfig {
        &self.config
    }

    /// `P_bar * C_bar`, the value every record's contributions start from.
    pub fn baseline(&self) -> f64 {
        self.utilization.mean * self.cost.mean
    }

    pub fn explain(&self, features: &FeatureVector) -> Result<AttributionRecord, StaleArtifactError> {
        ensure_schema(&self.artifact, features.schema())?;
        Ok(self.explain_unchecked(features))
    }

    /// Member-parallel; records come back in input order and each one depends
    /// only on its own member.
    pub fn explain_batch(
        &self,
        features: &[FeatureVector],
    ) -> Result<Vec<AttributionRecord>, StaleArtifactError> {
        for vector in features {
            ensure_schema(&self.artifact, vector.schema())?;
        }
        Ok(features
            .par_iter()
            .map(|v| self.explain_unchecked(v))
            .collect())
    }

    fn explain_unchecked(&self, features: &FeatureVector) -> AttributionRecord {
        let artifact = &self.artifact;
        let member_id = features.member_id();
        let x = artifact.scale_row(features.values().view());
        let seed = member_seed(artifact.seed, member_id);

        let probability = artifact.utilization.predict_row(x.view());
        let raw_cost = artifact.cost.predict_row(x.view());
        let cost = raw_cost.max(0.0);

        let p_attr = self.attribute_part(&self.utilization, x.view(), false, seed, member_id);
        let c_attr = self.attribute_part(&self.cost, x.view(), raw_cost < 0.0, seed, member_id);

        let p_bar = self.utilization.mean;
        let c_bar = self.cost.mean;
        let phi = &p_attr.phi * (0.5 * (cost + c_bar)) + &c_attr.phi * (0.5 * (probability + p_bar));

        let baseline = p_bar * c_bar;
        let prediction = probability * cost;
        let residual = phi.sum() + baseline - prediction;
        let scale = prediction.abs().max(baseline.abs()).max(1.0);
        let efficient = residual.abs() <= self.config.efficiency_tolerance * scale;
        if !efficient {
            log::warn!(
                "Attribution for member '{member_id}' misses efficiency by {residual:.3e} (prediction {prediction:.4})"
            );
        }

        let sampled = p_attr.sampled || c_attr.sampled;
        let fallback: Vec<AttributionFallbackWarning> =
            [p_attr.fallback, c_attr.fallback].into_iter().flatten().collect();

        let contributions = artifact
            .schema
            .names()
            .iter()
            .zip(features.values().iter())
            .zip(phi.iter())
            .map(|((name, &value), &contribution)| FeatureContribution {
                feature: name.clone(),
                value,
                contribution,
            })
            .collect();

        AttributionRecord {
            member_id: member_id.to_string(),
            baseline,
            prediction,
            contributions,
            meta: AttributionMeta {
                utilization_method: p_attr.method,
                cost_method: c_attr.method,
                seed: sampled.then_some(seed),
                permutations: sampled.then(|| self.permutation_count()),
                background_size: artifact.background.nrows(),
                artifact_version: artifact.version,
                efficiency_residual: residual,
                efficient,
                fallback,
            },
        }
    }

    fn permutation_count(&self) -> usize {
        let m = self.config.permutations.max(2);
        m + m % 2
    }

    fn attribute_part(
        &self,
        prepared: &PreparedPart,
        x: ArrayView1<f64>,
        floored_here: bool,
        member_seed: u64,
        member_id: &str,
    ) -> PartAttribution {
        let model = match prepared.part {
            ModelPart::Utilization => &self.artifact.utilization,
            ModelPart::Cost => &self.artifact.cost,
        };
        let background = self.artifact.background.view();
        let floor = prepared.part == ModelPart::Cost;

        let exact = prepared
            .exact
            .filter(|_| !(floor && (floored_here || prepared.floor_binds)));
        if let Some(method) = exact {
            let phi = match method {
                ExplainerKind::Constant => Array1::zeros(x.len()),
                ExplainerKind::LinearExact | ExplainerKind::AdditiveExact => {
                    let terms = model.model.additive_terms(x).unwrap_or_else(|| Array1::zeros(x.len()));
                    match &prepared.term_means {
                        Some(means) => terms - means,
                        None => terms,
                    }
                }
                _ => match model.model.tree_sum() {
                    Some(ensemble) => tree_sum_shap(&ensemble, x, background),
                    None => Array1::zeros(x.len()),
                },
            };
            return PartAttribution {
                phi,
                method,
                sampled: false,
                fallback: None,
            };
        }

        let f = |row: ArrayView1<f64>| {
            let v = model.predict_row(row);
            if floor { v.max(0.0) } else { v }
        };
        let p = x.len();
        if self.config.sampling && p <= self.config.max_sampled_features {
            let stream = match prepared.part {
                ModelPart::Utilization => 1,
                ModelPart::Cost => 2,
            };
            let phi = sampled_permutation_shap(
                &f,
                x,
                background,
                self.permutation_count(),
                derive_seed(member_seed, stream),
            );
            return PartAttribution {
                phi,
                method: ExplainerKind::SampledPermutation,
                sampled: true,
                fallback: None,
            };
        }

        let reason = if self.config.sampling {
            format!(
                "{p} features exceed the sampling limit of {}",
                self.config.max_sampled_features
            )
        } else {
            "sampled attribution is disabled".to_string()
        };
        let warning = AttributionFallbackWarning {
            member_id: member_id.to_string(),
            part: prepared.part,
            reason,
        };
        log::warn!("{warning}");
        PartAttribution {
            phi: occlusion_attribution(&f, x, background),
            method: ExplainerKind::PermutationFallback,
            sampled: false,
            fallback: Some(warning),
        }
    }
}

fn prepare(part: ModelPart, model: &PartModel, background: ArrayView2<f64>) -> PreparedPart {
    let floor = part == ModelPart::Cost;
    let raw: Vec<f64> = background
        .axis_iter(Axis(0))
        .map(|row| model.predict_row(row))
        .collect();
    let floor_binds = floor && raw.iter().any(|&v| v < 0.0);
    let mean = if raw.is_empty() {
        0.0
    } else {
        raw.iter().map(|&v| if floor { v.max(0.0) } else { v }).sum::<f64>() / raw.len() as f64
    };

    let (exact, term_means) = match &model.model {
        FittedModel::Constant { .. } => (Some(ExplainerKind::Constant), None),
        FittedModel::ElasticNet(_) | FittedModel::Glm(_) | FittedModel::Gam(_) => {
            let kind = if matches!(model.model, FittedModel::Gam(_)) {
                ExplainerKind::AdditiveExact
            } else {
                ExplainerKind::LinearExact
            };
            let terms: Option<Vec<Array1<f64>>> = background
                .axis_iter(Axis(0))
                .map(|row| model.model.additive_terms(row))
                .collect();
            match terms {
                Some(terms) if !terms.is_empty() => {
                    let mut sum = Array1::<f64>::zeros(background.ncols());
                    for t in &terms {
                        sum += t;
                    }
                    (Some(kind), Some(sum / terms.len() as f64))
                }
                _ => (None, None),
            }
        }
        FittedModel::RandomForest(_) | FittedModel::GradientBoosting(_) => {
            match model.model.tree_sum() {
                Some(_) => (Some(ExplainerKind::TreeExact), None),
                None => (None, None),
            }
        }
    };

    PreparedPart {
        part,
        exact,
        term_means,
        mean,
        floor_binds,
    }
}

/// Antithetic permutation sampling against every background row. For each
/// ordering and reference row the marginal contributions telescope to
/// `f(x) - f(z)`, so the averaged attribution is exactly efficient.
pub fn sampled_permutation_shap<F>(
    f: &F,
    x: ArrayView1<f64>,
    background: ArrayView2<f64>,
    permutations: usize,
    seed: u64,
) -> Array1<f64>
where
    F: Fn(ArrayView1<f64>) -> f64,
{
    let p = x.len();
    let mut phi = Array1::<f64>::zeros(p);
    if p == 0 || background.nrows() == 0 {
        return phi;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let pairs = permutations.div_ceil(2).max(1);
    let mut order: Vec<usize> = (0..p).collect();
    let mut samples = 0usize;

    for _ in 0..pairs {
        order.shuffle(&mut rng);
        for reversed in [false, true] {
            for z in background.axis_iter(Axis(0)) {
                let mut current = z.to_owned();
                let mut previous = f(current.view());
                let mut step = |j: usize| {
                    current[j] = x[j];
                    let value = f(current.view());
                    phi[j] += value - previous;
                    previous = value;
                };
                if reversed {
                    order.iter().rev().for_each(|&j| step(j));
                } else {
                    order.iter().for_each(|&j| step(j));
                }
                samples += 1;
            }
        }
    }
    phi / samples as f64
}

/// Occlusion deltas `f(x) - mean_b f(x with x_j := z_bj)`, rescaled so they
/// sum to `f(x) - mean_b f(z_b)`. Spread evenly when the deltas cancel out.
pub fn occlusion_attribution<F>(f: &F, x: ArrayView1<f64>, background: ArrayView2<f64>) -> Array1<f64>
where
    F: Fn(ArrayView1<f64>) -> f64,
{
    let p = x.len();
    let b = background.nrows();
    if p == 0 || b == 0 {
        return Array1::zeros(p);
    }
    let fx = f(x);
    let mean_bg = background.axis_iter(Axis(0)).map(|z| f(z)).sum::<f64>() / b as f64;
    let target = fx - mean_bg;

    let deltas: Array1<f64> = (0..p)
        .map(|j| {
            let mut probe = x.to_owned();
            let occluded = background
                .axis_iter(Axis(0))
                .map(|z| {
                    probe[j] = z[j];
                    f(probe.view())
                })
                .sum::<f64>()
                / b as f64;
            fx - occluded
        })
        .collect();

    let total = deltas.sum();
    if total.abs() > 1e-12 {
        deltas * (target / total)
    } else {
        Array1::from_elem(p, target / p as f64)
    }
}
