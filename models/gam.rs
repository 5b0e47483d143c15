//! Additive model: penalized B-spline smooths for continuous features and
//! ridge-penalized linear terms for indicator-like features, fitted by the
//! same penalized IRLS as the GLM.

use super::basis::SplineBasis;
use super::family::{FitError, ModelFamily, Task};
use super::glm::{LinkFunction, fit_penalized_irls, with_intercept};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GamParams {
    pub num_internal_knots: usize,
    pub degree: usize,
    pub penalty_order: usize,
    /// Smoothing parameter on each spline's difference penalty.
    pub smoothing: f64,
    /// Ridge penalty on linear terms.
    pub ridge: f64,
    /// Features with at least this many distinct training values get a smooth.
    pub min_distinct_for_smooth: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for GamParams {
    fn default() -> Self {
        Self {
            num_internal_knots: 4,
            degree: 3,
            penalty_order: 2,
            smoothing: 1.0,
            ridge: 1.0,
            min_distinct_for_smooth: 8,
            max_iterations: 100,
            tolerance: 1e-8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GamTerm {
    Linear {
        coefficient: f64,
    },
    Smooth {
        basis: SplineBasis,
        coefficients: Array1<f64>,
    },
}

impl GamTerm {
    fn evaluate(&self, x: f64) -> f64 {
        match self {
            GamTerm::Linear { coefficient } => coefficient * x,
            GamTerm::Smooth {
                basis,
                coefficients,
            } => basis.transform_value(x).dot(coefficients),
        }
    }
}

/// One term per feature, in feature order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamModel {
    link: LinkFunction,
    intercept: f64,
    terms: Vec<GamTerm>,
}

impl GamModel {
    pub fn fit(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        task: Task,
        params: &GamParams,
    ) -> Result<Self, FitError> {
        let (n, p) = x.dim();
        let mut blocks: Vec<Array2<f64>> = Vec::with_capacity(p);
        let mut smooths: Vec<Option<SplineBasis>> = Vec::with_capacity(p);
        let mut penalties: Vec<Array2<f64>> = Vec::with_capacity(p);

        for column in x.columns() {
            if distinct_values(column) >= params.min_distinct_for_smooth
                && n > params.num_internal_knots + params.degree + 1
            {
                let (basis, block) =
                    SplineBasis::fit(column, params.num_internal_knots, params.degree)?;
                let mut penalty = basis.penalty(params.penalty_order)? * params.smoothing;
                // Keeps the unpenalized null space (linear trend) well conditioned.
                penalty.diag_mut().mapv_inplace(|d| d + 1e-6);
                penalties.push(penalty);
                blocks.push(block);
                smooths.push(Some(basis));
            } else {
                penalties.push(Array2::from_elem((1, 1), params.ridge));
                blocks.push(column.to_owned().insert_axis(ndarray::Axis(1)));
                smooths.push(None);
            }
        }

        let width: usize = blocks.iter().map(|b| b.ncols()).sum();
        let mut raw = Array2::<f64>::zeros((n, width));
        let mut penalty = Array2::<f64>::zeros((width + 1, width + 1));
        let mut offset = 0;
        for (block, block_penalty) in blocks.iter().zip(&penalties) {
            let k = block.ncols();
            raw.slice_mut(s![.., offset..offset + k]).assign(block);
            penalty
                .slice_mut(s![1 + offset..1 + offset + k, 1 + offset..1 + offset + k])
                .assign(block_penalty);
            offset += k;
        }
        let design = with_intercept(raw.view());

        let link = task.link();
        let fit = fit_penalized_irls(
            design.view(),
            y,
            &penalty,
            link,
            ModelFamily::Gam,
            params.max_iterations,
            params.tolerance,
        )?;

        let mut terms = Vec::with_capacity(p);
        let mut offset = 1;
        for (smooth, block) in smooths.into_iter().zip(&blocks) {
            let k = block.ncols();
            let coefficients = fit.beta.slice(s![offset..offset + k]).to_owned();
            terms.push(match smooth {
                Some(basis) => GamTerm::Smooth {
                    basis,
                    coefficients,
                },
                None => GamTerm::Linear {
                    coefficient: coefficients[0],
                },
            });
            offset += k;
        }
        let smooth_count = terms
            .iter()
            .filter(|t| matches!(t, GamTerm::Smooth { .. }))
            .count();
        log::debug!(
            "gam fitted with {smooth_count} smooth and {} linear terms in {} IRLS iterations",
            p - smooth_count,
            fit.iterations
        );

        Ok(Self {
            link,
            intercept: fit.beta[0],
            terms,
        })
    }

    pub fn link(&self) -> LinkFunction {
        self.link
    }

    /// Per-feature contributions to the linear predictor.
    pub fn terms(&self, x: ArrayView1<f64>) -> Array1<f64> {
        self.terms
            .iter()
            .zip(x.iter())
            .map(|(term, &v)| term.evaluate(v))
            .collect()
    }

    pub fn predict_row(&self, x: ArrayView1<f64>) -> f64 {
        self.link.inverse(self.intercept + self.terms(x).sum())
    }
}

fn distinct_values(column: ArrayView1<f64>) -> usize {
    let mut values = column.to_vec();
    values.sort_unstable_by(f64::total_cmp);
    values.dedup();
    values.len()
}
