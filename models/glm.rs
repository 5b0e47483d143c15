use super::family::{FitError, ModelFamily, Task};
use super::linalg::solve_symmetric;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkFunction {
    Logit,
    Identity,
}

impl LinkFunction {
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Logit => 1.0 / (1.0 + (-eta.clamp(-700.0, 700.0)).exp()),
            LinkFunction::Identity => eta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlmParams {
    /// Ridge penalty on the standardized coefficients (intercept unpenalized).
    pub ridge: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for GlmParams {
    fn default() -> Self {
        Self {
            ridge: 1.0,
            max_iterations: 100,
            tolerance: 1e-8,
        }
    }
}

/// Intercept plus one coefficient per feature, on a logit or identity link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub link: LinkFunction,
    pub intercept: f64,
    pub coefficients: Array1<f64>,
}

impl LinearModel {
    pub fn predict_row(&self, x: ArrayView1<f64>) -> f64 {
        self.link.inverse(self.intercept + self.coefficients.dot(&x))
    }

    /// Per-feature terms of the linear predictor.
    pub fn terms(&self, x: ArrayView1<f64>) -> Array1<f64> {
        &self.coefficients * &x
    }
}

pub struct IrlsFit {
    pub beta: Array1<f64>,
    pub iterations: usize,
    pub deviance: f64,
}

pub fn update_glm_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
    link: LinkFunction,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    const MIN_WEIGHT: f64 = 1e-6;
    const PROB_EPS: f64 = 1e-8;

    match link {
        LinkFunction::Logit => {
            let eta_clamped = eta.mapv(|e| e.clamp(-700.0, 700.0));
            let mut mu = eta_clamped.mapv(|e| 1.0 / (1.0 + (-e).exp()));
            mu.mapv_inplace(|v| v.clamp(PROB_EPS, 1.0 - PROB_EPS));
            let weights = (&mu * (1.0 - &mu)).mapv(|v| v.max(MIN_WEIGHT));
            let z = &eta_clamped + &((&y - &mu) / &weights);
            (mu, weights, z)
        }
        LinkFunction::Identity => (eta.clone(), Array1::ones(y.len()), y.to_owned()),
    }
}

pub fn calculate_deviance(y: ArrayView1<f64>, mu: &Array1<f64>, link: LinkFunction) -> f64 {
    const EPS: f64 = 1e-8;
    match link {
        LinkFunction::Logit => {
            let total = Zip::from(y).and(mu).fold(0.0, |acc, &yi, &mui| {
                let mui = mui.clamp(EPS, 1.0 - EPS);
                let term1 = if yi > EPS { yi * (yi.ln() - mui.ln()) } else { 0.0 };
                let term2 = if yi < 1.0 - EPS {
                    (1.0 - yi) * ((1.0 - yi).ln() - (1.0 - mui).ln())
                } else {
                    0.0
                };
                acc + term1 + term2
            });
            2.0 * total
        }
        LinkFunction::Identity => Zip::from(y)
            .and(mu)
            .fold(0.0, |acc, &yi, &mui| acc + (yi - mui) * (yi - mui)),
    }
}

/// Penalized IRLS with step halving.
///
/// `design` must already contain the intercept column; `penalty` is the full
/// coefficient penalty (zero row/column for the intercept). Convergence uses
/// the relative change of the penalized deviance.
pub fn fit_penalized_irls(
    design: ArrayView2<f64>,
    y: ArrayView1<f64>,
    penalty: &Array2<f64>,
    link: LinkFunction,
    family: ModelFamily,
    max_iterations: usize,
    tolerance: f64,
) -> Result<IrlsFit, FitError> {
    let p = design.ncols();
    let mut beta = Array1::<f64>::zeros(p);
    if link == LinkFunction::Logit {
        let mean = y.mean().unwrap_or(0.5).clamp(1e-6, 1.0 - 1e-6);
        beta[0] = (mean / (1.0 - mean)).ln();
    }

    let penalized_deviance = |beta: &Array1<f64>| {
        let eta = design.dot(beta);
        let mu = eta.mapv(|e| link.inverse(e));
        calculate_deviance(y, &mu, link) + beta.dot(&penalty.dot(beta))
    };

    let mut current = penalized_deviance(&beta);
    let mut last_change = f64::INFINITY;
    for iteration in 1..=max_iterations {
        let eta = design.dot(&beta);
        let (_, weights, z) = update_glm_vectors(y, &eta, link);

        let weighted = &design * &weights.view().insert_axis(Axis(1));
        let mut lhs = weighted.t().dot(&design);
        lhs += penalty;
        let rhs = weighted.t().dot(&z);
        let proposal = solve_symmetric(&lhs, &rhs)?;

        let mut candidate = proposal;
        let mut candidate_dev = penalized_deviance(&candidate);
        let mut halvings = 0;
        while !(candidate_dev.is_finite() && candidate_dev <= current * (1.0 + 1e-10) + 1e-12)
            && halvings < 30
        {
            candidate = (&beta + &candidate) * 0.5;
            candidate_dev = penalized_deviance(&candidate);
            halvings += 1;
        }
        if !candidate_dev.is_finite() {
            return Err(FitError::NonFinite { family });
        }

        last_change = (current - candidate_dev).abs() / (0.1 + candidate_dev.abs());
        beta = candidate;
        current = candidate_dev;
        if last_change < tolerance || link == LinkFunction::Identity {
            log::debug!(
                "{family} IRLS converged after {iteration} iterations (penalized deviance {current:.6})"
            );
            return Ok(IrlsFit {
                beta,
                iterations: iteration,
                deviance: current,
            });
        }
    }

    Err(FitError::DidNotConverge {
        family,
        iterations: max_iterations,
        last_change,
    })
}

/// Prepends the intercept column.
pub fn with_intercept(x: ArrayView2<f64>) -> Array2<f64> {
    let mut design = Array2::ones((x.nrows(), x.ncols() + 1));
    design.slice_mut(s![.., 1..]).assign(&x);
    design
}

pub fn fit_glm(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    task: Task,
    params: &GlmParams,
) -> Result<LinearModel, FitError> {
    let design = with_intercept(x);
    let p = design.ncols();
    let mut penalty = Array2::<f64>::eye(p) * params.ridge;
    penalty[(0, 0)] = 0.0;

    let link = task.link();
    let fit = fit_penalized_irls(
        design.view(),
        y,
        &penalty,
        link,
        ModelFamily::Glm,
        params.max_iterations,
        params.tolerance,
    )?;
    Ok(LinearModel {
        link,
        intercept: fit.beta[0],
        coefficients: fit.beta.slice(s![1..]).to_owned(),
    })
}
