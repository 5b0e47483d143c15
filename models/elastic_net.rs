use super::family::{FitError, ModelFamily, Task};
use super::glm::{LinearModel, LinkFunction, calculate_deviance};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticNetParams {
    /// Overall penalty strength, relative to a unit-variance target.
    pub lambda: f64,
    /// Mix between lasso (1.0) and ridge (0.0).
    pub l1_ratio: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for ElasticNetParams {
    fn default() -> Self {
        Self {
            lambda: 0.01,
            l1_ratio: 0.5,
            max_iterations: 1000,
            tolerance: 1e-7,
        }
    }
}

const MAX_OUTER_ITERATIONS: usize = 50;

pub fn fit_elastic_net(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    task: Task,
    params: &ElasticNetParams,
) -> Result<LinearModel, FitError> {
    let n = x.nrows();
    if n < 2 {
        return Err(FitError::TooFewRows {
            family: ModelFamily::ElasticNet,
            found: n,
            required: 2,
        });
    }
    match task {
        Task::Regression => fit_gaussian(x, y, params),
        Task::Classification => fit_logistic(x, y, params),
    }
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

/// Weighted coordinate descent with an unpenalized intercept.
///
/// Minimizes `(1/2n) sum w_i (r_i)^2 + lambda * (a |b|_1 + (1-a)/2 |b|^2)`
/// where `r = z - intercept - Xb`. A sweep converges when no coordinate,
/// intercept included, moves the fit by more than `tolerance` in weighted
/// squared terms (`max_j x_j'Wx_j / n * delta_j^2`, glmnet's rule).
/// Returns `(intercept, beta, sweeps)`.
fn coordinate_descent(
    x: ArrayView2<f64>,
    z: &Array1<f64>,
    weights: &Array1<f64>,
    start: (f64, Array1<f64>),
    params: &ElasticNetParams,
) -> Result<(f64, Array1<f64>, usize), FitError> {
    let n = x.nrows() as f64;
    let p = x.ncols();
    let l1 = params.lambda * params.l1_ratio;
    let l2 = params.lambda * (1.0 - params.l1_ratio);

    let weight_sum = weights.sum();
    let column_scale: Array1<f64> = x
        .axis_iter(Axis(1))
        .map(|col| (&col * &col * weights).sum() / n)
        .collect();

    let (mut intercept, mut beta) = start;
    let mut residual = z - &x.dot(&beta) - intercept;

    let intercept_scale = weight_sum / n;
    let mut last_change = f64::INFINITY;
    for sweep in 1..=params.max_iterations {
        let shift = (weights * &residual).sum() / weight_sum;
        intercept += shift;
        residual -= shift;
        let mut max_change = intercept_scale * shift * shift;

        for j in 0..p {
            if column_scale[j] <= 1e-12 {
                continue;
            }
            let col = x.column(j);
            let old = beta[j];
            let rho = (&col * weights * &residual).sum() / n + column_scale[j] * old;
            let updated = soft_threshold(rho, l1) / (column_scale[j] + l2);
            let delta = updated - old;
            if delta != 0.0 {
                residual.scaled_add(-delta, &col);
                beta[j] = updated;
                max_change = max_change.max(column_scale[j] * delta * delta);
            }
        }

        if !max_change.is_finite() {
            return Err(FitError::NonFinite {
                family: ModelFamily::ElasticNet,
            });
        }
        last_change = max_change;
        if max_change < params.tolerance {
            return Ok((intercept, beta, sweep));
        }
    }

    Err(FitError::DidNotConverge {
        family: ModelFamily::ElasticNet,
        iterations: params.max_iterations,
        last_change,
    })
}

fn fit_gaussian(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    params: &ElasticNetParams,
) -> Result<LinearModel, FitError> {
    // Penalties are calibrated for a unit-variance response.
    let mean = y.mean().unwrap_or(0.0);
    let sd = y.std(0.0);
    let scale = if sd > 0.0 { sd } else { 1.0 };
    let z = y.mapv(|v| (v - mean) / scale);
    let weights = Array1::ones(x.nrows());

    let start = (0.0, Array1::zeros(x.ncols()));
    let (intercept, beta, sweeps) = coordinate_descent(x, &z, &weights, start, params)?;
    log::debug!("elastic_net (gaussian) converged after {sweeps} sweeps");

    Ok(LinearModel {
        link: LinkFunction::Identity,
        intercept: mean + scale * intercept,
        coefficients: beta * scale,
    })
}

/// glmnet-style proximal Newton: quadratic approximation of the log-likelihood
/// around the current fit, solved by weighted coordinate descent.
fn fit_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    params: &ElasticNetParams,
) -> Result<LinearModel, FitError> {
    let mean = y.mean().unwrap_or(0.5).clamp(1e-6, 1.0 - 1e-6);
    let mut intercept = (mean / (1.0 - mean)).ln();
    let mut beta = Array1::<f64>::zeros(x.ncols());

    let mut objective = penalized_log_loss(x, y, intercept, &beta, params);
    let mut last_change = f64::INFINITY;
    for outer in 1..=MAX_OUTER_ITERATIONS {
        let eta = x.dot(&beta) + intercept;
        let mu = eta.mapv(|e| LinkFunction::Logit.inverse(e).clamp(1e-8, 1.0 - 1e-8));
        let weights = mu.mapv(|m| (m * (1.0 - m)).max(1e-5));
        let z = &eta + &((&y - &mu) / &weights);

        let (next_intercept, next_beta, sweeps) =
            coordinate_descent(x, &z, &weights, (intercept, beta.clone()), params)?;
        intercept = next_intercept;
        beta = next_beta;

        let next_objective = penalized_log_loss(x, y, intercept, &beta, params);
        if !next_objective.is_finite() {
            return Err(FitError::NonFinite {
                family: ModelFamily::ElasticNet,
            });
        }
        last_change = (objective - next_objective).abs() / (next_objective.abs() + 0.1);
        objective = next_objective;

        // A single sweep means the warm start already solved this quadratic.
        if sweeps == 1 || last_change < params.tolerance {
            log::debug!("elastic_net (logistic) converged after {outer} Newton steps");
            return Ok(LinearModel {
                link: LinkFunction::Logit,
                intercept,
                coefficients: beta,
            });
        }
    }

    Err(FitError::DidNotConverge {
        family: ModelFamily::ElasticNet,
        iterations: MAX_OUTER_ITERATIONS,
        last_change,
    })
}

/// Mean binomial log-loss plus the elastic-net penalty.
fn penalized_log_loss(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    intercept: f64,
    beta: &Array1<f64>,
    params: &ElasticNetParams,
) -> f64 {
    let mu = (x.dot(beta) + intercept).mapv(|e| LinkFunction::Logit.inverse(e));
    let loss = calculate_deviance(y, &mu, LinkFunction::Logit) / (2.0 * x.nrows() as f64);
    let l1 = beta.iter().map(|b| b.abs()).sum::<f64>();
    let l2 = beta.dot(beta);
    loss + params.lambda * (params.l1_ratio * l1 + 0.5 * (1.0 - params.l1_ratio) * l2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn design(n: usize, p: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, p), |_| rng.gen_range(-1.5..1.5))
    }

    #[test]
    fn gaussian_fit_tracks_ols_for_tiny_penalty() {
        let x = design(300, 3, 3);
        let y = x.map_axis(Axis(1), |r| 100.0 + 40.0 * r[0] - 25.0 * r[1]);
        let params = ElasticNetParams {
            lambda: 1e-6,
            ..ElasticNetParams::default()
        };
        let model = fit_elastic_net(x.view(), y.view(), Task::Regression, &params).unwrap();
        assert_abs_diff_eq!(model.coefficients[0], 40.0, epsilon = 0.05);
        assert_abs_diff_eq!(model.coefficients[1], -25.0, epsilon = 0.05);
        assert_abs_diff_eq!(model.coefficients[2], 0.0, epsilon = 0.05);
        let pred = model.predict_row(array![0.0, 0.0, 0.0].view());
        assert_abs_diff_eq!(pred, 100.0, epsilon = 0.1);
    }

    #[test]
    fn strong_lasso_zeroes_irrelevant_coefficients() {
        let x = design(300, 4, 5);
        let y = x.map_axis(Axis(1), |r| 5.0 * r[0]);
        let params = ElasticNetParams {
            lambda: 0.2,
            l1_ratio: 1.0,
            ..ElasticNetParams::default()
        };
        let model = fit_elastic_net(x.view(), y.view(), Task::Regression, &params).unwrap();
        assert!(model.coefficients[0] > 1.0);
        for j in 1..4 {
            assert_eq!(model.coefficients[j], 0.0);
        }
    }

    #[test]
    fn logistic_fit_separates_classes() {
        let x = design(400, 2, 9);
        let mut rng = StdRng::seed_from_u64(10);
        let y = x.map_axis(Axis(1), |r| {
            let p = LinkFunction::Logit.inverse(2.0 * r[0]);
            if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 }
        });
        let model =
            fit_elastic_net(x.view(), y.view(), Task::Classification, &ElasticNetParams::default())
                .unwrap();
        assert_eq!(model.link, LinkFunction::Logit);
        assert!(model.coefficients[0] > 1.0);
        assert!(model.coefficients[1].abs() < 0.5);
    }

    /// Standardized claims-like design: condition flags, their count (an
    /// exact linear combination), age, and a weighted score of the flags.
    fn claims_design(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let prevalence = [0.3, 0.4, 0.15, 0.1, 0.05];
        let mut x = Array2::<f64>::zeros((n, 8));
        let mut cost = Array1::<f64>::zeros(n);
        let mut utilized = Array1::<f64>::zeros(n);
        for i in 0..n {
            let flags: Vec<f64> = prevalence
                .iter()
                .map(|&p| if rng.gen_bool(p) { 1.0 } else { 0.0 })
                .collect();
            let age = rng.gen_range(20.0f64..85.0);
            for (j, flag) in flags.iter().enumerate() {
                x[[i, j]] = *flag;
            }
            x[[i, 5]] = flags.iter().sum();
            x[[i, 6]] = age;
            x[[i, 7]] = 0.6 * flags[0] + 0.4 * flags[1] + 1.1 * flags[4] + rng.gen_range(0.0f64..0.05);
            cost[i] = 3000.0 + 6000.0 * flags[0] + 4000.0 * flags[1] + 30.0 * age
                + rng.gen_range(-800.0f64..800.0);
            let p = LinkFunction::Logit.inverse(-0.5 + 1.4 * flags[0] + 0.02 * (age - 50.0));
            utilized[i] = if rng.gen_range(0.0f64..1.0) < p { 1.0 } else { 0.0 };
        }
        let mean = x.mean_axis(Axis(0)).unwrap();
        let sd = x.std_axis(Axis(0), 0.0).mapv(|s| if s > 0.0 { s } else { 1.0 });
        ((x - &mean) / &sd, cost, utilized)
    }

    #[test]
    fn default_params_converge_on_collinear_claims_design() {
        for seed in 1..=5 {
            let (x, cost, utilized) = claims_design(120, seed);
            let params = ElasticNetParams::default();

            let cost_model = fit_elastic_net(x.view(), cost.view(), Task::Regression, &params)
                .unwrap_or_else(|e| panic!("seed {seed}: cost fit failed: {e}"));
            assert!(cost_model.coefficients.iter().all(|b| b.is_finite()));
            assert!(cost_model.coefficients[6] > 0.0, "age effect should be positive");

            let util_model =
                fit_elastic_net(x.view(), utilized.view(), Task::Classification, &params)
                    .unwrap_or_else(|e| panic!("seed {seed}: utilization fit failed: {e}"));
            assert!(util_model.coefficients.iter().all(|b| b.is_finite()));
        }
    }

    #[test]
    fn one_sweep_budget_reports_non_convergence() {
        let (x, cost, _) = claims_design(120, 7);
        let params = ElasticNetParams {
            max_iterations: 1,
            ..ElasticNetParams::default()
        };
        let err = fit_elastic_net(x.view(), cost.view(), Task::Regression, &params).unwrap_err();
        assert!(matches!(err, FitError::DidNotConverge { iterations: 1, .. }));
    }

    #[test]
    fn soft_threshold_shrinks_toward_zero() {
        assert_eq!(soft_threshold(3.0, 1.0), 2.0);
        assert_eq!(soft_threshold(-3.0, 1.0), -2.0);
        assert_eq!(soft_threshold(0.5, 1.0), 0.0);
    }
}
