//! Goodness-of-fit measures shared by cross-validation and reporting.

use ndarray::ArrayView1;

/// `1 - SS_res / SS_tot`. A constant target has no variance to explain, so the
/// score is 1.0 for an exact fit and 0.0 otherwise.
pub fn r_squared(observed: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    let Some(mean) = observed.mean() else {
        return 0.0;
    };
    let (ss_res, ss_tot) = observed
        .iter()
        .zip(predicted.iter())
        .fold((0.0, 0.0), |(res, tot), (&o, &p)| {
            (res + (o - p).powi(2), tot + (o - mean).powi(2))
        });
    if ss_tot <= f64::EPSILON {
        return if ss_res <= f64::EPSILON { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

pub fn rmse(observed: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    if observed.is_empty() {
        return 0.0;
    }
    let sse: f64 = observed
        .iter()
        .zip(predicted.iter())
        .map(|(&o, &p)| (o - p).powi(2))
        .sum();
    (sse / observed.len() as f64).sqrt()
}

/// Pearson correlation; `None` when either side has zero variance.
pub fn pearson(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Option<f64> {
    let n = a.len();
    if n < 2 || n != b.len() {
        return None;
    }
    let mean_a = a.mean()?;
    let mean_b = b.mean()?;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let da = x - mean_a;
        let db = y - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 1e-12 * n as f64 || var_b <= 1e-12 * n as f64 {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}
