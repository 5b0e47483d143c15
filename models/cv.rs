//! Seeded k-fold cross-validation with pooled out-of-fold scoring.

use super::family::{CandidateSpec, FitError, Task};
use super::metrics::{r_squared, rmse};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// SplitMix64 step over `base` and `stream`, used to give every candidate,
/// tree and stage its own reproducible random stream.
pub fn derive_seed(base: u64, stream: u64) -> u64 {
    let mut z = base
        .wrapping_add(stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Fold label for each row. Rows are shuffled with `seed` and dealt
/// round-robin, so every fold is non-empty whenever `k <= n`.
pub fn fold_assignment(n: usize, k: usize, seed: u64) -> Vec<usize> {
    let k = k.clamp(1, n.max(1));
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let mut folds = vec![0; n];
    for (position, &row) in order.iter().enumerate() {
        folds[row] = position % k;
    }
    folds
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CvScore {
    pub r2: f64,
    pub rmse: f64,
    pub folds: usize,
}

fn select_rows(x: ArrayView2<f64>, rows: &[usize]) -> Array2<f64> {
    x.select(Axis(0), rows)
}

fn select_values(y: ArrayView1<f64>, rows: &[usize]) -> Array1<f64> {
    rows.iter().map(|&r| y[r]).collect()
}

/// Fits `spec` on each training split and scores the pooled out-of-fold
/// predictions. With a single fold the candidate is scored in-sample.
pub fn cross_validate_score(
    spec: &CandidateSpec,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    task: Task,
    k_folds: usize,
    seed: u64,
) -> Result<CvScore, FitError> {
    let n = x.nrows();
    let folds = fold_assignment(n, k_folds, seed);
    let k = folds.iter().copied().max().map_or(0, |m| m + 1);
    let mut out_of_fold = Array1::<f64>::zeros(n);

    if k <= 1 {
        let model = spec.fit(x, y, task, derive_seed(seed, 0))?;
        out_of_fold.assign(&model.predict(x));
    } else {
        for fold in 0..k {
            let (held, train): (Vec<usize>, Vec<usize>) =
                (0..n).partition(|&r| folds[r] == fold);
            let model = spec.fit(
                select_rows(x, &train).view(),
                select_values(y, &train).view(),
                task,
                derive_seed(seed, fold as u64),
            )?;
            let predictions = model.predict(select_rows(x, &held).view());
            for (&row, &value) in held.iter().zip(predictions.iter()) {
                out_of_fold[row] = value;
            }
        }
    }

    if out_of_fold.iter().any(|v| !v.is_finite()) {
        return Err(FitError::NonFinite {
            family: spec.family(),
        });
    }
    Ok(CvScore {
        r2: r_squared(y, out_of_fold.view()),
        rmse: rmse(y, out_of_fold.view()),
        folds: k.max(1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::glm::GlmParams;
    use std::collections::BTreeSet;

    #[test]
    fn folds_cover_every_row_and_are_seeded() {
        let folds = fold_assignment(23, 5, 11);
        assert_eq!(folds.len(), 23);
        let labels: BTreeSet<usize> = folds.iter().copied().collect();
        assert_eq!(labels, (0..5).collect());
        for fold in 0..5 {
            let size = folds.iter().filter(|&&f| f == fold).count();
            assert!(size == 4 || size == 5);
        }
        assert_eq!(folds, fold_assignment(23, 5, 11));
        assert_ne!(folds, fold_assignment(23, 5, 12));
    }

    #[test]
    fn more_folds_than_rows_is_leave_one_out() {
        let folds = fold_assignment(3, 10, 0);
        let labels: BTreeSet<usize> = folds.iter().copied().collect();
        assert_eq!(labels.len(), 3);
    }

    #[test]
    fn derived_seeds_differ_per_stream() {
        assert_ne!(derive_seed(42, 0), derive_seed(42, 1));
        assert_ne!(derive_seed(42, 0), derive_seed(43, 0));
        assert_eq!(derive_seed(42, 7), derive_seed(42, 7));
    }

    #[test]
    fn linear_signal_scores_well_out_of_fold() {
        let x = Array2::from_shape_fn((60, 2), |(i, j)| ((i * (j + 5)) % 13) as f64);
        let y = x.map_axis(Axis(1), |r| 50.0 + 10.0 * r[0] - 3.0 * r[1]);
        let spec = CandidateSpec::Glm(GlmParams {
            ridge: 1e-6,
            ..GlmParams::default()
        });
        let score = cross_validate_score(&spec, x.view(), y.view(), Task::Regression, 5, 3).unwrap();
        assert_eq!(score.folds, 5);
        assert!(score.r2 > 0.999, "r2 = {}", score.r2);
        assert!(score.rmse < 0.5);
    }
}
