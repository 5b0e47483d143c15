use ndarray::{Array, Array1, Array2, ArrayView1, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline degree must be at least 1, but was {0}.")]
    InvalidDegree(usize),

    #[error("Data range is invalid: start ({0}) must be strictly less than end ({1}).")]
    InvalidRange(f64, f64),

    #[error("Cannot compute {num_quantiles} quantiles from only {num_points} data points.")]
    InsufficientDataForQuantiles {
        num_quantiles: usize,
        num_points: usize,
    },

    #[error(
        "Penalty order ({order}) must be positive and less than the number of basis functions ({num_basis})."
    )]
    InvalidPenaltyOrder { order: usize, num_basis: usize },
}

/// A fitted smooth for one feature: the knot vector plus the sum-to-zero
/// reparameterization learned from the training column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplineBasis {
    knots: Array1<f64>,
    degree: usize,
    range: (f64, f64),
    /// Maps constrained coefficients back to the raw B-spline coefficients.
    constraint: Array2<f64>,
}

impl SplineBasis {
    /// Builds a cubic-style basis with knots at the training quantiles.
    pub fn fit(
        column: ArrayView1<f64>,
        num_internal_knots: usize,
        degree: usize,
    ) -> Result<(Self, Array2<f64>), BasisError> {
        if degree < 1 {
            return Err(BasisError::InvalidDegree(degree));
        }
        let (min, max) = column
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if !(min < max) {
            return Err(BasisError::InvalidRange(min, max));
        }
        let knots = internal::generate_full_knot_vector((min, max), num_internal_knots, degree, column)?;
        let raw = internal::evaluate_matrix(column, degree, knots.view(), (min, max));
        let constraint = internal::sum_to_zero_transform(&raw);
        let constrained = raw.dot(&constraint);
        Ok((
            Self {
                knots,
                degree,
                range: (min, max),
                constraint,
            },
            constrained,
        ))
    }

    /// Number of constrained columns this smooth contributes to a design matrix.
    pub fn num_columns(&self) -> usize {
        self.constraint.ncols()
    }

    /// Constrained basis rows for new data; values outside the training range
    /// are clamped to it.
    pub fn transform(&self, column: ArrayView1<f64>) -> Array2<f64> {
        internal::evaluate_matrix(column, self.degree, self.knots.view(), self.range)
            .dot(&self.constraint)
    }

    /// Constrained basis row for a single value.
    pub fn transform_value(&self, x: f64) -> Array1<f64> {
        let raw = internal::evaluate_splines_at_point(
            x.clamp(self.range.0, self.range.1),
            self.degree,
            self.knots.view(),
        );
        raw.dot(&self.constraint)
    }

    /// Difference penalty expressed on the constrained coefficients.
    pub fn penalty(&self, order: usize) -> Result<Array2<f64>, BasisError> {
        let raw = create_difference_penalty_matrix(self.constraint.nrows(), order)?;
        Ok(self.constraint.t().dot(&raw).dot(&self.constraint))
    }
}

/// Creates the P-spline penalty `S = D'D` for `order`-th differences of
/// adjacent coefficients.
pub fn create_difference_penalty_matrix(
    num_basis_functions: usize,
    order: usize,
) -> Result<Array2<f64>, BasisError> {
    if order == 0 || order >= num_basis_functions {
        return Err(BasisError::InvalidPenaltyOrder {
            order,
            num_basis: num_basis_functions,
        });
    }

    let mut d = Array2::<f64>::eye(num_basis_functions);
    for _ in 0..order {
        d = &d.slice(s![1.., ..]) - &d.slice(s![..-1, ..]);
    }
    Ok(d.t().dot(&d))
}

mod internal {
    use super::*;

    pub(super) fn generate_full_knot_vector(
        data_range: (f64, f64),
        num_internal_knots: usize,
        degree: usize,
        training_data: ArrayView1<f64>,
    ) -> Result<Array1<f64>, BasisError> {
        let (min_val, max_val) = data_range;
        if training_data.len() < num_internal_knots {
            return Err(BasisError::InsufficientDataForQuantiles {
                num_quantiles: num_internal_knots,
                num_points: training_data.len(),
            });
        }

        let mut internal_knots = quantiles(training_data, num_internal_knots);
        // Quantiles of heavily tied data can coincide with a boundary; those
        // collapse a basis function and are replaced by uniform spacing.
        let degenerate = internal_knots
            .iter()
            .any(|&k| k <= min_val || k >= max_val)
            || internal_knots.windows(2).into_iter().any(|w| w[1] <= w[0]);
        if degenerate {
            let h = (max_val - min_val) / (num_internal_knots as f64 + 1.0);
            internal_knots =
                Array::from_iter((1..=num_internal_knots).map(|i| min_val + i as f64 * h));
        }

        let mut knots = Vec::with_capacity(num_internal_knots + 2 * (degree + 1));
        knots.extend(std::iter::repeat_n(min_val, degree + 1));
        knots.extend(internal_knots.iter().copied());
        knots.extend(std::iter::repeat_n(max_val, degree + 1));
        Ok(Array1::from(knots))
    }

    /// Type-7 quantiles at the interior points `k / (m + 1)`.
    fn quantiles(data: ArrayView1<f64>, num_quantiles: usize) -> Array1<f64> {
        if num_quantiles == 0 {
            return Array1::from_vec(vec![]);
        }
        let mut sorted = data.to_vec();
        sorted.sort_unstable_by(f64::total_cmp);
        let n = sorted.len();
        (1..=num_quantiles)
            .map(|k| {
                let p = k as f64 / (num_quantiles as f64 + 1.0);
                let float_idx = (n as f64 - 1.0) * p;
                let lower = float_idx.floor() as usize;
                let upper = float_idx.ceil() as usize;
                let fraction = float_idx - lower as f64;
                sorted[lower] * (1.0 - fraction) + sorted[upper] * fraction
            })
            .collect()
    }

    pub(super) fn evaluate_matrix(
        column: ArrayView1<f64>,
        degree: usize,
        knots: ArrayView1<f64>,
        range: (f64, f64),
    ) -> Array2<f64> {
        let num_basis = knots.len() - degree - 1;
        let mut basis = Array2::zeros((column.len(), num_basis));
        for (mut row, &x) in basis.axis_iter_mut(Axis(0)).zip(column.iter()) {
            row.assign(&evaluate_splines_at_point(
                x.clamp(range.0, range.1),
                degree,
                knots,
            ));
        }
        basis
    }

    /// Evaluates every B-spline basis function at `x` with the Cox-de Boor
    /// triangle. Rows sum to one inside the knot range.
    pub(super) fn evaluate_splines_at_point(
        x: f64,
        degree: usize,
        knots: ArrayView1<f64>,
    ) -> Array1<f64> {
        let num_basis = knots.len() - degree - 1;

        // Span index `mu` with knots[mu] <= x < knots[mu + 1]; the right
        // boundary belongs to the last non-empty span.
        let mu = knots
            .iter()
            .rposition(|&k| k <= x)
            .unwrap_or(degree)
            .clamp(degree, num_basis - 1);

        let mut left = vec![0.0; degree + 1];
        let mut right = vec![0.0; degree + 1];
        let mut n = vec![0.0; degree + 1];
        n[0] = 1.0;
        for j in 1..=degree {
            left[j] = x - knots[mu + 1 - j];
            right[j] = knots[mu + j] - x;
            let mut saved = 0.0;
            for r in 0..j {
                let denom = right[r + 1] + left[j - r];
                let temp = if denom.abs() > 1e-12 { n[r] / denom } else { 0.0 };
                n[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            n[j] = saved;
        }

        let mut values = Array1::zeros(num_basis);
        for (i, v) in n.into_iter().enumerate() {
            values[mu - degree + i] = v;
        }
        values
    }

    /// Null-space basis of `c = B'1` from one Householder reflection, so that
    /// every constrained column sums to zero over the training rows.
    pub(super) fn sum_to_zero_transform(basis: &Array2<f64>) -> Array2<f64> {
        let c = basis.sum_axis(Axis(0));
        let k = c.len();
        let norm = c.dot(&c).sqrt();
        let mut v = c.clone();
        let sign = if c[0] >= 0.0 { 1.0 } else { -1.0 };
        v[0] += sign * norm;
        let vtv = v.dot(&v);

        let mut h = Array2::<f64>::eye(k);
        if vtv > 0.0 {
            for i in 0..k {
                for j in 0..k {
                    h[(i, j)] -= 2.0 * v[i] * v[j] / vtv;
                }
            }
        }
        h.slice(s![.., 1..]).to_owned()
    }
}
