use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Per-feature transform recorded at training time and replayed at
/// prediction time: clamp to the training range, then centre and scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaling {
    min: Array1<f64>,
    max: Array1<f64>,
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl FeatureScaling {
    pub fn fit(x: ArrayView2<f64>) -> Self {
        let p = x.ncols();
        let mut min = Array1::from_elem(p, 0.0);
        let mut max = Array1::from_elem(p, 0.0);
        let mut mean = Array1::from_elem(p, 0.0);
        let mut scale = Array1::from_elem(p, 1.0);
        for (j, column) in x.axis_iter(Axis(1)).enumerate() {
            if column.is_empty() {
                continue;
            }
            min[j] = column.fold(f64::INFINITY, |a, &b| a.min(b));
            max[j] = column.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            mean[j] = column.mean().unwrap_or(0.0);
            let sd = column.std(0.0);
            // constant columns stay centred at zero
            scale[j] = if sd > 1e-12 { sd } else { 1.0 };
        }
        Self {
            min,
            max,
            mean,
            scale,
        }
    }

    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn transform_row(&self, row: ArrayView1<f64>) -> Array1<f64> {
        let mut out = row.to_owned();
        Zip::from(&mut out)
            .and(&self.min)
            .and(&self.max)
            .and(&self.mean)
            .and(&self.scale)
            .for_each(|v, &lo, &hi, &m, &s| *v = ((*v).clamp(lo, hi) - m) / s);
        out
    }

    pub fn transform_matrix(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut out = x.to_owned();
        for mut row in out.axis_iter_mut(Axis(0)) {
            let scaled = self.transform_row(row.view());
            row.assign(&scaled);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn standardizes_training_columns() {
        let x = array![[1.0, 5.0], [3.0, 5.0], [5.0, 5.0]];
        let scaling = FeatureScaling::fit(x.view());
        let z = scaling.transform_matrix(x.view());
        assert_abs_diff_eq!(z.column(0).mean().unwrap(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(z.column(0).std(0.0), 1.0, epsilon = 1e-12);
        assert!(z.column(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let x = array![[0.0], [10.0]];
        let scaling = FeatureScaling::fit(x.view());
        let inside = scaling.transform_row(array![10.0].view());
        let outside = scaling.transform_row(array![1000.0].view());
        assert_eq!(inside, outside);
    }
}
