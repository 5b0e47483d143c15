use super::cv::derive_seed;
use super::family::Task;
use super::glm::LinkFunction;
use super::tree::{RegressionTree, TreeParams};
use ahash::AHashMap;
use ndarray::{ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostingParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Row fraction drawn without replacement for each stage.
    pub subsample: f64,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.1,
            max_depth: 3,
            min_samples_leaf: 5,
            subsample: 0.8,
        }
    }
}

/// Stagewise additive trees on the link scale:
/// `link^-1(init + learning_rate * sum(trees))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedEnsemble {
    link: LinkFunction,
    init: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
}

impl BoostedEnsemble {
    pub fn fit(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        task: Task,
        params: &BoostingParams,
        seed: u64,
    ) -> Self {
        let n = x.nrows();
        let link = task.link();
        let mean = y.mean().unwrap_or(0.0);
        let init = match link {
            LinkFunction::Identity => mean,
            LinkFunction::Logit => {
                let p = mean.clamp(1e-6, 1.0 - 1e-6);
                (p / (1.0 - p)).ln()
            }
        };
        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_leaf: params.min_samples_leaf,
            max_features: None,
        };
        let stage_rows = ((n as f64 * params.subsample).round() as usize).clamp(1, n.max(1));

        let mut eta = vec![init; n];
        let mut trees = Vec::with_capacity(params.n_estimators);
        for stage in 0..params.n_estimators {
            let mut rng = StdRng::seed_from_u64(derive_seed(seed, stage as u64));
            let rows = if stage_rows < n {
                let mut rows = index::sample(&mut rng, n, stage_rows).into_vec();
                rows.sort_unstable();
                rows
            } else {
                (0..n).collect()
            };

            let residuals: Vec<f64> = eta
                .iter()
                .zip(y.iter())
                .map(|(&e, &target)| target - link.inverse(e))
                .collect();
            let mut tree = RegressionTree::fit(x, &residuals, rows.clone(), tree_params, &mut rng);
            if link == LinkFunction::Logit {
                newton_leaf_values(&mut tree, x, &residuals, &eta, &rows);
            }

            for (e, row) in eta.iter_mut().zip(x.axis_iter(Axis(0))) {
                *e += params.learning_rate * tree.predict_row(row);
            }
            trees.push(tree);
        }

        log::debug!(
            "gradient boosting fitted {} stages (link {:?}, init {init:.4})",
            trees.len(),
            link
        );
        Self {
            link,
            init,
            learning_rate: params.learning_rate,
            trees,
        }
    }

    pub fn link(&self) -> LinkFunction {
        self.link
    }

    pub fn init(&self) -> f64 {
        self.init
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    pub fn predict_row(&self, x: ArrayView1<f64>) -> f64 {
        let raw: f64 = self.trees.iter().map(|t| t.predict_row(x)).sum();
        self.link.inverse(self.init + self.learning_rate * raw)
    }
}

/// Replaces each leaf's mean residual with a one-step Newton update of the
/// binomial deviance, `sum(r) / sum(p (1 - p))`.
fn newton_leaf_values(
    tree: &mut RegressionTree,
    x: ArrayView2<f64>,
    residuals: &[f64],
    eta: &[f64],
    rows: &[usize],
) {
    let mut sums: AHashMap<usize, (f64, f64)> = AHashMap::new();
    for &r in rows {
        let p = LinkFunction::Logit.inverse(eta[r]);
        let entry = sums.entry(tree.leaf_index(x.row(r))).or_insert((0.0, 0.0));
        entry.0 += residuals[r];
        entry.1 += p * (1.0 - p);
    }
    for (leaf, (gradient, hessian)) in sums {
        tree.set_leaf_value(leaf, gradient / hessian.max(1e-6));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};
    use rand::Rng;

    #[test]
    fn regression_boosting_reduces_error() {
        let x = Array2::from_shape_fn((150, 2), |(i, j)| ((i * (j + 2)) % 23) as f64);
        let y = x.map_axis(Axis(1), |r| 3.0 * r[0] + if r[1] > 10.0 { 20.0 } else { 0.0 });
        let model = BoostedEnsemble::fit(
            x.view(),
            y.view(),
            Task::Regression,
            &BoostingParams::default(),
            3,
        );
        let mse: f64 = x
            .axis_iter(Axis(0))
            .zip(y.iter())
            .map(|(row, &t)| (model.predict_row(row) - t).powi(2))
            .sum::<f64>()
            / 150.0;
        let variance = y.var(0.0);
        assert!(mse < 0.1 * variance, "mse {mse} vs variance {variance}");
        assert_eq!(model.init(), y.mean().unwrap());
    }

    #[test]
    fn classification_boosting_outputs_probabilities() {
        let mut rng = StdRng::seed_from_u64(4);
        let x = Array2::from_shape_fn((300, 1), |_| rng.gen_range(-3.0..3.0));
        let y = x.column(0).mapv(|v| if v > 0.5 { 1.0 } else { 0.0 });
        let model = BoostedEnsemble::fit(
            x.view(),
            y.view(),
            Task::Classification,
            &BoostingParams::default(),
            9,
        );
        let high = model.predict_row(array![2.5].view());
        let low = model.predict_row(array![-2.5].view());
        assert!(high > 0.9 && high <= 1.0);
        assert!(low < 0.1 && low >= 0.0);
    }
}
