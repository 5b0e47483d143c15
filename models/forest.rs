use super::cv::derive_seed;
use super::tree::{RegressionTree, TreeParams};
use ndarray::{ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Share of features considered at each split.
    pub feature_fraction: f64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 8,
            min_samples_leaf: 5,
            feature_fraction: 0.5,
        }
    }
}

/// Bagged CART trees; the prediction is the unweighted mean of the trees.
/// For 0/1 targets the leaves hold class frequencies, so the output is a
/// probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<RegressionTree>,
}

impl RandomForest {
    pub fn fit(x: ArrayView2<f64>, y: ArrayView1<f64>, params: &ForestParams, seed: u64) -> Self {
        let (n, p) = x.dim();
        let targets = y.to_vec();
        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_leaf: params.min_samples_leaf,
            max_features: Some(((p as f64 * params.feature_fraction).ceil() as usize).clamp(1, p.max(1))),
        };

        let trees = (0..params.n_trees.max(1))
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(derive_seed(seed, t as u64));
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                RegressionTree::fit(x, &targets, bootstrap, tree_params, &mut rng)
            })
            .collect();
        Self { trees }
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    pub fn predict_row(&self, x: ArrayView1<f64>) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.predict_row(x)).sum();
        total / self.trees.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2, array};

    fn step_data() -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((200, 3), |(i, j)| ((i * (j + 3)) % 17) as f64);
        let y = x.column(0).mapv(|v| if v > 8.0 { 100.0 } else { 10.0 });
        (x, y)
    }

    #[test]
    fn forest_is_deterministic_for_a_seed() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_trees: 20,
            ..ForestParams::default()
        };
        let a = RandomForest::fit(x.view(), y.view(), &params, 5);
        let b = RandomForest::fit(x.view(), y.view(), &params, 5);
        let c = RandomForest::fit(x.view(), y.view(), &params, 6);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn forest_learns_step_signal() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_trees: 30,
            feature_fraction: 1.0,
            ..ForestParams::default()
        };
        let forest = RandomForest::fit(x.view(), y.view(), &params, 1);
        assert!(forest.predict_row(array![15.0, 0.0, 0.0].view()) > 80.0);
        assert!(forest.predict_row(array![2.0, 0.0, 0.0].view()) < 30.0);
    }
}
