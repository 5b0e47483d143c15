//! Exact interventional Shapley values for sums of regression trees.
//!
//! For a foreground row `x` and one background row `z`, the Shapley value of
//! feature `i` for a single tree can be read off the leaves reachable when
//! every split feature is taken from either `x` or `z`. A walk that records
//! which features were forced to come from `x` (set `A`) and which from `z`
//! (set `B`) visits each such leaf once; a leaf with value `v` then adds
//! `v (|A|-1)! |B|! / (|A|+|B|)!` to each feature in `A` and subtracts
//! `v |A|! (|B|-1)! / (|A|+|B|)!` from each feature in `B`. Leaves reached
//! with both sets empty are common to `x` and `z` and contribute nothing.

use crate::models::family::TreeSum;
use crate::models::tree::{Node, RegressionTree};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

/// Attribution of `weight * sum(trees(x)) - mean_b weight * sum(trees(z_b))`.
pub fn tree_sum_shap(
    ensemble: &TreeSum<'_>,
    x: ArrayView1<f64>,
    background: ArrayView2<f64>,
) -> Array1<f64> {
    let p = x.len();
    let mut phi = Array1::<f64>::zeros(p);
    if background.nrows() == 0 {
        return phi;
    }
    let weights = ShapleyWeights::new(max_depth(ensemble.trees));
    for z in background.axis_iter(Axis(0)) {
        let mut walk = Walk::new(x, z, &weights, &mut phi);
        for tree in ensemble.trees {
            walk.visit(tree.nodes(), 0);
        }
    }
    phi *= ensemble.weight / background.nrows() as f64;
    phi
}

fn max_depth(trees: &[RegressionTree]) -> usize {
    trees
        .iter()
        .map(|t| depth_of(t.nodes(), 0))
        .max()
        .unwrap_or(0)
}

fn depth_of(nodes: &[Node], idx: usize) -> usize {
    match &nodes[idx] {
        Node::Leaf { .. } => 0,
        Node::Split { left, right, .. } => 1 + depth_of(nodes, *left).max(depth_of(nodes, *right)),
    }
}

/// Factorials up to the deepest path; sets never outgrow the path length.
struct ShapleyWeights {
    factorial: Vec<f64>,
}

impl ShapleyWeights {
    fn new(depth: usize) -> Self {
        let mut factorial = Vec::with_capacity(depth + 2);
        factorial.push(1.0);
        for k in 1..=depth + 1 {
            factorial.push(factorial[k - 1] * k as f64);
        }
        Self { factorial }
    }

    /// `a! b! / (a + b + 1)!`
    fn coefficient(&self, a: usize, b: usize) -> f64 {
        self.factorial[a] * self.factorial[b] / self.factorial[a + b + 1]
    }
}

struct Walk<'x, 'z, 'w> {
    x: ArrayView1<'x, f64>,
    z: ArrayView1<'z, f64>,
    weights: &'w ShapleyWeights,
    from_x: Vec<usize>,
    from_z: Vec<usize>,
    phi: &'w mut Array1<f64>,
}

impl<'x, 'z, 'w> Walk<'x, 'z, 'w> {
    fn new(
        x: ArrayView1<'x, f64>,
        z: ArrayView1<'z, f64>,
        weights: &'w ShapleyWeights,
        phi: &'w mut Array1<f64>,
    ) -> Self {
        Self {
            x,
            z,
            weights,
            from_x: Vec::new(),
            from_z: Vec::new(),
            phi,
        }
    }

    fn visit(&mut self, nodes: &[Node], idx: usize) {
        match &nodes[idx] {
            Node::Leaf { value } => self.credit(*value),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                let x_child = if self.x[*feature] <= *threshold { *left } else { *right };
                let z_child = if self.z[*feature] <= *threshold { *left } else { *right };
                if x_child == z_child {
                    self.visit(nodes, x_child);
                } else if self.from_x.contains(feature) {
                    self.visit(nodes, x_child);
                } else if self.from_z.contains(feature) {
                    self.visit(nodes, z_child);
                } else {
                    self.from_x.push(*feature);
                    self.visit(nodes, x_child);
                    self.from_x.pop();

                    self.from_z.push(*feature);
                    self.visit(nodes, z_child);
                    self.from_z.pop();
                }
            }
        }
    }

    fn credit(&mut self, value: f64) {
        let a = self.from_x.len();
        let b = self.from_z.len();
        if a > 0 {
            let gain = value * self.weights.coefficient(a - 1, b);
            for &i in &self.from_x {
                self.phi[i] += gain;
            }
        }
        if b > 0 {
            let loss = value * self.weights.coefficient(a, b - 1);
            for &i in &self.from_z {
                self.phi[i] -= loss;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tree::TreeParams;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Single tree against a single reference row.
    fn tree_shap_single(
        tree: &RegressionTree,
        x: ArrayView1<f64>,
        z: ArrayView1<f64>,
    ) -> Array1<f64> {
        let mut phi = Array1::<f64>::zeros(x.len());
        let weights = ShapleyWeights::new(max_depth(std::slice::from_ref(tree)));
        Walk::new(x, z, &weights, &mut phi).visit(tree.nodes(), 0);
        phi
    }

    fn grown_tree() -> RegressionTree {
        // y = 10 * [x0 > 2] + 4 * [x1 > 1] + 3 * [x0 > 2][x1 > 1]
        let x = Array2::from_shape_fn((40, 3), |(i, j)| match j {
            0 => (i % 5) as f64,
            1 => (i / 5 % 3) as f64,
            _ => (i % 7) as f64,
        });
        let y: Vec<f64> = x
            .axis_iter(Axis(0))
            .map(|r| {
                let a = if r[0] > 2.0 { 1.0 } else { 0.0 };
                let b = if r[1] > 1.0 { 1.0 } else { 0.0 };
                10.0 * a + 4.0 * b + 3.0 * a * b
            })
            .collect();
        let mut rng = StdRng::seed_from_u64(0);
        RegressionTree::fit(
            x.view(),
            &y,
            (0..40).collect(),
            TreeParams {
                max_depth: 4,
                min_samples_leaf: 1,
                max_features: None,
            },
            &mut rng,
        )
    }

    #[test]
    fn single_reference_matches_brute_force_shapley() {
        let tree = grown_tree();
        let x = array![4.0, 2.0, 1.0];
        let z = array![0.0, 0.0, 5.0];
        let phi = tree_shap_single(&tree, x.view(), z.view());

        // brute force over the 3! orderings
        let value = |mask: [bool; 3]| {
            let row: Vec<f64> = (0..3).map(|i| if mask[i] { x[i] } else { z[i] }).collect();
            tree.predict_row(ndarray::ArrayView1::from(&row))
        };
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        let mut expected = [0.0; 3];
        for order in orders {
            let mut mask = [false; 3];
            for &i in &order {
                let before = value(mask);
                mask[i] = true;
                expected[i] += (value(mask) - before) / 6.0;
            }
        }
        for i in 0..3 {
            assert_abs_diff_eq!(phi[i], expected[i], epsilon = 1e-9);
        }
        assert_abs_diff_eq!(phi[0], 11.5, epsilon = 1e-9);
        assert_abs_diff_eq!(phi[1], 5.5, epsilon = 1e-9);
        assert_abs_diff_eq!(phi[2], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn ensemble_attribution_is_efficient() {
        let tree = grown_tree();
        let trees = vec![tree.clone(), tree];
        let ensemble = TreeSum {
            trees: &trees,
            weight: 0.5,
            bias: 1.0,
        };
        let background = array![[0.0, 0.0, 0.0], [4.0, 0.0, 3.0], [1.0, 2.0, 6.0]];
        let x = array![3.0, 2.0, 2.0];
        let phi = tree_sum_shap(&ensemble, x.view(), background.view());

        let f = |row: ArrayView1<f64>| {
            ensemble.bias + ensemble.weight * trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
        };
        let mean_bg = background.axis_iter(Axis(0)).map(f).sum::<f64>() / 3.0;
        assert_abs_diff_eq!(phi.sum(), f(x.view()) - mean_bg, epsilon = 1e-9);
    }
}
