//! CART regression trees shared by the forest and boosting families.

use ndarray::{ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        value: f64,
    },
    /// Rows with `x[feature] <= threshold` go left.
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Features examined per split; `None` examines all of them.
    pub max_features: Option<usize>,
}

/// Arena-allocated tree; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

struct Grower<'a, 't, 'r> {
    x: ArrayView2<'a, f64>,
    targets: &'t [f64],
    params: TreeParams,
    rng: &'r mut StdRng,
    nodes: Vec<Node>,
}

impl RegressionTree {
    /// Grows a tree on `rows` (indices into `x`, repeats allowed) to minimize
    /// squared error against `targets`.
    pub fn fit(
        x: ArrayView2<f64>,
        targets: &[f64],
        rows: Vec<usize>,
        params: TreeParams,
        rng: &mut StdRng,
    ) -> Self {
        let mut grower = Grower {
            x,
            targets,
            params,
            rng,
            nodes: Vec::new(),
        };
        grower.grow(rows, 0);
        Self {
            nodes: grower.nodes,
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Index of the leaf node `x` falls into.
    pub fn leaf_index(&self, x: ArrayView1<f64>) -> usize {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { .. } => return idx,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if x[*feature] <= *threshold { *left } else { *right },
            }
        }
    }

    pub fn predict_row(&self, x: ArrayView1<f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if x[*feature] <= *threshold { *left } else { *right },
            }
        }
    }

    pub(crate) fn set_leaf_value(&mut self, idx: usize, new_value: f64) {
        if let Node::Leaf { value } = &mut self.nodes[idx] {
            *value = new_value;
        }
    }
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

impl Grower<'_, '_, '_> {
    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let idx = self.nodes.len();
        let (sum, sum_sq) = rows.iter().fold((0.0, 0.0), |(s, q), &r| {
            let t = self.targets[r];
            (s + t, q + t * t)
        });
        let count = rows.len() as f64;
        let mean = if rows.is_empty() { 0.0 } else { sum / count };
        self.nodes.push(Node::Leaf { value: mean });

        let pure = sum_sq - sum * sum / count.max(1.0) <= 1e-12 * count.max(1.0);
        if depth >= self.params.max_depth
            || rows.len() < 2 * self.params.min_samples_leaf.max(1)
            || pure
        {
            return idx;
        }

        let Some(best) = self.best_split(&rows, sum) else {
            return idx;
        };
        let left = self.grow(best.left, depth + 1);
        let right = self.grow(best.right, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
        };
        idx
    }

    fn candidate_features(&mut self) -> Vec<usize> {
        let p = self.x.ncols();
        match self.params.max_features {
            Some(m) if m < p => {
                let mut chosen = index::sample(&mut *self.rng, p, m.max(1)).into_vec();
                chosen.sort_unstable();
                chosen
            }
            _ => (0..p).collect(),
        }
    }

    fn best_split(&mut self, rows: &[usize], total: f64) -> Option<BestSplit> {
        let n = rows.len();
        let min_leaf = self.params.min_samples_leaf.max(1);
        let parent_score = total * total / n as f64;
        let mut best: Option<(usize, f64, f64)> = None;
        let mut sorted = rows.to_vec();

        for feature in self.candidate_features() {
            let column = self.x.column(feature);
            sorted.sort_by(|&a, &b| column[a].total_cmp(&column[b]));

            let mut left_sum = 0.0;
            for k in 1..n {
                left_sum += self.targets[sorted[k - 1]];
                if k < min_leaf || n - k < min_leaf {
                    continue;
                }
                let lo = column[sorted[k - 1]];
                let hi = column[sorted[k]];
                if lo >= hi {
                    continue;
                }
                let right_sum = total - left_sum;
                let score = left_sum * left_sum / k as f64 + right_sum * right_sum / (n - k) as f64;
                let gain = score - parent_score;
                if gain > 1e-12 && best.is_none_or(|(_, _, g)| gain > g) {
                    best = Some((feature, 0.5 * (lo + hi), gain));
                }
            }
        }

        let (feature, threshold, _) = best?;
        let column = self.x.column(feature);
        let (left, right): (Vec<usize>, Vec<usize>) =
            rows.iter().partition(|&&r| column[r] <= threshold);
        Some(BestSplit {
            feature,
            threshold,
            left,
            right,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};
    use rand::SeedableRng;

    fn params(depth: usize) -> TreeParams {
        TreeParams {
            max_depth: depth,
            min_samples_leaf: 1,
            max_features: None,
        }
    }

    #[test]
    fn step_function_is_recovered_exactly() {
        let x = Array2::from_shape_fn((10, 2), |(i, j)| if j == 0 { i as f64 } else { 0.0 });
        let y: Vec<f64> = (0..10).map(|i| if i < 4 { 1.0 } else { 5.0 }).collect();
        let mut rng = StdRng::seed_from_u64(0);
        let tree = RegressionTree::fit(x.view(), &y, (0..10).collect(), params(3), &mut rng);

        match &tree.nodes()[0] {
            Node::Split {
                feature, threshold, ..
            } => {
                assert_eq!(*feature, 0);
                assert_eq!(*threshold, 3.5);
            }
            other => panic!("root should split, got {other:?}"),
        }
        assert_eq!(tree.predict_row(array![2.0, 0.0].view()), 1.0);
        assert_eq!(tree.predict_row(array![8.0, 0.0].view()), 5.0);
    }

    #[test]
    fn depth_zero_is_a_single_mean_leaf() {
        let x = Array2::from_shape_fn((4, 1), |(i, _)| i as f64);
        let y = vec![1.0, 2.0, 3.0, 6.0];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = RegressionTree::fit(x.view(), &y, (0..4).collect(), params(0), &mut rng);
        assert_eq!(tree.nodes().len(), 1);
        assert_eq!(tree.predict_row(array![10.0].view()), 3.0);
    }

    #[test]
    fn min_samples_leaf_is_respected() {
        let x = Array2::from_shape_fn((6, 1), |(i, _)| i as f64);
        let y = vec![0.0, 0.0, 0.0, 0.0, 0.0, 9.0];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = RegressionTree::fit(
            x.view(),
            &y,
            (0..6).collect(),
            TreeParams {
                max_depth: 4,
                min_samples_leaf: 3,
                max_features: None,
            },
            &mut rng,
        );
        // the only admissible split puts three rows on each side
        assert_eq!(tree.predict_row(array![5.0].view()), 3.0);
        assert_eq!(tree.predict_row(array![0.0].view()), 0.0);
    }
}
