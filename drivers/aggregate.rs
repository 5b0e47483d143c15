//! Population-level summaries over attribution records and observed cost.

use super::shapley::AttributionRecord;
use crate::features::FeatureBatch;
use crate::models::metrics::pearson;
use crate::types::FeatureSchema;
use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increases,
    Decreases,
    Neutral,
}

impl Direction {
    fn from_signed(value: f64) -> Self {
        if value > 1e-12 {
            Direction::Increases
        } else if value < -1e-12 {
            Direction::Decreases
        } else {
            Direction::Neutral
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverStat {
    pub feature: String,
    /// 1-based position in the ranking.
    pub rank: usize,
    pub mean_abs_contribution: f64,
    pub mean_contribution: f64,
    /// Whether higher values of the feature push predicted cost up or down,
    /// from the sign of `sum(phi_i * (x_i - mean x_i))`.
    pub direction: Direction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverRanking {
    pub drivers: Vec<DriverStat>,
}

impl DriverRanking {
    /// Ranks features by mean absolute contribution, largest first. Equal
    /// means keep schema order.
    pub fn from_records(schema: &FeatureSchema, records: &[AttributionRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }
        let p = schema.len();
        let n = records.len() as f64;
        let mut mean_abs = Array1::<f64>::zeros(p);
        let mut mean_signed = Array1::<f64>::zeros(p);
        let mut mean_value = Array1::<f64>::zeros(p);
        for record in records {
            for (j, c) in record.contributions.iter().enumerate().take(p) {
                mean_abs[j] += c.contribution.abs() / n;
                mean_signed[j] += c.contribution / n;
                mean_value[j] += c.value / n;
            }
        }
        let mut alignment = Array1::<f64>::zeros(p);
        for record in records {
            for (j, c) in record.contributions.iter().enumerate().take(p) {
                alignment[j] += c.contribution * (c.value - mean_value[j]);
            }
        }

        let drivers = (0..p)
            .sorted_by(|&a, &b| mean_abs[b].total_cmp(&mean_abs[a]).then(a.cmp(&b)))
            .enumerate()
            .map(|(position, j)| DriverStat {
                feature: schema.names()[j].clone(),
                rank: position + 1,
                mean_abs_contribution: mean_abs[j],
                mean_contribution: mean_signed[j],
                direction: Direction::from_signed(alignment[j]),
            })
            .collect();
        Self { drivers }
    }

    pub fn get(&self, feature: &str) -> Option<&DriverStat> {
        self.drivers.iter().find(|d| d.feature == feature)
    }

    pub fn top(&self, k: usize) -> &[DriverStat] {
        &self.drivers[..k.min(self.drivers.len())]
    }

    /// No feature carries any attribution.
    pub fn is_flat(&self) -> bool {
        self.drivers.iter().all(|d| d.mean_abs_contribution <= 1e-12)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCorrelation {
    pub feature: String,
    /// `None` when either the feature or cost has no variance.
    pub r: Option<f64>,
}

/// Pearson correlation of each feature with observed total cost. Secondary
/// evidence: correlation is not attribution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationTable {
    pub entries: Vec<FeatureCorrelation>,
}

impl CorrelationTable {
    pub fn from_batch(batch: &FeatureBatch) -> Self {
        let x = batch.design_matrix();
        let cost = batch.total_costs();
        let entries = batch
            .schema()
            .names()
            .iter()
            .zip(x.columns())
            .map(|(name, column)| FeatureCorrelation {
                feature: name.clone(),
                r: pearson(column, cost.view()),
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, feature: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.feature == feature)
            .and_then(|e| e.r)
    }
}

/// Spread of observed member cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationSummary {
    pub members: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    /// `std_dev / mean`; undefined for a zero mean.
    pub coefficient_of_variation: Option<f64>,
    /// Share of total cost from the costliest tenth of members.
    pub top_decile_share: Option<f64>,
    pub zero_cost_members: usize,
}

impl VariationSummary {
    pub fn from_costs(costs: ArrayView1<f64>) -> Self {
        let members = costs.len();
        let mut sorted = costs.to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));

        let mean = costs.mean().unwrap_or(0.0);
        let median = match members {
            0 => 0.0,
            m if m % 2 == 1 => sorted[m / 2],
            m => 0.5 * (sorted[m / 2 - 1] + sorted[m / 2]),
        };
        let std_dev = if members > 1 { costs.std(1.0) } else { 0.0 };
        let total: f64 = sorted.iter().sum();
        let top_count = members.div_ceil(10);
        let top_decile_share =
            (total > 0.0).then(|| sorted.iter().take(top_count).sum::<f64>() / total);

        Self {
            members,
            mean,
            median,
            std_dev,
            coefficient_of_variation: (mean.abs() > 1e-12).then(|| std_dev / mean),
            top_decile_share,
            zero_cost_members: costs.iter().filter(|&&c| c == 0.0).count(),
        }
    }
}
