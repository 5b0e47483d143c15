//! Deterministic, rule-ordered natural-language insights.

use super::aggregate::{CorrelationTable, Direction, DriverRanking, VariationSummary};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    pub top_k: usize,
    /// Drivers with a smaller mean |contribution| (PMPM dollars) are not reported.
    pub min_mean_abs_contribution: f64,
    pub conflict_min_correlation: f64,
    pub correlation_only_min: f64,
    /// Report concentration when the top decile carries at least this share.
    pub concentration_min_share: f64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_mean_abs_contribution: 0.01,
            conflict_min_correlation: 0.1,
            correlation_only_min: 0.3,
            concentration_min_share: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    TopDriver,
    ConflictingSignal,
    CorrelationOnly,
    CostConcentration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    /// 1-based position in the emitted list.
    pub rank: usize,
    pub kind: InsightKind,
    pub feature: Option<String>,
    pub direction: Option<Direction>,
    pub text: String,
}

/// Readable name for a feature column.
pub fn feature_label(feature: &str) -> String {
    let known = match feature {
        "age" => Some("Age"),
        "gender_female" => Some("Female gender"),
        "diabetes" => Some("Diabetes"),
        "hypertension" => Some("Hypertension"),
        "heart_disease" => Some("Heart disease"),
        "copd" => Some("COPD"),
        "cancer" => Some("Cancer"),
        "kidney_disease" => Some("Kidney disease"),
        "mental_health" => Some("Mental health condition"),
        "chronic_condition_count" => Some("Number of chronic conditions"),
        "high_cost_condition_count" => Some("Number of high-cost conditions"),
        "elderly" => Some("Age 65 or older"),
        "young_adult" => Some("Age 18 to 35"),
        "risk_score" => Some("HCC risk score"),
        "total_claims" => Some("Claim count"),
        _ => None,
    };
    if let Some(label) = known {
        return label.to_string();
    }
    let spaced = feature.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn verb(direction: Direction) -> &'static str {
    match direction {
        Direction::Increases => "raises",
        Direction::Decreases => "lowers",
        Direction::Neutral => "shifts",
    }
}

pub struct InsightGenerator {
    config: InsightConfig,
}

impl InsightGenerator {
    pub fn new(config: InsightConfig) -> Self {
        Self { config }
    }

    pub fn generate(
        &self,
        ranking: &DriverRanking,
        correlations: &CorrelationTable,
        variation: Option<&VariationSummary>,
    ) -> Vec<Insight> {
        let cfg = &self.config;
        let mut drafts: Vec<(InsightKind, Option<String>, Option<Direction>, String)> = Vec::new();

        let top: Vec<_> = ranking
            .top(cfg.top_k)
            .iter()
            .filter(|d| d.mean_abs_contribution > cfg.min_mean_abs_contribution)
            .collect();
        for driver in &top {
            drafts.push((
                InsightKind::TopDriver,
                Some(driver.feature.clone()),
                Some(driver.direction),
                format!(
                    "Cost driver #{}: {} {} predicted PMPM by ${:.2} per member on average.",
                    driver.rank,
                    feature_label(&driver.feature),
                    verb(driver.direction),
                    driver.mean_abs_contribution
                ),
            ));
        }

        for driver in &ranking.drivers {
            if driver.mean_abs_contribution <= cfg.min_mean_abs_contribution {
                continue;
            }
            let Some(r) = correlations.get(&driver.feature) else {
                continue;
            };
            let disagrees = match driver.direction {
                Direction::Increases => r < 0.0,
                Direction::Decreases => r > 0.0,
                Direction::Neutral => false,
            };
            if disagrees && r.abs() >= cfg.conflict_min_correlation {
                drafts.push((
                    InsightKind::ConflictingSignal,
                    Some(driver.feature.clone()),
                    Some(driver.direction),
                    format!(
                        "{}: the model says it {} predicted cost, yet it is {} correlated with observed cost (r = {r:.2}). Other conditions likely explain the raw association.",
                        feature_label(&driver.feature),
                        verb(driver.direction),
                        if r > 0.0 { "positively" } else { "negatively" },
                    ),
                ));
            }
        }

        for entry in &correlations.entries {
            let Some(r) = entry.r else {
                continue;
            };
            let in_top = top.iter().any(|d| d.feature == entry.feature);
            if !in_top && r.abs() >= cfg.correlation_only_min {
                drafts.push((
                    InsightKind::CorrelationOnly,
                    Some(entry.feature.clone()),
                    None,
                    format!(
                        "{} is {} correlated with observed cost (r = {r:.2}) but is not among the top model drivers.",
                        feature_label(&entry.feature),
                        if r > 0.0 { "positively" } else { "negatively" },
                    ),
                ));
            }
        }

        if let Some(share) = variation
            .and_then(|v| v.top_decile_share)
            .filter(|&s| s >= cfg.concentration_min_share)
        {
            drafts.push((
                InsightKind::CostConcentration,
                None,
                None,
                format!(
                    "Costs are concentrated: the costliest 10% of members account for {:.0}% of total cost.",
                    share * 100.0
                ),
            ));
        }

        drafts
            .into_iter()
            .enumerate()
            .map(|(i, (kind, feature, direction, text))| Insight {
                rank: i + 1,
                kind,
                feature,
                direction,
                text,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::aggregate::{DriverStat, FeatureCorrelation};

    fn stat(feature: &str, rank: usize, mean_abs: f64, direction: Direction) -> DriverStat {
        DriverStat {
            feature: feature.to_string(),
            rank,
            mean_abs_contribution: mean_abs,
            mean_contribution: 0.0,
            direction,
        }
    }

    fn correlations(pairs: &[(&str, Option<f64>)]) -> CorrelationTable {
        CorrelationTable {
            entries: pairs
                .iter()
                .map(|(f, r)| FeatureCorrelation {
                    feature: f.to_string(),
                    r: *r,
                })
                .collect(),
        }
    }

    #[test]
    fn rules_fire_in_order() {
        let ranking = DriverRanking {
            drivers: vec![
                stat("diabetes", 1, 120.0, Direction::Increases),
                stat("age", 2, 40.0, Direction::Decreases),
                stat("total_claims", 3, 0.0, Direction::Neutral),
            ],
        };
        let table = correlations(&[
            ("diabetes", Some(0.6)),
            ("age", Some(0.25)),
            ("total_claims", Some(0.8)),
        ]);
        let config = InsightConfig {
            top_k: 2,
            ..InsightConfig::default()
        };
        let insights = InsightGenerator::new(config).generate(&ranking, &table, None);
        let kinds: Vec<InsightKind> = insights.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![
                InsightKind::TopDriver,
                InsightKind::TopDriver,
                InsightKind::ConflictingSignal,
                InsightKind::CorrelationOnly,
            ]
        );
        assert!(insights[0].text.contains("Diabetes raises"));
        assert_eq!(insights[2].feature.as_deref(), Some("age"));
        assert_eq!(insights[3].feature.as_deref(), Some("total_claims"));
        assert_eq!(insights.iter().map(|i| i.rank).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn flat_ranking_produces_no_driver_insights() {
        let ranking = DriverRanking {
            drivers: vec![stat("age", 1, 0.0, Direction::Neutral)],
        };
        let insights =
            InsightGenerator::new(InsightConfig::default()).generate(&ranking, &correlations(&[("age", None)]), None);
        assert!(insights.is_empty());
    }

    #[test]
    fn labels_fall_back_to_readable_names() {
        assert_eq!(feature_label("copd"), "COPD");
        assert_eq!(feature_label("substance_abuse"), "Substance abuse");
    }
}
