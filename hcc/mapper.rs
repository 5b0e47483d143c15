use super::taxonomy::ConditionTaxonomy;
use crate::types::Gender;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CategoryStatus {
    Counted,
    Suppressed { by: String },
}

/// One resolved category in a member's breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryContribution {
    pub id: String,
    pub label: String,
    pub weight: f64,
    pub status: CategoryStatus,
    /// Condition keys that resolved to this category, sorted.
    pub triggered_by: Vec<String>,
}

impl CategoryContribution {
    pub fn is_counted(&self) -> bool {
        self.status == CategoryStatus::Counted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    /// Condition score plus demographic adjustment, never negative.
    pub total: f64,
    pub condition_score: f64,
    pub demographic_adjustment: f64,
    /// Resolved categories in taxonomy order.
    pub categories: Vec<CategoryContribution>,
    /// Flagged keys the taxonomy does not know, sorted.
    pub unknown_conditions: Vec<String>,
}

impl RiskScore {
    pub fn counted(&self) -> impl Iterator<Item = &CategoryContribution> {
        self.categories.iter().filter(|c| c.is_counted())
    }
}

/// Scores condition indicator sets against a shared taxonomy.
#[derive(Debug, Clone)]
pub struct HccMapper {
    taxonomy: Arc<ConditionTaxonomy>,
}

impl HccMapper {
    pub fn new(taxonomy: Arc<ConditionTaxonomy>) -> Self {
        Self { taxonomy }
    }

    pub fn taxonomy(&self) -> &Arc<ConditionTaxonomy> {
        &self.taxonomy
    }

    /// Scores the flagged condition keys without a demographic term.
    pub fn score_conditions<'a, I>(&self, flagged: I) -> RiskScore
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.score_with_adjustment(flagged, 0.0)
    }

    /// Scores the flagged condition keys and adds the member's age/sex band.
    pub fn score_member<'a, I>(&self, flagged: I, age: f64, gender: Gender) -> RiskScore
    where
        I: IntoIterator<Item = &'a str>,
    {
        let adjustment = self.taxonomy.demographic_adjustment(age, gender);
        self.score_with_adjustment(flagged, adjustment)
    }

    fn score_with_adjustment<'a, I>(&self, flagged: I, adjustment: f64) -> RiskScore
    where
        I: IntoIterator<Item = &'a str>,
    {
        // Sorted, de-duplicated keys make the result independent of input order.
        let keys: BTreeSet<String> = flagged
            .into_iter()
            .map(|k| k.trim().to_ascii_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        let mut present: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut unknown_conditions = Vec::new();
        for key in keys {
            match self.taxonomy.resolve(&key) {
                Some(indices) => {
                    for &idx in indices {
                        present.entry(idx).or_default().push(key.clone());
                    }
                }
                None => {
                    log::warn!("Ignoring unknown condition indicator '{key}'");
                    unknown_conditions.push(key);
                }
            }
        }

        let mut condition_score = 0.0;
        let mut categories = Vec::with_capacity(present.len());
        for (&idx, triggers) in &present {
            let category = self.taxonomy.category_at(idx);
            let suppressor = self
                .taxonomy
                .dominators_of(idx)
                .iter()
                .find(|&&d| present.contains_key(&d));
            let status = match suppressor {
                Some(&d) => CategoryStatus::Suppressed {
                    by: self.taxonomy.category_at(d).id.clone(),
                },
                None => {
                    condition_score += category.weight;
                    CategoryStatus::Counted
                }
            };
            categories.push(CategoryContribution {
                id: category.id.clone(),
                label: category.label.clone(),
                weight: category.weight,
                status,
                triggered_by: triggers.clone(),
            });
        }

        RiskScore {
            total: (condition_score + adjustment).max(0.0),
            condition_score,
            demographic_adjustment: adjustment,
            categories,
            unknown_conditions,
        }
    }
}
