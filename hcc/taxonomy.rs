use crate::types::Gender;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const BUILTIN_TAXONOMY: &str = include_str!("default_taxonomy.toml");

#[derive(Error, Debug)]
pub enum TaxonomyError {
    #[error("Failed to parse the condition taxonomy: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to read taxonomy file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("The taxonomy defines no condition categories.")]
    Empty,

    #[error("Category id '{0}' is defined more than once.")]
    DuplicateCategory(String),

    #[error("Category '{category}' references unknown category '{reference}'.")]
    UnknownReference { category: String, reference: String },

    #[error("Condition '{condition}' maps to unknown category '{category}'.")]
    UnknownConditionCategory { condition: String, category: String },

    #[error(
        "Category '{category}' has weight {weight}; weights must be finite and non-negative."
    )]
    InvalidWeight { category: String, weight: f64 },

    #[error(
        "Demographic band #{index} is invalid: ages must satisfy min <= max and the coefficient must be finite and non-negative."
    )]
    InvalidDemographicBand { index: usize },

    #[error("Category '{0}' suppresses itself through its parent/exclusion links.")]
    Cycle(String),
}

/// One node of the condition hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionCategory {
    pub id: String,
    pub label: String,
    pub weight: f64,
    /// The more severe relative that subsumes this category.
    #[serde(default)]
    pub parent: Option<String>,
    /// Categories outside the parent chain that this one suppresses.
    #[serde(default)]
    pub excludes: Vec<String>,
}

/// An additive age/sex adjustment. `gender = None` matches every member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemographicBand {
    #[serde(default)]
    pub gender: Option<Gender>,
    pub min_age: u32,
    pub max_age: u32,
    pub coefficient: f64,
}

impl DemographicBand {
    fn matches(&self, age: f64, gender: Gender) -> bool {
        let gender_ok = self.gender.is_none_or(|g| g == gender);
        gender_ok && age >= f64::from(self.min_age) && age < f64::from(self.max_age) + 1.0
    }
}

#[derive(Deserialize)]
struct TaxonomyFile {
    version: String,
    #[serde(rename = "category", default)]
    categories: Vec<ConditionCategory>,
    #[serde(default)]
    conditions: BTreeMap<String, Vec<String>>,
    #[serde(rename = "demographic", default)]
    demographics: Vec<DemographicBand>,
}

/// Immutable, validated condition taxonomy.
///
/// Suppression is resolved once at load time: `dominators[c]` lists, in
/// ascending index order, every category whose presence removes `c` from the
/// score (descendants through `parent` links plus explicit `excludes`, closed
/// transitively).
#[derive(Debug, Clone)]
pub struct ConditionTaxonomy {
    version: String,
    categories: Vec<ConditionCategory>,
    index: AHashMap<String, usize>,
    dominators: Vec<Vec<usize>>,
    conditions: BTreeMap<String, Vec<usize>>,
    demographics: Vec<DemographicBand>,
}

impl ConditionTaxonomy {
    /// The taxonomy shipped with the crate.
    pub fn builtin() -> Result<Self, TaxonomyError> {
        Self::from_toml_str(BUILTIN_TAXONOMY)
    }

    pub fn load(path: &Path) -> Result<Self, TaxonomyError> {
        let text = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, TaxonomyError> {
        let file: TaxonomyFile = toml::from_str(text)?;
        Self::from_parts(
            file.version,
            file.categories,
            file.conditions,
            file.demographics,
        )
    }

    fn from_parts(
        version: String,
        categories: Vec<ConditionCategory>,
        raw_conditions: BTreeMap<String, Vec<String>>,
        demographics: Vec<DemographicBand>,
    ) -> Result<Self, TaxonomyError> {
        if categories.is_empty() {
            return Err(TaxonomyError::Empty);
        }

        let mut index = AHashMap::with_capacity(categories.len());
        for (i, category) in categories.iter().enumerate() {
            if !category.weight.is_finite() || category.weight < 0.0 {
                return Err(TaxonomyError::InvalidWeight {
                    category: category.id.clone(),
                    weight: category.weight,
                });
            }
            if index.insert(category.id.clone(), i).is_some() {
                return Err(TaxonomyError::DuplicateCategory(category.id.clone()));
            }
        }

        let lookup = |owner: &str, reference: &str| {
            index
                .get(reference)
                .copied()
                .ok_or_else(|| TaxonomyError::UnknownReference {
                    category: owner.to_string(),
                    reference: reference.to_string(),
                })
        };

        // suppresses[d] holds the categories removed directly by d.
        let mut suppresses = vec![Vec::new(); categories.len()];
        for (child, category) in categories.iter().enumerate() {
            if let Some(parent) = &category.parent {
                suppresses[lookup(&category.id, parent)?].push(child);
            }
            for excluded in &category.excludes {
                let target = lookup(&category.id, excluded)?;
                suppresses[child].push(target);
            }
        }

        let mut dominators = vec![Vec::new(); categories.len()];
        for (root, category) in categories.iter().enumerate() {
            let mut seen = vec![false; categories.len()];
            let mut stack = suppresses[root].clone();
            while let Some(node) = stack.pop() {
                if node == root {
                    return Err(TaxonomyError::Cycle(category.id.clone()));
                }
                if seen[node] {
                    continue;
                }
                seen[node] = true;
                dominators[node].push(root);
                stack.extend(suppresses[node].iter().copied());
            }
        }
        for list in &mut dominators {
            list.sort_unstable();
        }

        let mut conditions = BTreeMap::new();
        for (condition, ids) in raw_conditions {
            let mut resolved = Vec::with_capacity(ids.len());
            for id in &ids {
                let idx = index.get(id.as_str()).copied().ok_or_else(|| {
                    TaxonomyError::UnknownConditionCategory {
                        condition: condition.clone(),
                        category: id.clone(),
                    }
                })?;
                resolved.push(idx);
            }
            resolved.sort_unstable();
            resolved.dedup();
            conditions.insert(condition.to_ascii_lowercase(), resolved);
        }

        for (i, band) in demographics.iter().enumerate() {
            if band.min_age > band.max_age
                || !band.coefficient.is_finite()
                || band.coefficient < 0.0
            {
                return Err(TaxonomyError::InvalidDemographicBand { index: i });
            }
        }

        Ok(Self {
            version,
            categories,
            index,
            dominators,
            conditions,
            demographics,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn categories(&self) -> &[ConditionCategory] {
        &self.categories
    }

    pub fn category(&self, id: &str) -> Option<&ConditionCategory> {
        self.index.get(id).map(|&i| &self.categories[i])
    }

    pub(crate) fn category_at(&self, idx: usize) -> &ConditionCategory {
        &self.categories[idx]
    }

    /// Category indices a condition key resolves to, if the key is known.
    pub(crate) fn resolve(&self, condition: &str) -> Option<&[usize]> {
        self.conditions.get(condition).map(Vec::as_slice)
    }

    pub(crate) fn dominators_of(&self, idx: usize) -> &[usize] {
        &self.dominators[idx]
    }

    pub fn knows_condition(&self, condition: &str) -> bool {
        self.conditions.contains_key(condition)
    }

    /// Condition keys in sorted order.
    pub fn condition_keys(&self) -> impl Iterator<Item = &str> {
        self.conditions.keys().map(String::as_str)
    }

    /// True when `dominant` being present removes `suppressed` from the score.
    pub fn suppresses(&self, dominant: &str, suppressed: &str) -> bool {
        match (self.index.get(dominant), self.index.get(suppressed)) {
            (Some(&d), Some(&s)) => self.dominators[s].binary_search(&d).is_ok(),
            _ => false,
        }
    }

    /// Additive adjustment from the first matching demographic band, or 0.
    pub fn demographic_adjustment(&self, age: f64, gender: Gender) -> f64 {
        self.demographics
            .iter()
            .find(|band| band.matches(age, gender))
            .map_or(0.0, |band| band.coefficient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_taxonomy_loads_and_resolves_conditions() {
        let taxonomy = ConditionTaxonomy::builtin().expect("builtin taxonomy must parse");
        assert!(!taxonomy.categories().is_empty());
        assert!(taxonomy.knows_condition("diabetes"));
        assert!(taxonomy.knows_condition("hypertension"));
        assert!(!taxonomy.knows_condition("gout"));
        assert_eq!(taxonomy.category("HCC19").map(|c| c.weight), Some(0.5));
    }

    #[test]
    fn parent_chain_is_closed_transitively() {
        let taxonomy = ConditionTaxonomy::builtin().unwrap();
        assert!(taxonomy.suppresses("HCC18", "HCC19"));
        assert!(taxonomy.suppresses("HCC17", "HCC19"));
        assert!(taxonomy.suppresses("HCC8", "HCC12"));
        assert!(!taxonomy.suppresses("HCC19", "HCC17"));
        // explicit cross-family exclusion plus its parent chain
        assert!(taxonomy.suppresses("HCC17", "HCC137"));
        assert!(!taxonomy.suppresses("HCC17", "HCC136"));
    }

    #[test]
    fn cycles_are_rejected() {
        let text = r#"
            version = "cyclic"
            [[category]]
            id = "A"
            label = "a"
            weight = 1.0
            parent = "B"
            [[category]]
            id = "B"
            label = "b"
            weight = 1.0
            excludes = ["A", "B"]
        "#;
        match ConditionTaxonomy::from_toml_str(text) {
            Err(TaxonomyError::Cycle(_)) => {}
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn negative_weights_and_dangling_references_are_rejected() {
        let negative = r#"
            version = "bad"
            [[category]]
            id = "A"
            label = "a"
            weight = -0.5
        "#;
        assert!(matches!(
            ConditionTaxonomy::from_toml_str(negative),
            Err(TaxonomyError::InvalidWeight { .. })
        ));

        let dangling = r#"
            version = "bad"
            [[category]]
            id = "A"
            label = "a"
            weight = 0.5
            [conditions]
            gout = ["Z"]
        "#;
        match ConditionTaxonomy::from_toml_str(dangling) {
            Err(TaxonomyError::UnknownConditionCategory { condition, category }) => {
                assert_eq!(condition, "gout");
                assert_eq!(category, "Z");
            }
            other => panic!("expected UnknownConditionCategory, got {other:?}"),
        }
    }

    #[test]
    fn demographic_bands_match_first_hit() {
        let taxonomy = ConditionTaxonomy::builtin().unwrap();
        assert_eq!(taxonomy.demographic_adjustment(45.0, Gender::Female), 0.0);
        assert_eq!(taxonomy.demographic_adjustment(70.0, Gender::Female), 0.30);
        assert_eq!(taxonomy.demographic_adjustment(74.5, Gender::Male), 0.35);
        assert_eq!(taxonomy.demographic_adjustment(80.0, Gender::Male), 0.55);
        assert_eq!(taxonomy.demographic_adjustment(80.0, Gender::Unknown), 0.0);
    }
}
