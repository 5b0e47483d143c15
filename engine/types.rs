//! Member-level records and the immutable feature vectors built from them.

use crate::hcc::RiskScore;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Normalized gender category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
    Unknown,
}

impl Gender {
    /// Maps free-text gender codes onto the fixed categories.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "f" | "female" | "0" => Gender::Female,
            "m" | "male" | "1" => Gender::Male,
            _ => Gender::Unknown,
        }
    }

    /// Numeric encoding used in the `gender_female` feature.
    pub fn encode(self) -> f64 {
        match self {
            Gender::Female => 1.0,
            Gender::Male => 0.0,
            Gender::Unknown => 0.5,
        }
    }

    pub fn decode(value: f64) -> Self {
        if value == 1.0 {
            Gender::Female
        } else if value == 0.0 {
            Gender::Male
        } else {
            Gender::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Female => "female",
            Gender::Male => "male",
            Gender::Unknown => "unknown",
        }
    }
}

/// A member row as handed over by the ingestion layer. Every field may be absent;
/// the feature pipeline decides which absences are fatal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMemberRow {
    pub member_id: Option<String>,
    pub age: Option<f64>,
    pub gender: Option<String>,
    pub total_claims: Option<f64>,
    pub total_cost: Option<f64>,
    /// Clinical indicators keyed by condition name (0/1, other values binarized).
    #[serde(default)]
    pub conditions: BTreeMap<String, f64>,
}

impl RawMemberRow {
    pub fn new(member_id: impl Into<String>) -> Self {
        Self {
            member_id: Some(member_id.into()),
            ..Self::default()
        }
    }

    pub fn with_age(mut self, age: f64) -> Self {
        self.age = Some(age);
        self
    }

    pub fn with_gender(mut self, gender: impl Into<String>) -> Self {
        self.gender = Some(gender.into());
        self
    }

    pub fn with_claims(mut self, total_claims: f64) -> Self {
        self.total_claims = Some(total_claims);
        self
    }

    pub fn with_cost(mut self, total_cost: f64) -> Self {
        self.total_cost = Some(total_cost);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>, value: f64) -> Self {
        self.conditions.insert(condition.into(), value);
        self
    }
}

/// A validated member with its derived HCC risk score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub member_id: String,
    pub age: f64,
    pub gender: Gender,
    /// Condition keys flagged true, lowercase.
    pub conditions: BTreeSet<String>,
    pub total_claims: f64,
    pub total_cost: f64,
    pub risk: RiskScore,
}

impl MemberRecord {
    pub fn risk_score(&self) -> f64 {
        self.risk.total
    }

    /// Rebuilds the raw row this record represents.
    pub fn to_raw_row(&self) -> RawMemberRow {
        RawMemberRow {
            member_id: Some(self.member_id.clone()),
            age: Some(self.age),
            gender: Some(self.gender.as_str().to_string()),
            total_claims: Some(self.total_claims),
            total_cost: Some(self.total_cost),
            conditions: self.conditions.iter().map(|c| (c.clone(), 1.0)).collect(),
        }
    }
}

/// Observed outcome for the two-part model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub utilized: bool,
    pub pmpm: f64,
}

/// Ordered feature names plus a stable fingerprint of that ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    names: Vec<String>,
    fingerprint: u64,
}

impl FeatureSchema {
    pub fn new(names: Vec<String>) -> Self {
        let mut hash = FNV_OFFSET;
        for name in &names {
            hash = fnv1a(hash, name.as_bytes());
            hash = fnv1a(hash, &[0xff]);
        }
        Self {
            names,
            fingerprint: hash,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// First position where the two orderings disagree, if any.
    pub fn first_mismatch(&self, other: &FeatureSchema) -> Option<usize> {
        if self.fingerprint == other.fingerprint && self.names == other.names {
            return None;
        }
        let shared = self.names.len().min(other.names.len());
        Some(
            (0..shared)
                .find(|&i| self.names[i] != other.names[i])
                .unwrap_or(shared),
        )
    }
}

/// One member's features in schema order. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    member_id: String,
    schema: Arc<FeatureSchema>,
    values: Array1<f64>,
}

impl FeatureVector {
    pub(crate) fn new(member_id: String, schema: Arc<FeatureSchema>, values: Array1<f64>) -> Self {
        debug_assert_eq!(schema.len(), values.len());
        Self {
            member_id,
            schema,
            values,
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.schema.index_of(name).map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.schema
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Seed for one member's random streams: stable across runs and batch orders.
pub(crate) fn member_seed(base: u64, member_id: &str) -> u64 {
    fnv1a(FNV_OFFSET ^ base, member_id.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gender_codes_normalize() {
        assert_eq!(Gender::normalize(" F "), Gender::Female);
        assert_eq!(Gender::normalize("female"), Gender::Female);
        assert_eq!(Gender::normalize("0"), Gender::Female);
        assert_eq!(Gender::normalize("M"), Gender::Male);
        assert_eq!(Gender::normalize("1"), Gender::Male);
        assert_eq!(Gender::normalize("x"), Gender::Unknown);
        for g in [Gender::Female, Gender::Male, Gender::Unknown] {
            assert_eq!(Gender::decode(g.encode()), g);
            assert_eq!(Gender::normalize(g.as_str()), g);
        }
    }

    #[test]
    fn schema_mismatch_reports_first_differing_position() {
        let a = FeatureSchema::new(vec!["age".into(), "risk_score".into(), "total_claims".into()]);
        let b = FeatureSchema::new(vec!["age".into(), "total_claims".into(), "risk_score".into()]);
        let c = FeatureSchema::new(vec!["age".into(), "risk_score".into()]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.first_mismatch(&a.clone()), None);
        assert_eq!(a.first_mismatch(&b), Some(1));
        assert_eq!(a.first_mismatch(&c), Some(2));
    }

    #[test]
    fn member_seed_depends_on_id_and_base() {
        assert_eq!(member_seed(7, "M1"), member_seed(7, "M1"));
        assert_ne!(member_seed(7, "M1"), member_seed(7, "M2"));
        assert_ne!(member_seed(7, "M1"), member_seed(8, "M1"));
    }
}
