//! Feature pipeline: validates raw member rows and turns them into fixed-order
//! feature vectors plus the labels the two-part model trains on.
//!
//! The vectors produced here are unscaled. Scaling is fitted by the trainer and
//! stored in the model artifact, so that training and inference apply the exact
//! same transformation.

use crate::hcc::{ConditionTaxonomy, HccMapper};
use crate::types::{FeatureSchema, FeatureVector, Gender, MemberRecord, Outcome, RawMemberRow};
use ahash::AHashMap;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

/// Conditions that get their own indicator feature unless configured otherwise.
pub const DEFAULT_FEATURE_CONDITIONS: [&str; 7] = [
    "diabetes",
    "hypertension",
    "heart_disease",
    "copd",
    "cancer",
    "kidney_disease",
    "mental_health",
];

const CHRONIC_CONDITIONS: [&str; 4] = ["diabetes", "hypertension", "heart_disease", "copd"];
const HIGH_COST_CONDITIONS: [&str; 3] = ["cancer", "kidney_disease", "mental_health"];

pub const MAX_AGE: f64 = 120.0;
pub const ELDERLY_AGE: f64 = 65.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Row {row}: required field '{field}' is missing.")]
    MissingField { row: usize, field: &'static str },

    #[error("Row {row}: field '{field}' must be a finite number.")]
    NotFinite { row: usize, field: &'static str },

    #[error("Row {row}: field '{field}' has value {value}, expected {expected}.")]
    OutOfRange {
        row: usize,
        field: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("Row {row}: condition indicator '{condition}' must be a finite number.")]
    InvalidIndicator { row: usize, condition: String },

    #[error("Member id '{member_id}' appears in rows {first} and {second}.")]
    DuplicateMember {
        member_id: String,
        first: usize,
        second: usize,
    },
}

impl ValidationError {
    /// Name of the offending input field.
    pub fn field(&self) -> &str {
        match self {
            ValidationError::MissingField { field, .. }
            | ValidationError::NotFinite { field, .. }
            | ValidationError::OutOfRange { field, .. } => field,
            ValidationError::InvalidIndicator { condition, .. } => condition,
            ValidationError::DuplicateMember { .. } => "member_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Conditions exposed as individual indicator features, in feature order.
    pub feature_conditions: Vec<String>,
    /// Months of exposure behind `total_cost`; PMPM = total_cost / exposure_months.
    pub exposure_months: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feature_conditions: DEFAULT_FEATURE_CONDITIONS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            exposure_months: 12.0,
        }
    }
}

/// Defaults and normalizations applied to a single row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowQuality {
    pub defaulted_indicators: Vec<String>,
    pub unknown_conditions: Vec<String>,
    pub unknown_gender: bool,
    pub binarized_indicators: usize,
}

/// Batch-level counts of everything the pipeline had to impute or normalize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQualityReport {
    pub rows_processed: usize,
    pub defaulted_indicators: BTreeMap<String, usize>,
    pub unknown_conditions: BTreeMap<String, usize>,
    pub unknown_gender: usize,
    pub binarized_indicators: usize,
    pub zero_cost_members: usize,
}

impl DataQualityReport {
    fn absorb(&mut self, quality: &RowQuality, record: &MemberRecord) {
        self.rows_processed += 1;
        for name in &quality.defaulted_indicators {
            *self.defaulted_indicators.entry(name.clone()).or_default() += 1;
        }
        for name in &quality.unknown_conditions {
            *self.unknown_conditions.entry(name.clone()).or_default() += 1;
        }
        self.unknown_gender += usize::from(quality.unknown_gender);
        self.binarized_indicators += quality.binarized_indicators;
        self.zero_cost_members += usize::from(record.total_cost == 0.0);
    }

    pub fn total_defaulted(&self) -> usize {
        self.defaulted_indicators.values().sum()
    }

    fn log_summary(&self) {
        log::info!(
            "Feature pipeline processed {} rows ({} defaulted indicators, {} zero-cost members)",
            self.rows_processed,
            self.total_defaulted(),
            self.zero_cost_members
        );
        if self.unknown_gender > 0 {
            log::warn!(
                "{} rows had an unrecognized gender code and were encoded as unknown",
                self.unknown_gender
            );
        }
        if !self.unknown_conditions.is_empty() {
            log::warn!(
                "Unknown condition indicators were ignored: {:?}",
                self.unknown_conditions
            );
        }
    }
}

/// Output of the pipeline for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberFeatures {
    pub record: MemberRecord,
    pub features: FeatureVector,
    pub outcome: Outcome,
    pub quality: RowQuality,
}

/// A validated batch, row-aligned across records, vectors and outcomes.
#[derive(Debug, Clone)]
pub struct FeatureBatch {
    schema: Arc<FeatureSchema>,
    records: Vec<MemberRecord>,
    vectors: Vec<FeatureVector>,
    outcomes: Vec<Outcome>,
    quality: DataQualityReport,
}

impl FeatureBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    pub fn records(&self) -> &[MemberRecord] {
        &self.records
    }

    pub fn vectors(&self) -> &[FeatureVector] {
        &self.vectors
    }

    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    pub fn quality(&self) -> &DataQualityReport {
        &self.quality
    }

    /// Unscaled feature matrix, one row per member.
    pub fn design_matrix(&self) -> Array2<f64> {
        let mut x = Array2::zeros((self.vectors.len(), self.schema.len()));
        for (mut row, vector) in x.rows_mut().into_iter().zip(&self.vectors) {
            row.assign(vector.values());
        }
        x
    }

    /// Observed historical cost per member.
    pub fn total_costs(&self) -> Array1<f64> {
        self.records.iter().map(|r| r.total_cost).collect()
    }
}

pub struct FeaturePipeline {
    mapper: HccMapper,
    config: PipelineConfig,
    schema: Arc<FeatureSchema>,
}

impl FeaturePipeline {
    pub fn new(taxonomy: Arc<ConditionTaxonomy>, mut config: PipelineConfig) -> Self {
        let mut seen = BTreeSet::new();
        config.feature_conditions = config
            .feature_conditions
            .iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty() && seen.insert(c.clone()))
            .collect();
        for condition in &config.feature_conditions {
            if !taxonomy.knows_condition(condition) {
                log::warn!(
                    "Feature condition '{condition}' is not in taxonomy {}; it will not affect the risk score",
                    taxonomy.version()
                );
            }
        }

        let mut names = vec!["age".to_string(), "gender_female".to_string()];
        names.extend(config.feature_conditions.iter().cloned());
        names.extend(
            [
                "chronic_condition_count",
                "high_cost_condition_count",
                "elderly",
                "young_adult",
                "risk_score",
                "total_claims",
            ]
            .map(String::from),
        );

        Self {
            mapper: HccMapper::new(taxonomy),
            config,
            schema: Arc::new(FeatureSchema::new(names)),
        }
    }

    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    pub fn mapper(&self) -> &HccMapper {
        &self.mapper
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validates and featurizes a single row.
    pub fn build(&self, row: &RawMemberRow) -> Result<MemberFeatures, ValidationError> {
        self.build_at(0, row)
    }

    /// Featurizes a batch. Fails on the first invalid row in input order; no
    /// partial batch is returned.
    pub fn build_batch(&self, rows: &[RawMemberRow]) -> Result<FeatureBatch, ValidationError> {
        let built: Vec<Result<MemberFeatures, ValidationError>> = rows
            .par_iter()
            .enumerate()
            .map(|(i, row)| self.build_at(i, row))
            .collect();

        let mut first_seen: AHashMap<String, usize> = AHashMap::with_capacity(rows.len());
        let mut records = Vec::with_capacity(rows.len());
        let mut vectors = Vec::with_capacity(rows.len());
        let mut outcomes = Vec::with_capacity(rows.len());
        let mut quality = DataQualityReport::default();

        for (i, member) in built.into_iter().enumerate() {
            let member = member?;
            if let Some(&first) = first_seen.get(&member.record.member_id) {
                return Err(ValidationError::DuplicateMember {
                    member_id: member.record.member_id,
                    first,
                    second: i,
                });
            }
            first_seen.insert(member.record.member_id.clone(), i);
            quality.absorb(&member.quality, &member.record);
            records.push(member.record);
            vectors.push(member.features);
            outcomes.push(member.outcome);
        }

        quality.log_summary();
        Ok(FeatureBatch {
            schema: Arc::clone(&self.schema),
            records,
            vectors,
            outcomes,
            quality,
        })
    }

    fn build_at(&self, row: usize, raw: &RawMemberRow) -> Result<MemberFeatures, ValidationError> {
        let member_id = raw
            .member_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(ValidationError::MissingField {
                row,
                field: "member_id",
            })?
            .to_string();

        let age = required_number(row, "age", raw.age)?;
        if !(0.0..=MAX_AGE).contains(&age) {
            return Err(ValidationError::OutOfRange {
                row,
                field: "age",
                value: age,
                expected: "an age between 0 and 120",
            });
        }

        let raw_gender = raw
            .gender
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .ok_or(ValidationError::MissingField {
                row,
                field: "gender",
            })?;
        let gender = Gender::normalize(raw_gender);

        let total_cost = non_negative(row, "total_cost", raw.total_cost)?;
        let total_claims = non_negative(row, "total_claims", raw.total_claims)?;

        let mut quality = RowQuality {
            unknown_gender: gender == Gender::Unknown,
            ..RowQuality::default()
        };

        let mut conditions = BTreeSet::new();
        for (key, &value) in &raw.conditions {
            if !value.is_finite() {
                return Err(ValidationError::InvalidIndicator {
                    row,
                    condition: key.clone(),
                });
            }
            if value != 0.0 && value != 1.0 {
                quality.binarized_indicators += 1;
            }
            let key = key.trim().to_ascii_lowercase();
            if value > 0.0 && !key.is_empty() {
                conditions.insert(key);
            }
        }

        for condition in &self.config.feature_conditions {
            let supplied = raw
                .conditions
                .keys()
                .any(|k| k.trim().eq_ignore_ascii_case(condition));
            if !supplied {
                quality.defaulted_indicators.push(condition.clone());
            }
        }

        let risk = self
            .mapper
            .score_member(conditions.iter().map(String::as_str), age, gender);
        quality.unknown_conditions = risk.unknown_conditions.clone();

        let flag = |name: &str| f64::from(u8::from(conditions.contains(name)));
        let count = |names: &[&str]| names.iter().map(|n| flag(n)).sum::<f64>();

        let mut values = Vec::with_capacity(self.schema.len());
        values.push(age);
        values.push(gender.encode());
        values.extend(self.config.feature_conditions.iter().map(|c| flag(c)));
        values.push(count(&CHRONIC_CONDITIONS));
        values.push(count(&HIGH_COST_CONDITIONS));
        values.push(f64::from(u8::from(age >= ELDERLY_AGE)));
        values.push(f64::from(u8::from((18.0..=35.0).contains(&age))));
        values.push(risk.total);
        values.push(total_claims);

        let outcome = Outcome {
            utilized: total_cost > 0.0,
            pmpm: total_cost / self.config.exposure_months,
        };
        let features =
            FeatureVector::new(member_id.clone(), Arc::clone(&self.schema), Array1::from(values));
        let record = MemberRecord {
            member_id,
            age,
            gender,
            conditions,
            total_claims,
            total_cost,
            risk,
        };

        Ok(MemberFeatures {
            record,
            features,
            outcome,
            quality,
        })
    }
}

fn required_number(
    row: usize,
    field: &'static str,
    value: Option<f64>,
) -> Result<f64, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField { row, field })?;
    if !value.is_finite() {
        return Err(ValidationError::NotFinite { row, field });
    }
    Ok(value)
}

fn non_negative(
    row: usize,
    field: &'static str,
    value: Option<f64>,
) -> Result<f64, ValidationError> {
    let value = required_number(row, field, value)?;
    if value < 0.0 {
        return Err(ValidationError::OutOfRange {
            row,
            field,
            value,
            expected: "a non-negative value",
        });
    }
    Ok(value)
}
