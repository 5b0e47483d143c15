//! Cost-driver analysis: per-member attribution, population ranking,
//! correlation, cost variation and the insights built on top of them.

pub mod aggregate;
pub mod insight;
pub mod shapley;
pub mod tree_shap;

pub use aggregate::{
    CorrelationTable, Direction, DriverRanking, DriverStat, FeatureCorrelation, VariationSummary,
};
pub use insight::{Insight, InsightConfig, InsightGenerator, InsightKind, feature_label};
pub use shapley::{
    AttributionConfig, AttributionFallbackWarning, AttributionMeta, AttributionRecord,
    CostDriverDecomposer, ExplainerKind, FeatureContribution, occlusion_attribution,
    sampled_permutation_shap,
};

use crate::features::FeatureBatch;
use crate::predict::StaleArtifactError;
use serde::{Deserialize, Serialize};

/// Everything the analysis endpoint reports for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostDriverAnalysis {
    pub artifact_version: u64,
    pub baseline: f64,
    pub records: Vec<AttributionRecord>,
    pub ranking: DriverRanking,
    pub correlations: CorrelationTable,
    pub variation: VariationSummary,
    pub insights: Vec<Insight>,
}

impl CostDriverAnalysis {
    pub fn fallback_warnings(&self) -> impl Iterator<Item = &AttributionFallbackWarning> {
        self.records.iter().flat_map(|r| r.meta.fallback.iter())
    }
}

/// Explains every member of `batch` and summarizes the result.
pub fn analyze_batch(
    decomposer: &CostDriverDecomposer,
    insights: &InsightGenerator,
    batch: &FeatureBatch,
) -> Result<CostDriverAnalysis, StaleArtifactError> {
    let records = decomposer.explain_batch(batch.vectors())?;
    let ranking = DriverRanking::from_records(batch.schema(), &records);
    let correlations = CorrelationTable::from_batch(batch);
    let variation = VariationSummary::from_costs(batch.total_costs().view());
    let insights = insights.generate(&ranking, &correlations, Some(&variation));

    let inefficient = records.iter().filter(|r| !r.meta.efficient).count();
    log::info!(
        "Explained {} members: {} insights, {} fallback warnings, {} records outside the efficiency tolerance",
        records.len(),
        insights.len(),
        records.iter().map(|r| r.meta.fallback.len()).sum::<usize>(),
        inefficient
    );

    Ok(CostDriverAnalysis {
        artifact_version: decomposer.artifact().version,
        baseline: decomposer.baseline(),
        records,
        ranking,
        correlations,
        variation,
        insights,
    })
}
