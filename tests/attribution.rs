mod common;

use approx::assert_abs_diff_eq;
use common::{diabetic_member, single_family_config, synthetic_cohort};
use riskadjust::drivers::ExplainerKind;
use riskadjust::features::{FeaturePipeline, PipelineConfig};
use riskadjust::hcc::ConditionTaxonomy;
use riskadjust::models::boosting::BoostingParams;
use riskadjust::models::elastic_net::ElasticNetParams;
use riskadjust::models::forest::ForestParams;
use riskadjust::models::gam::GamParams;
use riskadjust::models::glm::GlmParams;
use riskadjust::models::{CandidateSpec, ModelFamily};
use riskadjust::{EngineConfig, EngineError, RiskEngine};
use std::sync::Arc;

fn small_forest() -> ForestParams {
    ForestParams {
        n_trees: 25,
        max_depth: 5,
        ..ForestParams::default()
    }
}

fn small_boosting() -> BoostingParams {
    BoostingParams {
        n_estimators: 40,
        ..BoostingParams::default()
    }
}

#[test]
fn attributions_add_up_for_every_family() {
    let cohort = synthetic_cohort(150, 17);
    let members = synthetic_cohort(25, 18);
    let specs = [
        CandidateSpec::ElasticNet(ElasticNetParams::default()),
        CandidateSpec::Glm(GlmParams::default()),
        CandidateSpec::Gam(GamParams::default()),
        CandidateSpec::RandomForest(small_forest()),
        CandidateSpec::GradientBoosting(small_boosting()),
    ];

    for spec in specs {
        let family = spec.family();
        let engine = RiskEngine::new(single_family_config(spec)).unwrap();
        let report = engine
            .train(&cohort)
            .unwrap_or_else(|e| panic!("{family} failed to train: {e}"));
        assert_eq!(report.summary.utilization.family, family);
        assert_eq!(report.summary.cost.family, family);

        let predictions = engine.predict(&members).unwrap();
        let analysis = engine.analyze(&members).unwrap();
        assert_eq!(analysis.records.len(), members.len());
        for record in &analysis.records {
            assert!(record.meta.efficient, "{family}: {:?}", record.meta);
            let predicted = predictions.get(&record.member_id).unwrap().predicted_pmpm;
            assert_abs_diff_eq!(record.prediction, predicted, epsilon = 1e-9 * predicted.max(1.0));
            assert_abs_diff_eq!(
                record.baseline + record.total_contribution(),
                predicted,
                epsilon = 1e-3 * predicted.max(record.baseline).max(1.0)
            );
            assert!(record.meta.fallback.is_empty());
            assert_eq!(record.contributions.len(), analysis.ranking.drivers.len());
        }

        if matches!(family, ModelFamily::RandomForest | ModelFamily::GradientBoosting) {
            assert!(
                analysis
                    .records
                    .iter()
                    .all(|r| r.meta.cost_method == ExplainerKind::TreeExact
                        || r.meta.cost_method == ExplainerKind::SampledPermutation)
            );
        }
    }
}

#[test]
fn features_built_under_another_ordering_are_rejected() {
    let engine = RiskEngine::new(single_family_config(CandidateSpec::Glm(GlmParams::default())))
        .unwrap();
    engine.train(&synthetic_cohort(80, 2)).unwrap();

    let reordered = FeaturePipeline::new(
        Arc::new(ConditionTaxonomy::builtin().unwrap()),
        PipelineConfig {
            feature_conditions: vec!["hypertension".into(), "diabetes".into()],
            ..PipelineConfig::default()
        },
    );
    let stale = reordered.build(&diabetic_member()).unwrap().features;

    let err = engine.predictor().unwrap().predict(&stale).unwrap_err();
    assert_eq!(err.artifact_version, 1);
    assert_eq!(err.position, 2);
    assert_eq!(err.expected.as_deref(), Some("diabetes"));
    assert_eq!(err.found.as_deref(), Some("hypertension"));
    assert!(err.to_string().contains("retrain"));

    let fresh = engine.pipeline().build(&diabetic_member()).unwrap().features;
    assert!(engine.predictor().unwrap().predict(&fresh).is_ok());
}

#[test]
fn disabled_sampling_falls_back_with_a_warning() {
    let mut config = single_family_config(CandidateSpec::GradientBoosting(small_boosting()));
    config.attribution.sampling = false;
    let engine = RiskEngine::new(config).unwrap();
    engine.train(&synthetic_cohort(120, 9)).unwrap();

    let analysis = engine.analyze(&[diabetic_member()]).unwrap();
    let record = &analysis.records[0];
    assert_eq!(record.meta.utilization_method, ExplainerKind::PermutationFallback);
    assert!(record.meta.efficient);
    let warnings: Vec<_> = analysis.fallback_warnings().collect();
    assert!(!warnings.is_empty());
    assert_eq!(warnings[0].member_id, "TARGET");
    assert!(warnings[0].reason.contains("disabled"));
}

#[test]
fn top_drivers_come_first_in_the_insights() {
    let engine = RiskEngine::new(EngineConfig::default()).unwrap();
    engine.train(&synthetic_cohort(150, 23)).unwrap();
    let analysis = engine.analyze(&synthetic_cohort(60, 24)).unwrap();

    assert!(!analysis.insights.is_empty());
    let ranks: Vec<usize> = analysis.insights.iter().map(|i| i.rank).collect();
    assert_eq!(ranks, (1..=ranks.len()).collect::<Vec<_>>());
    let ranking = &analysis.ranking.drivers;
    assert!(
        ranking
            .windows(2)
            .all(|w| w[0].mean_abs_contribution >= w[1].mean_abs_contribution)
    );
    assert!(matches!(
        engine.predict(&[]),
        Ok(set) if set.is_empty()
    ));
    assert!(!matches!(engine.predict(&[diabetic_member()]), Err(EngineError::NoArtifact)));
}
