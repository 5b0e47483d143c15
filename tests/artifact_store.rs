mod common;

use common::{diabetic_member, single_family_config, synthetic_cohort};
use riskadjust::models::elastic_net::ElasticNetParams;
use riskadjust::models::glm::GlmParams;
use riskadjust::models::trainer::CandidateStatus;
use riskadjust::models::{CandidateSpec, ModelFamily, TrainingError};
use riskadjust::{EngineError, RawMemberRow, RiskEngine};
use std::sync::Barrier;

fn engine() -> RiskEngine {
    RiskEngine::new(single_family_config(CandidateSpec::Glm(GlmParams::default())))
        .expect("engine")
}

/// An elastic net that gives up after one sweep, so it can never converge.
fn starved_elastic_net() -> CandidateSpec {
    CandidateSpec::ElasticNet(ElasticNetParams {
        max_iterations: 1,
        ..ElasticNetParams::default()
    })
}

fn zero_cost_rows(n: usize) -> Vec<RawMemberRow> {
    (0..n)
        .map(|i| {
            RawMemberRow::new(format!("Z{i}"))
                .with_age(30.0 + i as f64)
                .with_gender("M")
                .with_claims(0.0)
                .with_cost(0.0)
        })
        .collect()
}

#[test]
fn failed_training_keeps_the_published_artifact() {
    let engine = engine();
    let first = engine.train(&synthetic_cohort(60, 1)).expect("first run");
    assert_eq!(first.artifact_version, 1);
    assert_eq!(first.summary.cost.family, ModelFamily::Glm);

    let err = engine.train(&synthetic_cohort(2, 2)).unwrap_err();
    assert!(matches!(err, EngineError::Training(_)));
    assert_eq!(engine.store().version(), Some(1));

    let second = engine.train(&synthetic_cohort(60, 3)).expect("second run");
    assert_eq!(second.artifact_version, 2);
}

#[test]
fn readers_always_see_a_complete_artifact_while_training_runs() {
    let engine = engine();
    engine.train(&synthetic_cohort(80, 5)).expect("initial artifact");
    let member = [diabetic_member()];

    std::thread::scope(|scope| {
        let trainer = scope.spawn(|| engine.train(&synthetic_cohort(200, 6)));
        for _ in 0..50 {
            let predictor = engine.predictor().expect("an artifact is always available");
            let version = predictor.artifact().version;
            assert!(version == 1 || version == 2);
            let set = predictor
                .predict_batch(engine.featurize(&member).unwrap().vectors())
                .unwrap();
            assert_eq!(set.artifact_version, version);
            assert_eq!(set.get("TARGET").unwrap().context.artifact_version, version);
        }
        let report = trainer.join().unwrap().expect("background run");
        assert_eq!(report.artifact_version, 2);
    });
    assert_eq!(engine.store().version(), Some(2));
}

#[test]
fn overlapping_try_train_calls_publish_at_most_once_each() {
    let engine = engine();
    let rows = synthetic_cohort(150, 8);
    let barrier = Barrier::new(2);

    let outcomes: Vec<Result<u64, EngineError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    engine.try_train(&rows).map(|r| r.artifact_version)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let published: Vec<u64> = outcomes.iter().filter_map(|o| o.as_ref().ok().copied()).collect();
    assert!(!published.is_empty());
    for outcome in &outcomes {
        if let Err(e) = outcome {
            assert!(matches!(e, EngineError::TrainingInProgress), "unexpected error {e}");
        }
    }
    assert_eq!(engine.store().version(), published.iter().max().copied());
}

#[test]
fn a_failing_candidate_is_skipped_and_the_next_one_selected() {
    let mut config = single_family_config(starved_elastic_net());
    config
        .training
        .candidates
        .push(CandidateSpec::Glm(GlmParams::default()));
    let engine = RiskEngine::new(config).expect("engine");

    let report = engine.train(&synthetic_cohort(120, 12)).expect("glm carries the run");
    for part in [&report.summary.utilization, &report.summary.cost] {
        assert_eq!(part.family, ModelFamily::Glm);
        assert_eq!(part.leaderboard.len(), 2);
        let skipped = &part.leaderboard[0];
        assert_eq!(skipped.family, ModelFamily::ElasticNet);
        assert!(!skipped.selected);
        assert!(
            matches!(&skipped.status, CandidateStatus::Failed { reason } if reason.contains("converge")),
            "{:?}",
            skipped.status
        );
        assert!(part.leaderboard[1].selected);
    }
}

#[test]
fn all_candidates_failing_keeps_the_published_artifact() {
    let engine = RiskEngine::new(single_family_config(starved_elastic_net())).expect("engine");

    // Degenerate labels need no candidate, so this run publishes constant parts.
    let first = engine.train(&zero_cost_rows(6)).expect("constant run");
    assert_eq!(first.summary.cost.family, ModelFamily::Constant);
    assert_eq!(engine.store().version(), Some(1));

    let err = engine.train(&synthetic_cohort(120, 13)).unwrap_err();
    match err {
        EngineError::Training(TrainingError::Model(failure)) => {
            assert_eq!(failure.failures.len(), 1);
            assert_eq!(failure.failures[0].0, ModelFamily::ElasticNet);
            assert!(failure.to_string().contains("Every candidate failed"));
        }
        other => panic!("expected a model training failure, got {other}"),
    }
    assert_eq!(engine.store().version(), Some(1));
    assert_eq!(
        engine.current_artifact().unwrap().summary.cost.family,
        ModelFamily::Constant
    );
}
