use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Poisson};
use riskadjust::models::CandidateSpec;
use riskadjust::{EngineConfig, RawMemberRow};

pub const CONDITIONS: [&str; 7] = [
    "diabetes",
    "hypertension",
    "heart_disease",
    "copd",
    "cancer",
    "kidney_disease",
    "mental_health",
];

/// A reproducible claims cohort. Chronic conditions raise both the chance of
/// any utilization and the annual cost of utilizers; roughly a fifth of the
/// members have no cost at all.
pub fn synthetic_cohort(n: usize, seed: u64) -> Vec<RawMemberRow> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 800.0).unwrap();

    (0..n)
        .map(|i| {
            let age: f64 = rng.gen_range(20.0..85.0);
            let female = rng.gen_bool(0.5);
            let elderly_boost = if age >= 65.0 { 0.15 } else { 0.0 };
            let prevalence = [
                0.25 + elderly_boost,
                0.35 + elderly_boost,
                0.12 + elderly_boost,
                0.08,
                0.05,
                0.06,
                0.15,
            ];
            let flags: Vec<bool> = prevalence.iter().map(|&p| rng.gen_bool(p)).collect();
            let has = |k: usize| if flags[k] { 1.0 } else { 0.0 };

            let logit = -0.2 + 1.4 * has(0) + 0.9 * has(1) + 1.0 * has(2) + 0.02 * (age - 50.0);
            let utilized = rng.gen_bool(1.0 / (1.0 + (-logit).exp()));

            let claims_rate = 1.0 + 3.0 * has(0) + 2.0 * has(1) + 2.5 * has(2) + 4.0 * has(4);
            let claims: f64 = Poisson::new(claims_rate).unwrap().sample(&mut rng);

            let cost = if utilized {
                let mean = 3000.0
                    + 6000.0 * has(0)
                    + 4000.0 * has(1)
                    + 5000.0 * has(2)
                    + 1500.0 * has(3)
                    + 9000.0 * has(4)
                    + 3000.0 * has(5)
                    + 30.0 * (age - 50.0);
                (mean + noise.sample(&mut rng)).max(250.0)
            } else {
                0.0
            };

            let mut row = RawMemberRow::new(format!("M{i:04}"))
                .with_age(age.round())
                .with_gender(if female { "F" } else { "M" })
                .with_claims(claims)
                .with_cost(cost);
            for (k, condition) in CONDITIONS.iter().enumerate() {
                row = row.with_condition(*condition, has(k));
            }
            row
        })
        .collect()
}

/// The 45-year-old diabetic, hypertensive member used across scenarios.
pub fn diabetic_member() -> RawMemberRow {
    RawMemberRow::new("TARGET")
        .with_age(45.0)
        .with_gender("F")
        .with_claims(12.0)
        .with_cost(8000.0)
        .with_condition("diabetes", 1.0)
        .with_condition("hypertension", 1.0)
}

/// Defaults with a single candidate family and a lighter fold count.
pub fn single_family_config(spec: CandidateSpec) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.training.candidates = vec![spec];
    config.training.k_folds = 3;
    config
}
