#![deny(unused_variables)]

pub mod artifact;
pub mod config;
pub mod features;
pub mod pipeline;
pub mod predict;
pub mod types;

#[path = "../hcc/mod.rs"]
pub mod hcc;

#[path = "../models/mod.rs"]
pub mod models;

#[path = "../drivers/mod.rs"]
pub mod drivers;

pub use artifact::{ArtifactStore, ModelArtifact};
pub use config::{ConfigError, EngineConfig};
pub use features::{FeatureBatch, FeaturePipeline, ValidationError};
pub use pipeline::{EngineError, RiskEngine, TrainingReport};
pub use predict::{PredictionResult, PredictionSet, Predictor, RiskTier, StaleArtifactError};
pub use types::{FeatureSchema, FeatureVector, Gender, MemberRecord, RawMemberRow};
