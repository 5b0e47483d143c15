pub mod basis;
pub mod boosting;
pub mod cv;
pub mod elastic_net;
pub mod family;
pub mod forest;
pub mod gam;
pub mod glm;
pub mod linalg;
pub mod metrics;
pub mod scaling;
pub mod trainer;
pub mod tree;

pub use family::{CandidateSpec, FitError, FittedModel, ModelFamily, Task};
pub use trainer::{
    ModelPart, ModelTrainingFailure, Trainer, TrainerConfig, TrainingDataError, TrainingError,
    TrainingSummary,
};
