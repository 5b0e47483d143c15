//! Hierarchical condition categories: the reference taxonomy and the mapper that
//! turns a member's condition indicators into a risk score.

pub mod mapper;
pub mod taxonomy;

pub use mapper::{CategoryContribution, CategoryStatus, HccMapper, RiskScore};
pub use taxonomy::{ConditionCategory, ConditionTaxonomy, DemographicBand, TaxonomyError};
