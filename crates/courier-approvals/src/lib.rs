pub mod db;
pub mod engine;
pub mod error;
pub mod risk;
pub mod types;

pub use engine::{ApprovalEngine, DecideOutcome};
pub use error::{ApprovalError, Result};
pub use risk::{assess_risk, RiskAssessment};
pub use types::{Approval, ApprovalStatus, DecisionKind, RiskConfidence, RiskLevel};
