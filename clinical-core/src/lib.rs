pub mod decision;
pub mod error;
pub mod extract;
pub mod knowledge;
pub mod model;
pub mod terms;

// Re-export commonly used types
pub use decision::{Decision, DecisionSource, Outcome, decide, fallback_decision};
pub use error::{CoreError, Result};
pub use extract::{BloodPressure, ClinicalData, extract_clinical_data};
pub use knowledge::{
    AppealCriteria, CkdStage, Clock, Complication, KnowledgeBase, KnowledgeCache, SystemClock,
};
pub use model::DecisionModel;
pub use terms::{TermExpansion, expand_terms};
