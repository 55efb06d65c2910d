//! Triangulation Validator
//!
//! Cross-checks the valid reports of a round and produces the candidate
//! positions the consensus engine votes on.

pub mod candidate;
pub mod validator;

pub use candidate::{
    Assessment, AssessmentStatus, CandidatePosition, Exclusion, ExclusionKind, ObserverReport,
    Strategy,
};
pub use validator::{TriangulationValidator, ValidatorConfig};
