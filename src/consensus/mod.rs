//! Consensus Module
//!
//! Turns revealed observations into verdicts:
//! - Round lifecycle and closure
//! - Weighted Byzantine voting with a 2/3 quorum
//! - The engine that ties observation, triangulation and voting together

pub mod clock;
pub mod config;
pub mod engine;
pub mod oracle;
pub mod round;
pub mod subject;
pub mod voting;

pub use clock::RoundClock;
pub use config::{EngineConfig, RoundConfig};
pub use engine::{ConsensusEngine, SubmissionReceipt, ValidationMetrics};
pub use oracle::PredictionOracle;
pub use round::{decide, ClosureReason, ConsensusRound, Decision, RoundPhase, ValidationReport, Verdict};
pub use subject::Subject;
pub use voting::{confidence, ByzantineVoting, CandidateTally, ConsensusResult, VotingConfig};
