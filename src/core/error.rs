//! Error types for Triangulum.

use crate::core::types::RoundId;
use thiserror::Error;

/// Result type alias for Triangulum operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while collecting, solving or voting on observations.
#[derive(Error, Debug)]
pub enum Error {
    // Commit/reveal errors
    #[error("Observer {observer_id} already committed to round {round_id}")]
    DuplicateCommit { observer_id: String, round_id: RoundId },

    #[error("Round {round_id} of subject {subject_id} is closed")]
    RoundClosed { subject_id: String, round_id: RoundId },

    #[error("Reveal from observer {0} does not match its commitment")]
    RevealHashMismatch(String),

    #[error("Observer {0} has no commitment in this round")]
    NoCommitment(String),

    #[error("Observer {0} already revealed in this round")]
    DuplicateReveal(String),

    #[error("Observer {observer_id} revealed in the same tick as its commit ({commit_tick})")]
    RevealTooEarly { observer_id: String, commit_tick: u64 },

    #[error("Observer {0} is excluded from this round")]
    ObserverExcluded(String),

    #[error("Malformed measurement from observer {observer_id}: {detail}")]
    MalformedMeasurement { observer_id: String, detail: String },

    #[error("Verification hook rejected observer {0}")]
    VerificationRejected(String),

    // Geometry errors
    #[error("Insufficient observers: need {need}, have {have}")]
    InsufficientObservers { need: usize, have: usize },

    #[error("Observer {0} violates the triangle inequality")]
    GeometricallyInconsistent(String),

    #[error("Indeterminate geometry: {0}")]
    Indeterminate(String),

    // Structural errors
    #[error("Round {round_id} of subject {subject_id} not found")]
    RoundNotFound { subject_id: String, round_id: RoundId },

    #[error("Subject not found: {0}")]
    SubjectNotFound(String),

    #[error("Observer not found: {0}")]
    ObserverNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error must be surfaced to the caller.
    ///
    /// Everything else is a per-observation problem that the engine absorbs
    /// into a rejected receipt and the audit trail.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::RoundNotFound { .. }
                | Error::SubjectNotFound(_)
                | Error::ObserverNotFound(_)
                | Error::InvalidConfig(_)
                | Error::Serialization(_)
                | Error::Io(_)
        )
    }

    /// Whether the error permanently excludes the observer from its round.
    pub fn excludes_observer(&self) -> bool {
        matches!(
            self,
            Error::RevealHashMismatch(_)
                | Error::VerificationRejected(_)
                | Error::MalformedMeasurement { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
