//! Consensus round state.
//!
//! A round moves `Open → Collecting → Validating → Voted` and settles on a
//! verdict the first time a claimed position is checked against it. Once a
//! round leaves `Collecting` its ledger is frozen.

use crate::consensus::voting::{confidence, ConsensusResult, VotingConfig};
use crate::core::{now, Error, Hash256, ObserverId, Result, RoundId, RoundKey, Tick, Timestamp};
use crate::geometry::{solve_distance_only, Point3};
use crate::observation::{Observation, ObservationVerifier, RevealPayload, RoundLedger};
use crate::triangulation::{Assessment, AssessmentStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Round phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoundPhase {
    /// Accepting commitments, nothing revealed yet
    Open,
    /// At least one reveal admitted
    Collecting,
    /// Closed, triangulation running
    Validating,
    /// Tally done, no claim checked yet
    Voted,
    Accepted,
    Rejected,
    Inconclusive,
}

impl RoundPhase {
    /// Whether the round still admits observations.
    pub fn is_open(&self) -> bool {
        matches!(self, RoundPhase::Open | RoundPhase::Collecting)
    }
}

/// Why a round closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClosureReason {
    QuorumReached,
    Timeout,
    SubjectLeft,
}

impl fmt::Display for ClosureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosureReason::QuorumReached => write!(f, "quorum-reached"),
            ClosureReason::Timeout => write!(f, "timeout"),
            ClosureReason::SubjectLeft => write!(f, "subject-left"),
        }
    }
}

/// Verdict on a claimed position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    Rejected,
    Inconclusive,
}

impl From<Verdict> for RoundPhase {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Accepted => RoundPhase::Accepted,
            Verdict::Rejected => RoundPhase::Rejected,
            Verdict::Inconclusive => RoundPhase::Inconclusive,
        }
    }
}

/// What closing the round decided, independent of any claim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    /// Fewer than two usable reports
    Insufficient,
    /// Two reports: claims can only be checked for distance agreement
    DistanceOnly,
    /// Observer geometry too degenerate to solve
    Indeterminate(String),
    /// No candidate carries the quorum weight
    NoQuorum,
    /// The heaviest weight is shared
    Tie,
    /// The winner's reflection could not be resolved
    Ambiguous,
    /// A quorum-backed candidate
    Winner { candidate: usize },
    /// The subject left before the round completed
    Abandoned,
}

/// Answer to a position validation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub subject_id: String,
    pub round_id: RoundId,
    pub verdict: Verdict,
    pub confidence: f64,
    /// Winning candidate position
    pub candidate: Option<Point3>,
    pub contributing_observers: Vec<ObserverId>,
    pub phase: RoundPhase,
    pub closure_reason: Option<ClosureReason>,
    /// Short explanation of the verdict
    pub detail: String,
}

/// One validation attempt for one subject.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusRound {
    pub key: RoundKey,
    pub phase: RoundPhase,
    pub ledger: RoundLedger,
    pub created_tick: Tick,
    pub created_at: Timestamp,
    pub closed_tick: Option<Tick>,
    pub closed_at: Option<Timestamp>,
    pub closure_reason: Option<ClosureReason>,
    pub assessment: Option<Assessment>,
    pub tally: Option<ConsensusResult>,
    pub decision: Option<Decision>,
    /// First verdict issued after closure
    pub verdict: Option<Verdict>,
    pub confidence: f64,
}

impl ConsensusRound {
    /// Create an open round.
    pub fn new(key: RoundKey, tick: Tick) -> Self {
        Self {
            key,
            phase: RoundPhase::Open,
            ledger: RoundLedger::new(),
            created_tick: tick,
            created_at: now(),
            closed_tick: None,
            closed_at: None,
            closure_reason: None,
            assessment: None,
            tally: None,
            decision: None,
            verdict: None,
            confidence: 0.0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.phase.is_open()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::RoundClosed {
                subject_id: self.key.subject_id.clone(),
                round_id: self.key.round_id,
            })
        }
    }

    /// Record a commitment.
    pub fn commit(
        &mut self,
        observer_id: &str,
        position: Point3,
        weight: f64,
        commit_hash: Hash256,
        tick: Tick,
    ) -> Result<&Observation> {
        self.ensure_open()?;
        self.ledger.commit(
            observer_id,
            &self.key.subject_id,
            self.key.round_id,
            position,
            weight,
            commit_hash,
            tick,
        )
    }

    /// Open a commitment.
    pub fn reveal(
        &mut self,
        observer_id: &str,
        payload: &RevealPayload,
        tick: Tick,
        verifier: &dyn ObservationVerifier,
    ) -> Result<&Observation> {
        self.ensure_open()?;
        let observation = self.ledger.reveal(observer_id, payload, tick, verifier)?;
        self.phase = RoundPhase::Collecting;
        Ok(observation)
    }

    /// Enough valid reveals and nobody left to reveal.
    pub fn quorum_ready(&self, quorum: usize) -> bool {
        self.is_open() && self.ledger.valid_count() >= quorum && self.ledger.pending_count() == 0
    }

    pub fn timed_out(&self, tick: Tick, timeout: Tick) -> bool {
        self.is_open() && tick.saturating_sub(self.created_tick) >= timeout
    }

    /// Freeze the round. Returns `false` if it was already closed, so the
    /// caller that gets `true` is the only one to finish it.
    pub fn begin_close(&mut self, reason: ClosureReason, tick: Tick) -> bool {
        if !self.is_open() {
            return false;
        }
        self.phase = RoundPhase::Validating;
        self.closure_reason = Some(reason);
        self.closed_tick = Some(tick);
        self.closed_at = Some(now());
        true
    }

    /// Record the outcome of triangulation and voting.
    pub fn finish(&mut self, assessment: Option<Assessment>, tally: Option<ConsensusResult>, decision: Decision) {
        self.phase = if decision == Decision::Abandoned {
            self.verdict = Some(Verdict::Inconclusive);
            RoundPhase::Inconclusive
        } else {
            RoundPhase::Voted
        };
        self.assessment = assessment;
        self.tally = tally;
        self.decision = Some(decision);
    }

    /// Judge a claimed position against the closed round.
    ///
    /// Pure over the round's closed state: the same claim always yields the
    /// same report.
    pub fn evaluate(&self, claim: &Point3, voting: &VotingConfig) -> ValidationReport {
        let mut report = ValidationReport {
            subject_id: self.key.subject_id.clone(),
            round_id: self.key.round_id,
            verdict: Verdict::Inconclusive,
            confidence: 0.0,
            candidate: None,
            contributing_observers: Vec::new(),
            phase: self.phase,
            closure_reason: self.closure_reason,
            detail: String::new(),
        };

        let (Some(decision), Some(assessment)) = (&self.decision, &self.assessment) else {
            report.detail = match self.closure_reason {
                Some(ClosureReason::SubjectLeft) => "subject left".to_string(),
                _ => "round still open".to_string(),
            };
            return report;
        };
        if !claim.is_finite() {
            report.detail = "claimed position is not finite".to_string();
            return report;
        }

        let tolerance = assessment.tolerance;
        match decision {
            Decision::Insufficient => report.detail = "insufficient observers".to_string(),
            Decision::Indeterminate(why) => report.detail = format!("indeterminate: {}", why),
            Decision::NoQuorum => report.detail = "no candidate reached quorum".to_string(),
            Decision::Tie => report.detail = "candidates tied".to_string(),
            Decision::Ambiguous => report.detail = "reflection ambiguous".to_string(),
            Decision::Abandoned => report.detail = "subject left".to_string(),
            Decision::DistanceOnly => {
                if let Ok(check) = solve_distance_only(&assessment.ranges, claim, tolerance) {
                    let agreeing = check.consistent_count();
                    report.confidence = confidence(agreeing).min(voting.distance_only_ceiling);
                    report.contributing_observers = check.consistent_observers();
                }
                report.detail = "two observers cannot fix a position".to_string();
            }
            Decision::Winner { candidate } => {
                if let Some(winner) = assessment.candidates.get(*candidate) {
                    report.candidate = Some(winner.position);
                    report.contributing_observers = winner.consistent_observers.clone();
                    report.confidence = confidence(winner.backer_count());
                    if winner.matches(claim, tolerance) {
                        report.verdict = Verdict::Accepted;
                        report.detail = "claim matches the quorum candidate".to_string();
                    } else {
                        report.verdict = Verdict::Rejected;
                        report.detail = format!(
                            "claim is {:.3} from the quorum candidate",
                            winner.position.distance_to(claim)
                        );
                    }
                }
            }
        }
        report
    }

    /// Settle the round on its first verdict. Later verdicts leave it as is.
    pub fn record_verdict(&mut self, report: &ValidationReport) -> bool {
        if self.phase != RoundPhase::Voted {
            return false;
        }
        self.verdict = Some(report.verdict);
        self.confidence = report.confidence;
        self.phase = report.verdict.into();
        true
    }
}

/// Turn an assessment and its tally into a decision.
pub fn decide(assessment: &Assessment, tally: &ConsensusResult) -> Decision {
    match &assessment.status {
        AssessmentStatus::Insufficient => Decision::Insufficient,
        AssessmentStatus::DistanceOnly => Decision::DistanceOnly,
        AssessmentStatus::Indeterminate(why) => Decision::Indeterminate(why.clone()),
        AssessmentStatus::Solved => match tally.winner {
            Some(index) if assessment.candidates[index].is_ambiguous() => Decision::Ambiguous,
            Some(index) => Decision::Winner { candidate: index },
            None if tally.tie => Decision::Tie,
            None => Decision::NoQuorum,
        },
    }
}
