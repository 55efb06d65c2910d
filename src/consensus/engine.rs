//! Consensus engine orchestrating rounds, triangulation and voting.
//!
//! The engine is the only entry point the transport layer needs. All calls
//! are synchronous and never block on I/O; the engine is `Send + Sync` and
//! is meant to be shared behind an `Arc`.
//!
//! Per-observation problems (duplicate commits, late reveals, hash
//! mismatches) never fail a call: they come back as a rejected
//! [`SubmissionReceipt`] and are recorded in the audit trail. Only
//! structural errors such as an unknown round are returned as `Err`.

use crate::audit::{AuditEntry, AuditEvent, AuditTrail};
use crate::consensus::config::EngineConfig;
use crate::consensus::oracle::PredictionOracle;
use crate::consensus::round::{decide, ClosureReason, ConsensusRound, Decision, ValidationReport, Verdict};
use crate::consensus::subject::Subject;
use crate::consensus::voting::ByzantineVoting;
use crate::core::types::{lock, read, write};
use crate::core::{Error, Hash256, Result, RoundKey, SubjectId, Tick};
use crate::geometry::Point3;
use crate::monitoring::init_logging;
use crate::observation::{
    AcceptAll, ObservationStore, ObservationVerifier, Observer, ObserverRegistry, RevealPayload,
};
use crate::triangulation::{Assessment, AssessmentStatus, ExclusionKind, TriangulationValidator};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Answer to a commit or reveal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub accepted: bool,
    /// Why the submission was refused
    pub reason: Option<String>,
    /// Set when this submission closed the round
    pub closed: Option<ClosureReason>,
}

impl SubmissionReceipt {
    fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
            closed: None,
        }
    }

    fn rejected(err: &Error) -> Self {
        Self {
            accepted: false,
            reason: Some(err.to_string()),
            closed: None,
        }
    }
}

/// Engine counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub rounds_opened: u64,
    pub closed_by_quorum: u64,
    pub closed_by_timeout: u64,
    pub closed_by_departure: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub inconclusive: u64,
    pub byzantine_flags: u64,
    pub malformed_reveals: u64,
    pub geometric_exclusions: u64,
    pub indeterminate_rounds: u64,
    /// Mean confidence over issued verdicts
    pub average_confidence: f64,
}

impl ValidationMetrics {
    pub fn rounds_closed(&self) -> u64 {
        self.closed_by_quorum + self.closed_by_timeout + self.closed_by_departure
    }

    pub fn verdicts(&self) -> u64 {
        self.accepted + self.rejected + self.inconclusive
    }

    fn record_closure(&mut self, reason: ClosureReason) {
        match reason {
            ClosureReason::QuorumReached => self.closed_by_quorum += 1,
            ClosureReason::Timeout => self.closed_by_timeout += 1,
            ClosureReason::SubjectLeft => self.closed_by_departure += 1,
        }
    }

    fn record_verdict(&mut self, verdict: Verdict, confidence: f64) {
        match verdict {
            Verdict::Accepted => self.accepted += 1,
            Verdict::Rejected => self.rejected += 1,
            Verdict::Inconclusive => self.inconclusive += 1,
        }
        let n = self.verdicts() as f64;
        self.average_confidence = (self.average_confidence * (n - 1.0) + confidence) / n;
    }
}

/// Byzantine-tolerant position validation engine.
pub struct ConsensusEngine {
    config: EngineConfig,
    store: ObservationStore,
    observers: ObserverRegistry,
    subjects: RwLock<HashMap<SubjectId, Subject>>,
    validator: TriangulationValidator,
    voting: ByzantineVoting,
    oracle: Option<Arc<dyn PredictionOracle>>,
    verifier: Arc<dyn ObservationVerifier>,
    audit: AuditTrail,
    metrics: Mutex<ValidationMetrics>,
    tick: AtomicU64,
}

impl ConsensusEngine {
    /// Create a new engine.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EngineConfig) -> Self {
        Self {
            store: ObservationStore::new(config.rounds.clone()),
            observers: ObserverRegistry::new(config.reliability.clone()),
            subjects: RwLock::new(HashMap::new()),
            validator: TriangulationValidator::new(config.geometry.clone(), config.validator.clone()),
            voting: ByzantineVoting::new(config.voting.clone()),
            oracle: None,
            verifier: Arc::new(AcceptAll),
            audit: AuditTrail::new(config.rounds.audit_capacity),
            metrics: Mutex::new(ValidationMetrics::default()),
            tick: AtomicU64::new(0),
            config,
        }
    }

    /// Install a prediction oracle for reflection tie-breaks.
    pub fn with_oracle(mut self, oracle: impl PredictionOracle + 'static) -> Self {
        self.oracle = Some(Arc::new(oracle));
        self
    }

    /// Install a reveal verifier.
    pub fn with_verifier(mut self, verifier: impl ObservationVerifier + 'static) -> Self {
        self.verifier = Arc::new(verifier);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Install the global subscriber described by the `logging` section.
    ///
    /// Returns `false` if the host already installed one.
    pub fn init_logging(&self) -> bool {
        init_logging(&self.config.logging)
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    /// Snapshot of the counters.
    pub fn metrics(&self) -> ValidationMetrics {
        lock(&self.metrics).clone()
    }

    pub fn current_tick(&self) -> Tick {
        self.tick.load(Ordering::SeqCst)
    }

    /// Advance one tick, closing timed-out rounds and evicting old ones.
    pub fn tick(&self) -> Tick {
        self.advance(1)
    }

    /// Advance several ticks at once.
    pub fn advance(&self, ticks: Tick) -> Tick {
        let tick = self.tick.fetch_add(ticks, Ordering::SeqCst) + ticks;
        self.expire_rounds(tick);
        self.store.evict(tick);
        tick
    }

    fn expire_rounds(&self, tick: Tick) {
        let timeout = self.config.rounds.timeout_ticks;
        for (_, handle) in self.store.handles() {
            let mut round = lock(&handle);
            if round.timed_out(tick, timeout) {
                self.close_locked(&mut round, ClosureReason::Timeout, tick);
            }
        }
    }

    /// Register an observer or update its position.
    pub fn register_observer(&self, observer_id: &str, position: Point3) -> Result<Observer> {
        self.observers.register(observer_id, position)
    }

    pub fn observer(&self, observer_id: &str) -> Option<Observer> {
        self.observers.get(observer_id)
    }

    /// Record a subject's claimed position and velocity.
    pub fn update_subject(
        &self,
        subject_id: &str,
        claimed_position: Option<Point3>,
        claimed_velocity: Option<Point3>,
    ) {
        let mut subjects = write(&self.subjects);
        let subject = subjects
            .entry(subject_id.to_string())
            .or_insert_with(|| Subject::new(subject_id));
        if claimed_position.is_some() {
            subject.claimed_position = claimed_position;
        }
        if claimed_velocity.is_some() {
            subject.claimed_velocity = claimed_velocity;
        }
    }

    pub fn subject(&self, subject_id: &str) -> Option<Subject> {
        read(&self.subjects).get(subject_id).cloned()
    }

    /// Record an observer's commitment for a round, opening the round on
    /// first use.
    pub fn commit_observation(
        &self,
        observer_id: &str,
        subject_id: &str,
        round_id: u64,
        commit_hash: Hash256,
    ) -> Result<SubmissionReceipt> {
        let (position, weight) = self.observers.snapshot(observer_id)?;
        let key = RoundKey::new(subject_id, round_id);
        let tick = self.current_tick();

        let (handle, created) = match self.store.get_or_open(&key, tick) {
            Ok(found) => found,
            Err(err) => return self.absorb(&key, observer_id, err),
        };
        if created {
            lock(&self.metrics).rounds_opened += 1;
            write(&self.subjects)
                .entry(subject_id.to_string())
                .or_insert_with(|| Subject::new(subject_id));
        }

        let mut round = lock(&handle);
        if round.timed_out(tick, self.config.rounds.timeout_ticks) {
            self.close_locked(&mut round, ClosureReason::Timeout, tick);
        }
        match round.commit(observer_id, position, weight, commit_hash, tick) {
            Ok(_) => {
                debug!(round = %key, observer = observer_id, tick, "commitment recorded");
                Ok(SubmissionReceipt::accepted())
            }
            Err(err) => self.absorb(&key, observer_id, err),
        }
    }

    /// Reveal the measurement behind an earlier commitment.
    pub fn reveal_observation(
        &self,
        observer_id: &str,
        subject_id: &str,
        round_id: u64,
        payload: &RevealPayload,
    ) -> Result<SubmissionReceipt> {
        let key = RoundKey::new(subject_id, round_id);
        if self.store.get(&key).is_none() && self.store.is_evicted(&key) {
            let err = Error::RoundClosed {
                subject_id: subject_id.to_string(),
                round_id,
            };
            return self.absorb(&key, observer_id, err);
        }
        let handle = self.store.require(&key)?;
        let tick = self.current_tick();

        let mut round = lock(&handle);
        if round.timed_out(tick, self.config.rounds.timeout_ticks) {
            self.close_locked(&mut round, ClosureReason::Timeout, tick);
        }
        let mut receipt = match round.reveal(observer_id, payload, tick, self.verifier.as_ref()) {
            Ok(_) => {
                debug!(round = %key, observer = observer_id, tick, "reveal admitted");
                SubmissionReceipt::accepted()
            }
            // An excluded final reveal can still complete the quorum.
            Err(err) => self.absorb(&key, observer_id, err)?,
        };
        if round.quorum_ready(self.config.rounds.quorum_observers)
            && self.close_locked(&mut round, ClosureReason::QuorumReached, tick)
        {
            receipt.closed = Some(ClosureReason::QuorumReached);
        }
        Ok(receipt)
    }

    /// Judge a claimed position against a round.
    ///
    /// An open round yields `Inconclusive` with zero confidence and stays
    /// open. For a closed round the answer depends only on the round and the
    /// claim, so repeated calls agree.
    pub fn validate_position(
        &self,
        subject_id: &str,
        round_id: u64,
        claimed_position: Point3,
    ) -> Result<ValidationReport> {
        let key = RoundKey::new(subject_id, round_id);
        let handle = self.store.require(&key)?;
        let mut round = lock(&handle);
        let mut report = round.evaluate(&claimed_position, &self.config.voting);
        if round.is_open() {
            return Ok(report);
        }

        if round.record_verdict(&report) {
            report.phase = round.phase;
            lock(&self.metrics).record_verdict(report.verdict, report.confidence);
            self.audit.record(
                AuditEntry::new(&key, self.current_tick(), AuditEvent::VerdictIssued)
                    .with_detail("verdict", report.verdict)
                    .with_detail("confidence", report.confidence)
                    .with_detail("claimed_position", claimed_position),
            );
            if report.verdict == Verdict::Accepted {
                if let Some(subject) = write(&self.subjects).get_mut(subject_id) {
                    subject.last_accepted = Some((claimed_position, round.created_tick));
                }
            }
            info!(
                round = %key,
                verdict = ?report.verdict,
                confidence = report.confidence,
                "verdict issued"
            );
        }
        Ok(report)
    }

    /// Close a round on behalf of the host.
    ///
    /// Returns `false` if the round was already closed.
    pub fn close_round(&self, subject_id: &str, round_id: u64, reason: ClosureReason) -> Result<bool> {
        let key = RoundKey::new(subject_id, round_id);
        let handle = self.store.require(&key)?;
        let mut round = lock(&handle);
        Ok(self.close_locked(&mut round, reason, self.current_tick()))
    }

    /// The subject left the simulation: close its open rounds as
    /// `SubjectLeft` and forget it. Returns the number of rounds closed.
    pub fn subject_left(&self, subject_id: &str) -> usize {
        let tick = self.current_tick();
        let mut closed = 0;
        for (_, handle) in self.store.rounds_for_subject(subject_id) {
            let mut round = lock(&handle);
            if self.close_locked(&mut round, ClosureReason::SubjectLeft, tick) {
                closed += 1;
            }
        }
        write(&self.subjects).remove(subject_id);
        info!(subject = subject_id, closed, "subject left");
        closed
    }

    /// Copy of a round's current state.
    pub fn round(&self, subject_id: &str, round_id: u64) -> Result<ConsensusRound> {
        let handle = self.store.require(&RoundKey::new(subject_id, round_id))?;
        let round = lock(&handle).clone();
        Ok(round)
    }

    /// Keys of every round still admitting observations.
    pub fn open_rounds(&self) -> Vec<RoundKey> {
        let mut keys: Vec<RoundKey> = self
            .store
            .handles()
            .into_iter()
            .filter(|(_, handle)| lock(handle).is_open())
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        keys
    }

    /// Turn a per-observation error into a receipt; structural errors pass
    /// through.
    fn absorb(&self, key: &RoundKey, observer_id: &str, err: Error) -> Result<SubmissionReceipt> {
        if err.is_structural() {
            return Err(err);
        }
        let tick = self.current_tick();
        let event = match &err {
            Error::RevealHashMismatch(_) => Some(AuditEvent::ByzantineReveal),
            Error::VerificationRejected(_) => Some(AuditEvent::VerificationRejected),
            Error::MalformedMeasurement { .. } => Some(AuditEvent::MalformedMeasurement),
            _ => None,
        };
        if let Some(event) = event {
            warn!(round = %key, observer = observer_id, error = %err, "observer excluded from round");
            self.audit.record(
                AuditEntry::new(key, tick, event)
                    .with_observer(observer_id)
                    .with_detail("error", err.to_string()),
            );
            let mut metrics = lock(&self.metrics);
            if event == AuditEvent::MalformedMeasurement {
                metrics.malformed_reveals += 1;
            } else {
                metrics.byzantine_flags += 1;
                drop(metrics);
                self.observers.record_byzantine(observer_id);
            }
        } else {
            debug!(round = %key, observer = observer_id, error = %err, "submission refused");
        }
        Ok(SubmissionReceipt::rejected(&err))
    }

    /// Prior for reflection tie-breaks: history first, then the oracle.
    fn prior_for(&self, round: &ConsensusRound) -> Option<Point3> {
        let history = read(&self.subjects)
            .get(&round.key.subject_id)
            .and_then(|s| s.extrapolate(round.created_tick));
        history.or_else(|| {
            self.oracle
                .as_ref()
                .and_then(|o| o.predict_position(&round.key.subject_id, round.created_at))
        })
    }

    /// Close a locked round exactly once: triangulate, tally, settle
    /// reliability and archive it.
    fn close_locked(&self, round: &mut ConsensusRound, reason: ClosureReason, tick: Tick) -> bool {
        if !round.begin_close(reason, tick) {
            return false;
        }
        let key = round.key.clone();

        if reason == ClosureReason::SubjectLeft {
            round.finish(None, None, Decision::Abandoned);
            lock(&self.metrics).record_verdict(Verdict::Inconclusive, 0.0);
        } else {
            let reports = round.ledger.valid_reports();
            let prior = self.prior_for(round);
            let assessment = self.validator.assess(&reports, prior.as_ref());
            let tally = self.voting.tally(&assessment.candidates, &assessment.participants);
            let decision = decide(&assessment, &tally);
            self.record_assessment(&key, &assessment, tick);

            if let Decision::Winner { candidate } = &decision {
                let backers = &assessment.candidates[*candidate].consistent_observers;
                self.observers
                    .apply_outcome(&assessment.participant_ids(), backers);
            }
            debug!(round = %key, decision = ?decision, "round decided");
            round.finish(Some(assessment), Some(tally), decision);
        }

        lock(&self.metrics).record_closure(reason);
        self.audit.record(
            AuditEntry::new(&key, tick, AuditEvent::RoundClosed)
                .with_detail("reason", reason.to_string())
                .with_detail("observations", round.ledger.len())
                .with_detail("valid", round.ledger.valid_count()),
        );
        self.store.archive(&key, tick);
        info!(round = %key, reason = %reason, tick, "round closed");
        true
    }

    fn record_assessment(&self, key: &RoundKey, assessment: &Assessment, tick: Tick) {
        for exclusion in &assessment.exclusions {
            let entry = match exclusion.kind {
                ExclusionKind::GeometricallyInconsistent { excess } => {
                    AuditEntry::new(key, tick, AuditEvent::GeometricallyInconsistent)
                        .with_detail("excess", excess)
                }
                ExclusionKind::ResidualOutlier => {
                    AuditEntry::new(key, tick, AuditEvent::ResidualOutlier)
                }
            };
            self.audit.record(entry.with_observer(&exclusion.observer_id));
            self.observers.record_geometric_exclusion(&exclusion.observer_id);
        }
        let mut metrics = lock(&self.metrics);
        metrics.geometric_exclusions += assessment.exclusions.len() as u64;
        if let AssessmentStatus::Indeterminate(why) = &assessment.status {
            metrics.indeterminate_rounds += 1;
            self.audit.record(
                AuditEntry::new(key, tick, AuditEvent::Indeterminate)
                    .with_detail("reason", why)
                    .with_detail("observers", assessment.participants.len()),
            );
        }
    }
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self::build(EngineConfig::default())
    }
}
