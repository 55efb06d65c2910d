//! Append-only record of one round's observations.
//!
//! Entries are only ever added (on commit) and moved forward through their
//! status (on reveal). Nothing is removed while the round lives.

use crate::core::{now, Error, Hash256, ObserverId, Result, RoundId, SubjectId, Tick, Timestamp};
use crate::geometry::Point3;
use crate::observation::commitment::{commitment_hash, RevealPayload};
use crate::observation::verifier::ObservationVerifier;
use crate::triangulation::ObserverReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a reveal was refused permanently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByzantineReason {
    /// Revealed payload does not hash to the commitment
    HashMismatch,
    /// The installed verifier refused the reveal
    VerificationRejected,
}

impl fmt::Display for ByzantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByzantineReason::HashMismatch => write!(f, "hash mismatch"),
            ByzantineReason::VerificationRejected => write!(f, "verification rejected"),
        }
    }
}

/// Where an observation stands in the commit/reveal protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Commitment recorded, measurement not yet revealed
    Committed,
    /// Revealed and eligible for triangulation
    Revealed,
    /// Excluded for the rest of the round
    Byzantine(ByzantineReason),
    /// Hash matched but the measurement is unusable
    Malformed(String),
}

/// One observer's report for one round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub subject_id: SubjectId,
    pub observer_id: ObserverId,
    pub round_id: RoundId,
    /// Observer position frozen at commit time
    pub observer_position: Point3,
    /// Observer weight frozen at commit time
    pub weight: f64,
    pub commit_hash: Hash256,
    pub commit_tick: Tick,
    pub committed_at: Timestamp,
    pub revealed_tick: Option<Tick>,
    pub revealed_at: Option<Timestamp>,
    pub distance: Option<f64>,
    pub bearing: Option<f64>,
    pub status: EntryStatus,
}

impl Observation {
    /// Revealed and not excluded.
    pub fn is_valid(&self) -> bool {
        self.status == EntryStatus::Revealed
    }

    /// Committed but not yet revealed.
    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Committed
    }

    /// Permanently excluded for the round.
    pub fn is_excluded(&self) -> bool {
        matches!(
            self.status,
            EntryStatus::Byzantine(_) | EntryStatus::Malformed(_)
        )
    }

    /// Input for the triangulation validator, if the observation is valid.
    pub fn report(&self) -> Option<ObserverReport> {
        if !self.is_valid() {
            return None;
        }
        Some(ObserverReport {
            observer_id: self.observer_id.clone(),
            position: self.observer_position,
            weight: self.weight,
            distance: self.distance,
            bearing: self.bearing,
        })
    }
}

fn check_measurement(payload: &RevealPayload) -> std::result::Result<(), String> {
    match (payload.distance, payload.bearing) {
        (None, None) => Err("no distance or bearing".to_string()),
        (Some(d), _) if !d.is_finite() || d < 0.0 => Err(format!("invalid distance {}", d)),
        (_, Some(b)) if !b.is_finite() => Err(format!("invalid bearing {}", b)),
        _ => Ok(()),
    }
}

/// Observations of a single round in arrival order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoundLedger {
    entries: Vec<Observation>,
}

impl RoundLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a commitment.
    #[allow(clippy::too_many_arguments)]
    pub fn commit(
        &mut self,
        observer_id: &str,
        subject_id: &str,
        round_id: RoundId,
        position: Point3,
        weight: f64,
        commit_hash: Hash256,
        tick: Tick,
    ) -> Result<&Observation> {
        if self.get(observer_id).is_some() {
            return Err(Error::DuplicateCommit {
                observer_id: observer_id.to_string(),
                round_id,
            });
        }
        self.entries.push(Observation {
            subject_id: subject_id.to_string(),
            observer_id: observer_id.to_string(),
            round_id,
            observer_position: position,
            weight,
            commit_hash,
            commit_tick: tick,
            committed_at: now(),
            revealed_tick: None,
            revealed_at: None,
            distance: None,
            bearing: None,
            status: EntryStatus::Committed,
        });
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Open a commitment.
    ///
    /// A mismatching hash, a verifier refusal and an unusable measurement
    /// each exclude the observer for the rest of the round. A reveal in the
    /// same tick as its commit is refused without penalty.
    pub fn reveal(
        &mut self,
        observer_id: &str,
        payload: &RevealPayload,
        tick: Tick,
        verifier: &dyn ObservationVerifier,
    ) -> Result<&Observation> {
        let index = self
            .entries
            .iter()
            .position(|o| o.observer_id == observer_id)
            .ok_or_else(|| Error::NoCommitment(observer_id.to_string()))?;
        let entry = &mut self.entries[index];

        match entry.status {
            EntryStatus::Committed => {}
            EntryStatus::Revealed => return Err(Error::DuplicateReveal(observer_id.to_string())),
            _ => return Err(Error::ObserverExcluded(observer_id.to_string())),
        }
        if tick <= entry.commit_tick {
            return Err(Error::RevealTooEarly {
                observer_id: observer_id.to_string(),
                commit_tick: entry.commit_tick,
            });
        }

        let expected = commitment_hash(observer_id, &entry.subject_id, entry.round_id, payload)?;
        if expected != entry.commit_hash {
            entry.status = EntryStatus::Byzantine(ByzantineReason::HashMismatch);
            return Err(Error::RevealHashMismatch(observer_id.to_string()));
        }
        if !verifier.verify(entry, payload) {
            entry.status = EntryStatus::Byzantine(ByzantineReason::VerificationRejected);
            return Err(Error::VerificationRejected(observer_id.to_string()));
        }
        if let Err(detail) = check_measurement(payload) {
            entry.status = EntryStatus::Malformed(detail.clone());
            return Err(Error::MalformedMeasurement {
                observer_id: observer_id.to_string(),
                detail,
            });
        }

        entry.distance = payload.distance;
        entry.bearing = payload.bearing;
        entry.revealed_tick = Some(tick);
        entry.revealed_at = Some(now());
        entry.status = EntryStatus::Revealed;
        Ok(entry)
    }

    pub fn get(&self, observer_id: &str) -> Option<&Observation> {
        self.entries.iter().find(|o| o.observer_id == observer_id)
    }

    /// All entries in commit order.
    pub fn entries(&self) -> &[Observation] {
        &self.entries
    }

    /// Triangulation inputs for every valid observation.
    pub fn valid_reports(&self) -> Vec<ObserverReport> {
        self.entries.iter().filter_map(Observation::report).collect()
    }

    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|o| o.is_valid()).count()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|o| o.is_pending()).count()
    }

    /// Observers excluded by the protocol, with the reason.
    pub fn excluded(&self) -> Vec<(ObserverId, EntryStatus)> {
        self.entries
            .iter()
            .filter(|o| o.is_excluded())
            .map(|o| (o.observer_id.clone(), o.status.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::verifier::AcceptAll;

    fn committed(observer_id: &str, payload: &RevealPayload) -> RoundLedger {
        let mut ledger = RoundLedger::new();
        let hash = payload.commitment(observer_id, "ship", 1).unwrap();
        ledger
            .commit(observer_id, "ship", 1, Point3::origin(), 1.0, hash, 10)
            .unwrap();
        ledger
    }

    #[test]
    fn test_commit_then_reveal() {
        let payload = RevealPayload::new(Some(5.0), Some(0.25));
        let mut ledger = committed("a", &payload);
        assert_eq!(ledger.pending_count(), 1);

        let entry = ledger.reveal("a", &payload, 11, &AcceptAll).unwrap();
        assert!(entry.is_valid());
        assert_eq!(entry.distance, Some(5.0));
        assert_eq!(ledger.valid_reports().len(), 1);
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_commit() {
        let payload = RevealPayload::new(Some(5.0), None);
        let mut ledger = committed("a", &payload);
        let result = ledger.commit("a", "ship", 1, Point3::origin(), 1.0, Hash256::zero(), 10);
        assert!(matches!(result, Err(Error::DuplicateCommit { .. })));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_reveal_in_commit_tick_is_too_early() {
        let payload = RevealPayload::new(Some(5.0), None);
        let mut ledger = committed("a", &payload);
        let result = ledger.reveal("a", &payload, 10, &AcceptAll);
        assert!(matches!(result, Err(Error::RevealTooEarly { commit_tick: 10, .. })));
        // Still revealable later.
        assert!(ledger.reveal("a", &payload, 11, &AcceptAll).is_ok());
    }

    #[test]
    fn test_hash_mismatch_is_permanent() {
        let payload = RevealPayload::new(Some(5.0), None);
        let mut ledger = committed("a", &payload);

        let mut forged = payload.clone();
        forged.distance = Some(6.0);
        let result = ledger.reveal("a", &forged, 11, &AcceptAll);
        assert!(matches!(result, Err(Error::RevealHashMismatch(_))));

        // The honest payload can no longer be admitted.
        let retry = ledger.reveal("a", &payload, 12, &AcceptAll);
        assert!(matches!(retry, Err(Error::ObserverExcluded(_))));
        assert!(ledger.valid_reports().is_empty());
        assert_eq!(
            ledger.excluded()[0].1,
            EntryStatus::Byzantine(ByzantineReason::HashMismatch)
        );
    }

    #[test]
    fn test_verifier_refusal() {
        let payload = RevealPayload::new(Some(5.0), None);
        let mut ledger = committed("a", &payload);
        let refuse = |_: &Observation, p: &RevealPayload| p.signature.is_some();
        let result = ledger.reveal("a", &payload, 11, &refuse);
        assert!(matches!(result, Err(Error::VerificationRejected(_))));
        assert!(ledger.get("a").unwrap().is_excluded());
    }

    #[test]
    fn test_malformed_measurements() {
        for payload in [
            RevealPayload::new(None, None),
            RevealPayload::new(Some(-1.0), None),
            RevealPayload::new(Some(f64::INFINITY), None),
            RevealPayload::new(Some(1.0), Some(f64::NAN)),
        ] {
            let mut ledger = committed("a", &payload);
            let result = ledger.reveal("a", &payload, 11, &AcceptAll);
            assert!(matches!(result, Err(Error::MalformedMeasurement { .. })));
            assert!(matches!(
                ledger.get("a").unwrap().status,
                EntryStatus::Malformed(_)
            ));
        }
    }

    #[test]
    fn test_reveal_without_commit_and_twice() {
        let payload = RevealPayload::new(Some(5.0), None);
        let mut ledger = committed("a", &payload);
        assert!(matches!(
            ledger.reveal("b", &payload, 11, &AcceptAll),
            Err(Error::NoCommitment(_))
        ));
        ledger.reveal("a", &payload, 11, &AcceptAll).unwrap();
        assert!(matches!(
            ledger.reveal("a", &payload, 12, &AcceptAll),
            Err(Error::DuplicateReveal(_))
        ));
    }
}
