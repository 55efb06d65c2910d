//! Round storage.
//!
//! Each round sits behind its own mutex; the map lock is only held long
//! enough to find or insert a round. Closed rounds are archived and then
//! evicted by age or count. A per-subject watermark remembers the newest
//! evicted round so an evicted round can never be opened again.

use crate::consensus::round::ConsensusRound;
use crate::consensus::RoundConfig;
use crate::core::types::{lock, read, write};
use crate::core::{Error, Result, RoundId, RoundKey, SubjectId, Tick};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Shared handle to one round.
pub type RoundHandle = Arc<Mutex<ConsensusRound>>;

/// Per-round storage for every subject.
pub struct ObservationStore {
    rounds: RwLock<HashMap<RoundKey, RoundHandle>>,
    /// Closed rounds in closing order, with their closing tick
    archive: Mutex<VecDeque<(RoundKey, Tick)>>,
    /// Newest evicted round per subject
    watermarks: RwLock<HashMap<SubjectId, RoundId>>,
    config: RoundConfig,
}

impl ObservationStore {
    /// Create an empty store.
    pub fn new(config: RoundConfig) -> Self {
        Self {
            rounds: RwLock::new(HashMap::new()),
            archive: Mutex::new(VecDeque::new()),
            watermarks: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Look up a round.
    pub fn get(&self, key: &RoundKey) -> Option<RoundHandle> {
        read(&self.rounds).get(key).cloned()
    }

    /// Look up a round or fail with `RoundNotFound`.
    pub fn require(&self, key: &RoundKey) -> Result<RoundHandle> {
        self.get(key).ok_or_else(|| Error::RoundNotFound {
            subject_id: key.subject_id.clone(),
            round_id: key.round_id,
        })
    }

    /// Find a round, creating it on first use.
    ///
    /// Returns the handle and whether it was created. Rounds at or below
    /// the subject's eviction watermark are closed for good.
    pub fn get_or_open(&self, key: &RoundKey, tick: Tick) -> Result<(RoundHandle, bool)> {
        if let Some(handle) = self.get(key) {
            return Ok((handle, false));
        }
        let mut rounds = write(&self.rounds);
        // Another caller may have created it while we waited for the lock.
        if let Some(handle) = rounds.get(key) {
            return Ok((handle.clone(), false));
        }
        if self.is_evicted(key) {
            return Err(Error::RoundClosed {
                subject_id: key.subject_id.clone(),
                round_id: key.round_id,
            });
        }
        let handle = Arc::new(Mutex::new(ConsensusRound::new(key.clone(), tick)));
        rounds.insert(key.clone(), handle.clone());
        debug!(round = %key, tick, "round opened");
        Ok((handle, true))
    }

    /// Whether the round was evicted (or precedes an evicted round).
    pub fn is_evicted(&self, key: &RoundKey) -> bool {
        read(&self.watermarks)
            .get(&key.subject_id)
            .is_some_and(|mark| key.round_id <= *mark)
    }

    /// Every round of a subject, ordered by round id.
    pub fn rounds_for_subject(&self, subject_id: &str) -> Vec<(RoundKey, RoundHandle)> {
        let mut found: Vec<(RoundKey, RoundHandle)> = read(&self.rounds)
            .iter()
            .filter(|(key, _)| key.subject_id == subject_id)
            .map(|(key, handle)| (key.clone(), handle.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Snapshot of every stored round handle.
    pub fn handles(&self) -> Vec<(RoundKey, RoundHandle)> {
        read(&self.rounds)
            .iter()
            .map(|(key, handle)| (key.clone(), handle.clone()))
            .collect()
    }

    /// Queue a closed round for eviction.
    pub fn archive(&self, key: &RoundKey, tick: Tick) {
        lock(&self.archive).push_back((key.clone(), tick));
    }

    /// Evict archived rounds past retention or over capacity, oldest first.
    pub fn evict(&self, tick: Tick) -> Vec<RoundKey> {
        let mut evicted = Vec::new();
        {
            let mut archive = lock(&self.archive);
            while let Some((key, closed_tick)) = archive.front() {
                let expired = tick.saturating_sub(*closed_tick) >= self.config.retention_ticks;
                let over = archive.len() > self.config.max_archived_rounds;
                if !(expired || over) {
                    break;
                }
                evicted.push(key.clone());
                archive.pop_front();
            }
        }
        if evicted.is_empty() {
            return evicted;
        }

        let mut rounds = write(&self.rounds);
        let mut watermarks = write(&self.watermarks);
        for key in &evicted {
            rounds.remove(key);
            let mark = watermarks.entry(key.subject_id.clone()).or_insert(key.round_id);
            *mark = (*mark).max(key.round_id);
        }
        debug!(count = evicted.len(), tick, "rounds evicted");
        evicted
    }

    /// Number of stored rounds, open or archived.
    pub fn len(&self) -> usize {
        read(&self.rounds).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn archived_len(&self) -> usize {
        lock(&self.archive).len()
    }
}

impl Default for ObservationStore {
    fn default() -> Self {
        Self::new(RoundConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ClosureReason;

    fn store(retention_ticks: Tick, max_archived_rounds: usize) -> ObservationStore {
        ObservationStore::new(RoundConfig {
            retention_ticks,
            max_archived_rounds,
            ..Default::default()
        })
    }

    fn close(store: &ObservationStore, key: &RoundKey, tick: Tick) {
        let handle = store.require(key).unwrap();
        lock(&handle).begin_close(ClosureReason::Timeout, tick);
        store.archive(key, tick);
    }

    #[test]
    fn test_get_or_open_creates_once() {
        let store = ObservationStore::default();
        let key = RoundKey::new("ship", 1);
        let (first, created) = store.get_or_open(&key, 0).unwrap();
        assert!(created);
        let (second, created) = store.get_or_open(&key, 5).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(lock(&second).created_tick, 0);
    }

    #[test]
    fn test_unknown_round() {
        let store = ObservationStore::default();
        assert!(matches!(
            store.require(&RoundKey::new("ship", 1)),
            Err(Error::RoundNotFound { .. })
        ));
    }

    #[test]
    fn test_eviction_by_age_and_watermark() {
        let store = store(10, 100);
        let key = RoundKey::new("ship", 4);
        store.get_or_open(&key, 0).unwrap();
        close(&store, &key, 2);

        assert!(store.evict(11).is_empty());
        assert_eq!(store.evict(12), vec![key.clone()]);
        assert!(store.get(&key).is_none());

        // Evicted rounds, and older ones, never reopen.
        assert!(matches!(store.get_or_open(&key, 13), Err(Error::RoundClosed { .. })));
        assert!(store.get_or_open(&RoundKey::new("ship", 3), 13).is_err());
        assert!(store.get_or_open(&RoundKey::new("ship", 5), 13).is_ok());
        assert!(store.get_or_open(&RoundKey::new("boat", 1), 13).is_ok());
    }

    #[test]
    fn test_eviction_by_capacity() {
        let store = store(1_000, 2);
        for round_id in 1..=3 {
            let key = RoundKey::new("ship", round_id);
            store.get_or_open(&key, 0).unwrap();
            close(&store, &key, round_id);
        }
        let evicted = store.evict(4);
        assert_eq!(evicted, vec![RoundKey::new("ship", 1)]);
        assert_eq!(store.archived_len(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_rounds_for_subject_sorted() {
        let store = ObservationStore::default();
        for round_id in [3, 1, 2] {
            store.get_or_open(&RoundKey::new("ship", round_id), 0).unwrap();
        }
        store.get_or_open(&RoundKey::new("boat", 1), 0).unwrap();
        let ids: Vec<RoundId> = store
            .rounds_for_subject("ship")
            .iter()
            .map(|(k, _)| k.round_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
