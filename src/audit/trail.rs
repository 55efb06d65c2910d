//! Audit trail of exclusions and verdicts.
//!
//! Every observer exclusion and every round outcome is recorded so that
//! repeat offenders can be spotted across rounds.

use crate::core::types::{read, write};
use crate::core::{now, ObserverId, RoundId, RoundKey, SubjectId, Tick, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// Audit event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEvent {
    /// Reveal did not match its commitment
    ByzantineReveal,
    /// Verification hook refused a reveal
    VerificationRejected,
    /// Reveal carried an unusable measurement
    MalformedMeasurement,
    /// Observer failed the triangle-inequality pre-filter
    GeometricallyInconsistent,
    /// Observer dropped by the least-squares outlier pass
    ResidualOutlier,
    /// Observer geometry too degenerate to solve
    Indeterminate,
    /// Round closed
    RoundClosed,
    /// Verdict issued for a claimed position
    VerdictIssued,
}

impl AuditEvent {
    /// Whether the event excludes an observer.
    pub fn is_offence(&self) -> bool {
        matches!(
            self,
            AuditEvent::ByzantineReveal
                | AuditEvent::VerificationRejected
                | AuditEvent::MalformedMeasurement
                | AuditEvent::GeometricallyInconsistent
                | AuditEvent::ResidualOutlier
        )
    }
}

/// An audit log entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry ID
    pub id: String,
    /// Wall-clock time
    pub timestamp: Timestamp,
    /// Engine tick
    pub tick: Tick,
    pub subject_id: SubjectId,
    pub round_id: RoundId,
    /// Observer concerned, if any
    pub observer_id: Option<ObserverId>,
    pub event: AuditEvent,
    /// Additional details
    pub details: HashMap<String, serde_json::Value>,
}

impl AuditEntry {
    /// Create a new audit entry.
    pub fn new(key: &RoundKey, tick: Tick, event: AuditEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now(),
            tick,
            subject_id: key.subject_id.clone(),
            round_id: key.round_id,
            observer_id: None,
            event,
            details: HashMap::new(),
        }
    }

    /// Set the observer.
    pub fn with_observer(mut self, observer_id: &str) -> Self {
        self.observer_id = Some(observer_id.to_string());
        self
    }

    /// Add detail.
    pub fn with_detail(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.to_string(), v);
        }
        self
    }
}

/// Audit filter for queries.
#[derive(Clone, Debug, Default)]
pub struct AuditFilter {
    pub subject_id: Option<SubjectId>,
    pub round_id: Option<RoundId>,
    pub observer_id: Option<ObserverId>,
    pub event: Option<AuditEvent>,
    /// Only exclusion events
    pub offences_only: bool,
    pub since_tick: Option<Tick>,
}

impl AuditFilter {
    /// Create a new filter.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_subject(mut self, subject_id: &str) -> Self {
        self.subject_id = Some(subject_id.to_string());
        self
    }

    pub fn by_round(mut self, key: &RoundKey) -> Self {
        self.subject_id = Some(key.subject_id.clone());
        self.round_id = Some(key.round_id);
        self
    }

    pub fn by_observer(mut self, observer_id: &str) -> Self {
        self.observer_id = Some(observer_id.to_string());
        self
    }

    pub fn by_event(mut self, event: AuditEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn offences(mut self) -> Self {
        self.offences_only = true;
        self
    }

    pub fn since(mut self, tick: Tick) -> Self {
        self.since_tick = Some(tick);
        self
    }

    /// Check if an entry matches this filter.
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(subject_id) = &self.subject_id {
            if &entry.subject_id != subject_id {
                return false;
            }
        }
        if let Some(round_id) = self.round_id {
            if entry.round_id != round_id {
                return false;
            }
        }
        if let Some(observer_id) = &self.observer_id {
            if entry.observer_id.as_ref() != Some(observer_id) {
                return false;
            }
        }
        if let Some(event) = self.event {
            if entry.event != event {
                return false;
            }
        }
        if self.offences_only && !entry.event.is_offence() {
            return false;
        }
        if let Some(since) = self.since_tick {
            if entry.tick < since {
                return false;
            }
        }
        true
    }
}

/// Bounded in-memory audit trail.
pub struct AuditTrail {
    entries: RwLock<VecDeque<AuditEntry>>,
    max_entries: usize,
}

impl AuditTrail {
    /// Create a new trail.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Log an entry, dropping the oldest when full.
    pub fn record(&self, entry: AuditEntry) {
        let mut entries = write(&self.entries);
        while entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Query entries, oldest first.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        read(&self.entries)
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Exclusions per observer, most frequent first.
    pub fn offence_counts(&self) -> Vec<(ObserverId, usize)> {
        let mut counts: HashMap<ObserverId, usize> = HashMap::new();
        for entry in read(&self.entries).iter() {
            if let (true, Some(observer_id)) = (entry.event.is_offence(), &entry.observer_id) {
                *counts.entry(observer_id.clone()).or_insert(0) += 1;
            }
        }
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        read(&self.entries).iter().rev().take(n).cloned().collect()
    }

    /// Export as JSON lines.
    pub fn to_json_lines(&self) -> String {
        read(&self.entries)
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new(10_000)
    }
}
