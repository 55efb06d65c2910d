//! Observer registry with historical reliability weights.
//!
//! Weights start uniform and drift with each closed round: observers that
//! back the winning candidate gain weight, participants that do not lose
//! some, and Byzantine reveals cost the most.

use crate::core::types::{read, write};
use crate::core::{now, Error, ObserverId, Result, Timestamp};
use crate::geometry::Point3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// How observer weights evolve.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Weight given to newly registered observers
    pub initial_weight: f64,
    /// Multiplicative gain for backing a quorum winner
    pub reward: f64,
    /// Multiplicative loss for participating without backing the winner
    pub penalty: f64,
    /// Multiplicative loss for a Byzantine reveal
    pub byzantine_penalty: f64,
    /// Lower clamp
    pub min_weight: f64,
    /// Upper clamp
    pub max_weight: f64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            initial_weight: 1.0,
            reward: 0.05,
            penalty: 0.1,
            byzantine_penalty: 0.5,
            min_weight: 0.05,
            max_weight: 4.0,
        }
    }
}

impl ReliabilityConfig {
    pub fn validate(&self) -> Result<()> {
        let fractions = [
            ("reward", self.reward),
            ("penalty", self.penalty),
            ("byzantine_penalty", self.byzantine_penalty),
        ];
        for (name, value) in fractions {
            if !(0.0..1.0).contains(&value) {
                return Err(Error::InvalidConfig(format!(
                    "{} must be in [0, 1), got {}",
                    name, value
                )));
            }
        }
        if !(self.min_weight > 0.0 && self.min_weight <= self.max_weight) {
            return Err(Error::InvalidConfig(
                "weights must satisfy 0 < min_weight <= max_weight".to_string(),
            ));
        }
        if !(self.min_weight..=self.max_weight).contains(&self.initial_weight) {
            return Err(Error::InvalidConfig(
                "initial_weight must lie within [min_weight, max_weight]".to_string(),
            ));
        }
        Ok(())
    }

    fn clamp(&self, weight: f64) -> f64 {
        weight.clamp(self.min_weight, self.max_weight)
    }
}

/// Running record of an observer's behaviour.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObserverStats {
    /// Closed rounds the observer had a valid reveal in
    pub rounds_participated: u64,
    /// Of those, rounds where it backed the winner
    pub rounds_backed: u64,
    /// Reveals rejected as Byzantine
    pub byzantine_flags: u64,
    /// Exclusions by the geometric pre-filter or outlier pass
    pub geometric_exclusions: u64,
}

/// A registered observer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Observer {
    pub id: ObserverId,
    /// Self-reported position
    pub position: Point3,
    /// Trust weight used in voting
    pub weight: f64,
    pub stats: ObserverStats,
    pub registered_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Registry of known observers.
pub struct ObserverRegistry {
    observers: RwLock<HashMap<ObserverId, Observer>>,
    config: ReliabilityConfig,
}

impl ObserverRegistry {
    /// Create an empty registry.
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Register an observer or move an existing one.
    ///
    /// Moving keeps the accumulated weight and stats.
    pub fn register(&self, id: &str, position: Point3) -> Result<Observer> {
        if !position.is_finite() {
            return Err(Error::MalformedMeasurement {
                observer_id: id.to_string(),
                detail: "observer position is not finite".to_string(),
            });
        }
        let mut observers = write(&self.observers);
        let timestamp = now();
        let observer = observers
            .entry(id.to_string())
            .and_modify(|o| {
                o.position = position;
                o.updated_at = timestamp;
            })
            .or_insert_with(|| Observer {
                id: id.to_string(),
                position,
                weight: self.config.initial_weight,
                stats: ObserverStats::default(),
                registered_at: timestamp,
                updated_at: timestamp,
            });
        Ok(observer.clone())
    }

    /// Remove an observer. Rounds already holding its snapshot are unaffected.
    pub fn unregister(&self, id: &str) -> Result<Observer> {
        write(&self.observers)
            .remove(id)
            .ok_or_else(|| Error::ObserverNotFound(id.to_string()))
    }

    /// Get an observer by id.
    pub fn get(&self, id: &str) -> Option<Observer> {
        read(&self.observers).get(id).cloned()
    }

    /// Position and weight to freeze into a round at commit time.
    pub fn snapshot(&self, id: &str) -> Result<(Point3, f64)> {
        read(&self.observers)
            .get(id)
            .map(|o| (o.position, o.weight))
            .ok_or_else(|| Error::ObserverNotFound(id.to_string()))
    }

    /// Current weight, or zero for unknown observers.
    pub fn weight(&self, id: &str) -> f64 {
        read(&self.observers).get(id).map_or(0.0, |o| o.weight)
    }

    /// Penalise a Byzantine reveal.
    pub fn record_byzantine(&self, id: &str) {
        let mut observers = write(&self.observers);
        if let Some(observer) = observers.get_mut(id) {
            observer.stats.byzantine_flags += 1;
            observer.weight = self
                .config
                .clamp(observer.weight * (1.0 - self.config.byzantine_penalty));
            observer.updated_at = now();
        }
    }

    /// Count a geometric exclusion. Weight is settled at round close.
    pub fn record_geometric_exclusion(&self, id: &str) {
        if let Some(observer) = write(&self.observers).get_mut(id) {
            observer.stats.geometric_exclusions += 1;
        }
    }

    /// Settle a quorum-backed round: reward backers, penalise the rest.
    pub fn apply_outcome(&self, participants: &[ObserverId], backers: &[ObserverId]) {
        let mut observers = write(&self.observers);
        let timestamp = now();
        for id in participants {
            let Some(observer) = observers.get_mut(id) else {
                continue;
            };
            observer.stats.rounds_participated += 1;
            let factor = if backers.contains(id) {
                observer.stats.rounds_backed += 1;
                1.0 + self.config.reward
            } else {
                1.0 - self.config.penalty
            };
            observer.weight = self.config.clamp(observer.weight * factor);
            observer.updated_at = timestamp;
        }
    }

    /// All registered observers.
    pub fn list(&self) -> Vec<Observer> {
        read(&self.observers).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read(&self.observers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new(ReliabilityConfig::default())
    }
}
