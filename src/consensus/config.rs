//! Engine configuration.
//!
//! Every section has working defaults; a JSON file only needs the fields
//! it changes.

use crate::consensus::voting::VotingConfig;
use crate::core::{Error, Result, Tick};
use crate::geometry::GeometryConfig;
use crate::monitoring::LoggerConfig;
use crate::observation::ReliabilityConfig;
use crate::triangulation::ValidatorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Round lifecycle limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Valid reveals that close a round early
    pub quorum_observers: usize,
    /// Ticks after creation at which an open round times out
    pub timeout_ticks: Tick,
    /// Ticks a closed round stays queryable
    pub retention_ticks: Tick,
    /// Closed rounds kept before the oldest is evicted
    pub max_archived_rounds: usize,
    /// Audit entries kept in memory
    pub audit_capacity: usize,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            quorum_observers: 3,
            timeout_ticks: 20,
            retention_ticks: 200,
            max_archived_rounds: 1024,
            audit_capacity: 10_000,
        }
    }
}

impl RoundConfig {
    pub fn validate(&self) -> Result<()> {
        if self.quorum_observers < 3 {
            return Err(Error::InvalidConfig(format!(
                "quorum_observers must be at least 3, got {}",
                self.quorum_observers
            )));
        }
        if self.timeout_ticks == 0 {
            return Err(Error::InvalidConfig(
                "timeout_ticks must be positive".to_string(),
            ));
        }
        if self.max_archived_rounds == 0 || self.audit_capacity == 0 {
            return Err(Error::InvalidConfig(
                "retention capacities must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the consensus engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub geometry: GeometryConfig,
    pub rounds: RoundConfig,
    pub voting: VotingConfig,
    pub validator: ValidatorConfig,
    pub reliability: ReliabilityConfig,
    /// Applied by [`ConsensusEngine::init_logging`](crate::consensus::ConsensusEngine::init_logging)
    pub logging: LoggerConfig,
}

impl EngineConfig {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject nonsensical values.
    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        self.rounds.validate()?;
        self.voting.validate()?;
        self.validator.validate()?;
        self.reliability.validate()?;
        Ok(())
    }

    pub fn with_quorum_observers(mut self, quorum: usize) -> Self {
        self.rounds.quorum_observers = quorum;
        self
    }

    pub fn with_timeout_ticks(mut self, ticks: Tick) -> Self {
        self.rounds.timeout_ticks = ticks;
        self
    }

    pub fn with_relative_tolerance(mut self, tolerance: f64) -> Self {
        self.geometry.relative_tolerance = tolerance;
        self
    }
}
