//! Byzantine-fault-tolerant voting over candidate positions.
//!
//! Implements 2/3 quorum consensus tolerating up to 1/3 Byzantine weight.
//! Each candidate is "voted for" by the observers whose reports agree with
//! it; observers that back nothing still count towards the total.

use crate::core::{Error, ObserverId, Result};
use crate::triangulation::CandidatePosition;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Voting configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    /// Quorum threshold (default 2/3)
    pub quorum_threshold: f64,
    /// Whether to use trust weights (otherwise one observer, one vote)
    pub weighted: bool,
    /// Confidence cap when only two observers report
    pub distance_only_ceiling: f64,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            quorum_threshold: 2.0 / 3.0,
            weighted: true,
            distance_only_ceiling: 0.5,
        }
    }
}

impl VotingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.quorum_threshold > 0.5 && self.quorum_threshold <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "quorum_threshold must be in (0.5, 1], got {}",
                self.quorum_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.distance_only_ceiling) {
            return Err(Error::InvalidConfig(format!(
                "distance_only_ceiling must be in [0, 1), got {}",
                self.distance_only_ceiling
            )));
        }
        Ok(())
    }
}

/// Confidence carried by `n` mutually consistent observers: `1 - 1/n^1.5`.
///
/// Zero for zero or one observer, strictly increasing after that and
/// always below one.
pub fn confidence(n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    1.0 - 1.0 / (n as f64).powf(1.5)
}

/// Weight behind one candidate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateTally {
    /// Index into the round's candidates
    pub candidate: usize,
    pub weight: f64,
    pub backers: usize,
}

/// Result of a consensus vote.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Whether consensus was reached
    pub consensus_reached: bool,
    /// Index of the winning candidate
    pub winner: Option<usize>,
    /// Per-candidate weights, heaviest first
    pub tallies: Vec<CandidateTally>,
    /// Total participating weight
    pub total_weight: f64,
    /// Heaviest candidate's share of the total
    pub leading_share: f64,
    /// Whether the heaviest weight is shared
    pub tie: bool,
    /// Confidence score (0-1)
    pub confidence: f64,
}

impl ConsensusResult {
    /// Backers of the winner, or nobody.
    pub fn winner_backers(&self) -> usize {
        self.winner
            .and_then(|w| self.tallies.iter().find(|t| t.candidate == w))
            .map_or(0, |t| t.backers)
    }
}

/// Byzantine-fault-tolerant voting system.
#[derive(Clone, Debug, Default)]
pub struct ByzantineVoting {
    config: VotingConfig,
}

impl ByzantineVoting {
    /// Create a new voting instance.
    pub fn new(config: VotingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VotingConfig {
        &self.config
    }

    /// Check if a weight reaches quorum of the total.
    pub fn has_quorum(&self, weight: f64, total: f64) -> bool {
        total > 0.0 && weight >= self.config.quorum_threshold * total - 1e-12
    }

    /// Tally the candidates against the participating observers.
    ///
    /// A candidate's weight is the sum of its backers' weights; backers that
    /// are not participants are ignored.
    pub fn tally(
        &self,
        candidates: &[CandidatePosition],
        participants: &[(ObserverId, f64)],
    ) -> ConsensusResult {
        let weights: HashMap<&str, f64> = participants
            .iter()
            .map(|(id, w)| (id.as_str(), if self.config.weighted { *w } else { 1.0 }))
            .collect();
        let total_weight: f64 = weights.values().sum();

        let mut tallies: Vec<CandidateTally> = candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| {
                let backing: Vec<f64> = candidate
                    .consistent_observers
                    .iter()
                    .filter_map(|id| weights.get(id.as_str()).copied())
                    .collect();
                CandidateTally {
                    candidate: index,
                    weight: backing.iter().sum(),
                    backers: backing.len(),
                }
            })
            .collect();
        tallies.sort_by(|a, b| b.weight.total_cmp(&a.weight));

        let leading = tallies.first().map_or(0.0, |t| t.weight);
        let tie = tallies.len() > 1 && (tallies[0].weight - tallies[1].weight).abs() <= 1e-12;
        let leading_share = if total_weight > 0.0 {
            leading / total_weight
        } else {
            0.0
        };

        let winner = match tallies.first() {
            Some(top) if !tie && self.has_quorum(top.weight, total_weight) => Some(top.candidate),
            _ => None,
        };
        let confidence = winner
            .and_then(|w| tallies.iter().find(|t| t.candidate == w))
            .map_or(0.0, |t| confidence(t.backers));

        ConsensusResult {
            consensus_reached: winner.is_some(),
            winner,
            tallies,
            total_weight,
            leading_share,
            tie,
            confidence,
        }
    }
}
