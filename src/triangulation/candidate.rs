//! Inputs and outputs of the triangulation validator.

use crate::core::ObserverId;
use crate::geometry::{angular_difference, Point3, Range};
use serde::{Deserialize, Serialize};

/// A valid observation as the validator sees it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObserverReport {
    pub observer_id: ObserverId,
    /// Observer position frozen at commit time
    pub position: Point3,
    pub weight: f64,
    pub distance: Option<f64>,
    pub bearing: Option<f64>,
}

impl ObserverReport {
    /// Range measurement, for reports that carry a distance.
    pub fn range(&self) -> Option<Range> {
        self.distance
            .map(|d| Range::new(&self.observer_id, self.position, d))
    }

    /// Whether the report's bearing points at `target`.
    ///
    /// Reports without a bearing never disagree. A target within `tolerance`
    /// of the observer horizontally has no meaningful bearing and agrees.
    pub fn bearing_agrees(&self, target: &Point3, bearing_tolerance: f64, tolerance: f64) -> bool {
        let Some(bearing) = self.bearing else {
            return true;
        };
        let dx = target.x - self.position.x;
        let dy = target.y - self.position.y;
        if dx.hypot(dy) <= tolerance {
            return true;
        }
        angular_difference(bearing, self.position.bearing_to(target)) <= bearing_tolerance
    }

    /// Whether the report agrees with `target` on every measured quantity.
    pub fn agrees_with(&self, target: &Point3, bearing_tolerance: f64, tolerance: f64) -> bool {
        let distance_ok = self
            .distance
            .map_or(true, |d| (self.position.distance_to(target) - d).abs() <= tolerance);
        distance_ok && self.bearing_agrees(target, bearing_tolerance, tolerance)
    }
}

/// Which solver produced a candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// Law-of-cosines solve of three observers
    Triangle,
    /// Closed-form four-observer solve
    Tetrahedron,
    /// Least squares within the observers' plane
    Planar,
    /// Spatial least squares with outlier removal
    LeastSquares,
    /// Best-backed subset found by searching observer triples
    Clique,
}

/// A position supported by a mutually consistent subset of observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidatePosition {
    pub position: Point3,
    /// Unresolved reflection of `position`, if any
    pub mirror: Option<Point3>,
    /// RMS distance residual over the backing observers
    pub residual_error: f64,
    /// Observers whose reports agree with `position` within ε
    pub consistent_observers: Vec<ObserverId>,
    /// Sum of the backing observers' weights
    pub backing_weight: f64,
    pub strategy: Strategy,
}

impl CandidatePosition {
    pub fn is_ambiguous(&self) -> bool {
        self.mirror.is_some()
    }

    pub fn backed_by(&self, observer_id: &str) -> bool {
        self.consistent_observers.iter().any(|id| id == observer_id)
    }

    pub fn backer_count(&self) -> usize {
        self.consistent_observers.len()
    }

    /// Whether `claim` lies within `tolerance` of the candidate.
    pub fn matches(&self, claim: &Point3, tolerance: f64) -> bool {
        self.position.distance_to(claim) <= tolerance
    }
}

/// Why the validator set an observer aside.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExclusionKind {
    /// Failed the pairwise triangle-inequality pre-filter
    GeometricallyInconsistent { excess: f64 },
    /// Dropped by the least-squares outlier pass
    ResidualOutlier,
}

/// An observer excluded from solving.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub observer_id: ObserverId,
    pub kind: ExclusionKind,
}

/// Overall outcome of a triangulation pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AssessmentStatus {
    /// Fewer than two ranging reports
    Insufficient,
    /// Exactly two ranging reports: no unique point
    DistanceOnly,
    /// One or more candidates were found
    Solved,
    /// Degenerate observer geometry
    Indeterminate(String),
}

/// Everything the validator learned about one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub status: AssessmentStatus,
    /// Round tolerance ε
    pub tolerance: f64,
    /// Candidates ordered by decreasing backing weight
    pub candidates: Vec<CandidatePosition>,
    pub exclusions: Vec<Exclusion>,
    /// Ranging reports that survived the pre-filter
    pub ranges: Vec<Range>,
    /// Every valid participant with its weight
    pub participants: Vec<(ObserverId, f64)>,
}

impl Assessment {
    pub fn total_weight(&self) -> f64 {
        self.participants.iter().map(|(_, w)| w).sum()
    }

    pub fn participant_ids(&self) -> Vec<ObserverId> {
        self.participants.iter().map(|(id, _)| id.clone()).collect()
    }
}
