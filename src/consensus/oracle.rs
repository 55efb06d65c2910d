//! Advisory position predictions.
//!
//! An oracle (for instance a deterministic orbit propagator owned by the
//! host) can suggest where a subject should be. The engine only uses the
//! suggestion to pick a side of a mirrored solution, never to override a
//! quorum-backed position.

use crate::core::Timestamp;
use crate::geometry::Point3;

/// Source of prior positions.
pub trait PredictionOracle: Send + Sync {
    /// Predicted position of `subject_id` at `timestamp`, if known.
    fn predict_position(&self, subject_id: &str, timestamp: Timestamp) -> Option<Point3>;
}

impl<F> PredictionOracle for F
where
    F: Fn(&str, Timestamp) -> Option<Point3> + Send + Sync,
{
    fn predict_position(&self, subject_id: &str, timestamp: Timestamp) -> Option<Point3> {
        self(subject_id, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::now;

    #[test]
    fn test_closure_oracle() {
        let oracle = |subject: &str, _: Timestamp| (subject == "moon").then(|| Point3::new(1.0, 2.0, 3.0));
        assert_eq!(oracle.predict_position("moon", now()), Some(Point3::new(1.0, 2.0, 3.0)));
        assert_eq!(oracle.predict_position("sun", now()), None);
    }
}
