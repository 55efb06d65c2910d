//! Subjects and their motion history.

use crate::core::{now, SubjectId, Tick, Timestamp};
use crate::geometry::Point3;
use serde::{Deserialize, Serialize};

/// An entity whose position is being validated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    /// Latest position the subject claims
    pub claimed_position: Option<Point3>,
    /// Claimed velocity in units per tick (a hint only)
    pub claimed_velocity: Option<Point3>,
    /// Last accepted position and the tick of its round
    pub last_accepted: Option<(Point3, Tick)>,
    pub first_seen: Timestamp,
}

impl Subject {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            claimed_position: None,
            claimed_velocity: None,
            last_accepted: None,
            first_seen: now(),
        }
    }

    /// Where history puts the subject at `tick`.
    ///
    /// The last accepted position, moved along the claimed velocity when
    /// one is known.
    pub fn extrapolate(&self, tick: Tick) -> Option<Point3> {
        let (position, at) = self.last_accepted?;
        match self.claimed_velocity {
            Some(velocity) if velocity.is_finite() => {
                let elapsed = tick as f64 - at as f64;
                Some(position + velocity * elapsed)
            }
            _ => Some(position),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extrapolate() {
        let mut subject = Subject::new("ship");
        assert_eq!(subject.extrapolate(5), None);

        subject.last_accepted = Some((Point3::new(1.0, 0.0, 0.0), 10));
        assert_eq!(subject.extrapolate(15), Some(Point3::new(1.0, 0.0, 0.0)));

        subject.claimed_velocity = Some(Point3::new(0.5, 0.0, -1.0));
        assert_eq!(subject.extrapolate(14), Some(Point3::new(3.0, 0.0, -4.0)));
    }
}
