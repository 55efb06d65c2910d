//! Geometry Kernel
//!
//! Stateless, deterministic geometry used to cross-check observer reports:
//! - Distance-only consistency for observer pairs
//! - Law-of-cosines triangle solve with reflection handling
//! - Tetrahedral multilateration for four observers
//! - Overdetermined least squares with one bounded outlier removal

pub mod kernel;
pub mod linalg;
pub mod multilateration;
pub mod point;

pub use kernel::{
    affine_rank, check_triangle_inequality, resolve_reflection, solve_distance_only,
    solve_triangle, worst_offender, DistanceConsistency, Range, RangeCheck, Trilateration,
    Violation,
};
pub use multilateration::{solve_overdetermined, solve_planar, solve_tetrahedron, Fix, OverdeterminedFix};
pub use point::{angular_difference, Point3};

use serde::{Deserialize, Serialize};

/// Numeric policy shared by every geometric check.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Tolerance as a fraction of the shortest reported distance
    pub relative_tolerance: f64,
    /// Lower bound on the tolerance (simulation units)
    pub absolute_tolerance: f64,
    /// Accepted bearing error (radians)
    pub bearing_tolerance: f64,
    /// Conditioning below which a configuration is indeterminate
    pub degeneracy_threshold: f64,
    /// Residual multiple of the median that marks an outlier
    pub outlier_factor: f64,
    /// Gauss-Newton refinement steps for overdetermined solves
    pub refinement_iterations: usize,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            relative_tolerance: 0.01,
            absolute_tolerance: 1e-3,
            bearing_tolerance: 0.035,
            degeneracy_threshold: 1e-3,
            outlier_factor: 3.0,
            refinement_iterations: 8,
        }
    }
}

impl GeometryConfig {
    /// Tolerance ε for a configuration with the given reported distances.
    pub fn tolerance_for<I>(&self, distances: I) -> f64
    where
        I: IntoIterator<Item = f64>,
    {
        let shortest = distances
            .into_iter()
            .filter(|d| d.is_finite())
            .fold(f64::INFINITY, f64::min);
        if shortest.is_finite() {
            (self.relative_tolerance * shortest).max(self.absolute_tolerance)
        } else {
            self.absolute_tolerance
        }
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> crate::core::Result<()> {
        let positive = [
            ("relative_tolerance", self.relative_tolerance),
            ("absolute_tolerance", self.absolute_tolerance),
            ("bearing_tolerance", self.bearing_tolerance),
            ("degeneracy_threshold", self.degeneracy_threshold),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(crate::core::Error::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if self.outlier_factor <= 1.0 {
            return Err(crate::core::Error::InvalidConfig(
                "outlier_factor must exceed 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_is_relative_to_shortest_distance() {
        let config = GeometryConfig::default();
        let eps = config.tolerance_for([50.0, 10.0, 30.0]);
        assert!((eps - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_tolerance_has_absolute_floor() {
        let config = GeometryConfig::default();
        assert_eq!(config.tolerance_for([0.001]), config.absolute_tolerance);
        assert_eq!(config.tolerance_for(Vec::<f64>::new()), config.absolute_tolerance);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = GeometryConfig {
            relative_tolerance: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(GeometryConfig::default().validate().is_ok());
    }
}
