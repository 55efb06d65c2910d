//! Multilateration for four or more observers.
//!
//! Each observer contributes a sphere `|p - a_i|² = r_i²`. Subtracting the
//! equations pairwise (or from their mean) cancels the quadratic `|p|²` term
//! and leaves a linear system in `p`.

use crate::core::{Error, ObserverId, Result};
use crate::geometry::kernel::{affine_rank, PlaneFrame, Range, Trilateration};
use crate::geometry::linalg::{normal_equations2, normal_equations3, solve2, solve3};
use crate::geometry::point::Point3;
use crate::geometry::GeometryConfig;
use serde::{Deserialize, Serialize};

/// A solved position with per-observer residuals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub position: Point3,
    /// `|‖p - a_i‖ - r_i|`, aligned with the input ranges
    pub residuals: Vec<f64>,
    /// Root mean square of the residuals
    pub rms: f64,
}

impl Fix {
    fn at(position: Point3, ranges: &[Range]) -> Self {
        let residuals = residuals_at(&position, ranges);
        let rms = rms(&residuals);
        Self {
            position,
            residuals,
            rms,
        }
    }
}

/// Result of an overdetermined solve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OverdeterminedFix {
    pub solution: Trilateration,
    /// Residuals of every input range against the final solution
    pub residuals: Vec<f64>,
    /// Observer dropped by the outlier pass, if any
    pub rejected: Option<ObserverId>,
}

fn residuals_at(position: &Point3, ranges: &[Range]) -> Vec<f64> {
    ranges.iter().map(|r| r.residual(position)).collect()
}

fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.is_empty() {
        0.0
    } else if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Four-observer closed-form solve.
///
/// Subtracting sphere 0 from spheres 1..3 gives a 3x3 linear system. Sphere
/// 0 itself is never enforced by that system, so its residual is the
/// configuration's consistency error.
pub fn solve_tetrahedron(ranges: &[Range], config: &GeometryConfig) -> Result<Fix> {
    if ranges.len() != 4 {
        return Err(Error::InsufficientObservers {
            need: 4,
            have: ranges.len(),
        });
    }
    let a0 = ranges[0].anchor;
    let r0 = ranges[0].distance;
    let mut m = [[0.0; 3]; 3];
    let mut b = [0.0; 3];
    for (row, range) in ranges[1..].iter().enumerate() {
        let a = range.anchor;
        m[row] = [2.0 * (a.x - a0.x), 2.0 * (a.y - a0.y), 2.0 * (a.z - a0.z)];
        b[row] = r0 * r0 - range.distance * range.distance + a.norm_squared() - a0.norm_squared();
    }
    let [x, y, z] = solve3(&m, &b, config.degeneracy_threshold)
        .ok_or_else(|| Error::Indeterminate("coplanar observers".to_string()))?;
    Ok(Fix::at(Point3::new(x, y, z), ranges))
}

/// Least squares in the plane of coplanar observers.
///
/// Solves the in-plane coordinates from the mean-subtracted linear system,
/// then recovers the height above the plane from the average remaining
/// squared range. A non-zero height is only known up to its sign.
pub fn solve_planar(
    ranges: &[Range],
    config: &GeometryConfig,
    tolerance: f64,
) -> Result<(Trilateration, Vec<f64>)> {
    if ranges.len() < 3 {
        return Err(Error::InsufficientObservers {
            need: 3,
            have: ranges.len(),
        });
    }
    let anchors: Vec<Point3> = ranges.iter().map(|r| r.anchor).collect();
    let frame = PlaneFrame::fit(&anchors, config.degeneracy_threshold)?;
    let local: Vec<Point3> = anchors.iter().map(|a| frame.local(a)).collect();

    let n = ranges.len() as f64;
    let mean_u = local.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_v = local.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_sq = local.iter().map(|p| p.x * p.x + p.y * p.y).sum::<f64>() / n;
    let mean_r2 = ranges.iter().map(|r| r.distance * r.distance).sum::<f64>() / n;

    let rows: Vec<([f64; 2], f64)> = local
        .iter()
        .zip(ranges)
        .map(|(p, r)| {
            (
                [2.0 * (p.x - mean_u), 2.0 * (p.y - mean_v)],
                (p.x * p.x + p.y * p.y - mean_sq) - (r.distance * r.distance - mean_r2),
            )
        })
        .collect();
    let (ata, atb) = normal_equations2(&rows);
    let [u, v] = solve2(&ata, &atb, config.degeneracy_threshold)
        .ok_or_else(|| Error::Indeterminate("ill-conditioned planar system".to_string()))?;

    let height_sq = local
        .iter()
        .zip(ranges)
        .map(|(p, r)| r.distance * r.distance - (u - p.x).powi(2) - (v - p.y).powi(2))
        .sum::<f64>()
        / n;

    let solution = frame.lift(u, v, height_sq, ranges, tolerance);
    let residuals = residuals_at(&solution.primary(), ranges);
    Ok((solution, residuals))
}

/// Linearised 3D least squares over observers that span space.
fn least_squares_3d(ranges: &[Range], config: &GeometryConfig) -> Result<Point3> {
    let n = ranges.len() as f64;
    let centroid = ranges
        .iter()
        .fold(Point3::origin(), |acc, r| acc + r.anchor)
        * (1.0 / n);
    let mean_sq = ranges.iter().map(|r| r.anchor.norm_squared()).sum::<f64>() / n;
    let mean_r2 = ranges.iter().map(|r| r.distance * r.distance).sum::<f64>() / n;

    let rows: Vec<([f64; 3], f64)> = ranges
        .iter()
        .map(|r| {
            let d = r.anchor - centroid;
            (
                [2.0 * d.x, 2.0 * d.y, 2.0 * d.z],
                (r.anchor.norm_squared() - mean_sq) - (r.distance * r.distance - mean_r2),
            )
        })
        .collect();
    let (ata, atb) = normal_equations3(&rows);
    let [x, y, z] = solve3(&ata, &atb, config.degeneracy_threshold)
        .ok_or_else(|| Error::Indeterminate("ill-conditioned spatial system".to_string()))?;
    Ok(Point3::new(x, y, z))
}

/// Gauss-Newton refinement of the true (non-linearised) range residuals.
///
/// Never returns a point with a worse RMS than the starting point.
fn refine(start: Point3, ranges: &[Range], config: &GeometryConfig) -> Point3 {
    let mut best = start;
    let mut best_rms = rms(&residuals_at(&start, ranges));
    let mut current = start;
    for _ in 0..config.refinement_iterations {
        let rows: Vec<([f64; 3], f64)> = ranges
            .iter()
            .filter_map(|r| {
                let offset = current - r.anchor;
                let dist = offset.norm();
                if dist <= f64::EPSILON {
                    return None;
                }
                let j = offset * (1.0 / dist);
                Some(([j.x, j.y, j.z], r.distance - dist))
            })
            .collect();
        let (jtj, jtr) = normal_equations3(&rows);
        let Some([dx, dy, dz]) = solve3(&jtj, &jtr, config.degeneracy_threshold) else {
            break;
        };
        let step = Point3::new(dx, dy, dz);
        current = current + step;
        let current_rms = rms(&residuals_at(&current, ranges));
        if current_rms < best_rms {
            best = current;
            best_rms = current_rms;
        }
        if step.norm() <= 1e-12 * (1.0 + current.norm()) {
            break;
        }
    }
    best
}

fn solve_set(ranges: &[Range], config: &GeometryConfig, tolerance: f64) -> Result<Trilateration> {
    let anchors: Vec<Point3> = ranges.iter().map(|r| r.anchor).collect();
    match affine_rank(&anchors, config.degeneracy_threshold) {
        0 | 1 => Err(Error::Indeterminate(
            "observers are coincident or collinear".to_string(),
        )),
        2 => solve_planar(ranges, config, tolerance).map(|(solution, _)| solution),
        _ => {
            let linear = least_squares_3d(ranges, config)?;
            Ok(Trilateration::Unique(refine(linear, ranges, config)))
        }
    }
}

/// Least-squares solve for five or more observers.
///
/// After the first solve, the single worst observer is dropped if its
/// residual exceeds `outlier_factor` times the median residual (and the
/// tolerance), and the system is solved once more. At most one observer
/// is ever dropped.
pub fn solve_overdetermined(
    ranges: &[Range],
    config: &GeometryConfig,
    tolerance: f64,
) -> Result<OverdeterminedFix> {
    if ranges.len() < 5 {
        return Err(Error::InsufficientObservers {
            need: 5,
            have: ranges.len(),
        });
    }

    let first = solve_set(ranges, config, tolerance)?;
    let residuals = residuals_at(&first.primary(), ranges);
    let typical = median(&residuals);

    let worst = residuals
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, r)| (i, *r));

    if let Some((index, residual)) = worst {
        if residual > config.outlier_factor * typical && residual > tolerance {
            let kept: Vec<Range> = ranges
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, r)| r.clone())
                .collect();
            if let Ok(second) = solve_set(&kept, config, tolerance) {
                return Ok(OverdeterminedFix {
                    residuals: residuals_at(&second.primary(), ranges),
                    solution: second,
                    rejected: Some(ranges[index].observer_id.clone()),
                });
            }
        }
    }

    Ok(OverdeterminedFix {
        solution: first,
        residuals,
        rejected: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges_to(target: Point3, anchors: &[Point3]) -> Vec<Range> {
        anchors
            .iter()
            .enumerate()
            .map(|(i, a)| Range::new(&format!("obs-{}", i), *a, a.distance_to(&target)))
            .collect()
    }

    fn spatial_anchors() -> Vec<Point3> {
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(20.0, 0.0, 0.0),
            Point3::new(0.0, 20.0, 0.0),
            Point3::new(0.0, 0.0, 20.0),
            Point3::new(20.0, 20.0, 0.0),
            Point3::new(20.0, 0.0, 20.0),
            Point3::new(0.0, 20.0, 20.0),
            Point3::new(20.0, 20.0, 20.0),
            Point3::new(-10.0, 6.0, 7.0),
            Point3::new(25.0, 6.0, 7.0),
            Point3::new(5.0, -10.0, 7.0),
            Point3::new(5.0, 6.0, 25.0),
        ]
    }

    #[test]
    fn test_tetrahedron_exact() {
        let target = Point3::new(7.0, 4.0, 3.0);
        let ranges = ranges_to(target, &spatial_anchors()[..4]);
        let fix = solve_tetrahedron(&ranges, &GeometryConfig::default()).unwrap();
        assert!(fix.position.distance_to(&target) < 1e-9);
        assert!(fix.rms < 1e-9);
        assert_eq!(fix.residuals.len(), 4);
    }

    #[test]
    fn test_tetrahedron_inconsistent_first_sphere_shows_in_residual() {
        let target = Point3::new(7.0, 4.0, 3.0);
        let mut ranges = ranges_to(target, &spatial_anchors()[..4]);
        ranges[0].distance += 2.0;
        let fix = solve_tetrahedron(&ranges, &GeometryConfig::default()).unwrap();
        assert!(fix.rms > 0.1);
    }

    #[test]
    fn test_tetrahedron_coplanar_is_indeterminate() {
        let anchors = vec![
            Point3::planar(0.0, 0.0),
            Point3::planar(10.0, 0.0),
            Point3::planar(0.0, 10.0),
            Point3::planar(10.0, 10.0),
        ];
        let ranges = ranges_to(Point3::planar(3.0, 4.0), &anchors);
        let err = solve_tetrahedron(&ranges, &GeometryConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Indeterminate(_)));
    }

    #[test]
    fn test_planar_exact() {
        let anchors = vec![
            Point3::planar(0.0, 0.0),
            Point3::planar(10.0, 0.0),
            Point3::planar(0.0, 10.0),
            Point3::planar(10.0, 10.0),
        ];
        let target = Point3::planar(3.0, 4.0);
        let ranges = ranges_to(target, &anchors);
        let (solution, residuals) = solve_planar(&ranges, &GeometryConfig::default(), 0.03).unwrap();
        assert!(!solution.is_ambiguous());
        assert!(solution.primary().distance_to(&target) < 1e-6);
        assert!(residuals.iter().all(|r| *r < 1e-6));
    }

    #[test]
    fn test_planar_off_plane_subject_is_mirrored() {
        let anchors = vec![
            Point3::planar(0.0, 0.0),
            Point3::planar(10.0, 0.0),
            Point3::planar(0.0, 10.0),
            Point3::planar(10.0, 10.0),
        ];
        let target = Point3::new(3.0, 4.0, 5.0);
        let ranges = ranges_to(target, &anchors);
        let (solution, _) = solve_planar(&ranges, &GeometryConfig::default(), 0.05).unwrap();
        let mirror = solution.mirror().unwrap();
        assert!((solution.primary().z.abs() - 5.0).abs() < 1e-6);
        assert!((solution.primary().z + mirror.z).abs() < 1e-9);
    }

    #[test]
    fn test_noisy_coplanar_ring_is_not_mirrored() {
        let anchors: Vec<Point3> = (0..5)
            .map(|i| {
                let angle = i as f64 * std::f64::consts::TAU / 5.0;
                Point3::planar(50.0 * angle.cos(), 50.0 * angle.sin())
            })
            .collect();
        let target = Point3::planar(3.0, 4.0);
        let mut ranges = ranges_to(target, &anchors);
        for range in &mut ranges {
            range.distance += 0.05;
        }
        let config = GeometryConfig::default();
        let tolerance = config.tolerance_for(ranges.iter().map(|r| r.distance));
        let fix = solve_overdetermined(&ranges, &config, tolerance).unwrap();
        assert!(!fix.solution.is_ambiguous());
        assert!(fix.rejected.is_none());
        assert!(fix.solution.primary().z.abs() < 1e-12);
        assert!(fix.solution.primary().distance_to(&target) < 0.2);
        assert!(fix.residuals.iter().all(|r| *r <= tolerance));
    }

    #[test]
    fn test_overdetermined_exact() {
        let target = Point3::new(5.0, 6.0, 7.0);
        let ranges = ranges_to(target, &spatial_anchors());
        let fix = solve_overdetermined(&ranges, &GeometryConfig::default(), 0.05).unwrap();
        assert!(fix.solution.primary().distance_to(&target) < 1e-6);
        assert!(fix.rejected.is_none());
    }

    #[test]
    fn test_overdetermined_drops_single_outlier() {
        let target = Point3::new(5.0, 6.0, 7.0);
        let mut ranges = ranges_to(target, &spatial_anchors());
        ranges[7].distance += 6.0;
        let fix = solve_overdetermined(&ranges, &GeometryConfig::default(), 0.05).unwrap();
        assert_eq!(fix.rejected.as_deref(), Some("obs-7"));
        assert!(fix.solution.primary().distance_to(&target) < 1e-6);
        assert!(fix.residuals[7] > 5.0);
    }

    #[test]
    fn test_overdetermined_keeps_noise() {
        let target = Point3::new(5.0, 6.0, 7.0);
        let mut ranges = ranges_to(target, &spatial_anchors());
        let noise = [0.01, -0.012, 0.008, -0.009, 0.011, -0.01, 0.009, -0.008, 0.012, -0.011, 0.01, -0.009];
        for (range, n) in ranges.iter_mut().zip(noise) {
            range.distance += n;
        }
        let fix = solve_overdetermined(&ranges, &GeometryConfig::default(), 0.05).unwrap();
        assert!(fix.rejected.is_none());
        assert!(fix.solution.primary().distance_to(&target) < 0.1);
    }

    #[test]
    fn test_overdetermined_needs_five() {
        let ranges = ranges_to(Point3::origin(), &spatial_anchors()[..4]);
        assert!(matches!(
            solve_overdetermined(&ranges, &GeometryConfig::default(), 0.05),
            Err(Error::InsufficientObservers { need: 5, have: 4 })
        ));
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }
}
