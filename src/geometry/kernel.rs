//! Distance checks and the three-observer triangle solve.

use crate::core::{Error, ObserverId, Result};
use crate::geometry::point::Point3;
use crate::geometry::GeometryConfig;
use serde::{Deserialize, Serialize};

/// A distance measured by one observer from a known anchor position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// Observer that reported the distance
    pub observer_id: ObserverId,
    /// Observer position at measurement time
    pub anchor: Point3,
    /// Reported distance to the subject
    pub distance: f64,
}

impl Range {
    /// Create a new range measurement.
    pub fn new(observer_id: &str, anchor: Point3, distance: f64) -> Self {
        Self {
            observer_id: observer_id.to_string(),
            anchor,
            distance,
        }
    }

    /// Absolute disagreement between the report and a candidate point.
    pub fn residual(&self, point: &Point3) -> f64 {
        (point.distance_to(&self.anchor) - self.distance).abs()
    }
}

/// Outcome of checking one range against a point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeCheck {
    pub observer_id: ObserverId,
    pub residual: f64,
    pub consistent: bool,
}

/// Per-observer result of a distance-only check.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistanceConsistency {
    pub checks: Vec<RangeCheck>,
}

impl DistanceConsistency {
    /// Number of observers whose distance agrees with the point.
    pub fn consistent_count(&self) -> usize {
        self.checks.iter().filter(|c| c.consistent).count()
    }

    /// Ids of the agreeing observers.
    pub fn consistent_observers(&self) -> Vec<ObserverId> {
        self.checks
            .iter()
            .filter(|c| c.consistent)
            .map(|c| c.observer_id.clone())
            .collect()
    }

    pub fn all_consistent(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.consistent)
    }
}

/// Check a claimed position against two observers' distances.
///
/// Two spheres meet in a circle, not a point, so this never produces a
/// position; it only says which observers agree with the claim.
pub fn solve_distance_only(
    ranges: &[Range],
    claim: &Point3,
    tolerance: f64,
) -> Result<DistanceConsistency> {
    if ranges.len() < 2 {
        return Err(Error::InsufficientObservers {
            need: 2,
            have: ranges.len(),
        });
    }
    let checks = ranges
        .iter()
        .map(|range| {
            let residual = range.residual(claim);
            RangeCheck {
                observer_id: range.observer_id.clone(),
                residual,
                consistent: residual <= tolerance,
            }
        })
        .collect();
    Ok(DistanceConsistency { checks })
}

/// A pair of observers whose reported distances cannot both be true.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub first: ObserverId,
    pub second: ObserverId,
    /// How far the pair is outside the feasible band
    pub excess: f64,
}

/// Pairwise triangle-inequality check.
///
/// For observers `i`, `j` separated by `d`, the subject can only exist if
/// `|r_i - r_j| <= d <= r_i + r_j`.
pub fn check_triangle_inequality(ranges: &[Range], tolerance: f64) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (i, a) in ranges.iter().enumerate() {
        for b in &ranges[i + 1..] {
            let separation = a.anchor.distance_to(&b.anchor);
            let too_far = separation - (a.distance + b.distance);
            let nested = (a.distance - b.distance).abs() - separation;
            let excess = too_far.max(nested);
            if excess > tolerance {
                violations.push(Violation {
                    first: a.observer_id.clone(),
                    second: b.observer_id.clone(),
                    excess,
                });
            }
        }
    }
    violations
}

/// The observer carrying the largest total violation excess.
///
/// `None` when there are no violations or when the largest total is shared:
/// a lone violating pair cannot tell which of its two reports is wrong.
pub fn worst_offender(ranges: &[Range], violations: &[Violation]) -> Option<ObserverId> {
    let mut totals: Vec<(&ObserverId, f64)> = ranges
        .iter()
        .map(|range| {
            let id = &range.observer_id;
            let total: f64 = violations
                .iter()
                .filter(|v| &v.first == id || &v.second == id)
                .map(|v| v.excess)
                .sum();
            (id, total)
        })
        .filter(|(_, total)| *total > 0.0)
        .collect();
    totals.sort_by(|a, b| b.1.total_cmp(&a.1));
    match totals.as_slice() {
        [] => None,
        [(id, _)] => Some((*id).clone()),
        [(id, best), (_, next), ..] => {
            if best - next > 1e-9 * best.max(1.0) {
                Some((*id).clone())
            } else {
                None
            }
        }
    }
}

/// Result of a solve that may only be known up to a reflection.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Trilateration {
    /// A single point
    Unique(Point3),
    /// Two points mirrored across the observers' plane
    Mirrored { primary: Point3, mirror: Point3 },
}

impl Trilateration {
    pub fn primary(&self) -> Point3 {
        match self {
            Trilateration::Unique(p) => *p,
            Trilateration::Mirrored { primary, .. } => *primary,
        }
    }

    pub fn mirror(&self) -> Option<Point3> {
        match self {
            Trilateration::Unique(_) => None,
            Trilateration::Mirrored { mirror, .. } => Some(*mirror),
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Trilateration::Mirrored { .. })
    }
}

/// Orthonormal frame spanning the plane of a set of observers.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PlaneFrame {
    pub origin: Point3,
    pub ex: Point3,
    pub ey: Point3,
    pub ez: Point3,
    /// Largest anchor distance from the origin
    pub scale: f64,
}

impl PlaneFrame {
    /// Frame with `ex` pointing from `a0` to `a1` and `a2` in the `xy` plane.
    pub fn from_axis(a0: Point3, a1: Point3, a2: Point3, degeneracy: f64) -> Result<Self> {
        let ex = (a1 - a0)
            .normalized()
            .ok_or_else(|| Error::Indeterminate("coincident observers".to_string()))?;
        let scale = a0.distance_to(&a1).max(a0.distance_to(&a2));
        let v = a2 - a0;
        let perpendicular = v - ex * ex.dot(&v);
        let sine = perpendicular.norm() / v.norm().max(f64::EPSILON);
        if sine < degeneracy {
            return Err(Error::Indeterminate("collinear observers".to_string()));
        }
        let ey = perpendicular * (1.0 / perpendicular.norm());
        Ok(Self {
            origin: a0,
            ex,
            ey,
            ez: ex.cross(&ey),
            scale,
        })
    }

    /// Best-spread frame through an arbitrary set of anchors.
    pub fn fit(anchors: &[Point3], degeneracy: f64) -> Result<Self> {
        let origin = *anchors
            .first()
            .ok_or_else(|| Error::Indeterminate("no observers".to_string()))?;
        let far = anchors
            .iter()
            .copied()
            .max_by(|a, b| origin.distance_to(a).total_cmp(&origin.distance_to(b)))
            .unwrap_or(origin);
        let scale = origin.distance_to(&far);
        let ex = (far - origin)
            .normalized()
            .ok_or_else(|| Error::Indeterminate("coincident observers".to_string()))?;
        let widest = anchors
            .iter()
            .map(|a| {
                let v = *a - origin;
                v - ex * ex.dot(&v)
            })
            .max_by(|a, b| a.norm().total_cmp(&b.norm()))
            .unwrap_or_default();
        if widest.norm() / scale < degeneracy {
            return Err(Error::Indeterminate("collinear observers".to_string()));
        }
        let ey = widest * (1.0 / widest.norm());
        Ok(Self {
            origin,
            ex,
            ey,
            ez: ex.cross(&ey),
            scale,
        })
    }

    /// Coordinates of `p` in this frame.
    pub fn local(&self, p: &Point3) -> Point3 {
        let v = *p - self.origin;
        Point3::new(self.ex.dot(&v), self.ey.dot(&v), self.ez.dot(&v))
    }

    /// World point for frame coordinates.
    pub fn world(&self, u: f64, v: f64, w: f64) -> Point3 {
        self.origin + self.ex * u + self.ey * v + self.ez * w
    }

    /// Build the (possibly mirrored) solution at height `h² = height_sq`.
    ///
    /// The in-plane point wins whenever every range already agrees with it
    /// within `tolerance`: range noise alone must never lift a solution off
    /// the observers' plane.
    pub fn lift(
        &self,
        u: f64,
        v: f64,
        height_sq: f64,
        ranges: &[Range],
        tolerance: f64,
    ) -> Trilateration {
        let base = self.world(u, v, 0.0);
        if height_sq <= 0.0 || ranges.iter().all(|r| r.residual(&base) <= tolerance) {
            return Trilateration::Unique(base);
        }
        let h = height_sq.sqrt();
        // Mirrors closer together than ε are the same point for every check.
        if 2.0 * h <= tolerance {
            return Trilateration::Unique(base);
        }
        Trilateration::Mirrored {
            primary: base + self.ez * h,
            mirror: base - self.ez * h,
        }
    }
}

/// Affine rank of a point set: 0 (all coincident) up to 3 (spans space).
pub fn affine_rank(anchors: &[Point3], degeneracy: f64) -> usize {
    let Some(first) = anchors.first() else {
        return 0;
    };
    if anchors.iter().all(|a| a.distance_to(first) <= f64::EPSILON) {
        return 0;
    }
    let frame = match PlaneFrame::fit(anchors, degeneracy) {
        Ok(frame) => frame,
        Err(_) => return 1,
    };
    let off_plane = anchors
        .iter()
        .map(|a| frame.local(a).z.abs())
        .fold(0.0, f64::max);
    if off_plane / frame.scale < degeneracy {
        2
    } else {
        3
    }
}

/// Three-observer solve via the law of cosines.
///
/// Places observer 0 at the origin and observer 1 on the x axis, so the
/// subject's projection follows from the cosine rule on each pair of
/// spheres. Returns both reflections when the subject lies off the
/// observers' plane; use [`resolve_reflection`] to pick one.
pub fn solve_triangle(
    ranges: &[Range],
    config: &GeometryConfig,
    tolerance: f64,
) -> Result<Trilateration> {
    if ranges.len() < 3 {
        return Err(Error::InsufficientObservers {
            need: 3,
            have: ranges.len(),
        });
    }
    if ranges.len() > 3 {
        return Err(Error::Indeterminate(format!(
            "triangle solve takes 3 observers, got {}",
            ranges.len()
        )));
    }

    let violations = check_triangle_inequality(ranges, tolerance);
    if let Some(first) = violations.first() {
        let offender = worst_offender(ranges, &violations).unwrap_or_else(|| first.first.clone());
        return Err(Error::GeometricallyInconsistent(offender));
    }

    let (r0, r1, r2) = (ranges[0].distance, ranges[1].distance, ranges[2].distance);
    let frame = PlaneFrame::from_axis(
        ranges[0].anchor,
        ranges[1].anchor,
        ranges[2].anchor,
        config.degeneracy_threshold,
    )?;
    let d = ranges[0].anchor.distance_to(&ranges[1].anchor);
    let third = frame.local(&ranges[2].anchor);
    let (i, j) = (third.x, third.y);

    // r1² = r0² + d² - 2·d·(r0·cosθ), with x = r0·cosθ
    let x = (r0 * r0 - r1 * r1 + d * d) / (2.0 * d);
    let y = (r0 * r0 - r2 * r2 + i * i + j * j) / (2.0 * j) - (i / j) * x;
    let height_sq = r0 * r0 - x * x - y * y;

    Ok(frame.lift(x, y, height_sq, ranges, tolerance))
}

/// Pick one side of a mirrored solution using a prior position.
///
/// The prior's side of the mirror plane decides; when the prior sits on
/// the plane the closer solution wins; an exact tie stays mirrored.
pub fn resolve_reflection(
    solution: Trilateration,
    prior: Option<&Point3>,
    tolerance: f64,
) -> Trilateration {
    let (Trilateration::Mirrored { primary, mirror }, Some(prior)) = (solution, prior) else {
        return solution;
    };
    let mid = (primary + mirror) * 0.5;
    let Some(axis) = (primary - mirror).normalized() else {
        return Trilateration::Unique(primary);
    };
    let side = (*prior - mid).dot(&axis);
    if side > tolerance * 0.5 {
        return Trilateration::Unique(primary);
    }
    if side < -tolerance * 0.5 {
        return Trilateration::Unique(mirror);
    }
    let to_primary = prior.distance_to(&primary);
    let to_mirror = prior.distance_to(&mirror);
    if to_primary < to_mirror {
        Trilateration::Unique(primary)
    } else if to_mirror < to_primary {
        Trilateration::Unique(mirror)
    } else {
        solution
    }
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

    fn triangle_anchors() -> Vec<Point3> {
        vec![
            Point3::planar(0.0, 0.0),
            Point3::planar(10.0, 0.0),
            Point3::planar(5.0, 8.66),
        ]
    }

    #[test]
    fn test_distance_only_pair() {
        let claim = Point3::planar(3.0, 4.0);
        let ranges = vec![
            Range::new("a", Point3::origin(), 5.0),
            Range::new("b", Point3::planar(6.0, 0.0), 9.0),
        ];
        let result = solve_distance_only(&ranges, &claim, 0.05).unwrap();
        assert_eq!(result.consistent_count(), 1);
        assert_eq!(result.consistent_observers(), vec!["a".to_string()]);
        assert!(!result.all_consistent());
    }

    #[test]
    fn test_distance_only_needs_two() {
        let ranges = vec![Range::new("a", Point3::origin(), 5.0)];
        let err = solve_distance_only(&ranges, &Point3::origin(), 0.1).unwrap_err();
        assert!(matches!(err, Error::InsufficientObservers { need: 2, have: 1 }));
    }

    #[test]
    fn test_triangle_recovers_planar_point() {
        let target = Point3::planar(4.0, 3.0);
        let ranges = ranges_to(target, &triangle_anchors());
        let solution = solve_triangle(&ranges, &GeometryConfig::default(), 0.01).unwrap();
        let found = solution.primary();
        assert!(!solution.is_ambiguous());
        assert!(found.distance_to(&target) < 1e-9);
    }

    #[test]
    fn test_noisy_planar_triangle_stays_in_plane() {
        let target = Point3::planar(5.0, 2.8868);
        let mut ranges = ranges_to(target, &triangle_anchors());
        for range in &mut ranges {
            range.distance += 0.01;
        }
        let tolerance = GeometryConfig::default().tolerance_for(ranges.iter().map(|r| r.distance));
        let solution = solve_triangle(&ranges, &GeometryConfig::default(), tolerance).unwrap();
        assert!(!solution.is_ambiguous());
        assert!(solution.primary().z.abs() < 1e-12);
        assert!(solution.primary().distance_to(&target) < 1e-3);
    }

    #[test]
    fn test_triangle_reports_both_reflections() {
        let target = Point3::new(4.0, 3.0, 6.0);
        let ranges = ranges_to(target, &triangle_anchors());
        let solution = solve_triangle(&ranges, &GeometryConfig::default(), 0.01).unwrap();
        let mirror_target = Point3::new(4.0, 3.0, -6.0);
        let primary = solution.primary();
        let mirror = solution.mirror().unwrap();
        let hit = |p: &Point3| p.distance_to(&target) < 1e-9 || p.distance_to(&mirror_target) < 1e-9;
        assert!(hit(&primary));
        assert!(hit(&mirror));
        assert!(primary.distance_to(&mirror) > 1.0);
    }

    #[test]
    fn test_reflection_resolved_by_prior_side() {
        let target = Point3::new(4.0, 3.0, 6.0);
        let ranges = ranges_to(target, &triangle_anchors());
        let solution = solve_triangle(&ranges, &GeometryConfig::default(), 0.01).unwrap();
        let prior = Point3::new(3.0, 2.0, 5.0);
        let resolved = resolve_reflection(solution, Some(&prior), 0.01);
        assert_eq!(resolved, Trilateration::Unique(resolved.primary()));
        assert!(resolved.primary().distance_to(&target) < 1e-9);
    }

    #[test]
    fn test_reflection_without_prior_stays_ambiguous() {
        let target = Point3::new(4.0, 3.0, 6.0);
        let ranges = ranges_to(target, &triangle_anchors());
        let solution = solve_triangle(&ranges, &GeometryConfig::default(), 0.01).unwrap();
        assert!(resolve_reflection(solution, None, 0.01).is_ambiguous());
    }

    #[test]
    fn test_reflection_prior_on_plane_is_a_tie() {
        let target = Point3::new(4.0, 3.0, 6.0);
        let ranges = ranges_to(target, &triangle_anchors());
        let solution = solve_triangle(&ranges, &GeometryConfig::default(), 0.01).unwrap();
        let on_plane = Point3::planar(4.0, 3.0);
        assert!(resolve_reflection(solution, Some(&on_plane), 0.01).is_ambiguous());
    }

    #[test]
    fn test_triangle_inequality_rejects_impossible_distances() {
        let ranges = vec![
            Range::new("a", Point3::planar(0.0, 0.0), 1.0),
            Range::new("b", Point3::planar(10.0, 0.0), 1.0),
            Range::new("c", Point3::planar(5.0, 8.66), 100.0),
        ];
        let violations = check_triangle_inequality(&ranges, 0.01);
        assert_eq!(violations.len(), 3);
        assert_eq!(worst_offender(&ranges, &violations), Some("c".to_string()));

        let err = solve_triangle(&ranges, &GeometryConfig::default(), 0.01).unwrap_err();
        assert!(matches!(err, Error::GeometricallyInconsistent(id) if id == "c"));
    }

    #[test]
    fn test_lone_violating_pair_has_no_worst_offender() {
        let ranges = vec![
            Range::new("a", Point3::planar(0.0, 0.0), 2.0),
            Range::new("b", Point3::planar(10.0, 0.0), 2.0),
        ];
        let violations = check_triangle_inequality(&ranges, 0.01);
        assert_eq!(violations.len(), 1);
        assert_eq!(worst_offender(&ranges, &violations), None);
    }

    #[test]
    fn test_triangle_tangent_spheres_are_feasible() {
        // Circles of radius 5 around observers 10 apart touch at one point.
        let ranges = vec![
            Range::new("a", Point3::planar(0.0, 0.0), 5.0),
            Range::new("b", Point3::planar(10.0, 0.0), 5.0),
        ];
        assert!(check_triangle_inequality(&ranges, 0.01).is_empty());
    }

    #[test]
    fn test_collinear_observers_are_indeterminate() {
        let anchors = vec![
            Point3::planar(0.0, 0.0),
            Point3::planar(5.0, 0.0),
            Point3::planar(10.0, 0.0),
        ];
        let ranges = ranges_to(Point3::planar(5.0, 5.0), &anchors);
        let err = solve_triangle(&ranges, &GeometryConfig::default(), 0.05).unwrap_err();
        assert!(matches!(err, Error::Indeterminate(_)));
    }

    #[test]
    fn test_affine_rank() {
        let degeneracy = 1e-3;
        assert_eq!(affine_rank(&[], degeneracy), 0);
        assert_eq!(affine_rank(&[Point3::origin(), Point3::origin()], degeneracy), 0);
        assert_eq!(
            affine_rank(&[Point3::origin(), Point3::planar(1.0, 0.0), Point3::planar(2.0, 0.0)], degeneracy),
            1
        );
        assert_eq!(affine_rank(&triangle_anchors(), degeneracy), 2);
        let mut spatial = triangle_anchors();
        spatial.push(Point3::new(5.0, 3.0, 7.0));
        assert_eq!(affine_rank(&spatial, degeneracy), 3);
    }
}
