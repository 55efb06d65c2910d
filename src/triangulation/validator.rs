//! Triangulation Validator
//!
//! Turns a round's valid reports into candidate positions:
//! 1. Pairwise triangle-inequality pre-filter
//! 2. Dispatch on the ranging report count (2, 3, 4, 5+)
//! 3. Clique search when the observers disagree with each other
//! 4. Reflection resolution by geometry, bearing, then prior

use crate::core::{Error, Result};
use crate::geometry::{
    affine_rank, check_triangle_inequality, resolve_reflection, solve_overdetermined,
    solve_planar, solve_tetrahedron, solve_triangle, worst_offender, GeometryConfig, Point3,
    Range, Trilateration,
};
use crate::triangulation::candidate::{
    Assessment, AssessmentStatus, CandidatePosition, Exclusion, ExclusionKind, ObserverReport,
    Strategy,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Limits on the clique search.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Largest pool searched triple by triple
    pub max_search_observers: usize,
    /// Most candidates reported for one round
    pub max_candidates: usize,
    /// Fewest ranging backers a clique needs
    pub min_clique: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_search_observers: 12,
            max_candidates: 4,
            min_clique: 3,
        }
    }
}

impl ValidatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_candidates == 0 {
            return Err(Error::InvalidConfig(
                "max_candidates must be at least 1".to_string(),
            ));
        }
        if self.min_clique < 3 {
            return Err(Error::InvalidConfig(
                "min_clique must be at least 3".to_string(),
            ));
        }
        Ok(())
    }
}

/// A raw solver output before observers are checked against it.
struct Hypothesis {
    solution: Trilateration,
    strategy: Strategy,
}

/// Triangulation validator.
#[derive(Clone, Debug, Default)]
pub struct TriangulationValidator {
    geometry: GeometryConfig,
    config: ValidatorConfig,
}

impl TriangulationValidator {
    /// Create a new validator.
    pub fn new(geometry: GeometryConfig, config: ValidatorConfig) -> Self {
        Self { geometry, config }
    }

    pub fn geometry(&self) -> &GeometryConfig {
        &self.geometry
    }

    /// Assess a round's valid reports.
    ///
    /// `prior` is only consulted to pick a side of a mirrored solution.
    pub fn assess(&self, reports: &[ObserverReport], prior: Option<&Point3>) -> Assessment {
        let participants = reports
            .iter()
            .map(|r| (r.observer_id.clone(), r.weight))
            .collect();
        let mut ranges: Vec<Range> = reports.iter().filter_map(ObserverReport::range).collect();
        let mut exclusions = Vec::new();
        let tolerance = self.prefilter(&mut ranges, &mut exclusions);

        let mut candidates = Vec::new();
        let status = match ranges.len() {
            0 | 1 => AssessmentStatus::Insufficient,
            2 => AssessmentStatus::DistanceOnly,
            _ => {
                let pool: Vec<&ObserverReport> = reports
                    .iter()
                    .filter(|r| ranges.iter().any(|g| g.observer_id == r.observer_id))
                    .collect();
                let bearing_only: Vec<&ObserverReport> = reports
                    .iter()
                    .filter(|r| r.distance.is_none() && r.bearing.is_some())
                    .collect();
                match self.extract(&pool, &bearing_only, tolerance, prior, &mut exclusions) {
                    Ok(found) => {
                        candidates = found;
                        AssessmentStatus::Solved
                    }
                    Err(err) => {
                        warn!(observers = pool.len(), error = %err, "indeterminate observer geometry");
                        AssessmentStatus::Indeterminate(err.to_string())
                    }
                }
            }
        };

        debug!(
            reports = reports.len(),
            ranging = ranges.len(),
            candidates = candidates.len(),
            tolerance,
            "triangulation assessed"
        );

        Assessment {
            status,
            tolerance,
            candidates,
            exclusions,
            ranges,
            participants,
        }
    }

    /// Drop the worst triangle-inequality offender until the set is
    /// consistent or only two ranges remain.
    ///
    /// Returns the round tolerance. It is taken from the surviving ranges
    /// only, so an excluded observer never tightens it for everyone else.
    fn prefilter(&self, ranges: &mut Vec<Range>, exclusions: &mut Vec<Exclusion>) -> f64 {
        loop {
            let tolerance = self.geometry.tolerance_for(ranges.iter().map(|r| r.distance));
            if ranges.len() < 3 {
                return tolerance;
            }
            let violations = check_triangle_inequality(ranges, tolerance);
            let Some(offender) = worst_offender(ranges, &violations) else {
                return tolerance;
            };
            let excess: f64 = violations
                .iter()
                .filter(|v| v.first == offender || v.second == offender)
                .map(|v| v.excess)
                .sum();
            warn!(observer = %offender, excess, "excluding geometrically inconsistent observer");
            ranges.retain(|r| r.observer_id != offender);
            exclusions.push(Exclusion {
                observer_id: offender,
                kind: ExclusionKind::GeometricallyInconsistent { excess },
            });
        }
    }

    /// Solve a set of ranges with the strategy its size calls for.
    fn dispatch(
        &self,
        ranges: &[Range],
        tolerance: f64,
        exclusions: &mut Vec<Exclusion>,
    ) -> Result<Hypothesis> {
        match ranges.len() {
            0..=2 => Err(Error::InsufficientObservers {
                need: 3,
                have: ranges.len(),
            }),
            3 => Ok(Hypothesis {
                solution: solve_triangle(ranges, &self.geometry, tolerance)?,
                strategy: Strategy::Triangle,
            }),
            4 => {
                let anchors: Vec<Point3> = ranges.iter().map(|r| r.anchor).collect();
                match affine_rank(&anchors, self.geometry.degeneracy_threshold) {
                    3 => Ok(Hypothesis {
                        solution: Trilateration::Unique(
                            solve_tetrahedron(ranges, &self.geometry)?.position,
                        ),
                        strategy: Strategy::Tetrahedron,
                    }),
                    2 => Ok(Hypothesis {
                        solution: solve_planar(ranges, &self.geometry, tolerance)?.0,
                        strategy: Strategy::Planar,
                    }),
                    _ => Err(Error::Indeterminate(
                        "observers are coincident or collinear".to_string(),
                    )),
                }
            }
            _ => {
                let fix = solve_overdetermined(ranges, &self.geometry, tolerance)?;
                if let Some(rejected) = fix.rejected {
                    debug!(observer = %rejected, "least-squares outlier removed");
                    exclusions.push(Exclusion {
                        observer_id: rejected,
                        kind: ExclusionKind::ResidualOutlier,
                    });
                }
                Ok(Hypothesis {
                    solution: fix.solution,
                    strategy: Strategy::LeastSquares,
                })
            }
        }
    }

    /// Find the candidates supported by the pool.
    fn extract(
        &self,
        pool: &[&ObserverReport],
        bearing_only: &[&ObserverReport],
        tolerance: f64,
        prior: Option<&Point3>,
        exclusions: &mut Vec<Exclusion>,
    ) -> Result<Vec<CandidatePosition>> {
        let ranges = ranges_of(pool);
        let first = self
            .dispatch(&ranges, tolerance, exclusions)
            .map(|h| self.candidate(h, pool, bearing_only, tolerance, prior));

        if let Ok(candidate) = &first {
            if candidate.backer_count() >= pool.len()
                && pool.iter().all(|r| candidate.backed_by(&r.observer_id))
            {
                return Ok(vec![candidate.clone()]);
            }
        }
        if pool.len() > self.config.max_search_observers {
            return first.map(|c| vec![c]);
        }

        let seed = first.as_ref().ok().cloned();
        let cliques = self.search_cliques(pool, bearing_only, tolerance, prior, seed);
        if cliques.is_empty() {
            return first.map(|c| vec![c]);
        }
        Ok(cliques)
    }

    /// Peel off mutually consistent observer subsets, best-backed first.
    fn search_cliques(
        &self,
        pool: &[&ObserverReport],
        bearing_only: &[&ObserverReport],
        tolerance: f64,
        prior: Option<&Point3>,
        mut seed: Option<CandidatePosition>,
    ) -> Vec<CandidatePosition> {
        let mut remaining: Vec<&ObserverReport> = pool.to_vec();
        let mut found: Vec<CandidatePosition> = Vec::new();

        while found.len() < self.config.max_candidates && remaining.len() >= self.config.min_clique {
            let ranges = ranges_of(&remaining);
            let mut best: Option<CandidatePosition> = seed
                .take()
                .map(|c| self.candidate(
                    Hypothesis {
                        solution: solution_of(&c),
                        strategy: c.strategy,
                    },
                    &remaining,
                    bearing_only,
                    tolerance,
                    prior,
                ));

            for i in 0..ranges.len() {
                for j in i + 1..ranges.len() {
                    for k in j + 1..ranges.len() {
                        let triple = [ranges[i].clone(), ranges[j].clone(), ranges[k].clone()];
                        let Ok(solution) = solve_triangle(&triple, &self.geometry, tolerance) else {
                            continue;
                        };
                        let hypothesis = Hypothesis {
                            solution,
                            strategy: Strategy::Clique,
                        };
                        let candidate =
                            self.candidate(hypothesis, &remaining, bearing_only, tolerance, prior);
                        if best.as_ref().map_or(true, |b| outranks(&candidate, b)) {
                            best = Some(candidate);
                        }
                    }
                }
            }

            let Some(mut best) = best else {
                break;
            };
            let ranging_backers: Vec<&ObserverReport> = remaining
                .iter()
                .copied()
                .filter(|r| r.distance.is_some() && best.backed_by(&r.observer_id))
                .collect();
            if ranging_backers.len() < self.config.min_clique {
                break;
            }

            // Refit over the clique; keep the refit only if it loses no support.
            let mut scratch = Vec::new();
            if let Ok(refit) = self.dispatch(&ranges_of(&ranging_backers), tolerance, &mut scratch) {
                let mut refined = self.candidate(refit, &remaining, bearing_only, tolerance, prior);
                refined.strategy = Strategy::Clique;
                if !outranks(&best, &refined) {
                    best = refined;
                }
            }
            best.strategy = Strategy::Clique;

            remaining.retain(|r| !best.backed_by(&r.observer_id));
            debug!(
                backers = best.backer_count(),
                weight = best.backing_weight,
                remaining = remaining.len(),
                "observer clique extracted"
            );
            found.push(best);
        }

        found.sort_by(|a, b| b.backing_weight.total_cmp(&a.backing_weight));
        found
    }

    /// Check every report against a hypothesis and build the candidate.
    fn candidate(
        &self,
        hypothesis: Hypothesis,
        pool: &[&ObserverReport],
        bearing_only: &[&ObserverReport],
        tolerance: f64,
        prior: Option<&Point3>,
    ) -> CandidatePosition {
        let resolved = self.resolve(hypothesis.solution, pool, bearing_only, tolerance, prior);
        let position = resolved.primary();
        let bearing_tolerance = self.geometry.bearing_tolerance;

        let backers: Vec<&ObserverReport> = pool
            .iter()
            .chain(bearing_only.iter())
            .copied()
            .filter(|r| r.agrees_with(&position, bearing_tolerance, tolerance))
            .collect();
        let residuals: Vec<f64> = backers
            .iter()
            .filter_map(|r| r.range())
            .map(|range| range.residual(&position))
            .collect();
        let residual_error = if residuals.is_empty() {
            0.0
        } else {
            (residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64).sqrt()
        };

        CandidatePosition {
            position,
            mirror: resolved.mirror(),
            residual_error,
            consistent_observers: backers.iter().map(|r| r.observer_id.clone()).collect(),
            backing_weight: backers.iter().map(|r| r.weight).sum(),
            strategy: hypothesis.strategy,
        }
    }

    /// Pick a side of a mirrored solution.
    ///
    /// Order: distance support from observers outside the solve, bearing
    /// support, the prior. Anything left undecided stays mirrored.
    fn resolve(
        &self,
        solution: Trilateration,
        pool: &[&ObserverReport],
        bearing_only: &[&ObserverReport],
        tolerance: f64,
        prior: Option<&Point3>,
    ) -> Trilateration {
        let Trilateration::Mirrored { primary, mirror } = solution else {
            return solution;
        };
        let bearing_tolerance = self.geometry.bearing_tolerance;

        let distance_support = |target: &Point3| -> f64 {
            pool.iter()
                .filter(|r| {
                    r.distance
                        .is_some_and(|d| (r.position.distance_to(target) - d).abs() <= tolerance)
                })
                .map(|r| r.weight)
                .sum()
        };
        if let Some(side) = pick_side(primary, mirror, distance_support(&primary), distance_support(&mirror)) {
            return side;
        }

        let bearing_support = |target: &Point3| -> f64 {
            pool.iter()
                .chain(bearing_only.iter())
                .filter(|r| r.bearing.is_some() && r.bearing_agrees(target, bearing_tolerance, tolerance))
                .map(|r| r.weight)
                .sum()
        };
        if let Some(side) = pick_side(primary, mirror, bearing_support(&primary), bearing_support(&mirror)) {
            return side;
        }

        resolve_reflection(solution, prior, tolerance)
    }
}

fn ranges_of(reports: &[&ObserverReport]) -> Vec<Range> {
    reports.iter().filter_map(|r| r.range()).collect()
}

fn solution_of(candidate: &CandidatePosition) -> Trilateration {
    match candidate.mirror {
        Some(mirror) => Trilateration::Mirrored {
            primary: candidate.position,
            mirror,
        },
        None => Trilateration::Unique(candidate.position),
    }
}

fn pick_side(primary: Point3, mirror: Point3, primary_support: f64, mirror_support: f64) -> Option<Trilateration> {
    const MARGIN: f64 = 1e-9;
    if primary_support > mirror_support + MARGIN {
        Some(Trilateration::Unique(primary))
    } else if mirror_support > primary_support + MARGIN {
        Some(Trilateration::Unique(mirror))
    } else {
        None
    }
}

/// Candidate ordering: backing weight, then backer count, then residual.
fn outranks(a: &CandidatePosition, b: &CandidatePosition) -> bool {
    const MARGIN: f64 = 1e-9;
    if (a.backing_weight - b.backing_weight).abs() > MARGIN {
        return a.backing_weight > b.backing_weight;
    }
    if a.backer_count() != b.backer_count() {
        return a.backer_count() > b.backer_count();
    }
    a.residual_error < b.residual_error
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranging(id: &str, position: Point3, target: &Point3) -> ObserverReport {
        ObserverReport {
            observer_id: id.to_string(),
            position,
            weight: 1.0,
            distance: Some(position.distance_to(target)),
            bearing: None,
        }
    }

    fn reports_to(target: Point3, anchors: &[Point3]) -> Vec<ObserverReport> {
        anchors
            .iter()
            .enumerate()
            .map(|(i, a)| ranging(&format!("obs-{}", i), *a, &target))
            .collect()
    }

    fn ring(count: usize, radius: f64) -> Vec<Point3> {
        (0..count)
            .map(|i| {
                let angle = i as f64 * std::f64::consts::TAU / count as f64;
                Point3::planar(radius * angle.cos(), radius * angle.sin())
            })
            .collect()
    }

    #[test]
    fn test_insufficient_and_distance_only() {
        let validator = TriangulationValidator::default();
        let target = Point3::planar(5.0, 5.0);

        let one = reports_to(target, &ring(1, 10.0));
        assert_eq!(validator.assess(&one, None).status, AssessmentStatus::Insufficient);

        let two = reports_to(target, &ring(2, 10.0));
        let assessment = validator.assess(&two, None);
        assert_eq!(assessment.status, AssessmentStatus::DistanceOnly);
        assert!(assessment.candidates.is_empty());
        assert_eq!(assessment.ranges.len(), 2);
    }

    #[test]
    fn test_bearing_only_reports_never_enter_a_solve() {
        let validator = TriangulationValidator::default();
        let target = Point3::planar(5.0, 5.0);
        let mut reports = reports_to(target, &ring(1, 10.0));
        let observer = Point3::planar(-10.0, 0.0);
        reports.push(ObserverReport {
            observer_id: "bearing".to_string(),
            position: observer,
            weight: 1.0,
            distance: None,
            bearing: Some(observer.bearing_to(&target)),
        });
        let assessment = validator.assess(&reports, None);
        assert_eq!(assessment.status, AssessmentStatus::Insufficient);
        assert_eq!(assessment.participants.len(), 2);
    }

    #[test]
    fn test_three_observers_one_candidate() {
        let validator = TriangulationValidator::default();
        let target = Point3::planar(5.0, 2.8868);
        let anchors = [
            Point3::planar(0.0, 0.0),
            Point3::planar(10.0, 0.0),
            Point3::planar(5.0, 8.66),
        ];
        let assessment = validator.assess(&reports_to(target, &anchors), None);
        assert_eq!(assessment.status, AssessmentStatus::Solved);
        assert_eq!(assessment.candidates.len(), 1);
        let candidate = &assessment.candidates[0];
        assert!(candidate.position.distance_to(&target) < 1e-6);
        assert_eq!(candidate.backer_count(), 3);
        assert_eq!(candidate.strategy, Strategy::Triangle);
        assert!(!candidate.is_ambiguous());
    }

    #[test]
    fn test_inconsistent_observer_is_prefiltered() {
        let validator = TriangulationValidator::default();
        let anchors = [
            Point3::planar(0.0, 0.0),
            Point3::planar(10.0, 0.0),
            Point3::planar(5.0, 8.66),
        ];
        let reports: Vec<ObserverReport> = [1.0, 1.0, 100.0]
            .iter()
            .zip(anchors.iter())
            .zip(["a", "b", "c"])
            .map(|((d, a), id)| ObserverReport {
                observer_id: id.to_string(),
                position: *a,
                weight: 1.0,
                distance: Some(*d),
                bearing: None,
            })
            .collect();

        let assessment = validator.assess(&reports, None);
        assert_eq!(assessment.status, AssessmentStatus::DistanceOnly);
        assert_eq!(assessment.exclusions.len(), 1);
        assert_eq!(assessment.exclusions[0].observer_id, "c");
        assert!(matches!(
            assessment.exclusions[0].kind,
            ExclusionKind::GeometricallyInconsistent { .. }
        ));
        // Excluded observers still count towards the total weight.
        assert_eq!(assessment.total_weight(), 3.0);
    }

    #[test]
    fn test_excluded_observer_does_not_set_tolerance() {
        let validator = TriangulationValidator::default();
        let target = Point3::planar(3.0, 4.0);
        let noise = [-0.1, -0.15, -0.2, -0.1, -0.15];
        let mut reports = reports_to(target, &ring(5, 50.0));
        for (report, n) in reports.iter_mut().zip(noise) {
            report.distance = report.distance.map(|d| d + n);
        }
        let honest = validator.assess(&reports, None);

        reports.push(ObserverReport {
            observer_id: "liar".to_string(),
            position: Point3::planar(-70.0, 70.0),
            weight: 1.0,
            distance: Some(0.0),
            bearing: None,
        });
        let assessment = validator.assess(&reports, None);

        assert_eq!(assessment.exclusions.len(), 1);
        assert_eq!(assessment.exclusions[0].observer_id, "liar");
        assert_eq!(assessment.tolerance, honest.tolerance);
        assert!(assessment.tolerance > 0.4);
        assert_eq!(assessment.status, AssessmentStatus::Solved);
        let winner = &assessment.candidates[0];
        assert_eq!(winner.backer_count(), 5);
        assert!(!winner.is_ambiguous());
        assert!(winner.position.distance_to(&target) < 0.3);
        assert_eq!(assessment.total_weight(), 6.0);
    }

    #[test]
    fn test_tetrahedron_dispatch() {
        let validator = TriangulationValidator::default();
        let target = Point3::new(3.0, 4.0, 5.0);
        let anchors = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(10.0, 0.0, 0.0),
            Point3::new(0.0, 10.0, 0.0),
            Point3::new(0.0, 0.0, 10.0),
        ];
        let assessment = validator.assess(&reports_to(target, &anchors), None);
        assert_eq!(assessment.candidates.len(), 1);
        assert_eq!(assessment.candidates[0].strategy, Strategy::Tetrahedron);
        assert!(assessment.candidates[0].position.distance_to(&target) < 1e-6);
    }

    #[test]
    fn test_coplanar_four_use_planar_solve() {
        let validator = TriangulationValidator::default();
        let target = Point3::planar(2.0, 3.0);
        let assessment = validator.assess(&reports_to(target, &ring(4, 10.0)), None);
        assert_eq!(assessment.candidates.len(), 1);
        assert_eq!(assessment.candidates[0].strategy, Strategy::Planar);
        assert!(assessment.candidates[0].position.distance_to(&target) < 1e-6);
    }

    #[test]
    fn test_collinear_observers_are_indeterminate() {
        let validator = TriangulationValidator::default();
        let target = Point3::planar(3.0, 4.0);
        let anchors = [
            Point3::planar(0.0, 0.0),
            Point3::planar(5.0, 0.0),
            Point3::planar(10.0, 0.0),
        ];
        let assessment = validator.assess(&reports_to(target, &anchors), None);
        assert!(matches!(assessment.status, AssessmentStatus::Indeterminate(_)));
        assert!(assessment.candidates.is_empty());
    }

    #[test]
    fn test_colluding_minority_forms_separate_clique() {
        let validator = TriangulationValidator::default();
        let truth = Point3::planar(3.0, -2.0);
        let lie = Point3::planar(-12.0, 14.0);
        let anchors = ring(10, 30.0);

        let mut reports = reports_to(truth, &anchors[..7]);
        for (i, a) in anchors[7..].iter().enumerate() {
            reports.push(ranging(&format!("liar-{}", i), *a, &lie));
        }

        let assessment = validator.assess(&reports, None);
        assert_eq!(assessment.status, AssessmentStatus::Solved);
        let winner = &assessment.candidates[0];
        assert!(winner.position.distance_to(&truth) < 1e-3);
        assert_eq!(winner.backer_count(), 7);
        assert!(winner
            .consistent_observers
            .iter()
            .all(|id| id.starts_with("obs-")));
        for candidate in &assessment.candidates[1..] {
            assert!(candidate.backing_weight < winner.backing_weight);
        }
    }

    #[test]
    fn test_mirror_resolved_by_bearing_then_prior() {
        let validator = TriangulationValidator::default();
        // Observers in the vertical plane x = 0.
        let anchors = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.0, 10.0, 0.0),
            Point3::new(0.0, 0.0, 10.0),
        ];
        let target = Point3::new(4.0, 3.0, 2.0);
        let mut reports = reports_to(target, &anchors);

        let ambiguous = validator.assess(&reports, None);
        assert!(ambiguous.candidates[0].is_ambiguous());

        let with_prior = validator.assess(&reports, Some(&Point3::new(1.0, 3.0, 2.0)));
        assert!(with_prior.candidates[0].position.distance_to(&target) < 1e-6);
        assert!(!with_prior.candidates[0].is_ambiguous());

        // A bearing from the first observer breaks the tie even against the prior.
        reports[0].bearing = Some(anchors[0].bearing_to(&target));
        let wrong_prior = Point3::new(-1.0, 3.0, 2.0);
        let with_bearing = validator.assess(&reports, Some(&wrong_prior));
        assert!(with_bearing.candidates[0].position.distance_to(&target) < 1e-6);
    }

    #[test]
    fn test_single_outlier_in_large_set_is_not_a_backer() {
        let validator = TriangulationValidator::default();
        let target = Point3::new(4.0, -3.0, 6.0);
        let mut anchors = ring(6, 25.0);
        anchors.push(Point3::new(0.0, 0.0, 30.0));
        anchors.push(Point3::new(5.0, 5.0, -20.0));
        let mut reports = reports_to(target, &anchors);
        reports[2].distance = reports[2].distance.map(|d| d + 8.0);

        let assessment = validator.assess(&reports, None);
        let winner = &assessment.candidates[0];
        assert!(winner.position.distance_to(&target) < 1e-3);
        assert_eq!(winner.backer_count(), 7);
        assert!(!winner.backed_by("obs-2"));
    }
}
