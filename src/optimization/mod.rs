//! The `optimization` module refines the reconstruction with bundle adjustment.
//!
//! Bundle adjustment jointly moves every 3D point and every camera pose to
//! minimize the reprojection error of the observations. The state is flattened
//! by [`ParameterLayout`], residuals are `observed − projected` pixels, and the
//! minimization itself is delegated to a [`LeastSquaresSolver`] (by default
//! [`TinySolverBackend`], Levenberg-Marquardt from the `tiny_solver` crate).
//!
//! Refinement is always optional: on any solver failure the caller gets the
//! unmodified input state back.

use crate::camera::Intrinsics;
use crate::observation::Observation;
use crate::pose::PoseStore;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod bundle_adjustment;
pub mod parameters;
pub mod solver;

pub use bundle_adjustment::{AdjustmentResult, BundleAdjuster};
pub use parameters::{compute_residuals, observation_residual, ParameterLayout};
pub use solver::{BundleProblem, LeastSquaresSolver, SolverOutcome, TinySolverBackend};

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Pixel reprojection error statistics over every observation whose camera
/// and point exist and whose point lies in front of the camera.
///
/// Returns `None` when no observation qualifies.
pub fn compute_reprojection_error(
    points: &[Point3<f64>],
    poses: &PoseStore,
    observations: &[Observation],
    intrinsics: &Intrinsics,
) -> Option<ProjectionError> {
    let mut errors: Vec<f64> = observations
        .iter()
        .filter_map(|o| {
            let pose = poses.get(&o.camera)?;
            let point = points.get(o.point)?;
            let cam = pose.transform_point(&point.coords);
            if cam.z <= 0.0 || !o.is_finite() {
                return None;
            }
            let r = observation_residual(&point.coords, pose, &o.pixel, intrinsics);
            Some((r[0] * r[0] + r[1] * r[1]).sqrt())
        })
        .collect();

    if errors.is_empty() {
        return None;
    }

    let n = errors.len() as f64;
    let mean = errors.iter().sum::<f64>() / n;
    let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
    let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

    errors.sort_by(f64::total_cmp);
    let mid = errors.len() / 2;
    let median = if errors.len() % 2 == 0 {
        (errors[mid - 1] + errors[mid]) / 2.0
    } else {
        errors[mid]
    };

    Some(ProjectionError {
        rmse,
        min,
        max,
        mean,
        stddev: variance.sqrt(),
        median,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Pose;
    use approx::assert_relative_eq;
    use nalgebra::Point2;

    #[test]
    fn test_reprojection_error_statistics() {
        let intrinsics = Intrinsics {
            fx: 100.0,
            fy: 100.0,
            cx: 0.0,
            cy: 0.0,
        };
        let points = vec![Point3::new(0.0, 0.0, 1.0), Point3::new(0.0, 0.0, -1.0)];
        let mut poses = PoseStore::new();
        poses.insert(0, Pose::identity());
        let observations = vec![
            Observation::new(0, 0, Point2::new(3.0, 4.0)),
            Observation::new(0, 0, Point2::new(0.0, 1.0)),
            // Behind the camera and unknown camera: ignored.
            Observation::new(0, 1, Point2::new(50.0, 50.0)),
            Observation::new(9, 0, Point2::new(50.0, 50.0)),
        ];

        let stats = compute_reprojection_error(&points, &poses, &observations, &intrinsics).unwrap();
        assert_relative_eq!(stats.min, 1.0);
        assert_relative_eq!(stats.max, 5.0);
        assert_relative_eq!(stats.mean, 3.0);
        assert_relative_eq!(stats.median, 3.0);
        assert_relative_eq!(stats.stddev, 2.0);
        assert_relative_eq!(stats.rmse, 13f64.sqrt());
    }

    #[test]
    fn test_reprojection_error_without_observations() {
        assert!(compute_reprojection_error(&[], &PoseStore::new(), &[], &Intrinsics {
            fx: 1.0,
            fy: 1.0,
            cx: 0.0,
            cy: 0.0
        })
        .is_none());
    }
}
