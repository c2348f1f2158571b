//! Camera pose estimation: bootstrap placement of every camera, translation
//! normalization and PnP re-registration.

use crate::camera::PinholeModel;
use crate::features::PnpSolver;
use crate::geometry::Pose;
use log::debug;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod bootstrap;
pub mod normalize;

pub use bootstrap::{bootstrap_poses, BootstrapResult, BootstrapSettings};
pub use normalize::{resolve_focal_length_mm, TranslationNormalizer};

/// Camera index → world-to-camera pose.
pub type PoseStore = BTreeMap<usize, Pose>;

/// Result of asking a [`crate::features::TwoViewEstimator`] for a relative pose.
#[derive(Debug, Clone, PartialEq)]
pub enum TwoViewOutcome {
    /// Relative motion from the first view to the second, translation up to scale.
    Pose { relative: Pose, inliers: Vec<usize> },
    /// Enough data, but the geometry did not yield a usable pose.
    Degenerate(String),
    InsufficientData { available: usize, required: usize },
}

/// How a camera obtained its pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Placement {
    /// World reference frame.
    Reference,
    /// Chained from `partner` through two-view geometry.
    TwoView {
        partner: usize,
        correspondences: usize,
        inliers: usize,
    },
    /// Synthetic position on a circle in the reference plane.
    Fallback { angle: f64, radius: f64 },
    /// Re-registered against triangulated points.
    Pnp { correspondences: usize },
}

impl Placement {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Placement::Fallback { .. })
    }
}

/// Minimum 3D-2D correspondences before a PnP solve is attempted.
pub const MIN_PNP_POINTS: usize = 4;

/// Absolute pose from 3D-2D correspondences, with its translation normalized.
///
/// Returns `None` on too few points or when the solver fails.
pub fn estimate_pose_pnp(
    points_3d: &[Point3<f64>],
    points_2d: &[Point2<f64>],
    camera: &PinholeModel,
    solver: &dyn PnpSolver,
    normalizer: &TranslationNormalizer,
) -> Option<Pose> {
    if points_3d.len() < MIN_PNP_POINTS || points_3d.len() != points_2d.len() {
        debug!(
            "PnP skipped: {} 3D points, {} 2D points",
            points_3d.len(),
            points_2d.len()
        );
        return None;
    }

    let pose = solver.solve(points_3d, points_2d, &camera.intrinsics, &camera.distortions)?;
    Some(Pose::new(
        pose.rotation,
        normalizer.normalize_translation(&pose.translation),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution};
    use crate::features::DltPnpSolver;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    struct FixedSolver(Option<Pose>);

    impl PnpSolver for FixedSolver {
        fn solve(
            &self,
            _points_3d: &[Point3<f64>],
            _points_2d: &[Point2<f64>],
            _intrinsics: &Intrinsics,
            _distortion: &[f64],
        ) -> Option<Pose> {
            self.0
        }
    }

    fn camera() -> PinholeModel {
        PinholeModel::from_intrinsics(
            Intrinsics {
                fx: 500.0,
                fy: 500.0,
                cx: 320.0,
                cy: 240.0,
            },
            Resolution {
                width: 640,
                height: 480,
            },
        )
    }

    #[test]
    fn test_pnp_requires_four_points() {
        let normalizer = TranslationNormalizer::new(75.0);
        let solver = FixedSolver(Some(Pose::identity()));
        let pts3 = vec![Point3::origin(); 3];
        let pts2 = vec![Point2::origin(); 3];
        assert!(estimate_pose_pnp(&pts3, &pts2, &camera(), &solver, &normalizer).is_none());
    }

    #[test]
    fn test_pnp_translation_is_normalized() {
        let normalizer = TranslationNormalizer::new(75.0);
        let solver = FixedSolver(Some(Pose::new(
            nalgebra::Matrix3::identity(),
            Vector3::new(0.0, 3.0, 4.0),
        )));
        let pts3 = vec![Point3::origin(); 4];
        let pts2 = vec![Point2::origin(); 4];
        let pose = estimate_pose_pnp(&pts3, &pts2, &camera(), &solver, &normalizer).unwrap();
        assert_relative_eq!(pose.translation, Vector3::new(0.0, 45.0, 60.0), epsilon = 1e-9);
    }

    #[test]
    fn test_pnp_solver_failure_is_none() {
        let normalizer = TranslationNormalizer::new(75.0);
        let pts3 = vec![Point3::new(0.0, 0.0, 1.0); 8];
        let pts2 = vec![Point2::new(320.0, 240.0); 8];
        assert!(estimate_pose_pnp(&pts3, &pts2, &camera(), &DltPnpSolver, &normalizer).is_none());
    }
}
