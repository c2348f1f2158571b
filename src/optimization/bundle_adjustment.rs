//! Joint refinement of points and poses.

use crate::camera::Intrinsics;
use crate::config::SfmConfig;
use crate::observation::Observation;
use crate::optimization::parameters::ParameterLayout;
use crate::optimization::solver::{BundleProblem, LeastSquaresSolver};
use crate::optimization::{compute_reprojection_error, ProjectionError};
use crate::pose::PoseStore;
use log::{info, warn};
use nalgebra::Point3;

#[derive(Debug, Clone, PartialEq)]
pub struct AdjustmentResult {
    pub points: Vec<Point3<f64>>,
    pub poses: PoseStore,
    /// `false` when the input state was returned untouched.
    pub refined: bool,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub initial_error: Option<ProjectionError>,
    pub final_error: Option<ProjectionError>,
}

/// Runs a [`LeastSquaresSolver`] over the packed state and scatters the
/// result back.
pub struct BundleAdjuster<'a> {
    solver: &'a dyn LeastSquaresSolver,
    max_evaluations: usize,
    tolerance: f64,
}

impl<'a> BundleAdjuster<'a> {
    pub fn new(solver: &'a dyn LeastSquaresSolver, max_evaluations: usize, tolerance: f64) -> Self {
        BundleAdjuster {
            solver,
            max_evaluations,
            tolerance,
        }
    }

    pub fn from_config(solver: &'a dyn LeastSquaresSolver, config: &SfmConfig) -> Self {
        BundleAdjuster::new(solver, config.max_evaluations, config.tolerance)
    }

    /// Refines `points` and `poses` against `observations`.
    ///
    /// Whenever the solver reports failure, or returns a vector of the wrong
    /// size or with non-finite entries, the input state comes back unchanged.
    ///
    /// # Arguments
    ///
    /// * `points` - 3D points in world coordinates, indexed by point id.
    /// * `poses` - World-to-camera poses; every camera is optimized.
    /// * `observations` - Pixel measurements; entries referencing unknown
    ///   cameras or points are ignored.
    /// * `intrinsics` - Shared pinhole intrinsics, held fixed.
    ///
    /// # Returns
    ///
    /// An [`AdjustmentResult`] whose `refined` flag tells whether the state
    /// was replaced by the solver output.
    pub fn adjust(
        &self,
        points: &[Point3<f64>],
        poses: &PoseStore,
        observations: &[Observation],
        intrinsics: &Intrinsics,
    ) -> AdjustmentResult {
        let layout = ParameterLayout::for_state(points, poses);
        let problem = BundleProblem {
            layout: &layout,
            observations,
            intrinsics,
        };
        let initial = layout.pack(points, poses);
        let initial_cost = problem.cost(&initial);
        let initial_error = compute_reprojection_error(points, poses, observations, intrinsics);

        let unchanged = |reason: &str| {
            warn!("bundle adjustment skipped: {reason}");
            AdjustmentResult {
                points: points.to_vec(),
                poses: poses.clone(),
                refined: false,
                initial_cost,
                final_cost: initial_cost,
                initial_error: initial_error.clone(),
                final_error: initial_error.clone(),
            }
        };

        if points.is_empty() || poses.is_empty() {
            return unchanged("no points or no poses");
        }
        if observations.is_empty() {
            return unchanged("no observations");
        }

        info!(
            "bundle adjustment: {} points, {} cameras, {} observations, {} parameters",
            points.len(),
            poses.len(),
            observations.len(),
            layout.len()
        );
        if let Some(error) = &initial_error {
            info!("initial reprojection error: {error:?}");
        }

        let outcome = self
            .solver
            .minimize(&problem, &initial, self.max_evaluations, self.tolerance);
        if !outcome.success {
            return unchanged("solver did not converge");
        }
        if outcome.x.len() != layout.len() || outcome.x.iter().any(|v| !v.is_finite()) {
            return unchanged("solver returned an invalid parameter vector");
        }

        let (refined_points, refined_poses) = layout.unpack(&outcome.x);
        let final_error =
            compute_reprojection_error(&refined_points, &refined_poses, observations, intrinsics);
        if let Some(error) = &final_error {
            info!("final reprojection error: {error:?}");
        }
        info!("cost {initial_cost:.6} -> {:.6}", outcome.cost);

        AdjustmentResult {
            points: refined_points,
            poses: refined_poses,
            refined: true,
            initial_cost,
            final_cost: outcome.cost,
            initial_error,
            final_error,
        }
    }
}
