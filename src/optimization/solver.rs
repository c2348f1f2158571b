//! Least-squares backends for bundle adjustment.
//!
//! The adjuster talks to a [`LeastSquaresSolver`]; [`TinySolverBackend`]
//! is the default and runs tiny-solver's Levenberg-Marquardt with one
//! auto-differentiated residual block per observation.

use crate::camera::Intrinsics;
use crate::observation::Observation;
use crate::optimization::parameters::{compute_residuals, cost, ParameterLayout};
use log::{debug, warn};
use nalgebra::{DVector, Point2};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Everything a solver needs to evaluate the reprojection residuals.
#[derive(Debug, Clone, Copy)]
pub struct BundleProblem<'a> {
    pub layout: &'a ParameterLayout,
    pub observations: &'a [Observation],
    pub intrinsics: &'a Intrinsics,
}

impl BundleProblem<'_> {
    pub fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        compute_residuals(params, self.layout, self.observations, self.intrinsics)
    }

    pub fn cost(&self, params: &DVector<f64>) -> f64 {
        cost(&self.residuals(params))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverOutcome {
    pub success: bool,
    pub x: DVector<f64>,
    pub cost: f64,
}

pub trait LeastSquaresSolver {
    /// Minimizes `½‖r(x)‖²` starting from `initial`.
    ///
    /// `max_evaluations` bounds the iterations and `tolerance` is the relative
    /// cost decrease under which the solve counts as converged.
    fn minimize(
        &self,
        problem: &BundleProblem<'_>,
        initial: &DVector<f64>,
        max_evaluations: usize,
        tolerance: f64,
    ) -> SolverOutcome;
}

/// Reprojection residual of one observation over a point block and a camera
/// block `[axis-angle (3), translation (3)]`.
#[derive(Debug, Clone)]
struct ReprojectionFactor {
    observed: Point2<f64>,
    intrinsics: Intrinsics,
}

impl<T: nalgebra::RealField> Factor<T> for ReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let point = &params[0];
        let camera = &params[1];

        let (px, py, pz) = (point[0].clone(), point[1].clone(), point[2].clone());
        let (wx, wy, wz) = (camera[0].clone(), camera[1].clone(), camera[2].clone());

        // Rodrigues rotation of the point.
        let theta2 = wx.clone() * wx.clone() + wy.clone() * wy.clone() + wz.clone() * wz.clone();
        let small: T = nalgebra::convert(1e-12);
        let (rx, ry, rz) = if theta2 > small {
            let theta = theta2.sqrt();
            let (kx, ky, kz) = (
                wx / theta.clone(),
                wy / theta.clone(),
                wz / theta.clone(),
            );
            let (sin, cos) = (theta.clone().sin(), theta.cos());
            let one_minus_cos = T::one() - cos.clone();
            let dot = kx.clone() * px.clone() + ky.clone() * py.clone() + kz.clone() * pz.clone();
            let cross_x = ky.clone() * pz.clone() - kz.clone() * py.clone();
            let cross_y = kz.clone() * px.clone() - kx.clone() * pz.clone();
            let cross_z = kx.clone() * py.clone() - ky.clone() * px.clone();
            (
                px * cos.clone() + cross_x * sin.clone() + kx * dot.clone() * one_minus_cos.clone(),
                py * cos.clone() + cross_y * sin.clone() + ky * dot.clone() * one_minus_cos.clone(),
                pz * cos + cross_z * sin + kz * dot * one_minus_cos,
            )
        } else {
            // First order: R ≈ I + [w]×.
            (
                px.clone() + wy.clone() * pz.clone() - wz.clone() * py.clone(),
                py.clone() + wz * px.clone() - wx.clone() * pz.clone(),
                pz + wx * py - wy * px,
            )
        };

        let x = rx + camera[3].clone();
        let y = ry + camera[4].clone();
        let z = rz + camera[5].clone();

        let mut residual = DVector::zeros(2);
        if z <= T::zero() {
            return residual;
        }

        let fx: T = nalgebra::convert(self.intrinsics.fx);
        let fy: T = nalgebra::convert(self.intrinsics.fy);
        let cx: T = nalgebra::convert(self.intrinsics.cx);
        let cy: T = nalgebra::convert(self.intrinsics.cy);
        let u: T = nalgebra::convert(self.observed.x);
        let v: T = nalgebra::convert(self.observed.y);

        residual[0] = u - (fx * x / z.clone() + cx);
        residual[1] = v - (fy * y / z + cy);
        residual
    }
}

fn point_key(point: usize) -> String {
    format!("p{point}")
}

fn camera_key(slot: usize) -> String {
    format!("c{slot}")
}

/// Levenberg-Marquardt through `tiny_solver`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TinySolverBackend;

impl LeastSquaresSolver for TinySolverBackend {
    fn minimize(
        &self,
        problem: &BundleProblem<'_>,
        initial: &DVector<f64>,
        max_evaluations: usize,
        tolerance: f64,
    ) -> SolverOutcome {
        let layout = problem.layout;
        let initial_cost = problem.cost(initial);
        let failed = || SolverOutcome {
            success: false,
            x: initial.clone(),
            cost: initial_cost,
        };
        if initial.len() != layout.len() {
            warn!(
                "parameter vector has {} entries, layout expects {}",
                initial.len(),
                layout.len()
            );
            return failed();
        }

        let mut tiny_problem = tiny_solver::Problem::new();
        let mut initial_values: HashMap<String, DVector<f64>> = HashMap::new();
        let mut blocks = 0;
        for observation in problem.observations {
            let Some((slot, point)) = layout.resolve(observation) else {
                continue;
            };
            let (p_key, c_key) = (point_key(point), camera_key(slot));
            initial_values.entry(p_key.clone()).or_insert_with(|| {
                let offset = layout.point_offset(point);
                initial.rows(offset, 3).into_owned()
            });
            initial_values.entry(c_key.clone()).or_insert_with(|| {
                let offset = layout.camera_offset(slot);
                initial.rows(offset, 6).into_owned()
            });

            let factor = ReprojectionFactor {
                observed: observation.pixel,
                intrinsics: *problem.intrinsics,
            };
            tiny_problem.add_residual_block(
                2,
                &[p_key.as_str(), c_key.as_str()],
                Box::new(factor),
                None,
            );
            blocks += 1;
        }
        if blocks == 0 {
            return failed();
        }
        debug!(
            "tiny-solver problem: {blocks} residual blocks over {} variables",
            initial_values.len()
        );

        let options = tiny_solver::OptimizerOptions {
            max_iteration: max_evaluations.max(1),
            verbosity_level: 0,
            min_rel_error_decrease_threshold: tolerance,
            ..Default::default()
        };
        let optimizer = LevenbergMarquardtOptimizer::default();
        let Some(result) = optimizer.optimize(&tiny_problem, &initial_values, Some(options)) else {
            warn!("tiny-solver did not return a solution");
            return failed();
        };

        // Blocks no observation touches keep their initial values.
        let mut x = initial.clone();
        for (key, value) in &result {
            let (offset, size) = match key.split_at(1) {
                ("p", index) => match index.parse::<usize>() {
                    Ok(point) => (layout.point_offset(point), 3),
                    Err(_) => continue,
                },
                ("c", index) => match index.parse::<usize>() {
                    Ok(slot) => (layout.camera_offset(slot), 6),
                    Err(_) => continue,
                },
                _ => continue,
            };
            if value.len() != size || offset + size > x.len() {
                return failed();
            }
            x.rows_mut(offset, size).copy_from(value);
        }

        let final_cost = problem.cost(&x);
        let finite = x.iter().all(|v| v.is_finite()) && final_cost.is_finite();
        SolverOutcome {
            success: finite && final_cost <= initial_cost,
            x,
            cost: final_cost,
        }
    }
}
