//! Linear (DLT) perspective-n-point solver.

use crate::camera::Intrinsics;
use crate::features::PnpSolver;
use crate::geometry::Pose;
use nalgebra::{DMatrix, Matrix3, Point2, Point3, Vector3};

/// Solves the 3×4 camera matrix from at least six correspondences and
/// projects its left block onto the closest rotation.
///
/// Distortion is ignored: the crate only ever carries zero coefficients.
#[derive(Debug, Clone, Copy, Default)]
pub struct DltPnpSolver;

const MIN_POINTS: usize = 6;

impl PnpSolver for DltPnpSolver {
    fn solve(
        &self,
        points_3d: &[Point3<f64>],
        points_2d: &[Point2<f64>],
        intrinsics: &Intrinsics,
        _distortion: &[f64],
    ) -> Option<Pose> {
        let n = points_3d.len().min(points_2d.len());
        if n < MIN_POINTS {
            return None;
        }

        // Condition the 3D points: zero centroid, mean distance √3.
        let centroid = points_3d[..n]
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.coords)
            / n as f64;
        let mean_distance = points_3d[..n]
            .iter()
            .map(|p| (p.coords - centroid).norm())
            .sum::<f64>()
            / n as f64;
        if mean_distance < 1e-12 {
            return None;
        }
        let scale = 3f64.sqrt() / mean_distance;

        let rows = (2 * n).max(12);
        let mut design = DMatrix::<f64>::zeros(rows, 12);
        for i in 0..n {
            let x = (points_3d[i].coords - centroid) * scale;
            let u = (points_2d[i].x - intrinsics.cx) / intrinsics.fx;
            let v = (points_2d[i].y - intrinsics.cy) / intrinsics.fy;
            let xh = [x.x, x.y, x.z, 1.0];
            for j in 0..4 {
                design[(2 * i, j)] = xh[j];
                design[(2 * i, 8 + j)] = -u * xh[j];
                design[(2 * i + 1, 4 + j)] = xh[j];
                design[(2 * i + 1, 8 + j)] = -v * xh[j];
            }
        }

        let svd = design.svd(false, true);
        let v_t = svd.v_t?;
        let (null_row, _) = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|l, r| l.1.total_cmp(r.1))?;
        let p = v_t.row(null_row);

        let mut m = Matrix3::new(p[0], p[1], p[2], p[4], p[5], p[6], p[8], p[9], p[10]);
        let mut last = Vector3::new(p[3], p[7], p[11]);
        if m.determinant() < 0.0 {
            m = -m;
            last = -last;
        }

        // Undo the conditioning: P = P' · [sI | −s·c].
        let m_world = m * scale;
        let t_world = last - m_world * centroid;

        let svd_m = m_world.svd(true, true);
        let (u, v_t) = (svd_m.u?, svd_m.v_t?);
        let rotation = u * v_t;
        let sigma = svd_m.singular_values.mean();
        if sigma < 1e-12 || rotation.determinant() < 0.0 {
            return None;
        }
        let pose = Pose::new(rotation, t_world / sigma);

        let in_front = points_3d[..n]
            .iter()
            .filter(|p| pose.transform_point(&p.coords).z > 0.0)
            .count();
        (pose.is_finite() && in_front * 2 > n).then_some(pose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::axis_angle_to_matrix;
    use approx::assert_relative_eq;

    #[test]
    fn test_dlt_pnp_recovers_pose() {
        let k = Intrinsics {
            fx: 600.0,
            fy: 610.0,
            cx: 320.0,
            cy: 240.0,
        };
        let truth = Pose::new(
            axis_angle_to_matrix(&Vector3::new(0.1, 0.3, -0.05)),
            Vector3::new(0.4, -0.2, 5.0),
        );
        let points_3d: Vec<Point3<f64>> = (0..20)
            .map(|i| {
                let f = i as f64;
                Point3::new((f * 0.37).sin() * 2.0, (f * 0.61).cos() * 1.5, (f * 0.23).sin())
            })
            .collect();
        let points_2d: Vec<Point2<f64>> = points_3d
            .iter()
            .map(|p| {
                let c = truth.transform_point(&p.coords);
                Point2::new(k.fx * c.x / c.z + k.cx, k.fy * c.y / c.z + k.cy)
            })
            .collect();

        let pose = DltPnpSolver.solve(&points_3d, &points_2d, &k, &[0.0; 5]).unwrap();
        assert_relative_eq!(pose.rotation, truth.rotation, epsilon = 1e-6);
        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_dlt_pnp_needs_six_points() {
        let k = Intrinsics {
            fx: 600.0,
            fy: 600.0,
            cx: 320.0,
            cy: 240.0,
        };
        let pts3 = vec![Point3::new(0.0, 0.0, 1.0); 5];
        let pts2 = vec![Point2::new(0.0, 0.0); 5];
        assert!(DltPnpSolver.solve(&pts3, &pts2, &k, &[]).is_none());
    }
}
