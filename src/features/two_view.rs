//! Essential-matrix estimation with RANSAC and pose recovery.
//!
//! Pixel correspondences are normalized with `K⁻¹`, the essential matrix is
//! fitted with the linear eight-point method inside a seeded RANSAC loop scored
//! by the Sampson distance, and the four `(R, t)` decompositions are
//! disambiguated by counting points in front of both cameras.

use crate::camera::Intrinsics;
use crate::features::TwoViewEstimator;
use crate::geometry::Pose;
use crate::pose::TwoViewOutcome;
use crate::triangulation::{projection_matrix, triangulate_dlt};
use log::debug;
use nalgebra::{DMatrix, Matrix3, Point2, Vector3};
use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const MIN_POINTS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct EightPointEstimator {
    pub max_iterations: usize,
    pub seed: u64,
}

impl Default for EightPointEstimator {
    fn default() -> Self {
        EightPointEstimator {
            max_iterations: 1000,
            seed: 42,
        }
    }
}

fn normalize(point: &Point2<f64>, k: &Intrinsics) -> Vector3<f64> {
    Vector3::new((point.x - k.cx) / k.fx, (point.y - k.cy) / k.fy, 1.0)
}

/// Linear eight-point fit over the given correspondences.
fn fit_essential(a: &[Vector3<f64>], b: &[Vector3<f64>], indices: &[usize]) -> Option<Matrix3<f64>> {
    // Pad to at least 9 rows so the SVD exposes the full right null space.
    let rows = indices.len().max(9);
    let mut design = DMatrix::<f64>::zeros(rows, 9);
    for (row, &i) in indices.iter().enumerate() {
        let (x1, x2) = (a[i], b[i]);
        design.row_mut(row).copy_from_slice(&[
            x2.x * x1.x,
            x2.x * x1.y,
            x2.x,
            x2.y * x1.x,
            x2.y * x1.y,
            x2.y,
            x1.x,
            x1.y,
            1.0,
        ]);
    }

    let svd = design.svd(false, true);
    let v_t = svd.v_t?;
    let (null_row, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|l, r| l.1.total_cmp(r.1))?;
    let e = v_t.row(null_row);
    let raw = Matrix3::new(e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7], e[8]);
    enforce_essential_constraints(&raw)
}

/// Projects onto the essential manifold: singular values `(σ, σ, 0)`.
fn enforce_essential_constraints(e: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = e.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut sorted = [
        svd.singular_values[0],
        svd.singular_values[1],
        svd.singular_values[2],
    ];
    sorted.sort_by(|l, r| r.total_cmp(l));
    let sigma = 0.5 * (sorted[0] + sorted[1]);

    let mut diagonal = Vector3::zeros();
    for i in 0..3 {
        // Zero the smallest singular value, flatten the other two.
        diagonal[i] = if svd.singular_values[i] == sorted[2] { 0.0 } else { sigma };
    }
    Some(u * Matrix3::from_diagonal(&diagonal) * v_t)
}

fn sampson_distance(e: &Matrix3<f64>, x1: &Vector3<f64>, x2: &Vector3<f64>) -> f64 {
    let ex1 = e * x1;
    let etx2 = e.transpose() * x2;
    let denom = ex1.x.powi(2) + ex1.y.powi(2) + etx2.x.powi(2) + etx2.y.powi(2);
    if denom < 1e-18 {
        return f64::MAX;
    }
    let numerator = x2.dot(&ex1);
    numerator * numerator / denom
}

/// The four `(R, t)` candidates of an essential matrix, unit translation.
fn decompose_essential(e: &Matrix3<f64>) -> Option<Vec<(Matrix3<f64>, Vector3<f64>)>> {
    let svd = e.svd(true, true);
    let (mut u, mut v_t) = (svd.u?, svd.v_t?);
    if u.determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    if v_t.determinant() < 0.0 {
        v_t.row_mut(2).neg_mut();
    }

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t = u.column(2).normalize();

    Some(vec![(r1, t), (r1, -t), (r2, t), (r2, -t)])
}

fn count_in_front(
    a: &[Vector3<f64>],
    b: &[Vector3<f64>],
    inliers: &[usize],
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
) -> usize {
    let identity = Intrinsics {
        fx: 1.0,
        fy: 1.0,
        cx: 0.0,
        cy: 0.0,
    };
    let first = Pose::identity();
    let second = Pose::new(*rotation, *translation);
    let p1 = projection_matrix(&identity, &first);
    let p2 = projection_matrix(&identity, &second);

    inliers
        .iter()
        .filter(|&&i| {
            let x1 = Point2::new(a[i].x, a[i].y);
            let x2 = Point2::new(b[i].x, b[i].y);
            triangulate_dlt(&x1, &x2, &p1, &p2).is_some_and(|point| {
                let world = point.coords;
                world.z > 0.0 && second.transform_point(&world).z > 0.0
            })
        })
        .count()
}

impl TwoViewEstimator for EightPointEstimator {
    fn estimate(
        &self,
        points_a: &[Point2<f64>],
        points_b: &[Point2<f64>],
        intrinsics: &Intrinsics,
        ransac_threshold: f64,
        confidence: f64,
    ) -> TwoViewOutcome {
        let n = points_a.len().min(points_b.len());
        if n < MIN_POINTS {
            return TwoViewOutcome::InsufficientData {
                available: n,
                required: MIN_POINTS,
            };
        }

        let a: Vec<Vector3<f64>> = points_a[..n].iter().map(|p| normalize(p, intrinsics)).collect();
        let b: Vec<Vector3<f64>> = points_b[..n].iter().map(|p| normalize(p, intrinsics)).collect();

        // Sampson distance is squared; express the pixel threshold in normalized units.
        let threshold = (ransac_threshold / intrinsics.mean_focal_length()).powi(2);

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut best_inliers: Vec<usize> = Vec::new();
        let mut required_iterations = self.max_iterations;
        let mut iteration = 0;
        while iteration < required_iterations.min(self.max_iterations) {
            iteration += 1;
            let minimal = sample(&mut rng, n, MIN_POINTS).into_vec();
            let Some(e) = fit_essential(&a, &b, &minimal) else {
                continue;
            };
            let inliers: Vec<usize> = (0..n)
                .filter(|&i| sampson_distance(&e, &a[i], &b[i]) < threshold)
                .collect();
            if inliers.len() > best_inliers.len() {
                best_inliers = inliers;
                let ratio = best_inliers.len() as f64 / n as f64;
                let outlier_free = 1.0 - ratio.powi(MIN_POINTS as i32);
                required_iterations = if outlier_free <= f64::EPSILON {
                    iteration
                } else {
                    ((1.0 - confidence).ln() / outlier_free.ln()).ceil() as usize
                };
            }
        }

        if best_inliers.len() < MIN_POINTS {
            return TwoViewOutcome::Degenerate(format!(
                "only {} RANSAC inliers",
                best_inliers.len()
            ));
        }

        let Some(essential) = fit_essential(&a, &b, &best_inliers) else {
            return TwoViewOutcome::Degenerate("essential refit failed".to_string());
        };
        let Some(candidates) = decompose_essential(&essential) else {
            return TwoViewOutcome::Degenerate("essential decomposition failed".to_string());
        };

        let best = candidates
            .iter()
            .map(|(r, t)| (count_in_front(&a, &b, &best_inliers, r, t), r, t))
            .max_by_key(|(count, _, _)| *count);
        match best {
            Some((count, rotation, translation)) if count > 0 => {
                debug!(
                    "two-view: {} inliers of {n}, {count} in front after {iteration} iterations",
                    best_inliers.len()
                );
                TwoViewOutcome::Pose {
                    relative: Pose::new(*rotation, *translation),
                    inliers: best_inliers,
                }
            }
            _ => TwoViewOutcome::Degenerate("no point in front of both cameras".to_string()),
        }
    }
}
