//! Rigid-body helpers: camera poses, axis-angle conversion and pixel grids.

use nalgebra::{Matrix3, Point2, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// World→camera transform `x_cam = R·X + t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Pose::identity()
    }
}

impl Pose {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            rotation,
            translation,
        }
    }

    /// The world reference frame.
    pub fn identity() -> Self {
        Pose {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Builds the pose of a camera with rotation `R` whose centre sits at `center`.
    pub fn from_center(rotation: Matrix3<f64>, center: &Vector3<f64>) -> Self {
        Pose {
            rotation,
            translation: -(rotation * center),
        }
    }

    /// Camera centre in world coordinates, `−Rᵗt`.
    pub fn center(&self) -> Vector3<f64> {
        -(self.rotation.transpose() * self.translation)
    }

    /// Moves a world point into this camera's frame.
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// Chains a relative motion `(R_rel, t_rel)` measured from this camera.
    ///
    /// The result maps world points into the second camera:
    /// `R = R_rel·R_self`, `t = R_rel·t_self + t_rel`.
    pub fn then(&self, relative: &Pose) -> Pose {
        Pose {
            rotation: relative.rotation * self.rotation,
            translation: relative.rotation * self.translation + relative.translation,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.rotation.iter().all(|v| v.is_finite()) && self.translation.iter().all(|v| v.is_finite())
    }
}

/// Converts an axis-angle vector (axis scaled by the angle) to a rotation matrix.
pub fn axis_angle_to_matrix(axis_angle: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::new(*axis_angle).into_inner()
}

/// Converts a rotation matrix to its axis-angle vector.
///
/// The input is re-orthonormalized first so that matrices carrying small
/// numerical drift still convert.
pub fn matrix_to_axis_angle(rotation: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix(rotation).scaled_axis()
}

/// Rotation about the vertical (`z`) axis of the reference plane.
pub fn rotation_about_vertical(angle: f64) -> Matrix3<f64> {
    let (sin_angle, cos_angle) = angle.sin_cos();
    Matrix3::new(
        cos_angle, -sin_angle, 0.0, //
        sin_angle, cos_angle, 0.0, //
        0.0, 0.0, 1.0,
    )
}

/// Generate a grid of sample points that are evenly distributed across the image
///
/// # Arguments
///
/// * `width` - The width of the image in pixels
/// * `height` - The height of the image in pixels
/// * `n` - The approximate number of points to generate
///
/// # Returns
///
/// A vector of 2D points representing pixel coordinates
pub fn sample_points(width: f64, height: f64, n: usize) -> Vec<Point2<f64>> {
    let mut points = Vec::new();
    if n == 0 || width <= 0.0 || height <= 0.0 {
        return points;
    }

    let num_cells_x = ((n as f64 * (width / height)).sqrt().round() as i32).max(1);
    let num_cells_y = ((n as f64 * (height / width)).sqrt().round() as i32).max(1);

    let cell_width = width / num_cells_x as f64;
    let cell_height = height / num_cells_y as f64;

    for i in 0..num_cells_y {
        for j in 0..num_cells_x {
            let x = (j as f64 + 0.5) * cell_width;
            let y = (i as f64 + 0.5) * cell_height;
            points.push(Point2::new(x, y));
        }
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_sample_points() {
        let width = 800f64;
        let height = 600f64;
        let n = 100;

        let points = sample_points(width, height, n);

        let expected_count = (n as f64 * 0.8) as usize..=(n as f64 * 1.2) as usize;
        assert!(
            expected_count.contains(&points.len()),
            "Expected around {} points, got {}",
            n,
            points.len()
        );

        for point in &points {
            assert!(point.x >= 0.0 && point.x < width);
            assert!(point.y >= 0.0 && point.y < height);
        }
    }

    #[test]
    fn test_axis_angle_round_trip() {
        let axis_angle = Vector3::new(0.1, -0.4, 0.25);
        let rotation = axis_angle_to_matrix(&axis_angle);
        assert_relative_eq!(matrix_to_axis_angle(&rotation), axis_angle, epsilon = 1e-12);

        let identity = axis_angle_to_matrix(&Vector3::zeros());
        assert_relative_eq!(identity, Matrix3::identity());
        assert_relative_eq!(matrix_to_axis_angle(&identity), Vector3::zeros());
    }

    #[test]
    fn test_center_and_from_center_agree() {
        let rotation = rotation_about_vertical(PI / 3.0);
        let center = Vector3::new(3.0, -2.0, 1.0);
        let pose = Pose::from_center(rotation, &center);
        assert_relative_eq!(pose.center(), center, epsilon = 1e-12);
        assert_relative_eq!(pose.transform_point(&center), Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_then_composes_relative_motion() {
        let first = Pose::new(rotation_about_vertical(0.3), Vector3::new(1.0, 0.0, 0.0));
        let relative = Pose::new(rotation_about_vertical(-0.1), Vector3::new(0.0, 2.0, 0.0));
        let chained = first.then(&relative);

        let world = Vector3::new(0.5, 0.7, 4.0);
        let expected = relative.transform_point(&first.transform_point(&world));
        assert_relative_eq!(chained.transform_point(&world), expected, epsilon = 1e-12);
    }
}
