//! Flat parameter vector over the joint (points, poses) state.
//!
//! Layout: all point coordinates in point order, then for each camera in
//! ascending index order a 3-component axis-angle rotation followed by a
//! 3-component translation. Length is `3·points + 6·cameras`.

use crate::camera::Intrinsics;
use crate::geometry::{axis_angle_to_matrix, matrix_to_axis_angle, Pose};
use crate::observation::Observation;
use crate::pose::PoseStore;
use nalgebra::{DVector, Point3, Vector3};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterLayout {
    point_count: usize,
    cameras: Vec<usize>,
}

impl ParameterLayout {
    /// Cameras are sorted and deduplicated.
    pub fn new(point_count: usize, cameras: impl IntoIterator<Item = usize>) -> Self {
        let mut cameras: Vec<usize> = cameras.into_iter().collect();
        cameras.sort_unstable();
        cameras.dedup();
        ParameterLayout {
            point_count,
            cameras,
        }
    }

    pub fn for_state(points: &[Point3<f64>], poses: &PoseStore) -> Self {
        // PoseStore keys are already ordered.
        ParameterLayout {
            point_count: points.len(),
            cameras: poses.keys().copied().collect(),
        }
    }

    pub fn point_count(&self) -> usize {
        self.point_count
    }

    pub fn cameras(&self) -> &[usize] {
        &self.cameras
    }

    pub fn len(&self) -> usize {
        3 * self.point_count + 6 * self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of `camera` among the layout's cameras.
    pub fn camera_slot(&self, camera: usize) -> Option<usize> {
        self.cameras.binary_search(&camera).ok()
    }

    pub fn point_offset(&self, point: usize) -> usize {
        3 * point
    }

    pub fn camera_offset(&self, slot: usize) -> usize {
        3 * self.point_count + 6 * slot
    }

    /// Packs points and poses; cameras missing from `poses` pack as identity.
    pub fn pack(&self, points: &[Point3<f64>], poses: &PoseStore) -> DVector<f64> {
        let mut params = DVector::zeros(self.len());
        for (i, point) in points.iter().take(self.point_count).enumerate() {
            params
                .fixed_rows_mut::<3>(self.point_offset(i))
                .copy_from(&point.coords);
        }
        for (slot, camera) in self.cameras.iter().enumerate() {
            let pose = poses.get(camera).copied().unwrap_or_default();
            let offset = self.camera_offset(slot);
            params
                .fixed_rows_mut::<3>(offset)
                .copy_from(&matrix_to_axis_angle(&pose.rotation));
            params
                .fixed_rows_mut::<3>(offset + 3)
                .copy_from(&pose.translation);
        }
        params
    }

    pub fn point(&self, params: &DVector<f64>, point: usize) -> Vector3<f64> {
        params.fixed_rows::<3>(self.point_offset(point)).into_owned()
    }

    pub fn pose(&self, params: &DVector<f64>, slot: usize) -> Pose {
        let offset = self.camera_offset(slot);
        let axis_angle: Vector3<f64> = params.fixed_rows::<3>(offset).into_owned();
        Pose::new(
            axis_angle_to_matrix(&axis_angle),
            params.fixed_rows::<3>(offset + 3).into_owned(),
        )
    }

    /// Inverse of [`ParameterLayout::pack`].
    pub fn unpack(&self, params: &DVector<f64>) -> (Vec<Point3<f64>>, PoseStore) {
        let points = (0..self.point_count)
            .map(|i| Point3::from(self.point(params, i)))
            .collect();
        let poses = self
            .cameras
            .iter()
            .enumerate()
            .map(|(slot, &camera)| (camera, self.pose(params, slot)))
            .collect();
        (points, poses)
    }

    /// The slot and point of an observation the layout can evaluate.
    pub fn resolve(&self, observation: &Observation) -> Option<(usize, usize)> {
        if observation.point >= self.point_count || !observation.is_finite() {
            return None;
        }
        Some((self.camera_slot(observation.camera)?, observation.point))
    }
}

/// `observed − projected` for one point under one pose.
///
/// A point with non-positive depth yields exactly `(0, 0)`.
pub fn observation_residual(
    point: &Vector3<f64>,
    pose: &Pose,
    observed: &nalgebra::Point2<f64>,
    intrinsics: &Intrinsics,
) -> [f64; 2] {
    let cam = pose.transform_point(point);
    if cam.z <= 0.0 {
        return [0.0, 0.0];
    }
    let u = intrinsics.fx * cam.x / cam.z + intrinsics.cx;
    let v = intrinsics.fy * cam.y / cam.z + intrinsics.cy;
    [observed.x - u, observed.y - v]
}

/// Residual vector for `params`: two entries per resolvable observation, in
/// observation order. Observations with unknown cameras or out-of-range
/// points contribute nothing.
pub fn compute_residuals(
    params: &DVector<f64>,
    layout: &ParameterLayout,
    observations: &[Observation],
    intrinsics: &Intrinsics,
) -> DVector<f64> {
    let mut residuals = Vec::with_capacity(observations.len() * 2);
    for observation in observations {
        let Some((slot, point)) = layout.resolve(observation) else {
            continue;
        };
        let r = observation_residual(
            &layout.point(params, point),
            &layout.pose(params, slot),
            &observation.pixel,
            intrinsics,
        );
        residuals.extend_from_slice(&r);
    }
    DVector::from_vec(residuals)
}

/// `½·‖r‖²`.
pub fn cost(residuals: &DVector<f64>) -> f64 {
    0.5 * residuals.norm_squared()
}
