//! Rescales camera positions into a plausible metric band.
//!
//! Two-view geometry only recovers translation up to scale, and chained
//! estimates can blow up. The normalizer keeps ray directions and moves camera
//! centres so their distances sit around `1.5 × focal length (mm)`.

use crate::camera::{ImageMetadata, PinholeModel};
use crate::config::SfmConfig;
use crate::geometry::Pose;
use crate::pose::PoseStore;
use log::{debug, warn};
use nalgebra::Vector3;

/// Translations longer than this multiple of the target count as blow-ups.
const EXPLODED_FACTOR: f64 = 10.0;
/// Cameras farther than this multiple of the target from the centroid are pulled in.
const UPPER_BAND: f64 = 3.0;
/// Cameras closer than this multiple of the target to the centroid are pushed out.
const LOWER_BAND: f64 = 0.3;
/// Centres closer than this to the origin are left out of the centroid.
const DEGENERATE_CENTER: f64 = 0.1;

/// Physical focal length in millimetres.
///
/// Order of preference: the metadata value, then the pixel focal length of
/// `camera` converted through the sensor width, then `default_mm`.
pub fn resolve_focal_length_mm(
    metadata: Option<&ImageMetadata>,
    camera: Option<&PinholeModel>,
    sensor_width_mm: f64,
    default_mm: f64,
) -> f64 {
    if let Some(focal) = metadata.and_then(|m| m.focal_length_mm) {
        if focal > 0.0 {
            return focal;
        }
    }
    if let Some(camera) = camera {
        let width = camera.resolution.width;
        if width > 0 {
            return camera.intrinsics.mean_focal_length() * sensor_width_mm / width as f64;
        }
    }
    default_mm
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranslationNormalizer {
    target_distance: f64,
}

impl TranslationNormalizer {
    pub fn new(target_distance: f64) -> Self {
        TranslationNormalizer { target_distance }
    }

    /// Target distance of `1.5 ×` the resolved focal length.
    pub fn from_camera(
        config: &SfmConfig,
        metadata: Option<&ImageMetadata>,
        camera: Option<&PinholeModel>,
    ) -> Self {
        let focal = config.focal_length_mm.unwrap_or_else(|| {
            resolve_focal_length_mm(
                metadata,
                camera,
                config.sensor_width_mm,
                config.default_focal_length_mm,
            )
        });
        debug!("translation normalizer: focal {focal:.2} mm");
        TranslationNormalizer::new(1.5 * focal)
    }

    pub fn target_distance(&self) -> f64 {
        self.target_distance
    }

    /// Rescales one translation to the target length, keeping its direction.
    ///
    /// A zero translation becomes `[target, 0, 0]`.
    pub fn normalize_translation(&self, translation: &Vector3<f64>) -> Vector3<f64> {
        let target = self.target_distance;
        let norm = translation.norm();
        if !norm.is_finite() || norm <= f64::EPSILON {
            return Vector3::new(target, 0.0, 0.0);
        }
        if norm > EXPLODED_FACTOR * target {
            warn!("translation norm {norm:.3} exceeds {EXPLODED_FACTOR}× target {target:.3}, rescaling");
        }
        translation * (target / norm)
    }

    /// Moves only the cameras whose distance from the centroid of the
    /// non-degenerate centres falls outside `[0.3×, 3×]` target.
    ///
    /// Cameras inside the band keep their pose bit-for-bit, so a second pass
    /// over an in-band set changes nothing. Degenerate centres at the origin,
    /// the reference camera among them, are never moved and the world frame
    /// stays put. Fewer than two poses are returned unchanged.
    ///
    /// # Arguments
    ///
    /// * `poses` - World-to-camera poses keyed by camera index.
    ///
    /// # Returns
    ///
    /// A new [`PoseStore`] with the same keys and rotations.
    pub fn normalize_poses(&self, poses: &PoseStore) -> PoseStore {
        if poses.len() < 2 {
            return poses.clone();
        }
        let target = self.target_distance;

        let centers: Vec<(usize, Vector3<f64>)> =
            poses.iter().map(|(&idx, pose)| (idx, pose.center())).collect();
        let valid: Vec<&Vector3<f64>> = centers
            .iter()
            .map(|(_, c)| c)
            .filter(|c| c.norm() > DEGENERATE_CENTER)
            .collect();
        let centroid = if valid.is_empty() {
            Vector3::zeros()
        } else {
            valid.iter().fold(Vector3::zeros(), |acc, c| acc + *c) / valid.len() as f64
        };

        let mut normalized = poses.clone();
        for (idx, center) in centers {
            if center.norm() <= DEGENERATE_CENTER {
                continue;
            }
            let offset = center - centroid;
            let distance = offset.norm();
            if distance <= UPPER_BAND * target && distance >= LOWER_BAND * target {
                continue;
            }

            let new_center = if distance <= f64::EPSILON {
                centroid + Vector3::new(target, 0.0, 0.0)
            } else {
                centroid + offset * (target / distance)
            };
            debug!("camera {idx}: distance {distance:.3} from centroid rescaled to {target:.3}");
            if let Some(pose) = normalized.get_mut(&idx) {
                *pose = Pose::from_center(pose.rotation, &new_center);
            }
        }
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution};
    use crate::geometry::rotation_about_vertical;
    use approx::assert_relative_eq;

    #[test]
    fn test_focal_length_resolution_order() {
        let camera = PinholeModel::from_intrinsics(
            Intrinsics {
                fx: 1000.0,
                fy: 1000.0,
                cx: 500.0,
                cy: 400.0,
            },
            Resolution {
                width: 1000,
                height: 800,
            },
        );
        let metadata = ImageMetadata {
            focal_length_mm: Some(35.0),
            ..Default::default()
        };

        assert_relative_eq!(
            resolve_focal_length_mm(Some(&metadata), Some(&camera), 23.5, 50.0),
            35.0
        );
        assert_relative_eq!(
            resolve_focal_length_mm(None, Some(&camera), 23.5, 50.0),
            23.5
        );
        assert_relative_eq!(resolve_focal_length_mm(None, None, 23.5, 50.0), 50.0);
    }

    #[test]
    fn test_normalize_translation() {
        let normalizer = TranslationNormalizer::new(75.0);

        let exploded = normalizer.normalize_translation(&Vector3::new(0.0, 0.0, 1.0e6));
        assert_relative_eq!(exploded, Vector3::new(0.0, 0.0, 75.0));

        let unit = normalizer.normalize_translation(&Vector3::new(0.6, 0.8, 0.0));
        assert_relative_eq!(unit, Vector3::new(45.0, 60.0, 0.0), epsilon = 1e-12);

        let zero = normalizer.normalize_translation(&Vector3::zeros());
        assert_relative_eq!(zero, Vector3::new(75.0, 0.0, 0.0));

        let again = normalizer.normalize_translation(&unit);
        assert_relative_eq!(again, unit, epsilon = 1e-12);
    }

    #[test]
    fn test_normalize_poses_leaves_in_band_cameras() {
        let normalizer = TranslationNormalizer::new(10.0);
        let mut poses = PoseStore::new();
        poses.insert(0, Pose::from_center(rotation_about_vertical(0.0), &Vector3::new(10.0, 0.0, 0.0)));
        poses.insert(1, Pose::from_center(rotation_about_vertical(0.4), &Vector3::new(0.0, 10.0, 0.0)));
        poses.insert(2, Pose::from_center(rotation_about_vertical(1.1), &Vector3::new(-8.0, -9.0, 1.0)));

        let once = normalizer.normalize_poses(&poses);
        assert_eq!(once, poses);
        let twice = normalizer.normalize_poses(&once);
        assert_eq!(twice, once);
    }

    #[test]
    fn test_normalize_poses_pulls_in_outlier() {
        let normalizer = TranslationNormalizer::new(1.0);
        let mut poses = PoseStore::new();
        poses.insert(0, Pose::identity());
        poses.insert(1, Pose::from_center(rotation_about_vertical(0.2), &Vector3::new(1.0, 0.0, 0.0)));
        poses.insert(2, Pose::from_center(rotation_about_vertical(0.5), &Vector3::new(0.0, 1.0, 0.0)));
        poses.insert(3, Pose::from_center(rotation_about_vertical(0.9), &Vector3::new(500.0, 500.0, 0.0)));

        let normalized = normalizer.normalize_poses(&poses);
        let centroid = (Vector3::new(1.0, 0.0, 0.0)
            + Vector3::new(0.0, 1.0, 0.0)
            + Vector3::new(500.0, 500.0, 0.0))
            / 3.0;

        let moved = normalized[&3].center();
        assert_relative_eq!((moved - centroid).norm(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(normalized[&3].rotation, poses[&3].rotation);
        // Direction from the centroid is preserved.
        let before = (Vector3::new(500.0, 500.0, 0.0) - centroid).normalize();
        assert_relative_eq!((moved - centroid).normalize(), before, epsilon = 1e-9);
    }

    #[test]
    fn test_reference_camera_stays_at_identity() {
        let normalizer = TranslationNormalizer::new(75.0);
        let mut poses = PoseStore::new();
        poses.insert(0, Pose::identity());
        poses.insert(1, Pose::from_center(rotation_about_vertical(0.3), &Vector3::new(900.0, 40.0, 0.0)));
        poses.insert(2, Pose::from_center(rotation_about_vertical(2.0), &Vector3::new(-600.0, 800.0, 5.0)));

        let normalized = normalizer.normalize_poses(&poses);
        assert_eq!(normalized[&0], Pose::identity());
        assert_ne!(normalized[&1], poses[&1]);
        assert_ne!(normalized[&2], poses[&2]);
    }

    #[test]
    fn test_single_pose_unchanged() {
        let normalizer = TranslationNormalizer::new(1.0);
        let mut poses = PoseStore::new();
        poses.insert(4, Pose::new(rotation_about_vertical(0.3), Vector3::new(900.0, 0.0, 0.0)));
        assert_eq!(normalizer.normalize_poses(&poses), poses);
    }
}
