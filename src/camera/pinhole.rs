//! Implements the Pinhole camera model used for every view.
//!
//! This module provides the [`PinholeModel`] struct and its associated methods.
//! It adheres to the [`CameraModel`] trait defined in the parent `camera`
//! module ([`crate::camera`]). Lens distortion is carried as a zero-valued
//! coefficient vector and never applied.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use yaml_rust::YamlLoader;

/// Represents a Pinhole camera model.
///
/// # Examples
///
/// ```rust
/// use nalgebra::Vector3;
/// use simple_sfm::camera::{CameraModel, Intrinsics, PinholeModel, Resolution};
///
/// let intrinsics = Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 };
/// let model = PinholeModel::from_intrinsics(intrinsics, Resolution { width: 640, height: 480 });
///
/// let pixel = model.project(&Vector3::new(0.0, 0.0, 2.0)).unwrap();
/// assert_eq!(pixel.x, 320.0);
/// assert!(model.is_inside(&pixel));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinholeModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// Distortion coefficients `[k1, k2, p1, p2, k3]`, zero unless calibrated.
    pub distortions: [f64; 5],
}

impl PinholeModel {
    pub fn from_intrinsics(intrinsics: Intrinsics, resolution: Resolution) -> Self {
        PinholeModel {
            intrinsics,
            resolution,
            distortions: [0.0; 5],
        }
    }

    /// The shared 3×3 projection matrix `K`.
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.matrix()
    }

    /// Returns `true` when a pixel lies inside the image bounds.
    ///
    /// A zero resolution means the image size is unknown; every pixel is then
    /// considered inside.
    pub fn is_inside(&self, point_2d: &Vector2<f64>) -> bool {
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return point_2d.x.is_finite() && point_2d.y.is_finite();
        }
        point_2d.x >= 0.0
            && point_2d.x < self.resolution.width as f64
            && point_2d.y >= 0.0
            && point_2d.y < self.resolution.height as f64
    }
}

impl CameraModel for PinholeModel {
    /// Projects a 3D point from camera coordinates to pixel coordinates.
    ///
    /// `u = fx * X / Z + cx`, `v = fy * Y / Z + cy`. Points outside the image
    /// are still projected; use [`PinholeModel::is_inside`] to test bounds.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: if `Z` is not strictly positive.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        let u: f64 = self.intrinsics.fx * point_3d.x / point_3d.z + self.intrinsics.cx;
        let v: f64 = self.intrinsics.fy * point_3d.y / point_3d.z + self.intrinsics.cy;

        Ok(Vector2::new(u, v))
    }

    /// Loads camera parameters from a YAML file.
    ///
    /// Expected layout:
    ///
    /// ```yaml
    /// cam0:
    ///   intrinsics: [fx, fy, cx, cy]
    ///   resolution: [width, height]
    /// ```
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs
            .first()
            .ok_or_else(|| CameraModelError::YamlError("Empty YAML document".to_string()))?;

        let intrinsics_yaml = doc["cam0"]["intrinsics"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("YAML missing 'intrinsics' or not an array".to_string())
        })?;
        let resolution_yaml = doc["cam0"]["resolution"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("YAML missing 'resolution' or not an array".to_string())
        })?;
        if intrinsics_yaml.len() < 4 || resolution_yaml.len() < 2 {
            return Err(CameraModelError::InvalidParams(
                "'intrinsics' needs 4 values and 'resolution' needs 2".to_string(),
            ));
        }

        let read_f64 = |index: usize, name: &str| {
            intrinsics_yaml[index].as_f64().ok_or_else(|| {
                CameraModelError::InvalidParams(format!("Invalid {name}: not a float"))
            })
        };
        let intrinsics = Intrinsics {
            fx: read_f64(0, "fx")?,
            fy: read_f64(1, "fy")?,
            cx: read_f64(2, "cx")?,
            cy: read_f64(3, "cy")?,
        };

        let resolution = Resolution {
            width: resolution_yaml[0].as_i64().ok_or_else(|| {
                CameraModelError::InvalidParams("Invalid width: not an integer".to_string())
            })? as u32,
            height: resolution_yaml[1].as_i64().ok_or_else(|| {
                CameraModelError::InvalidParams("Invalid height: not an integer".to_string())
            })? as u32,
        };

        let model = PinholeModel::from_intrinsics(intrinsics, resolution);
        model.validate_params()?;

        Ok(model)
    }

    /// Saves the camera model's parameters in the layout read by `load_from_yaml`.
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let yaml = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::String("cam0".to_string()),
            serde_yaml::to_value(serde_yaml::Mapping::from_iter([
                (
                    serde_yaml::Value::String("camera_model".to_string()),
                    serde_yaml::Value::String("pinhole".to_string()),
                ),
                (
                    serde_yaml::Value::String("intrinsics".to_string()),
                    serde_yaml::to_value(vec![
                        self.intrinsics.fx,
                        self.intrinsics.fy,
                        self.intrinsics.cx,
                        self.intrinsics.cy,
                    ])
                    .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
                ),
                (
                    serde_yaml::Value::String("resolution".to_string()),
                    serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])
                        .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
                ),
            ]))
            .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
        )]))
        .map_err(|e| CameraModelError::YamlError(e.to_string()))?;

        let yaml_string =
            serde_yaml::to_string(&yaml).map_err(|e| CameraModelError::YamlError(e.to_string()))?;

        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;

        Ok(())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.distortions.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }
}
