//! Camera intrinsics shared by every view of a reconstruction.
//!
//! The reconstruction assumes a single pinhole camera for all images. Its
//! intrinsic matrix is estimated once from image metadata (see
//! [`estimate_camera_matrix`]) and then treated as fixed by every later stage.

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod pinhole;

pub use pinhole::PinholeModel;

/// Focal length and principal point in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Returns the 3×3 projection matrix `K`.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Reads `fx, fy, cx, cy` back out of a projection matrix.
    pub fn from_matrix(k: &Matrix3<f64>) -> Self {
        Intrinsics {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }
    }

    /// Mean of the two focal lengths, in pixels.
    pub fn mean_focal_length(&self) -> f64 {
        (self.fx + self.fy) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraModelError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point in camera coordinates to 2D pixel coordinates
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Load camera parameters from a YAML file
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError>
    where
        Self: Sized;

    /// Save camera parameters to a YAML file
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if intrinsics.fx <= 0.0 || intrinsics.fy <= 0.0 {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }
}

/// Per-image metadata relevant to the reconstruction.
///
/// `focal_length_mm` is the physical focal length reported by the camera (or
/// supplied by configuration); `camera_matrix` is an explicit intrinsic matrix
/// that takes precedence over any estimate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub resolution: Option<Resolution>,
    pub focal_length_mm: Option<f64>,
    pub camera_matrix: Option<Intrinsics>,
}

/// Intrinsics used when no metadata is available at all.
pub const DEFAULT_INTRINSICS: Intrinsics = Intrinsics {
    fx: 1000.0,
    fy: 1000.0,
    cx: 960.0,
    cy: 540.0,
};

/// Estimates the shared camera from the first image's metadata.
///
/// Precedence: an explicit camera matrix, then an estimate from the image size
/// (`f = 0.8 · max(w, h)`, principal point at the image centre), then
/// [`DEFAULT_INTRINSICS`].
pub fn estimate_camera_matrix(metadata: Option<&ImageMetadata>) -> PinholeModel {
    let Some(metadata) = metadata else {
        return PinholeModel::from_intrinsics(DEFAULT_INTRINSICS, Resolution::default());
    };
    let resolution = metadata.resolution.unwrap_or_default();

    if let Some(k) = metadata.camera_matrix {
        return PinholeModel::from_intrinsics(k, resolution);
    }

    match metadata.resolution {
        Some(res) if res.width > 0 && res.height > 0 => {
            let width = res.width as f64;
            let height = res.height as f64;
            let focal = width.max(height) * 0.8;
            PinholeModel::from_intrinsics(
                Intrinsics {
                    fx: focal,
                    fy: focal,
                    cx: width / 2.0,
                    cy: height / 2.0,
                },
                res,
            )
        }
        _ => PinholeModel::from_intrinsics(DEFAULT_INTRINSICS, resolution),
    }
}
