//! Reconstruction settings, loadable from YAML.

use crate::error::{Result, SfmError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Every tunable threshold of the reconstruction.
///
/// Missing keys in a YAML file fall back to [`SfmConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SfmConfig {
    /// RANSAC inlier threshold in pixels for two-view estimation.
    pub ransac_threshold: f64,
    pub ransac_confidence: f64,
    /// Nearest/second-nearest ratio for descriptor matching.
    pub ratio_threshold: f32,
    /// Pairs with fewer matches are dropped from the match graph.
    pub min_matches: usize,
    /// Looser ratio used when re-matching posed pairs before triangulation.
    pub additional_ratio_threshold: f32,
    pub additional_min_matches: usize,
    /// Correspondences needed to attempt two-view estimation beyond the first pair.
    pub min_bootstrap_correspondences: usize,

    /// Physical focal length override in millimetres.
    pub focal_length_mm: Option<f64>,
    pub default_focal_length_mm: f64,
    /// Calibration file in the `cam0: {intrinsics, resolution}` layout.
    /// Its intrinsics replace the estimate derived from image size.
    pub camera_yaml: Option<PathBuf>,
    /// Assumed sensor width (APS-C) when converting pixel focal lengths.
    pub sensor_width_mm: f64,

    /// Circle radius used for fallback placement when nothing is posed yet.
    pub fallback_radius: f64,
    pub fallback_radius_scale: f64,

    pub relaxed_cheirality: bool,
    pub cheirality_min_depth: f64,
    pub max_point_distance: f64,

    pub bundle_adjustment: bool,
    pub max_evaluations: usize,
    pub tolerance: f64,

    pub observation_margin: usize,
    pub observation_seed: u64,
    pub mined_observations_per_camera: usize,
    pub placeholder_observations_per_camera: usize,
    /// Pads with observations tied to point 0. Diagnostic only.
    pub placeholder_observations: bool,

    pub output_dir: PathBuf,
    pub base_filename: String,
    pub max_images: Option<usize>,
}

impl Default for SfmConfig {
    fn default() -> Self {
        SfmConfig {
            ransac_threshold: 8.0,
            ransac_confidence: 0.99,
            ratio_threshold: 0.7,
            min_matches: 10,
            additional_ratio_threshold: 0.8,
            additional_min_matches: 5,
            min_bootstrap_correspondences: 10,
            focal_length_mm: None,
            default_focal_length_mm: 50.0,
            camera_yaml: None,
            sensor_width_mm: 23.5,
            fallback_radius: 50.0,
            fallback_radius_scale: 0.8,
            relaxed_cheirality: true,
            cheirality_min_depth: -0.1,
            max_point_distance: 1000.0,
            bundle_adjustment: true,
            max_evaluations: 20,
            tolerance: 1e-4,
            observation_margin: 1000,
            observation_seed: 42,
            mined_observations_per_camera: 1000,
            placeholder_observations_per_camera: 500,
            placeholder_observations: false,
            output_dir: PathBuf::from("output/sfm_pipeline"),
            base_filename: "sfm_results".to_string(),
            max_images: None,
        }
    }
}

impl SfmConfig {
    pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: SfmConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.ratio_threshold > 0.0 && self.ratio_threshold <= 1.0) {
            return Err(SfmError::InvalidParams(format!(
                "ratio_threshold must lie in (0, 1], got {}",
                self.ratio_threshold
            )));
        }
        if self.default_focal_length_mm <= 0.0 || self.sensor_width_mm <= 0.0 {
            return Err(SfmError::InvalidParams(
                "focal length and sensor width must be positive".to_string(),
            ));
        }
        if let Some(focal) = self.focal_length_mm {
            if !(focal > 0.0) {
                return Err(SfmError::InvalidParams(format!(
                    "focal_length_mm must be positive, got {focal}"
                )));
            }
        }
        if self.tolerance <= 0.0 {
            return Err(SfmError::InvalidParams(
                "tolerance must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
