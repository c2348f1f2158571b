//! Simple SfM Library
//!
//! Incremental structure-from-motion over an unordered photo collection:
//! - Pose bootstrap with a deterministic fallback placement for cameras that
//!   cannot be chained through two-view geometry
//! - Translation normalization to a focal-length-derived metric scale
//! - Observation table construction and padding for a well-determined solve
//! - Bundle adjustment over a flat point/pose parameter vector, solved with
//!   the tiny-solver Levenberg-Marquardt optimizer
//!
//! Feature detection, matching, two-view estimation, PnP and triangulation
//! sit behind traits in [`features`], each with a default implementation.
//! [`pipeline::SfmPipeline`] drives every stage in order.

pub mod camera;
pub mod config;
pub mod error;
pub mod export;
pub mod features;
pub mod geometry;
pub mod image_io;
pub mod observation;
pub mod optimization;
pub mod pipeline;
pub mod pose;
pub mod triangulation;

// Re-export commonly used types
pub use camera::{
    estimate_camera_matrix, CameraModel, CameraModelError, ImageMetadata, Intrinsics,
    PinholeModel, Resolution,
};
pub use config::SfmConfig;
pub use error::{Result, SfmError};
pub use geometry::Pose;
pub use observation::{CorrespondenceTable, Observation, ObservationSynthesizer};
pub use optimization::{BundleAdjuster, LeastSquaresSolver, ProjectionError, TinySolverBackend};
pub use pipeline::{PipelineReport, PipelineStage, SfmPipeline, StageRecord};
pub use pose::{bootstrap_poses, PoseStore, TranslationNormalizer, TwoViewOutcome};
