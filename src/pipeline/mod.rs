//! The stage-sequential reconstruction controller.
//!
//! Stages run strictly in order:
//!
//! `Loaded → MetadataExtracted → FeaturesExtracted → Matched →
//! PosesBootstrapped → Triangulated → BundleAdjusted → Colored → Exported`
//!
//! Every stage is a method that borrows the current [`PipelineState`] and
//! returns the updated copy, so each can be exercised on its own. The
//! controller logs a [`StageRecord`] per stage as JSON. A failing stage ends
//! the run with an empty [`PipelineReport`], except bundle adjustment and
//! colouring, whose failures keep the previous state and move on.

use crate::camera::{estimate_camera_matrix, CameraModel, ImageMetadata, PinholeModel};
use crate::config::SfmConfig;
use crate::error::{Result, SfmError};
use crate::export::{color_points, export_reconstruction, ExportBundle};
use crate::features::{
    match_all_pairs, pair_matches, BruteForceMatcher, DescriptorMatcher, DltPnpSolver,
    EightPointEstimator, FeatureDetector, Features, HarrisDetector, MatchGraph, PnpSolver,
    Triangulator, TwoViewEstimator,
};
use crate::image_io::{extract_metadata, load_images_from_directory, SfmImage};
use crate::observation::{
    observations_from_matches, CorrespondenceTable, Observation, ObservationSources,
    ObservationSynthesizer, SynthesisSettings,
};
use crate::optimization::{BundleAdjuster, LeastSquaresSolver, ProjectionError, TinySolverBackend};
use crate::pose::{
    bootstrap_poses, estimate_pose_pnp, BootstrapSettings, Placement, PoseStore,
    TranslationNormalizer,
};
use crate::triangulation::{
    find_additional_matches, triangulate_posed_pairs, DltTriangulator, TriangulationOutput,
    TriangulationSettings,
};
use log::{error, info, warn};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Loaded,
    MetadataExtracted,
    FeaturesExtracted,
    Matched,
    PosesBootstrapped,
    Triangulated,
    BundleAdjusted,
    Colored,
    Exported,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 9] = [
        PipelineStage::Loaded,
        PipelineStage::MetadataExtracted,
        PipelineStage::FeaturesExtracted,
        PipelineStage::Matched,
        PipelineStage::PosesBootstrapped,
        PipelineStage::Triangulated,
        PipelineStage::BundleAdjusted,
        PipelineStage::Colored,
        PipelineStage::Exported,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Loaded => "loaded",
            PipelineStage::MetadataExtracted => "metadata_extracted",
            PipelineStage::FeaturesExtracted => "features_extracted",
            PipelineStage::Matched => "matched",
            PipelineStage::PosesBootstrapped => "poses_bootstrapped",
            PipelineStage::Triangulated => "triangulated",
            PipelineStage::BundleAdjusted => "bundle_adjusted",
            PipelineStage::Colored => "colored",
            PipelineStage::Exported => "exported",
        }
    }

    /// Stages whose failure keeps the prior state instead of ending the run.
    pub fn is_optional(&self) -> bool {
        matches!(self, PipelineStage::BundleAdjusted | PipelineStage::Colored)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// Disabled, or an optional stage that failed and kept the prior state.
    Skipped,
    Failed,
}

/// Structured log entry emitted once per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: PipelineStage,
    pub status: StageStatus,
    pub inputs: BTreeMap<String, usize>,
    pub outputs: BTreeMap<String, usize>,
    pub elapsed_ms: f64,
    pub message: Option<String>,
}

impl StageRecord {
    fn log(&self) {
        match serde_json::to_string(self) {
            Ok(json) => match self.status {
                StageStatus::Failed => error!("{json}"),
                StageStatus::Skipped => warn!("{json}"),
                StageStatus::Completed => info!("{json}"),
            },
            Err(err) => warn!("could not serialize record of stage {}: {err}", self.stage),
        }
    }
}

/// Everything produced so far, threaded explicitly from stage to stage.
#[derive(Debug, Clone)]
pub struct PipelineState<'a> {
    pub images: &'a [SfmImage],
    pub metadata: Option<ImageMetadata>,
    pub camera: Option<PinholeModel>,
    pub normalizer: Option<TranslationNormalizer>,
    pub features: BTreeMap<usize, Features>,
    pub matches: MatchGraph,
    pub poses: PoseStore,
    pub placements: BTreeMap<usize, Placement>,
    pub points: Vec<Point3<f64>>,
    pub table: CorrespondenceTable,
    pub observations: Vec<Observation>,
    pub colors: Vec<[u8; 3]>,
    pub bundle_adjusted: bool,
    pub reprojection_error: Option<ProjectionError>,
    pub output_files: Vec<PathBuf>,
    pub completed: Option<PipelineStage>,
}

impl<'a> PipelineState<'a> {
    pub fn new(images: &'a [SfmImage]) -> Self {
        PipelineState {
            images,
            metadata: None,
            camera: None,
            normalizer: None,
            features: BTreeMap::new(),
            matches: MatchGraph::new(),
            poses: PoseStore::new(),
            placements: BTreeMap::new(),
            points: Vec::new(),
            table: CorrespondenceTable::new(),
            observations: Vec::new(),
            colors: Vec::new(),
            bundle_adjusted: false,
            reprojection_error: None,
            output_files: Vec::new(),
            completed: None,
        }
    }

    pub fn keypoint_count(&self) -> usize {
        self.features.values().map(Features::len).sum()
    }

    pub fn match_count(&self) -> usize {
        self.matches.values().map(Vec::len).sum()
    }

    fn counts(&self) -> BTreeMap<String, usize> {
        [
            ("images", self.images.len()),
            ("keypoints", self.keypoint_count()),
            ("matches", self.match_count()),
            ("poses", self.poses.len()),
            ("points_3d", self.points.len()),
            ("observations", self.observations.len()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
    }

    fn require_camera(&self) -> Result<&PinholeModel> {
        self.camera
            .as_ref()
            .ok_or_else(|| SfmError::EmptyStage(PipelineStage::MetadataExtracted.to_string()))
    }
}

/// Summary of a run. Degraded runs report zero counts but keep their stage
/// records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub images: usize,
    pub keypoints: usize,
    pub matches: usize,
    pub poses: usize,
    pub points_3d: usize,
    pub observations: usize,
    pub bundle_adjusted: bool,
    pub reprojection_error: Option<ProjectionError>,
    pub stage_records: Vec<StageRecord>,
    pub output_files: Vec<PathBuf>,
    pub completed_stage: Option<PipelineStage>,
    pub total_processing_ms: f64,
}

impl PipelineReport {
    fn from_state(state: &PipelineState<'_>, stage_records: Vec<StageRecord>, elapsed_ms: f64) -> Self {
        PipelineReport {
            images: state.images.len(),
            keypoints: state.keypoint_count(),
            matches: state.match_count(),
            poses: state.poses.len(),
            points_3d: state.points.len(),
            observations: state.observations.len(),
            bundle_adjusted: state.bundle_adjusted,
            reprojection_error: state.reprojection_error.clone(),
            stage_records,
            output_files: state.output_files.clone(),
            completed_stage: state.completed,
            total_processing_ms: elapsed_ms,
        }
    }

    fn empty(
        completed_stage: Option<PipelineStage>,
        stage_records: Vec<StageRecord>,
        elapsed_ms: f64,
    ) -> Self {
        PipelineReport {
            stage_records,
            completed_stage,
            total_processing_ms: elapsed_ms,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points_3d == 0 && self.poses == 0
    }

    pub fn save_to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Owns the configuration and the external collaborators.
pub struct SfmPipeline {
    config: SfmConfig,
    detector: Box<dyn FeatureDetector>,
    matcher: Box<dyn DescriptorMatcher>,
    two_view: Box<dyn TwoViewEstimator>,
    pnp: Box<dyn PnpSolver>,
    triangulator: Box<dyn Triangulator>,
    solver: Box<dyn LeastSquaresSolver>,
}

impl SfmPipeline {
    pub fn new(config: SfmConfig) -> Self {
        SfmPipeline {
            config,
            detector: Box::new(HarrisDetector::default()),
            matcher: Box::new(BruteForceMatcher),
            two_view: Box::new(EightPointEstimator::default()),
            pnp: Box::new(DltPnpSolver),
            triangulator: Box::new(DltTriangulator),
            solver: Box::new(TinySolverBackend),
        }
    }

    pub fn config(&self) -> &SfmConfig {
        &self.config
    }

    pub fn with_detector(mut self, detector: Box<dyn FeatureDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_matcher(mut self, matcher: Box<dyn DescriptorMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_two_view_estimator(mut self, estimator: Box<dyn TwoViewEstimator>) -> Self {
        self.two_view = estimator;
        self
    }

    pub fn with_pnp_solver(mut self, solver: Box<dyn PnpSolver>) -> Self {
        self.pnp = solver;
        self
    }

    pub fn with_triangulator(mut self, triangulator: Box<dyn Triangulator>) -> Self {
        self.triangulator = triangulator;
        self
    }

    pub fn with_solver(mut self, solver: Box<dyn LeastSquaresSolver>) -> Self {
        self.solver = solver;
        self
    }

    /// Loads every image of `dir` (up to `max_images`) and runs the pipeline.
    pub fn run_directory<P: AsRef<Path>>(&self, dir: P) -> Result<PipelineReport> {
        let images = load_images_from_directory(dir, self.config.max_images)?;
        self.run(&images)
    }

    /// Runs every stage over `images`.
    ///
    /// # Arguments
    ///
    /// * `images` - Loaded images; the first one supplies the camera metadata.
    ///
    /// # Returns
    ///
    /// A [`PipelineReport`] with one [`StageRecord`] per stage that ran.
    /// Optional stages that fail are recorded as skipped; any other stage
    /// failure is logged and yields an empty report.
    ///
    /// # Errors
    ///
    /// * [`SfmError::NoImages`] - If `images` is empty.
    pub fn run(&self, images: &[SfmImage]) -> Result<PipelineReport> {
        self.run_with_state(images).map(|(report, _)| report)
    }

    /// Like [`SfmPipeline::run`], also handing back the final state.
    pub fn run_with_state<'a>(
        &self,
        images: &'a [SfmImage],
    ) -> Result<(PipelineReport, PipelineState<'a>)> {
        if images.is_empty() {
            return Err(SfmError::NoImages);
        }
        let started = Instant::now();
        let mut state = PipelineState::new(images);
        let mut records = Vec::with_capacity(PipelineStage::ALL.len());

        for stage in PipelineStage::ALL {
            let stage_started = Instant::now();
            let inputs = state.counts();
            let (status, message) = if stage == PipelineStage::BundleAdjusted
                && !self.config.bundle_adjustment
            {
                (StageStatus::Skipped, Some("disabled by configuration".to_string()))
            } else {
                match self.execute(stage, &state) {
                    Ok(next) => {
                        state = next;
                        state.completed = Some(stage);
                        (StageStatus::Completed, None)
                    }
                    Err(err) if stage.is_optional() => (StageStatus::Skipped, Some(err.to_string())),
                    Err(err) => (StageStatus::Failed, Some(err.to_string())),
                }
            };

            let record = StageRecord {
                stage,
                status,
                inputs,
                outputs: state.counts(),
                elapsed_ms: stage_started.elapsed().as_secs_f64() * 1000.0,
                message,
            };
            record.log();
            records.push(record);

            if status == StageStatus::Failed {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                let report = PipelineReport::empty(state.completed, records, elapsed);
                return Ok((report, PipelineState::new(images)));
            }
        }

        let summary = self
            .config
            .output_dir
            .join(format!("{}_summary.json", self.config.base_filename));
        state.output_files.push(summary.clone());
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        let report = PipelineReport::from_state(&state, records, elapsed);
        if let Err(err) = report.save_to_json(&summary) {
            warn!("could not write {}: {err}", summary.display());
        }
        info!(
            "reconstruction finished in {elapsed:.1} ms: {} cameras, {} points",
            report.poses, report.points_3d
        );
        Ok((report, state))
    }

    /// Runs a single stage on `state`.
    pub fn execute<'a>(
        &self,
        stage: PipelineStage,
        state: &PipelineState<'a>,
    ) -> Result<PipelineState<'a>> {
        match stage {
            PipelineStage::Loaded => self.check_loaded(state),
            PipelineStage::MetadataExtracted => self.extract_metadata(state),
            PipelineStage::FeaturesExtracted => self.extract_features(state),
            PipelineStage::Matched => self.match_features(state),
            PipelineStage::PosesBootstrapped => self.bootstrap(state),
            PipelineStage::Triangulated => self.triangulate(state),
            PipelineStage::BundleAdjusted => self.bundle_adjust(state),
            PipelineStage::Colored => self.color(state),
            PipelineStage::Exported => self.export(state),
        }
    }

    pub fn check_loaded<'a>(&self, state: &PipelineState<'a>) -> Result<PipelineState<'a>> {
        if state.images.is_empty() {
            return Err(SfmError::NoImages);
        }
        Ok(state.clone())
    }

    /// Shared intrinsics and translation normalizer, from the first image.
    pub fn extract_metadata<'a>(&self, state: &PipelineState<'a>) -> Result<PipelineState<'a>> {
        let first = state.images.first().ok_or(SfmError::NoImages)?;
        let mut metadata = extract_metadata(first, self.config.focal_length_mm);
        if let Some(path) = &self.config.camera_yaml {
            let calibrated = PinholeModel::load_from_yaml(&path.to_string_lossy())?;
            info!("intrinsics loaded from {}", path.display());
            metadata.camera_matrix = Some(calibrated.intrinsics);
            metadata.resolution.get_or_insert(calibrated.resolution);
        }
        let camera = estimate_camera_matrix(Some(&metadata));
        let normalizer = TranslationNormalizer::from_camera(&self.config, Some(&metadata), Some(&camera));
        info!(
            "camera {:?}, normalization target {:.2}",
            camera.intrinsics,
            normalizer.target_distance()
        );

        let mut next = state.clone();
        next.metadata = Some(metadata);
        next.camera = Some(camera);
        next.normalizer = Some(normalizer);
        Ok(next)
    }

    /// Detection failures on a single image leave that image without features.
    pub fn extract_features<'a>(&self, state: &PipelineState<'a>) -> Result<PipelineState<'a>> {
        let mut features = BTreeMap::new();
        for image in state.images {
            let detected = self.detector.detect(image).unwrap_or_else(|err| {
                warn!("feature detection failed on {}: {err}", image.path.display());
                Features::default()
            });
            info!("image {}: {} keypoints", image.index, detected.len());
            features.insert(image.index, detected);
        }

        let mut next = state.clone();
        next.features = features;
        if next.keypoint_count() == 0 {
            return Err(SfmError::EmptyStage(PipelineStage::FeaturesExtracted.to_string()));
        }
        Ok(next)
    }

    pub fn match_features<'a>(&self, state: &PipelineState<'a>) -> Result<PipelineState<'a>> {
        let matches = match_all_pairs(
            &state.features,
            self.matcher.as_ref(),
            self.config.ratio_threshold,
            self.config.min_matches,
        );
        info!("{} image pairs matched", matches.len());
        if matches.is_empty() {
            return Err(SfmError::EmptyStage(PipelineStage::Matched.to_string()));
        }
        let mut next = state.clone();
        next.matches = matches;
        Ok(next)
    }

    /// One pose per image, then the translation normalization pass.
    pub fn bootstrap<'a>(&self, state: &PipelineState<'a>) -> Result<PipelineState<'a>> {
        let camera = state.require_camera()?;
        let cameras: Vec<usize> = state.images.iter().map(|image| image.index).collect();
        let result = bootstrap_poses(
            &cameras,
            &state.features,
            &state.matches,
            &camera.intrinsics,
            self.two_view.as_ref(),
            &BootstrapSettings::from(&self.config),
        );
        if result.poses.is_empty() {
            return Err(SfmError::EmptyStage(PipelineStage::PosesBootstrapped.to_string()));
        }
        let fallback = result.fallback_cameras();
        if !fallback.is_empty() {
            warn!("cameras placed without geometry: {fallback:?}");
        }

        let mut next = state.clone();
        next.poses = match &state.normalizer {
            Some(normalizer) => normalizer.normalize_poses(&result.poses),
            None => result.poses,
        };
        next.placements = result.placements;
        Ok(next)
    }

    /// Triangulates the posed pairs, re-registers synthetically placed
    /// cameras by PnP, and builds the observation list.
    pub fn triangulate<'a>(&self, state: &PipelineState<'a>) -> Result<PipelineState<'a>> {
        let camera = state.require_camera()?;
        let intrinsics = camera.intrinsics;
        let settings = TriangulationSettings::from(&self.config);

        let posed: Vec<usize> = state.poses.keys().copied().collect();
        let mut matches = state.matches.clone();
        matches.extend(find_additional_matches(
            &posed,
            &state.features,
            &state.matches,
            self.matcher.as_ref(),
            self.config.additional_ratio_threshold,
            self.config.additional_min_matches,
        ));

        let mut poses = state.poses.clone();
        let mut placements = state.placements.clone();
        let fallback: Vec<usize> = placements
            .iter()
            .filter(|(_, placement)| placement.is_fallback())
            .map(|(&index, _)| index)
            .collect();

        let trusted: PoseStore = poses
            .iter()
            .filter(|(index, _)| !fallback.contains(*index))
            .map(|(&index, pose)| (index, *pose))
            .collect();
        let mut output = triangulate_posed_pairs(
            &trusted,
            &state.features,
            &matches,
            &intrinsics,
            self.triangulator.as_ref(),
            &settings,
        );

        if !fallback.is_empty() {
            if let Some(normalizer) = &state.normalizer {
                for &index in &fallback {
                    let (points_3d, points_2d) =
                        registration_pairs(index, &trusted, &state.features, &matches, &output);
                    if let Some(pose) =
                        estimate_pose_pnp(&points_3d, &points_2d, camera, self.pnp.as_ref(), normalizer)
                    {
                        info!("camera {index} re-registered from {} points", points_3d.len());
                        poses.insert(index, pose);
                        placements.insert(
                            index,
                            Placement::Pnp {
                                correspondences: points_3d.len(),
                            },
                        );
                    }
                }
            }
            output = triangulate_posed_pairs(
                &poses,
                &state.features,
                &matches,
                &intrinsics,
                self.triangulator.as_ref(),
                &settings,
            );
        }

        if output.is_empty() {
            return Err(SfmError::EmptyStage(PipelineStage::Triangulated.to_string()));
        }

        let TriangulationOutput { points, table, .. } = output;
        let observations = self.synthesize_observations(&points, &poses, &table, &matches, &state.features);

        let mut next = state.clone();
        next.matches = matches;
        next.poses = poses;
        next.placements = placements;
        next.points = points;
        next.table = table;
        next.observations = observations;
        Ok(next)
    }

    fn synthesize_observations(
        &self,
        points: &[Point3<f64>],
        poses: &PoseStore,
        table: &CorrespondenceTable,
        matches: &MatchGraph,
        features: &BTreeMap<usize, Features>,
    ) -> Vec<Observation> {
        let primary = if table.is_empty() {
            observations_from_matches(matches, features, points.len())
        } else {
            table.observations()
        };
        let camera_views = table.camera_views();
        let detections: BTreeMap<usize, Vec<Point2<f64>>> = features
            .iter()
            .map(|(&index, f)| (index, f.keypoints.clone()))
            .collect();
        let cameras: Vec<usize> = poses.keys().copied().collect();

        ObservationSynthesizer::new(SynthesisSettings::from(&self.config)).synthesize(
            ObservationSources {
                primary: &primary,
                camera_views: &camera_views,
                detections: &detections,
            },
            points.len(),
            &cameras,
        )
    }

    /// Fails without touching the state when the solver does not converge.
    pub fn bundle_adjust<'a>(&self, state: &PipelineState<'a>) -> Result<PipelineState<'a>> {
        let camera = state.require_camera()?;
        let adjuster = BundleAdjuster::from_config(self.solver.as_ref(), &self.config);
        let result = adjuster.adjust(
            &state.points,
            &state.poses,
            &state.observations,
            &camera.intrinsics,
        );
        if !result.refined {
            return Err(SfmError::NumericalError(
                "bundle adjustment did not refine the reconstruction".to_string(),
            ));
        }

        let mut next = state.clone();
        next.points = result.points;
        next.poses = result.poses;
        next.bundle_adjusted = true;
        next.reprojection_error = result.final_error;
        Ok(next)
    }

    pub fn color<'a>(&self, state: &PipelineState<'a>) -> Result<PipelineState<'a>> {
        let images: BTreeMap<usize, &SfmImage> =
            state.images.iter().map(|image| (image.index, image)).collect();
        let mut next = state.clone();
        next.colors = color_points(state.points.len(), &state.table, &images);
        Ok(next)
    }

    pub fn export<'a>(&self, state: &PipelineState<'a>) -> Result<PipelineState<'a>> {
        let camera = state.require_camera()?;
        let written = export_reconstruction(
            &self.config.output_dir,
            &self.config.base_filename,
            &ExportBundle {
                points: &state.points,
                colors: &state.colors,
                poses: &state.poses,
                table: &state.table,
                camera,
                bundle_adjusted: state.bundle_adjusted,
            },
        )?;
        let mut next = state.clone();
        next.output_files = written;
        Ok(next)
    }
}

/// 3D-2D pairs for `camera` from its matches with trusted cameras whose
/// keypoints already produced a triangulated point.
fn registration_pairs(
    camera: usize,
    trusted: &PoseStore,
    features: &BTreeMap<usize, Features>,
    matches: &MatchGraph,
    output: &TriangulationOutput,
) -> (Vec<Point3<f64>>, Vec<Point2<f64>>) {
    let Some(own) = features.get(&camera) else {
        return (Vec::new(), Vec::new());
    };
    let mut points_3d = Vec::new();
    let mut points_2d = Vec::new();
    for &other in trusted.keys() {
        let Some(pair) = pair_matches(matches, camera, other) else {
            continue;
        };
        for m in pair {
            let point = output
                .keypoint_points
                .get(&(other, m.train_idx))
                .and_then(|&index| output.points.get(index));
            if let (Some(point), Some(pixel)) = (point, own.keypoints.get(m.query_idx)) {
                points_3d.push(*point);
                points_2d.push(*pixel);
            }
        }
    }
    (points_3d, points_2d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution};
    use crate::geometry::{rotation_about_vertical, Pose};
    use crate::optimization::{BundleProblem, SolverOutcome};
    use crate::pose::TwoViewOutcome;
    use image::{DynamicImage, Rgb, RgbImage};
    use nalgebra::{DVector, Vector3};

    const DESCRIPTOR_LEN: usize = 64;

    /// Keypoints keyed by image index; descriptor `id` is one-hot so only
    /// identical scene points match.
    struct SceneDetector {
        visible: BTreeMap<usize, Vec<usize>>,
    }

    impl FeatureDetector for SceneDetector {
        fn detect(&self, image: &SfmImage) -> Result<Features> {
            let ids = self.visible.get(&image.index).cloned().unwrap_or_default();
            Ok(Features {
                keypoints: ids
                    .iter()
                    .map(|&id| Point2::new(id as f64 + 2.0, image.index as f64 * 10.0 + 2.0))
                    .collect(),
                descriptors: ids
                    .iter()
                    .map(|&id| {
                        let mut d = vec![0.0; DESCRIPTOR_LEN];
                        d[id] = 1.0;
                        d
                    })
                    .collect(),
            })
        }
    }

    /// Succeeds on at least `min_points` correspondences.
    struct FixedEstimator {
        min_points: usize,
    }

    impl TwoViewEstimator for FixedEstimator {
        fn estimate(
            &self,
            points_a: &[Point2<f64>],
            _points_b: &[Point2<f64>],
            _intrinsics: &Intrinsics,
            _ransac_threshold: f64,
            _confidence: f64,
        ) -> TwoViewOutcome {
            if points_a.len() < self.min_points {
                return TwoViewOutcome::InsufficientData {
                    available: points_a.len(),
                    required: self.min_points,
                };
            }
            TwoViewOutcome::Pose {
                relative: Pose::new(rotation_about_vertical(0.1), Vector3::new(1.0, 0.0, 0.0)),
                inliers: (0..points_a.len()).collect(),
            }
        }
    }

    struct FixedPnp;

    impl PnpSolver for FixedPnp {
        fn solve(
            &self,
            _points_3d: &[Point3<f64>],
            _points_2d: &[Point2<f64>],
            _intrinsics: &Intrinsics,
            _distortion: &[f64],
        ) -> Option<Pose> {
            Some(Pose::new(rotation_about_vertical(-0.2), Vector3::new(0.0, 0.0, 2.0)))
        }
    }

    /// Every correspondence becomes a point 10 units in front of the first camera.
    struct FrontTriangulator;

    impl Triangulator for FrontTriangulator {
        fn triangulate(
            &self,
            points_a: &[Point2<f64>],
            _points_b: &[Point2<f64>],
            pose_a: &Pose,
            _pose_b: &Pose,
            _intrinsics: &Intrinsics,
        ) -> Vec<Option<Point3<f64>>> {
            points_a
                .iter()
                .map(|p| {
                    let in_camera = Vector3::new(p.x * 0.01, p.y * 0.01, 10.0);
                    let world = pose_a.rotation.transpose() * (in_camera - pose_a.translation);
                    Some(Point3::from(world))
                })
                .collect()
        }
    }

    struct FailingSolver;

    impl LeastSquaresSolver for FailingSolver {
        fn minimize(
            &self,
            _problem: &BundleProblem<'_>,
            initial: &DVector<f64>,
            _max_evaluations: usize,
            _tolerance: f64,
        ) -> SolverOutcome {
            SolverOutcome {
                success: false,
                x: initial.clone(),
                cost: f64::INFINITY,
            }
        }
    }

    fn images(n: usize) -> Vec<SfmImage> {
        (0..n)
            .map(|i| {
                let pixel = Rgb([10 * i as u8, 200, 30]);
                SfmImage::new(
                    i,
                    format!("image_{i}.png"),
                    DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, pixel)),
                )
            })
            .collect()
    }

    fn config(name: &str) -> SfmConfig {
        SfmConfig {
            output_dir: std::env::temp_dir().join(name),
            ..Default::default()
        }
    }

    /// Cameras 0 and 1 share 40 points; camera 2 sees only 12 of them.
    fn pipeline(config: SfmConfig) -> SfmPipeline {
        let visible: BTreeMap<usize, Vec<usize>> =
            [(0, (0..40).collect()), (1, (0..40).collect()), (2, (0..12).collect())]
                .into_iter()
                .collect();
        SfmPipeline::new(config)
            .with_detector(Box::new(SceneDetector { visible }))
            .with_two_view_estimator(Box::new(FixedEstimator { min_points: 20 }))
            .with_pnp_solver(Box::new(FixedPnp))
            .with_triangulator(Box::new(FrontTriangulator))
            .with_solver(Box::new(FailingSolver))
    }

    #[test]
    fn test_no_images_is_an_error() {
        let result = SfmPipeline::new(SfmConfig::default()).run(&[]);
        assert!(matches!(result, Err(SfmError::NoImages)));
    }

    #[test]
    fn test_full_run_with_fallback_reregistration() {
        let config = config("simple_sfm_pipeline_full");
        let output_dir = config.output_dir.clone();
        let _ = fs::remove_dir_all(&output_dir);
        let images = images(3);

        let (report, state) = pipeline(config).run_with_state(&images).unwrap();

        assert_eq!(report.completed_stage, Some(PipelineStage::Exported));
        assert_eq!(report.stage_records.len(), PipelineStage::ALL.len());
        assert_eq!(report.poses, 3);
        assert_eq!(state.poses[&0], Pose::identity());
        assert_eq!(
            state.placements[&2],
            Placement::Pnp {
                correspondences: 24
            }
        );
        // Pairs (0,1), (0,2) and (1,2) after re-registration.
        assert_eq!(report.points_3d, 40 + 12 + 12);

        let required = crate::observation::required_observations(
            report.points_3d,
            3,
            SfmConfig::default().observation_margin,
        );
        assert!(report.observations >= required);
        assert!(report.observations <= 2 * required);

        // Failing solver: bundle adjustment skipped, later stages still run.
        let ba = &report.stage_records[6];
        assert_eq!(ba.stage, PipelineStage::BundleAdjusted);
        assert_eq!(ba.status, StageStatus::Skipped);
        assert!(!report.bundle_adjusted);
        assert_eq!(report.stage_records[7].status, StageStatus::Completed);

        assert_eq!(state.colors.len(), report.points_3d);
        assert!(report.output_files.iter().all(|p| p.exists()));
        assert!(output_dir.join("sfm_results_summary.json").exists());
        let _ = fs::remove_dir_all(&output_dir);
    }

    #[test]
    fn test_calibration_file_overrides_estimate() {
        let path = std::env::temp_dir().join("simple_sfm_pipeline_calibration.yaml");
        let calibrated = PinholeModel::from_intrinsics(
            Intrinsics {
                fx: 90.0,
                fy: 91.0,
                cx: 30.0,
                cy: 33.0,
            },
            Resolution {
                width: 64,
                height: 64,
            },
        );
        calibrated.save_to_yaml(&path.to_string_lossy()).unwrap();

        let config = SfmConfig {
            camera_yaml: Some(path.clone()),
            ..config("simple_sfm_pipeline_calibrated")
        };
        let images = images(2);
        let state = pipeline(config)
            .extract_metadata(&PipelineState::new(&images))
            .unwrap();

        assert_eq!(state.camera.as_ref().unwrap().intrinsics, calibrated.intrinsics);
        assert_eq!(
            state.metadata.as_ref().unwrap().camera_matrix,
            Some(calibrated.intrinsics)
        );
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_calibration_file_fails_metadata() {
        let config = SfmConfig {
            camera_yaml: Some(std::env::temp_dir().join("simple_sfm_no_such_camera.yaml")),
            ..config("simple_sfm_pipeline_missing_calibration")
        };
        let images = images(1);
        let result = pipeline(config).extract_metadata(&PipelineState::new(&images));
        assert!(matches!(result, Err(SfmError::CameraModel(_))));
    }

    #[test]
    fn test_empty_stage_returns_empty_report() {
        let config = config("simple_sfm_pipeline_empty");
        let pipeline = SfmPipeline::new(config).with_detector(Box::new(SceneDetector {
            visible: BTreeMap::new(),
        }));
        let images = images(2);

        let report = pipeline.run(&images).unwrap();
        assert!(report.is_empty());
        assert_eq!(report.images, 0);
        assert_eq!(report.completed_stage, Some(PipelineStage::MetadataExtracted));
        let last = report.stage_records.last().unwrap();
        assert_eq!(last.stage, PipelineStage::FeaturesExtracted);
        assert_eq!(last.status, StageStatus::Failed);
        assert_eq!(report.stage_records.len(), 3);
    }

    #[test]
    fn test_disabled_bundle_adjustment_is_skipped() {
        let config = SfmConfig {
            bundle_adjustment: false,
            ..config("simple_sfm_pipeline_no_ba")
        };
        let output_dir = config.output_dir.clone();
        let images = images(3);
        let report = pipeline(config).run(&images).unwrap();

        let ba = &report.stage_records[6];
        assert_eq!(ba.status, StageStatus::Skipped);
        assert_eq!(ba.message.as_deref(), Some("disabled by configuration"));
        assert_eq!(ba.inputs, ba.outputs);
        assert_eq!(report.completed_stage, Some(PipelineStage::Exported));
        let _ = fs::remove_dir_all(&output_dir);
    }

    #[test]
    fn test_stages_run_in_isolation() {
        let images = images(3);
        let pipeline = pipeline(config("simple_sfm_pipeline_isolated"));
        let mut state = PipelineState::new(&images);
        for stage in &PipelineStage::ALL[..4] {
            state = pipeline.execute(*stage, &state).unwrap();
        }
        assert_eq!(state.matches.len(), 3);
        assert!(state.poses.is_empty());

        let bootstrapped = pipeline.bootstrap(&state).unwrap();
        assert_eq!(bootstrapped.poses.len(), 3);
        assert!(bootstrapped.placements[&2].is_fallback());
        // The input state is left untouched.
        assert!(state.poses.is_empty());
    }

    #[test]
    fn test_stage_record_serializes_as_json() {
        let record = StageRecord {
            stage: PipelineStage::PosesBootstrapped,
            status: StageStatus::Completed,
            inputs: BTreeMap::new(),
            outputs: [("poses".to_string(), 3)].into_iter().collect(),
            elapsed_ms: 1.5,
            message: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"stage\":\"poses_bootstrapped\""));
        assert!(json.contains("\"status\":\"completed\""));
        assert!(json.contains("\"poses\":3"));
    }
}
