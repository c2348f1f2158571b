//! Assigns a pose to every camera.
//!
//! The smallest camera index defines the world frame. Cameras connected to an
//! already-posed camera are chained through two-view geometry; whatever is left
//! is placed on a circle in the reference plane so later stages always see a
//! complete pose set.

use crate::camera::Intrinsics;
use crate::config::SfmConfig;
use crate::features::{matched_points, pair_matches, Features, MatchGraph, TwoViewEstimator};
use crate::geometry::{rotation_about_vertical, Pose};
use crate::pose::{Placement, PoseStore, TwoViewOutcome};
use log::{debug, info, warn};
use nalgebra::Vector3;
use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapSettings {
    pub ransac_threshold: f64,
    pub ransac_confidence: f64,
    /// Correspondences needed to chain a camera beyond the first pair.
    pub min_correspondences: usize,
    /// Base radius when no posed camera lies away from the origin.
    pub fallback_radius: f64,
    pub fallback_radius_scale: f64,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        BootstrapSettings::from(&SfmConfig::default())
    }
}

impl From<&SfmConfig> for BootstrapSettings {
    fn from(config: &SfmConfig) -> Self {
        BootstrapSettings {
            ransac_threshold: config.ransac_threshold,
            ransac_confidence: config.ransac_confidence,
            min_correspondences: config.min_bootstrap_correspondences,
            fallback_radius: config.fallback_radius,
            fallback_radius_scale: config.fallback_radius_scale,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootstrapResult {
    pub poses: PoseStore,
    pub placements: BTreeMap<usize, Placement>,
}

impl BootstrapResult {
    pub fn fallback_cameras(&self) -> Vec<usize> {
        self.placements
            .iter()
            .filter(|(_, p)| p.is_fallback())
            .map(|(&idx, _)| idx)
            .collect()
    }
}

fn match_count(matches: &MatchGraph, a: usize, b: usize) -> usize {
    let key = if a < b { (a, b) } else { (b, a) };
    matches.get(&key).map_or(0, Vec::len)
}

/// Relative pose of `camera` seen from `partner`, with the correspondence count.
fn estimate_relative(
    partner: usize,
    camera: usize,
    features: &BTreeMap<usize, Features>,
    matches: &MatchGraph,
    intrinsics: &Intrinsics,
    estimator: &dyn TwoViewEstimator,
    settings: &BootstrapSettings,
) -> (usize, TwoViewOutcome) {
    let (Some(partner_features), Some(camera_features), Some(pair)) = (
        features.get(&partner),
        features.get(&camera),
        pair_matches(matches, partner, camera),
    ) else {
        return (
            0,
            TwoViewOutcome::InsufficientData {
                available: 0,
                required: 1,
            },
        );
    };

    let (points_partner, points_camera) =
        matched_points(&partner_features.keypoints, &camera_features.keypoints, &pair);
    let outcome = estimator.estimate(
        &points_partner,
        &points_camera,
        intrinsics,
        settings.ransac_threshold,
        settings.ransac_confidence,
    );
    (points_partner.len(), outcome)
}

/// Produces exactly one pose per distinct camera index.
///
/// Estimation failures never abort: a camera that cannot be chained is placed
/// at `fallback_radius_scale ×` the mean centre distance of the geometrically
/// posed cameras, at angle `2π·(index − min)/N` around the vertical axis.
///
/// # Arguments
///
/// * `cameras` - Camera indices to place; duplicates are ignored.
/// * `features` - Keypoints per camera.
/// * `matches` - Pairwise matches keyed by `(i, j)` with `i < j`.
/// * `intrinsics` - Shared pinhole intrinsics.
/// * `estimator` - Relative pose estimator used for chaining.
/// * `settings` - RANSAC and fallback parameters.
///
/// # Returns
///
/// A [`BootstrapResult`] holding a pose and a [`Placement`] for every camera.
pub fn bootstrap_poses(
    cameras: &[usize],
    features: &BTreeMap<usize, Features>,
    matches: &MatchGraph,
    intrinsics: &Intrinsics,
    estimator: &dyn TwoViewEstimator,
    settings: &BootstrapSettings,
) -> BootstrapResult {
    let ordered: Vec<usize> = cameras
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut result = BootstrapResult::default();
    let Some(&reference) = ordered.first() else {
        return result;
    };

    result.poses.insert(reference, Pose::identity());
    result.placements.insert(reference, Placement::Reference);

    let mut geometric = false;
    if let Some(&second) = ordered.get(1) {
        let (correspondences, outcome) = estimate_relative(
            reference, second, features, matches, intrinsics, estimator, settings,
        );
        match outcome {
            TwoViewOutcome::Pose { relative, inliers } => {
                info!(
                    "initial pair ({reference}, {second}): {} of {correspondences} inliers",
                    inliers.len()
                );
                result.poses.insert(second, Pose::identity().then(&relative));
                result.placements.insert(
                    second,
                    Placement::TwoView {
                        partner: reference,
                        correspondences,
                        inliers: inliers.len(),
                    },
                );
                geometric = true;
            }
            TwoViewOutcome::Degenerate(reason) => {
                warn!("initial pair ({reference}, {second}) degenerate: {reason}");
            }
            TwoViewOutcome::InsufficientData { available, required } => {
                warn!(
                    "initial pair ({reference}, {second}) has {available} correspondences, needs {required}"
                );
            }
        }
    }

    if geometric {
        let mut failed = BTreeSet::new();
        loop {
            let mut progressed = false;
            for &camera in &ordered {
                if result.poses.contains_key(&camera) || failed.contains(&camera) {
                    continue;
                }

                // Most correspondences wins; ties go to the smaller index.
                let partner = result
                    .poses
                    .keys()
                    .map(|&posed| (match_count(matches, posed, camera), posed))
                    .filter(|&(count, _)| count >= settings.min_correspondences)
                    .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
                let Some((_, partner)) = partner else {
                    continue;
                };

                let (correspondences, outcome) = estimate_relative(
                    partner, camera, features, matches, intrinsics, estimator, settings,
                );
                match outcome {
                    TwoViewOutcome::Pose { relative, inliers } => {
                        let partner_pose = result.poses[&partner];
                        result.poses.insert(camera, partner_pose.then(&relative));
                        result.placements.insert(
                            camera,
                            Placement::TwoView {
                                partner,
                                correspondences,
                                inliers: inliers.len(),
                            },
                        );
                        debug!("camera {camera} chained from {partner}");
                        progressed = true;
                    }
                    other => {
                        debug!("camera {camera} against {partner}: {other:?}");
                        failed.insert(camera);
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    place_remaining(&ordered, &mut result, settings);
    result
}

fn place_remaining(ordered: &[usize], result: &mut BootstrapResult, settings: &BootstrapSettings) {
    let (Some(&min_index), total) = (ordered.first(), ordered.len()) else {
        return;
    };

    // Computed once, from the geometrically posed cameras only.
    let mean_distance = result.poses.values().map(|p| p.center().norm()).sum::<f64>()
        / result.poses.len() as f64;
    let base = if mean_distance.is_finite() && mean_distance > f64::EPSILON {
        mean_distance
    } else {
        settings.fallback_radius
    };
    let radius = settings.fallback_radius_scale * base;

    for &camera in ordered {
        if result.poses.contains_key(&camera) {
            continue;
        }
        let angle = 2.0 * PI * (camera - min_index) as f64 / total as f64;
        let center = Vector3::new(radius * angle.cos(), radius * angle.sin(), 0.0);
        result
            .poses
            .insert(camera, Pose::from_center(rotation_about_vertical(angle), &center));
        result
            .placements
            .insert(camera, Placement::Fallback { angle, radius });
        warn!("camera {camera} placed on fallback circle (angle {angle:.3}, radius {radius:.3})");
    }
}
