//! Keypoints, descriptor matching and the collaborator traits consumed by the
//! reconstruction stages.
//!
//! Detection, matching, two-view estimation, PnP and triangulation are
//! pluggable: each is a trait here so a pipeline can be driven by any
//! implementation. The crate ships a default for each one:
//! [`HarrisDetector`], [`BruteForceMatcher`], [`EightPointEstimator`],
//! [`DltPnpSolver`] and [`crate::triangulation::DltTriangulator`].

use crate::camera::Intrinsics;
use crate::error::Result;
use crate::geometry::Pose;
use crate::image_io::SfmImage;
use crate::pose::TwoViewOutcome;
use log::debug;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod harris;
pub mod pnp;
pub mod two_view;

pub use harris::HarrisDetector;
pub use pnp::DltPnpSolver;
pub use two_view::EightPointEstimator;

/// Keypoint positions and their descriptors, index-aligned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub keypoints: Vec<Point2<f64>>,
    pub descriptors: Vec<Vec<f32>>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// One descriptor match: keypoint `query_idx` of the first image against
/// keypoint `train_idx` of the second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatch {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: f32,
}

/// Matches per unordered image pair `(i, j)` with `i < j`.
pub type MatchGraph = BTreeMap<(usize, usize), Vec<FeatureMatch>>;

pub trait FeatureDetector {
    fn detect(&self, image: &SfmImage) -> Result<Features>;
}

pub trait DescriptorMatcher {
    /// Returns matches that survive the nearest/second-nearest ratio test.
    fn match_descriptors(
        &self,
        descriptors_a: &[Vec<f32>],
        descriptors_b: &[Vec<f32>],
        ratio_threshold: f32,
    ) -> Vec<FeatureMatch>;
}

/// Relative pose of the second view with respect to the first.
pub trait TwoViewEstimator {
    fn estimate(
        &self,
        points_a: &[Point2<f64>],
        points_b: &[Point2<f64>],
        intrinsics: &Intrinsics,
        ransac_threshold: f64,
        confidence: f64,
    ) -> TwoViewOutcome;
}

/// Absolute pose from 3D-2D correspondences; `None` when no pose can be found.
pub trait PnpSolver {
    fn solve(
        &self,
        points_3d: &[Point3<f64>],
        points_2d: &[Point2<f64>],
        intrinsics: &Intrinsics,
        distortion: &[f64],
    ) -> Option<Pose>;
}

/// Triangulates index-aligned correspondences between two posed views.
///
/// A `None` entry marks a correspondence that could not be triangulated.
pub trait Triangulator {
    fn triangulate(
        &self,
        points_a: &[Point2<f64>],
        points_b: &[Point2<f64>],
        pose_a: &Pose,
        pose_b: &Pose,
        intrinsics: &Intrinsics,
    ) -> Vec<Option<Point3<f64>>>;
}

/// Exhaustive L2 matcher with Lowe's ratio test.
#[derive(Debug, Clone, Copy, Default)]
pub struct BruteForceMatcher;

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl DescriptorMatcher for BruteForceMatcher {
    fn match_descriptors(
        &self,
        descriptors_a: &[Vec<f32>],
        descriptors_b: &[Vec<f32>],
        ratio_threshold: f32,
    ) -> Vec<FeatureMatch> {
        if descriptors_b.len() < 2 {
            return Vec::new();
        }

        let mut matches = Vec::new();
        for (query_idx, query) in descriptors_a.iter().enumerate() {
            let mut best = (usize::MAX, f32::INFINITY);
            let mut second = f32::INFINITY;
            for (train_idx, train) in descriptors_b.iter().enumerate() {
                let d = squared_distance(query, train);
                if d < best.1 {
                    second = best.1;
                    best = (train_idx, d);
                } else if d < second {
                    second = d;
                }
            }

            let (best_idx, best_sq) = best;
            let best_distance = best_sq.sqrt();
            if best_idx != usize::MAX && best_distance < ratio_threshold * second.sqrt() {
                matches.push(FeatureMatch {
                    query_idx,
                    train_idx: best_idx,
                    distance: best_distance,
                });
            }
        }
        matches
    }
}

/// Matches every unordered image pair and keeps pairs with at least
/// `min_matches` matches.
pub fn match_all_pairs(
    features: &BTreeMap<usize, Features>,
    matcher: &dyn DescriptorMatcher,
    ratio_threshold: f32,
    min_matches: usize,
) -> MatchGraph {
    let indices: Vec<usize> = features.keys().copied().collect();
    let mut graph = MatchGraph::new();

    for (pos, &i) in indices.iter().enumerate() {
        for &j in &indices[pos + 1..] {
            let matches = matcher.match_descriptors(
                &features[&i].descriptors,
                &features[&j].descriptors,
                ratio_threshold,
            );
            debug!("pair ({i}, {j}): {} matches", matches.len());
            if matches.len() >= min_matches {
                graph.insert((i, j), matches);
            }
        }
    }
    graph
}

/// Pixel coordinates of both sides of each match, skipping stale indices.
pub fn matched_points(
    keypoints_a: &[Point2<f64>],
    keypoints_b: &[Point2<f64>],
    matches: &[FeatureMatch],
) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
    matches
        .iter()
        .filter_map(|m| {
            let a = keypoints_a.get(m.query_idx)?;
            let b = keypoints_b.get(m.train_idx)?;
            Some((*a, *b))
        })
        .unzip()
}

/// Matches between two cameras regardless of the order they are asked for.
///
/// The graph stores `(i, j)` with `i < j`; asking for `(j, i)` swaps the sides.
pub fn pair_matches(graph: &MatchGraph, a: usize, b: usize) -> Option<Vec<FeatureMatch>> {
    if a < b {
        graph.get(&(a, b)).cloned()
    } else {
        graph.get(&(b, a)).map(|matches| {
            matches
                .iter()
                .map(|m| FeatureMatch {
                    query_idx: m.train_idx,
                    train_idx: m.query_idx,
                    distance: m.distance,
                })
                .collect()
        })
    }
}
