//! Point↔pixel observations and the synthesizer that sizes them for bundle
//! adjustment.
//!
//! The [`CorrespondenceTable`] is filled during triangulation: one track per 3D
//! point listing every `(camera, pixel)` that supports it. The
//! [`ObservationSynthesizer`] turns it into the flat observation list handed to
//! the optimizer, padding or thinning it so the residual count comfortably
//! exceeds the parameter count.

use crate::config::SfmConfig;
use crate::features::{Features, MatchGraph};
use log::{debug, info};
use nalgebra::Point2;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Camera `camera` sees 3D point `point` at `pixel`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub camera: usize,
    pub point: usize,
    pub pixel: Point2<f64>,
}

impl Observation {
    pub fn new(camera: usize, point: usize, pixel: Point2<f64>) -> Self {
        Observation {
            camera,
            point,
            pixel,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.pixel.x.is_finite() && self.pixel.y.is_finite()
    }
}

/// Dense per-point tracks, indexed `0..point_count`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrespondenceTable {
    tracks: Vec<Vec<(usize, Point2<f64>)>>,
}

impl CorrespondenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new point supported by `observations` and returns its index.
    ///
    /// Non-finite pixels are dropped.
    pub fn add_point(&mut self, observations: &[(usize, Point2<f64>)]) -> usize {
        self.tracks.push(
            observations
                .iter()
                .filter(|(_, p)| p.x.is_finite() && p.y.is_finite())
                .copied()
                .collect(),
        );
        self.tracks.len() - 1
    }

    pub fn point_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.iter().all(Vec::is_empty)
    }

    pub fn track(&self, point: usize) -> &[(usize, Point2<f64>)] {
        self.tracks.get(point).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn observation_count(&self) -> usize {
        self.tracks.iter().map(Vec::len).sum()
    }

    /// All observations in point order.
    pub fn observations(&self) -> Vec<Observation> {
        self.tracks
            .iter()
            .enumerate()
            .flat_map(|(point, track)| {
                track
                    .iter()
                    .map(move |&(camera, pixel)| Observation::new(camera, point, pixel))
            })
            .collect()
    }

    /// Per-camera pixel of every point, `None` where the camera does not see it.
    ///
    /// A camera observing the same point twice keeps its first pixel.
    pub fn camera_views(&self) -> BTreeMap<usize, Vec<Option<Point2<f64>>>> {
        let mut views: BTreeMap<usize, Vec<Option<Point2<f64>>>> = BTreeMap::new();
        for (point, track) in self.tracks.iter().enumerate() {
            for &(camera, pixel) in track {
                let view = views
                    .entry(camera)
                    .or_insert_with(|| vec![None; self.tracks.len()]);
                view[point].get_or_insert(pixel);
            }
        }
        views
    }
}

/// Reinterprets every two-view match as its own synthetic 3D point.
///
/// Match `k` (counted across pairs in key order) yields two observations of
/// point `k`; points at or beyond `point_count` are dropped.
pub fn observations_from_matches(
    matches: &MatchGraph,
    features: &BTreeMap<usize, Features>,
    point_count: usize,
) -> Vec<Observation> {
    let mut observations = Vec::new();
    let mut point = 0;
    for (&(a, b), pair) in matches {
        let (Some(fa), Some(fb)) = (features.get(&a), features.get(&b)) else {
            continue;
        };
        for m in pair {
            if point >= point_count {
                return observations;
            }
            let pa = fa.keypoints.get(m.query_idx);
            let pb = fb.keypoints.get(m.train_idx);
            if let (Some(pa), Some(pb)) = (pa, pb) {
                observations.push(Observation::new(a, point, *pa));
                observations.push(Observation::new(b, point, *pb));
            }
            point += 1;
        }
    }
    observations
}

/// `⌊(3·points + 6·cameras) / 2⌋ + margin`.
pub fn required_observations(point_count: usize, camera_count: usize, margin: usize) -> usize {
    (3 * point_count + 6 * camera_count) / 2 + margin
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisSettings {
    pub margin: usize,
    pub seed: u64,
    pub mined_per_camera: usize,
    pub placeholder_per_camera: usize,
    pub placeholders: bool,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        SynthesisSettings::from(&SfmConfig::default())
    }
}

impl From<&SfmConfig> for SynthesisSettings {
    fn from(config: &SfmConfig) -> Self {
        SynthesisSettings {
            margin: config.observation_margin,
            seed: config.observation_seed,
            mined_per_camera: config.mined_observations_per_camera,
            placeholder_per_camera: config.placeholder_observations_per_camera,
            placeholders: config.placeholder_observations,
        }
    }
}

/// Everything the synthesizer may draw observations from.
#[derive(Debug, Clone, Copy)]
pub struct ObservationSources<'a> {
    /// Triangulation-time capture, or observations rebuilt from matches.
    pub primary: &'a [Observation],
    /// Per-camera pixel tables indexed by point.
    pub camera_views: &'a BTreeMap<usize, Vec<Option<Point2<f64>>>>,
    /// Raw detections per camera, used only for placeholder padding.
    pub detections: &'a BTreeMap<usize, Vec<Point2<f64>>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ObservationSynthesizer {
    settings: SynthesisSettings,
}

fn subsample(observations: Vec<Observation>, count: usize, seed: u64) -> Vec<Observation> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut picked = sample(&mut rng, observations.len(), count).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| observations[i]).collect()
}

impl ObservationSynthesizer {
    pub fn new(settings: SynthesisSettings) -> Self {
        ObservationSynthesizer { settings }
    }

    /// Builds the observation list for `point_count` points and `cameras`.
    ///
    /// Observations referencing unknown cameras, out-of-range points or
    /// non-finite pixels are dropped first. When any source yields at least
    /// one observation the result holds between `required` and `2 × required`
    /// entries. All sampling is seeded, so identical inputs give identical
    /// output.
    ///
    /// # Arguments
    ///
    /// * `sources` - Primary observations, per-camera pixel tables and raw
    ///   detections, tried in that order.
    /// * `point_count` - Number of 3D points in the reconstruction.
    /// * `cameras` - Posed camera indices.
    ///
    /// # Returns
    ///
    /// The observation list, empty only when every source is empty.
    pub fn synthesize(
        &self,
        sources: ObservationSources<'_>,
        point_count: usize,
        cameras: &[usize],
    ) -> Vec<Observation> {
        let settings = &self.settings;
        let camera_set: BTreeSet<usize> = cameras.iter().copied().collect();
        let is_valid = |o: &Observation| {
            o.point < point_count && camera_set.contains(&o.camera) && o.is_finite()
        };
        let required = required_observations(point_count, camera_set.len(), settings.margin);

        let mut observations: Vec<Observation> =
            sources.primary.iter().copied().filter(|o| is_valid(o)).collect();
        let initial = observations.len();

        if initial > 2 * required {
            info!("subsampling {initial} observations to {}", 2 * required);
            return subsample(observations, 2 * required, settings.seed);
        }
        if initial >= required {
            return observations;
        }

        // Resample the existing observations with replacement.
        if !observations.is_empty() {
            let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
            let existing = observations.len();
            while observations.len() < required {
                let pick = observations[rng.gen_range(0..existing)];
                observations.push(pick);
            }
        }

        // Mine per-camera pixel tables.
        for (&camera, view) in sources.camera_views {
            if observations.len() >= required {
                break;
            }
            if !camera_set.contains(&camera) {
                continue;
            }
            let valid: Vec<(usize, Point2<f64>)> = view
                .iter()
                .enumerate()
                .take(point_count)
                .filter_map(|(point, pixel)| pixel.map(|p| (point, p)))
                .filter(|(_, p)| p.x.is_finite() && p.y.is_finite())
                .collect();
            if valid.is_empty() {
                continue;
            }
            let mut rng = ChaCha8Rng::seed_from_u64(settings.seed + camera as u64);
            let take = settings.mined_per_camera.min(valid.len());
            for _ in 0..take {
                let (point, pixel) = valid[rng.gen_range(0..valid.len())];
                observations.push(Observation::new(camera, point, pixel));
            }
            debug!("mined {take} observations from camera {camera}");
        }

        // Diagnostic padding: detections tied to point 0.
        if settings.placeholders && point_count > 0 {
            for (&camera, detections) in sources.detections {
                if observations.len() >= required {
                    break;
                }
                if !camera_set.contains(&camera) || detections.is_empty() {
                    continue;
                }
                let mut rng = ChaCha8Rng::seed_from_u64(settings.seed + camera as u64 + 1000);
                let take = settings.placeholder_per_camera.min(detections.len());
                for i in sample(&mut rng, detections.len(), take).into_vec() {
                    let observation = Observation::new(camera, 0, detections[i]);
                    if observation.is_finite() {
                        observations.push(observation);
                    }
                }
                debug!("added {take} placeholder observations for camera {camera}");
            }
        }

        if observations.is_empty() {
            return observations;
        }

        // Mining may stop short on sparse tables; top up from what exists.
        if observations.len() < required {
            let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
            let existing = observations.len();
            while observations.len() < required {
                let pick = observations[rng.gen_range(0..existing)];
                observations.push(pick);
            }
        }

        if observations.len() > required {
            observations = subsample(observations, required, settings.seed);
        }
        info!(
            "padded observations from {initial} to {} (required {required})",
            observations.len()
        );
        observations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureMatch;

    fn table(points: usize, cameras: usize) -> CorrespondenceTable {
        let mut table = CorrespondenceTable::new();
        for p in 0..points {
            let track: Vec<(usize, Point2<f64>)> = (0..cameras)
                .map(|c| (c, Point2::new(p as f64, c as f64)))
                .collect();
            table.add_point(&track);
        }
        table
    }

    fn synthesizer() -> ObservationSynthesizer {
        ObservationSynthesizer::default()
    }

    #[test]
    fn test_required_observations() {
        assert_eq!(required_observations(10, 3, 1000), (30 + 18) / 2 + 1000);
        assert_eq!(required_observations(3, 1, 0), 7);
    }

    #[test]
    fn test_camera_views_use_none_sentinel() {
        let mut table = CorrespondenceTable::new();
        table.add_point(&[(0, Point2::new(1.0, 2.0)), (2, Point2::new(3.0, 4.0))]);
        table.add_point(&[(2, Point2::new(5.0, 6.0)), (1, Point2::new(f64::NAN, 0.0))]);

        let views = table.camera_views();
        assert_eq!(views[&0], vec![Some(Point2::new(1.0, 2.0)), None]);
        assert_eq!(
            views[&2],
            vec![Some(Point2::new(3.0, 4.0)), Some(Point2::new(5.0, 6.0))]
        );
        assert!(!views.contains_key(&1));
        assert_eq!(table.observation_count(), 3);
    }

    #[test]
    fn test_padding_reaches_required() {
        let table = table(20, 3);
        let observations = table.observations();
        let views = table.camera_views();
        let detections = BTreeMap::new();
        let sources = ObservationSources {
            primary: &observations,
            camera_views: &views,
            detections: &detections,
        };

        let result = synthesizer().synthesize(sources, 20, &[0, 1, 2]);
        let required = required_observations(20, 3, 1000);
        assert_eq!(result.len(), required);
        assert!(result.iter().all(|o| o.point < 20 && o.camera < 3));

        // Deterministic across runs.
        assert_eq!(synthesizer().synthesize(sources, 20, &[0, 1, 2]), result);
    }

    #[test]
    fn test_large_sets_are_capped() {
        let settings = SynthesisSettings {
            margin: 10,
            ..Default::default()
        };
        let table = table(200, 4);
        let observations = table.observations();
        let views = table.camera_views();
        let detections = BTreeMap::new();
        let sources = ObservationSources {
            primary: &observations,
            camera_views: &views,
            detections: &detections,
        };

        let required = required_observations(200, 4, 10);
        assert!(observations.len() > 2 * required);
        let result = ObservationSynthesizer::new(settings).synthesize(sources, 200, &[0, 1, 2, 3]);
        assert_eq!(result.len(), 2 * required);
    }

    #[test]
    fn test_in_range_sets_pass_through() {
        let settings = SynthesisSettings {
            margin: 0,
            ..Default::default()
        };
        let table = table(10, 3);
        let observations = table.observations();
        let views = table.camera_views();
        let detections = BTreeMap::new();
        let sources = ObservationSources {
            primary: &observations,
            camera_views: &views,
            detections: &detections,
        };
        // required = (30 + 18) / 2 = 24 <= 30 <= 48
        let result = ObservationSynthesizer::new(settings).synthesize(sources, 10, &[0, 1, 2]);
        assert_eq!(result, observations);
    }

    #[test]
    fn test_invalid_references_are_dropped() {
        let settings = SynthesisSettings {
            margin: 0,
            ..Default::default()
        };
        let primary = vec![
            Observation::new(0, 0, Point2::new(1.0, 1.0)),
            Observation::new(7, 0, Point2::new(1.0, 1.0)),
            Observation::new(1, 5, Point2::new(1.0, 1.0)),
            Observation::new(1, 0, Point2::new(f64::NAN, 1.0)),
        ];
        let views = BTreeMap::new();
        let detections = BTreeMap::new();
        let sources = ObservationSources {
            primary: &primary,
            camera_views: &views,
            detections: &detections,
        };
        let result = ObservationSynthesizer::new(settings).synthesize(sources, 1, &[0, 1]);
        let required = required_observations(1, 2, 0);
        assert_eq!(result.len(), required);
        assert!(result.iter().all(|o| *o == primary[0]));
    }

    #[test]
    fn test_mining_fills_empty_primary() {
        let settings = SynthesisSettings {
            margin: 0,
            mined_per_camera: 4,
            ..Default::default()
        };
        let table = table(6, 2);
        let views = table.camera_views();
        let detections = BTreeMap::new();
        let sources = ObservationSources {
            primary: &[],
            camera_views: &views,
            detections: &detections,
        };
        // required = (18 + 12) / 2 = 15; mining yields 8, topped up to 15.
        let result = ObservationSynthesizer::new(settings).synthesize(sources, 6, &[0, 1]);
        assert_eq!(result.len(), 15);
        for o in &result {
            assert_eq!(o.pixel, Point2::new(o.point as f64, o.camera as f64));
        }
    }

    #[test]
    fn test_mining_overshoot_is_subsampled() {
        let settings = SynthesisSettings {
            margin: 0,
            ..Default::default()
        };
        let table = table(20, 2);
        let views = table.camera_views();
        let detections = BTreeMap::new();
        let sources = ObservationSources {
            primary: &[],
            camera_views: &views,
            detections: &detections,
        };
        // required = (60 + 12) / 2 = 36; mining both cameras yields 40.
        let synthesizer = ObservationSynthesizer::new(settings);
        let result = synthesizer.synthesize(sources, 20, &[0, 1]);
        assert_eq!(result.len(), 36);
        assert!(result.iter().any(|o| o.camera == 1));
        for o in &result {
            assert_eq!(o.pixel, Point2::new(o.point as f64, o.camera as f64));
        }

        assert_eq!(synthesizer.synthesize(sources, 20, &[0, 1]), result);
    }

    #[test]
    fn test_placeholders_only_when_enabled() {
        let detections: BTreeMap<usize, Vec<Point2<f64>>> = (0..2)
            .map(|c| (c, (0..50).map(|i| Point2::new(i as f64, c as f64)).collect()))
            .collect();
        let views = BTreeMap::new();
        let sources = ObservationSources {
            primary: &[],
            camera_views: &views,
            detections: &detections,
        };

        let disabled = ObservationSynthesizer::new(SynthesisSettings {
            margin: 10,
            ..Default::default()
        });
        assert!(disabled.synthesize(sources, 3, &[0, 1]).is_empty());

        let enabled = ObservationSynthesizer::new(SynthesisSettings {
            margin: 10,
            placeholders: true,
            ..Default::default()
        });
        let result = enabled.synthesize(sources, 3, &[0, 1]);
        assert_eq!(result.len(), required_observations(3, 2, 10));
        assert!(result.iter().all(|o| o.point == 0));
    }

    #[test]
    fn test_observations_from_matches() {
        let mut features = BTreeMap::new();
        for c in 0..2 {
            features.insert(
                c,
                Features {
                    keypoints: (0..3).map(|i| Point2::new(i as f64, c as f64)).collect(),
                    descriptors: vec![vec![0.0]; 3],
                },
            );
        }
        let mut graph = MatchGraph::new();
        graph.insert(
            (0, 1),
            (0..3)
                .map(|i| FeatureMatch {
                    query_idx: i,
                    train_idx: 2 - i,
                    distance: 0.0,
                })
                .collect(),
        );

        let observations = observations_from_matches(&graph, &features, 2);
        assert_eq!(observations.len(), 4);
        assert_eq!(observations[1], Observation::new(1, 0, Point2::new(2.0, 1.0)));
        assert_eq!(observations[3].point, 1);
    }
}
