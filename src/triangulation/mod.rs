//! Two-view triangulation of posed camera pairs.
//!
//! Every posed pair with matches is triangulated independently; each point
//! that survives the cheirality filter becomes one entry of the
//! [`CorrespondenceTable`] carrying both of its observations.

use crate::camera::Intrinsics;
use crate::config::SfmConfig;
use crate::features::{DescriptorMatcher, Features, FeatureMatch, MatchGraph, Triangulator};
use crate::geometry::Pose;
use crate::observation::CorrespondenceTable;
use crate::pose::PoseStore;
use log::{debug, info};
use nalgebra::{Matrix3x4, Matrix4, Point2, Point3};
use std::collections::BTreeMap;

/// `P = K·[R | t]`.
pub fn projection_matrix(intrinsics: &Intrinsics, pose: &Pose) -> Matrix3x4<f64> {
    let mut rt = Matrix3x4::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(&pose.rotation);
    rt.set_column(3, &pose.translation);
    intrinsics.matrix() * rt
}

/// Linear triangulation of one correspondence.
///
/// Returns `None` for points at infinity or a failed decomposition.
pub fn triangulate_dlt(
    p1: &Point2<f64>,
    p2: &Point2<f64>,
    proj1: &Matrix3x4<f64>,
    proj2: &Matrix3x4<f64>,
) -> Option<Point3<f64>> {
    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = p1.x * proj1[(2, j)] - proj1[(0, j)];
        a[(1, j)] = p1.y * proj1[(2, j)] - proj1[(1, j)];
        a[(2, j)] = p2.x * proj2[(2, j)] - proj2[(0, j)];
        a[(3, j)] = p2.y * proj2[(2, j)] - proj2[(1, j)];
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (null_row, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|l, r| l.1.total_cmp(r.1))?;
    let h = v_t.row(null_row);

    let w = h[3];
    if w.abs() < 1e-12 {
        return None;
    }
    let point = Point3::new(h[0] / w, h[1] / w, h[2] / w);
    point.coords.iter().all(|v| v.is_finite()).then_some(point)
}

/// Default [`Triangulator`]: DLT on the pixel projection matrices.
#[derive(Debug, Clone, Copy, Default)]
pub struct DltTriangulator;

impl Triangulator for DltTriangulator {
    fn triangulate(
        &self,
        points_a: &[Point2<f64>],
        points_b: &[Point2<f64>],
        pose_a: &Pose,
        pose_b: &Pose,
        intrinsics: &Intrinsics,
    ) -> Vec<Option<Point3<f64>>> {
        let proj_a = projection_matrix(intrinsics, pose_a);
        let proj_b = projection_matrix(intrinsics, pose_b);
        points_a
            .iter()
            .zip(points_b)
            .map(|(a, b)| triangulate_dlt(a, b, &proj_a, &proj_b))
            .collect()
    }
}

/// Strict cheirality: positive depth under both cameras.
pub fn check_cheirality(point: &Point3<f64>, pose_a: &Pose, pose_b: &Pose) -> bool {
    pose_a.transform_point(&point.coords).z > 0.0 && pose_b.transform_point(&point.coords).z > 0.0
}

/// Relaxed cheirality: depth above `min_depth` under the first camera and
/// world distance below `max_distance`.
pub fn check_cheirality_relaxed(
    point: &Point3<f64>,
    pose_a: &Pose,
    min_depth: f64,
    max_distance: f64,
) -> bool {
    pose_a.transform_point(&point.coords).z > min_depth && point.coords.norm() < max_distance
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangulationSettings {
    pub relaxed_cheirality: bool,
    pub min_depth: f64,
    pub max_point_distance: f64,
}

impl Default for TriangulationSettings {
    fn default() -> Self {
        TriangulationSettings::from(&SfmConfig::default())
    }
}

impl From<&SfmConfig> for TriangulationSettings {
    fn from(config: &SfmConfig) -> Self {
        TriangulationSettings {
            relaxed_cheirality: config.relaxed_cheirality,
            min_depth: config.cheirality_min_depth,
            max_point_distance: config.max_point_distance,
        }
    }
}

impl TriangulationSettings {
    fn accepts(&self, point: &Point3<f64>, pose_a: &Pose, pose_b: &Pose) -> bool {
        if self.relaxed_cheirality {
            check_cheirality_relaxed(point, pose_a, self.min_depth, self.max_point_distance)
        } else {
            check_cheirality(point, pose_a, pose_b)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriangulationOutput {
    pub points: Vec<Point3<f64>>,
    pub table: CorrespondenceTable,
    /// `(camera, keypoint)` → first point created from that keypoint.
    pub keypoint_points: BTreeMap<(usize, usize), usize>,
}

impl TriangulationOutput {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Re-matches posed pairs that have no entry in `existing`, with looser limits.
pub fn find_additional_matches(
    posed: &[usize],
    features: &BTreeMap<usize, Features>,
    existing: &MatchGraph,
    matcher: &dyn DescriptorMatcher,
    ratio_threshold: f32,
    min_matches: usize,
) -> MatchGraph {
    let mut additional = MatchGraph::new();
    for (pos, &i) in posed.iter().enumerate() {
        for &j in &posed[pos + 1..] {
            let key = if i < j { (i, j) } else { (j, i) };
            if existing.contains_key(&key) {
                continue;
            }
            let (Some(fa), Some(fb)) = (features.get(&key.0), features.get(&key.1)) else {
                continue;
            };
            let matches = matcher.match_descriptors(&fa.descriptors, &fb.descriptors, ratio_threshold);
            if matches.len() >= min_matches {
                debug!("additional pair {key:?}: {} matches", matches.len());
                additional.insert(key, matches);
            }
        }
    }
    additional
}

/// Triangulates every pair of `matches` whose cameras are both in `poses`.
pub fn triangulate_posed_pairs(
    poses: &PoseStore,
    features: &BTreeMap<usize, Features>,
    matches: &MatchGraph,
    intrinsics: &Intrinsics,
    triangulator: &dyn Triangulator,
    settings: &TriangulationSettings,
) -> TriangulationOutput {
    let mut output = TriangulationOutput::default();

    for (&(a, b), pair) in matches {
        let (Some(pose_a), Some(pose_b)) = (poses.get(&a), poses.get(&b)) else {
            continue;
        };
        let (Some(fa), Some(fb)) = (features.get(&a), features.get(&b)) else {
            continue;
        };

        let usable: Vec<(&FeatureMatch, Point2<f64>, Point2<f64>)> = pair
            .iter()
            .filter_map(|m| {
                let pa = fa.keypoints.get(m.query_idx)?;
                let pb = fb.keypoints.get(m.train_idx)?;
                Some((m, *pa, *pb))
            })
            .collect();
        let points_a: Vec<Point2<f64>> = usable.iter().map(|u| u.1).collect();
        let points_b: Vec<Point2<f64>> = usable.iter().map(|u| u.2).collect();

        let triangulated = triangulator.triangulate(&points_a, &points_b, pose_a, pose_b, intrinsics);
        let mut kept = 0;
        for ((m, pa, pb), point) in usable.iter().zip(triangulated) {
            let Some(point) = point else {
                continue;
            };
            if !settings.accepts(&point, pose_a, pose_b) {
                continue;
            }
            let index = output.table.add_point(&[(a, *pa), (b, *pb)]);
            output.points.push(point);
            output.keypoint_points.entry((a, m.query_idx)).or_insert(index);
            output.keypoint_points.entry((b, m.train_idx)).or_insert(index);
            kept += 1;
        }
        debug!("pair ({a}, {b}): kept {kept} of {} points", usable.len());
    }

    info!(
        "triangulated {} points with {} observations",
        output.points.len(),
        output.table.observation_count()
    );
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rotation_about_vertical;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
        }
    }

    fn project(k: &Intrinsics, pose: &Pose, world: &Vector3<f64>) -> Point2<f64> {
        let c = pose.transform_point(world);
        Point2::new(k.fx * c.x / c.z + k.cx, k.fy * c.y / c.z + k.cy)
    }

    struct FixedTriangulator(Vec<Option<Point3<f64>>>);

    impl Triangulator for FixedTriangulator {
        fn triangulate(
            &self,
            _points_a: &[Point2<f64>],
            _points_b: &[Point2<f64>],
            _pose_a: &Pose,
            _pose_b: &Pose,
            _intrinsics: &Intrinsics,
        ) -> Vec<Option<Point3<f64>>> {
            self.0.clone()
        }
    }

    fn two_camera_setup(n: usize) -> (PoseStore, BTreeMap<usize, Features>, MatchGraph) {
        let mut poses = PoseStore::new();
        poses.insert(0, Pose::identity());
        poses.insert(1, Pose::new(rotation_about_vertical(0.0), Vector3::new(-1.0, 0.0, 0.0)));

        let mut features = BTreeMap::new();
        for c in 0..2 {
            features.insert(
                c,
                Features {
                    keypoints: (0..n).map(|i| Point2::new(100.0 + i as f64, 200.0)).collect(),
                    descriptors: vec![vec![0.0]; n],
                },
            );
        }
        let mut matches = MatchGraph::new();
        matches.insert(
            (0, 1),
            (0..n)
                .map(|i| FeatureMatch {
                    query_idx: i,
                    train_idx: i,
                    distance: 0.0,
                })
                .collect(),
        );
        (poses, features, matches)
    }

    #[test]
    fn test_dlt_recovers_point() {
        let k = intrinsics();
        let pose_a = Pose::identity();
        let pose_b = Pose::new(rotation_about_vertical(0.1), Vector3::new(-1.0, 0.2, 0.1));
        let world = Vector3::new(0.3, -0.4, 6.0);

        let result = DltTriangulator.triangulate(
            &[project(&k, &pose_a, &world)],
            &[project(&k, &pose_b, &world)],
            &pose_a,
            &pose_b,
            &k,
        );
        assert_relative_eq!(result[0].unwrap().coords, world, epsilon = 1e-8);
    }

    #[test]
    fn test_relaxed_cheirality_keeps_one_of_two() {
        let (poses, features, matches) = two_camera_setup(2);
        let triangulator = FixedTriangulator(vec![
            Some(Point3::new(0.0, 0.0, 5.0)),
            Some(Point3::new(0.0, 0.0, -5.0)),
        ]);

        let output = triangulate_posed_pairs(
            &poses,
            &features,
            &matches,
            &intrinsics(),
            &triangulator,
            &TriangulationSettings::default(),
        );

        assert_eq!(output.points, vec![Point3::new(0.0, 0.0, 5.0)]);
        assert_eq!(output.table.point_count(), 1);
        assert_eq!(output.table.track(0).len(), 2);
        assert_eq!(output.keypoint_points.get(&(1, 0)), Some(&0));
        assert!(output.keypoint_points.get(&(0, 1)).is_none());
    }

    #[test]
    fn test_relaxed_limits() {
        let pose = Pose::identity();
        assert!(check_cheirality_relaxed(&Point3::new(0.0, 0.0, -0.05), &pose, -0.1, 1000.0));
        assert!(!check_cheirality_relaxed(&Point3::new(0.0, 0.0, -0.2), &pose, -0.1, 1000.0));
        assert!(!check_cheirality_relaxed(&Point3::new(0.0, 0.0, 2000.0), &pose, -0.1, 1000.0));

        let behind_second = Pose::new(rotation_about_vertical(0.0), Vector3::new(0.0, 0.0, -10.0));
        assert!(!check_cheirality(&Point3::new(0.0, 0.0, 5.0), &pose, &behind_second));
    }

    #[test]
    fn test_unposed_pairs_are_skipped() {
        let (mut poses, features, matches) = two_camera_setup(4);
        poses.remove(&1);
        let output = triangulate_posed_pairs(
            &poses,
            &features,
            &matches,
            &intrinsics(),
            &DltTriangulator,
            &TriangulationSettings::default(),
        );
        assert!(output.is_empty());
    }

    #[test]
    fn test_projection_matrix() {
        let k = intrinsics();
        let pose = Pose::new(rotation_about_vertical(0.3), Vector3::new(0.5, -0.1, 2.0));
        let world = Vector3::new(1.0, 2.0, 3.0);
        let p = projection_matrix(&k, &pose) * world.push(1.0);
        let expected = project(&k, &pose, &world);
        assert_relative_eq!(p.x / p.z, expected.x, epsilon = 1e-9);
        assert_relative_eq!(p.y / p.z, expected.y, epsilon = 1e-9);
    }
}
