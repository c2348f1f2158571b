//! Point colouring and the writers for reconstruction results.
//!
//! Outputs: ASCII and binary little-endian PLY point clouds, a cameras JSON
//! (`{index: {R, t, K}}`), the shared camera as calibration YAML, a metadata
//! JSON, and the correspondence table as CSV.

use crate::camera::{CameraModel, Intrinsics, PinholeModel};
use crate::error::Result;
use crate::image_io::SfmImage;
use crate::observation::CorrespondenceTable;
use crate::pose::PoseStore;
use image::GenericImageView;
use log::info;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_COLOR: [u8; 3] = [128, 128, 128];

/// Colour of each point from the first camera, in ascending index order, whose
/// observation of it falls inside that camera's image.
pub fn color_points(
    point_count: usize,
    table: &CorrespondenceTable,
    images: &BTreeMap<usize, &SfmImage>,
) -> Vec<[u8; 3]> {
    (0..point_count)
        .map(|point| {
            let mut track = table.track(point).to_vec();
            track.sort_by_key(|(camera, _)| *camera);
            track
                .iter()
                .find_map(|(camera, pixel)| {
                    let image = &images.get(camera)?.image;
                    let (x, y) = (pixel.x.floor(), pixel.y.floor());
                    if x < 0.0 || y < 0.0 || x >= image.width() as f64 || y >= image.height() as f64 {
                        return None;
                    }
                    let rgba = image.get_pixel(x as u32, y as u32);
                    Some([rgba[0], rgba[1], rgba[2]])
                })
                .unwrap_or(DEFAULT_COLOR)
        })
        .collect()
}

fn ply_header(format: &str, vertex_count: usize) -> String {
    format!(
        "ply\nformat {format} 1.0\nelement vertex {vertex_count}\n\
         property float x\nproperty float y\nproperty float z\n\
         property uchar red\nproperty uchar green\nproperty uchar blue\nend_header\n"
    )
}

/// Colours default to grey when `colors` is shorter than `points`.
pub fn write_ply_ascii<P: AsRef<Path>>(
    path: P,
    points: &[Point3<f64>],
    colors: &[[u8; 3]],
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(ply_header("ascii", points.len()).as_bytes())?;
    for (i, point) in points.iter().enumerate() {
        let [r, g, b] = colors.get(i).copied().unwrap_or(DEFAULT_COLOR);
        writeln!(
            writer,
            "{:.6} {:.6} {:.6} {r} {g} {b}",
            point.x, point.y, point.z
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// `float32 x y z` followed by `uchar r g b` per vertex, little-endian.
pub fn write_ply_binary<P: AsRef<Path>>(
    path: P,
    points: &[Point3<f64>],
    colors: &[[u8; 3]],
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(ply_header("binary_little_endian", points.len()).as_bytes())?;
    for (i, point) in points.iter().enumerate() {
        for coordinate in [point.x, point.y, point.z] {
            writer.write_all(&(coordinate as f32).to_le_bytes())?;
        }
        writer.write_all(&colors.get(i).copied().unwrap_or(DEFAULT_COLOR))?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    #[serde(rename = "R")]
    pub rotation: [[f64; 3]; 3],
    pub t: [f64; 3],
    #[serde(rename = "K")]
    pub k: [[f64; 3]; 3],
}

fn rows(m: &nalgebra::Matrix3<f64>) -> [[f64; 3]; 3] {
    [
        [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
        [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
        [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
    ]
}

pub fn camera_records(poses: &PoseStore, intrinsics: &Intrinsics) -> BTreeMap<String, CameraRecord> {
    let k = rows(&intrinsics.matrix());
    poses
        .iter()
        .map(|(index, pose)| {
            (
                index.to_string(),
                CameraRecord {
                    rotation: rows(&pose.rotation),
                    t: [pose.translation.x, pose.translation.y, pose.translation.z],
                    k,
                },
            )
        })
        .collect()
}

pub fn write_cameras_json<P: AsRef<Path>>(
    path: P,
    poses: &PoseStore,
    intrinsics: &Intrinsics,
) -> Result<()> {
    let json = serde_json::to_string_pretty(&camera_records(poses, intrinsics))?;
    fs::write(path, json)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionMetadata {
    pub num_points: usize,
    pub num_cameras: usize,
    pub num_observations: usize,
    pub intrinsics: Intrinsics,
    pub bundle_adjusted: bool,
}

pub fn write_metadata_json<P: AsRef<Path>>(path: P, metadata: &ReconstructionMetadata) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(metadata)?)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct CorrespondenceRow {
    point: usize,
    camera: usize,
    u: f64,
    v: f64,
}

pub fn write_correspondences_csv<P: AsRef<Path>>(
    path: P,
    table: &CorrespondenceTable,
) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for observation in table.observations() {
        writer.serialize(CorrespondenceRow {
            point: observation.point,
            camera: observation.camera,
            u: observation.pixel.x,
            v: observation.pixel.y,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Everything the exporter writes for one reconstruction.
pub struct ExportBundle<'a> {
    pub points: &'a [Point3<f64>],
    pub colors: &'a [[u8; 3]],
    pub poses: &'a PoseStore,
    pub table: &'a CorrespondenceTable,
    pub camera: &'a PinholeModel,
    pub bundle_adjusted: bool,
}

/// Writes every output under `output_dir` as `<base>*.{ply,json,csv}` and
/// returns the written paths.
pub fn export_reconstruction<P: AsRef<Path>>(
    output_dir: P,
    base_filename: &str,
    bundle: &ExportBundle<'_>,
) -> Result<Vec<PathBuf>> {
    let dir = output_dir.as_ref();
    fs::create_dir_all(dir)?;

    let ascii = dir.join(format!("{base_filename}.ply"));
    let binary = dir.join(format!("{base_filename}_binary.ply"));
    let cameras = dir.join(format!("{base_filename}_cameras.json"));
    let calibration = dir.join(format!("{base_filename}_camera.yaml"));
    let metadata = dir.join(format!("{base_filename}_metadata.json"));
    let correspondences = dir.join(format!("{base_filename}_correspondences.csv"));

    write_ply_ascii(&ascii, bundle.points, bundle.colors)?;
    write_ply_binary(&binary, bundle.points, bundle.colors)?;
    let intrinsics = &bundle.camera.intrinsics;
    write_cameras_json(&cameras, bundle.poses, intrinsics)?;
    bundle.camera.save_to_yaml(&calibration.to_string_lossy())?;
    write_metadata_json(
        &metadata,
        &ReconstructionMetadata {
            num_points: bundle.points.len(),
            num_cameras: bundle.poses.len(),
            num_observations: bundle.table.observation_count(),
            intrinsics: *intrinsics,
            bundle_adjusted: bundle.bundle_adjusted,
        },
    )?;
    write_correspondences_csv(&correspondences, bundle.table)?;

    info!("exported {} points to {}", bundle.points.len(), dir.display());
    Ok(vec![ascii, binary, cameras, calibration, metadata, correspondences])
}
