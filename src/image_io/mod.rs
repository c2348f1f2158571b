//! Loading input photographs and deriving the metadata the camera estimate needs.

use crate::camera::{ImageMetadata, Resolution};
use crate::error::{Result, SfmError};
use image::DynamicImage;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

const SUPPORTED_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff"];

/// A decoded input image with its dense index.
#[derive(Debug, Clone)]
pub struct SfmImage {
    pub index: usize,
    pub path: PathBuf,
    pub image: DynamicImage,
}

impl SfmImage {
    pub fn new(index: usize, path: impl Into<PathBuf>, image: DynamicImage) -> Self {
        SfmImage {
            index,
            path: path.into(),
            image,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.image.width(),
            height: self.image.height(),
        }
    }
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Image files in `dir`, sorted by file name.
pub fn list_image_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(SfmError::IOError(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_supported(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Decodes every supported image of `dir`, up to `max_images`.
///
/// Files that fail to decode are skipped with a warning; indices stay dense
/// over the images that did load.
pub fn load_images_from_directory<P: AsRef<Path>>(
    dir: P,
    max_images: Option<usize>,
) -> Result<Vec<SfmImage>> {
    let mut files = list_image_files(&dir)?;
    if let Some(max) = max_images {
        files.truncate(max);
    }

    let mut images = Vec::with_capacity(files.len());
    for path in files {
        match image::open(&path) {
            Ok(decoded) => images.push(SfmImage::new(images.len(), path, decoded)),
            Err(err) => warn!("skipping {}: {err}", path.display()),
        }
    }
    info!(
        "loaded {} images from {}",
        images.len(),
        dir.as_ref().display()
    );
    Ok(images)
}

/// Metadata available without EXIF parsing: the decoded size plus an optional
/// focal-length override.
pub fn extract_metadata(image: &SfmImage, focal_length_mm: Option<f64>) -> ImageMetadata {
    ImageMetadata {
        resolution: Some(image.resolution()),
        focal_length_mm,
        camera_matrix: None,
    }
}
