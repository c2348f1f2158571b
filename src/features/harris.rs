//! Harris corner detector with normalized intensity-patch descriptors.

use crate::error::Result;
use crate::features::{FeatureDetector, Features};
use crate::image_io::SfmImage;
use log::debug;
use nalgebra::Point2;

/// Detects Harris corners on the luminance channel.
///
/// Each corner is described by the `(2r+1)²` intensities around it, shifted
/// to zero mean and scaled to unit norm, so descriptors compare with plain L2.
#[derive(Debug, Clone, Copy)]
pub struct HarrisDetector {
    pub max_features: usize,
    pub patch_radius: u32,
    /// Harris sensitivity `k` in `det(M) − k·tr(M)²`.
    pub k: f64,
    /// Responses below this fraction of the strongest one are dropped.
    pub relative_threshold: f64,
}

impl Default for HarrisDetector {
    fn default() -> Self {
        HarrisDetector {
            max_features: 2000,
            patch_radius: 4,
            k: 0.04,
            relative_threshold: 0.01,
        }
    }
}

impl HarrisDetector {
    fn response_map(&self, intensity: &[f64], width: usize, height: usize) -> Vec<f64> {
        let at = |x: usize, y: usize| intensity[y * width + x];

        let mut ixx = vec![0.0; width * height];
        let mut iyy = vec![0.0; width * height];
        let mut ixy = vec![0.0; width * height];
        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let gx = (at(x + 1, y) - at(x - 1, y)) * 0.5;
                let gy = (at(x, y + 1) - at(x, y - 1)) * 0.5;
                let i = y * width + x;
                ixx[i] = gx * gx;
                iyy[i] = gy * gy;
                ixy[i] = gx * gy;
            }
        }

        let mut response = vec![0.0; width * height];
        for y in 2..height - 2 {
            for x in 2..width - 2 {
                let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
                for wy in y - 1..=y + 1 {
                    for wx in x - 1..=x + 1 {
                        let i = wy * width + wx;
                        sxx += ixx[i];
                        syy += iyy[i];
                        sxy += ixy[i];
                    }
                }
                let det = sxx * syy - sxy * sxy;
                let trace = sxx + syy;
                response[y * width + x] = det - self.k * trace * trace;
            }
        }
        response
    }

    fn describe(&self, intensity: &[f64], width: usize, x: usize, y: usize) -> Option<Vec<f32>> {
        let r = self.patch_radius as usize;
        let mut patch = Vec::with_capacity((2 * r + 1) * (2 * r + 1));
        for py in y - r..=y + r {
            for px in x - r..=x + r {
                patch.push(intensity[py * width + px]);
            }
        }

        let mean = patch.iter().sum::<f64>() / patch.len() as f64;
        let norm = patch.iter().map(|v| (v - mean).powi(2)).sum::<f64>().sqrt();
        if norm < 1e-9 {
            return None;
        }
        Some(patch.iter().map(|v| ((v - mean) / norm) as f32).collect())
    }
}

impl FeatureDetector for HarrisDetector {
    fn detect(&self, image: &SfmImage) -> Result<Features> {
        let gray = image.image.to_luma32f();
        let (width, height) = (gray.width() as usize, gray.height() as usize);
        let margin = (self.patch_radius as usize).max(2) + 1;
        if width <= 2 * margin || height <= 2 * margin {
            return Ok(Features::default());
        }

        let intensity: Vec<f64> = gray.pixels().map(|p| p.0[0] as f64).collect();
        let response = self.response_map(&intensity, width, height);

        let strongest = response.iter().copied().fold(0.0, f64::max);
        if strongest <= 0.0 {
            return Ok(Features::default());
        }
        let threshold = strongest * self.relative_threshold;

        let mut corners = Vec::new();
        for y in margin..height - margin {
            for x in margin..width - margin {
                let value = response[y * width + x];
                if value <= threshold {
                    continue;
                }
                // Plateaus keep only their first pixel in raster order.
                let is_peak = (y - 1..=y + 1).all(|ny| {
                    (x - 1..=x + 1).all(|nx| {
                        let neighbour = response[ny * width + nx];
                        (nx == x && ny == y)
                            || neighbour < value
                            || (neighbour == value && (ny, nx) > (y, x))
                    })
                });
                if is_peak {
                    corners.push((value, x, y));
                }
            }
        }
        corners.sort_by(|a, b| b.0.total_cmp(&a.0));
        corners.truncate(self.max_features);

        let mut features = Features::default();
        for (_, x, y) in corners {
            if let Some(descriptor) = self.describe(&intensity, width, x, y) {
                features.keypoints.push(Point2::new(x as f64, y as f64));
                features.descriptors.push(descriptor);
            }
        }
        debug!("image {}: {} corners", image.index, features.len());

        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, Luma};
    use std::path::PathBuf;

    fn checkerboard(size: u32, square: u32) -> SfmImage {
        let img = GrayImage::from_fn(size, size, |x, y| {
            if ((x / square) + (y / square)) % 2 == 0 {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });
        SfmImage {
            index: 0,
            path: PathBuf::from("checkerboard.png"),
            image: DynamicImage::ImageLuma8(img),
        }
    }

    #[test]
    fn test_detects_checkerboard_corners() {
        let features = HarrisDetector::default()
            .detect(&checkerboard(64, 16))
            .unwrap();

        assert!(!features.is_empty());
        assert_eq!(features.keypoints.len(), features.descriptors.len());
        let descriptor_len = (2 * 4 + 1) * (2 * 4 + 1);
        for descriptor in &features.descriptors {
            assert_eq!(descriptor.len(), descriptor_len);
        }
        // Corners sit on the inner grid lines at multiples of 16.
        for kp in &features.keypoints {
            let near_line = |v: f64| (v - (v / 16.0).round() * 16.0).abs() <= 2.0;
            assert!(near_line(kp.x) && near_line(kp.y), "unexpected corner {kp:?}");
        }
    }

    #[test]
    fn test_flat_image_has_no_features() {
        let img = SfmImage {
            index: 3,
            path: PathBuf::from("flat.png"),
            image: DynamicImage::ImageLuma8(GrayImage::from_pixel(32, 32, Luma([90u8]))),
        };
        assert!(HarrisDetector::default().detect(&img).unwrap().is_empty());
    }
}
