// Inference capabilities used by the match engine
//
// The engine only sees the two narrow traits below; concrete backends load
// their weights on first use so a process that never runs a category search
// never pays for the detector, and vice versa.

pub mod clip;
pub mod detection;

use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

/// Bounding box in image pixels
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// A single labelled region returned by a detector
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Multimodal embedding model: images and text land in the same unit-vector space.
pub trait Embedder: Send {
    /// Loads weights if needed. Idempotent.
    fn ensure_loaded(&mut self) -> Result<()>;
    fn embed_image(&mut self, image: &DynamicImage) -> Result<Vec<f32>>;
    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>>;
}

/// Object detector.
pub trait Detector: Send {
    /// Loads weights if needed. Idempotent.
    fn ensure_loaded(&mut self) -> Result<()>;
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<Detection>>;
}

pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Cosine similarity of two unit vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(anyhow!(
            "Embedding dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        ));
    }
    Ok(a.iter().zip(b).map(|(x, y)| x * y).sum())
}

/// Component-wise mean of unit vectors, re-normalized to unit length.
pub fn mean_direction(vectors: &[Vec<f32>]) -> Result<Vec<f32>> {
    let first = vectors
        .first()
        .ok_or_else(|| anyhow!("No vectors to average"))?;
    let mut sum = vec![0.0f32; first.len()];
    for v in vectors {
        if v.len() != sum.len() {
            return Err(anyhow!(
                "Embedding dimension mismatch: {} vs {}",
                v.len(),
                sum.len()
            ));
        }
        sum.iter_mut().zip(v).for_each(|(s, x)| *s += x);
    }
    let n = vectors.len() as f32;
    sum.iter_mut().for_each(|s| *s /= n);
    let mean = l2_normalize(sum);
    if mean.iter().all(|x| *x == 0.0) {
        return Err(anyhow!("Query embeddings cancel out"));
    }
    Ok(mean)
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
pub fn mat_to_dynamic_image(mat: &Mat) -> Result<DynamicImage> {
    if mat.empty() {
        return Err(anyhow!("Empty frame"));
    }
    if mat.channels() != 3 {
        return Err(anyhow!("Expected 3 channels, got {}", mat.channels()));
    }

    let mut rgb_mat = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb_mat, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let buffer = rgb_mat.data_bytes()?.to_vec();
    let img_buffer =
        ImageBuffer::<Rgb<u8>, _>::from_vec(size.width as u32, size.height as u32, buffer)
            .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC1, CV_8UC3};

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_cosine_rejects_mismatched_dims() {
        assert!(cosine(&[1.0, 0.0], &[1.0]).is_err());
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_mean_direction() {
        let mean = mean_direction(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((mean[0] - expected).abs() < 1e-6);
        assert!((mean[1] - expected).abs() < 1e-6);

        assert!(mean_direction(&[vec![1.0, 0.0], vec![-1.0, 0.0]]).is_err());
        assert!(mean_direction(&[]).is_err());
    }

    #[test]
    fn test_mat_to_dynamic_image_swaps_channels() {
        // Pure red in BGR order
        let mat = Mat::new_rows_cols_with_default(4, 6, CV_8UC3, Scalar::new(0.0, 0.0, 255.0, 0.0))
            .unwrap();
        let image = mat_to_dynamic_image(&mat).unwrap();
        assert_eq!(image.width(), 6);
        assert_eq!(image.height(), 4);
        assert_eq!(image.to_rgb8().get_pixel(0, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_mat_to_dynamic_image_rejects_gray() {
        let mat = Mat::new_rows_cols_with_default(4, 4, CV_8UC1, Scalar::all(0.0)).unwrap();
        assert!(mat_to_dynamic_image(&mat).is_err());
        assert!(mat_to_dynamic_image(&Mat::default()).is_err());
    }
}
