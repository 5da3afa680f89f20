//! In-memory videos and deterministic models for unit tests.

use crate::models::{l2_normalize, BBox, Detection, Detector, Embedder};
use crate::video::{VideoReader, VideoSource};
use anyhow::{anyhow, Result};
use image::{DynamicImage, Rgb, RgbImage};
use opencv::core::{Mat, Scalar, CV_8UC3};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Solid RGB frame stored the way decoders hand frames out (BGR).
pub(crate) fn solid_mat(rgb: [u8; 3]) -> Mat {
    let [r, g, b] = rgb;
    let bgr = Scalar::new(b as f64, g as f64, r as f64, 0.0);
    Mat::new_rows_cols_with_default(8, 8, CV_8UC3, bgr).unwrap()
}

pub(crate) fn write_solid_png(path: &Path, rgb: [u8; 3]) -> PathBuf {
    RgbImage::from_pixel(4, 4, Rgb(rgb)).save(path).unwrap();
    path.to_path_buf()
}

fn first_pixel(image: &DynamicImage) -> [u8; 3] {
    image.to_rgb8().get_pixel(0, 0).0
}

/// A video made of solid-colour frames, black unless painted.
#[derive(Clone)]
pub(crate) struct SyntheticVideo {
    frames: usize,
    fps: f64,
    colors: Vec<(Range<usize>, [u8; 3])>,
    failing: HashSet<usize>,
    released: Arc<AtomicBool>,
}

impl SyntheticVideo {
    pub(crate) fn new(frames: usize, fps: f64) -> Self {
        Self {
            frames,
            fps,
            colors: Vec::new(),
            failing: HashSet::new(),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Later ranges win where they overlap.
    pub(crate) fn with_color(mut self, frames: Range<usize>, rgb: [u8; 3]) -> Self {
        self.colors.push((frames, rgb));
        self
    }

    /// Frames whose decode returns an error.
    pub(crate) fn failing_at(mut self, frames: &[usize]) -> Self {
        self.failing.extend(frames.iter().copied());
        self
    }

    /// Set once a reader over this video has been dropped.
    pub(crate) fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }

    fn color_at(&self, frame: usize) -> [u8; 3] {
        self.colors
            .iter()
            .rev()
            .find(|(range, _)| range.contains(&frame))
            .map(|(_, rgb)| *rgb)
            .unwrap_or([0, 0, 0])
    }
}

struct SyntheticReader {
    video: SyntheticVideo,
    position: usize,
}

impl VideoReader for SyntheticReader {
    fn frame_count(&self) -> Result<usize> {
        Ok(self.video.frames)
    }

    fn source_fps(&self) -> Result<f64> {
        Ok(self.video.fps)
    }

    fn read_frame(&mut self) -> Result<Option<Mat>> {
        if self.position >= self.video.frames {
            return Ok(None);
        }
        let frame = self.position;
        self.position += 1;
        if self.video.failing.contains(&frame) {
            return Err(anyhow!("corrupt packet at frame {}", frame));
        }
        Ok(Some(solid_mat(self.video.color_at(frame))))
    }

    fn skip_frame(&mut self) -> Result<bool> {
        if self.position >= self.video.frames {
            return Ok(false);
        }
        self.position += 1;
        Ok(true)
    }
}

impl Drop for SyntheticReader {
    fn drop(&mut self) {
        self.video.released.store(true, Ordering::SeqCst);
    }
}

/// Serves synthetic videos by path. Unknown paths fail to open.
pub(crate) struct SyntheticSource {
    videos: HashMap<String, SyntheticVideo>,
    opens: Arc<AtomicUsize>,
}

impl SyntheticSource {
    pub(crate) fn new() -> Self {
        Self {
            videos: HashMap::new(),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn with_video(mut self, path: &str, video: SyntheticVideo) -> Self {
        self.videos.insert(path.to_string(), video);
        self
    }

    /// Counts every open attempt, successful or not.
    pub(crate) fn open_counter(&self) -> Arc<AtomicUsize> {
        self.opens.clone()
    }
}

impl VideoSource for SyntheticSource {
    fn open(&self, path: &str) -> Result<Box<dyn VideoReader>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let video = self
            .videos
            .get(path)
            .ok_or_else(|| anyhow!("No such file: {}", path))?;
        Ok(Box::new(SyntheticReader {
            video: video.clone(),
            position: 0,
        }))
    }
}

/// Embeds an image as its normalized mean colour and text by colour keyword.
///
/// Pure white images make inference fail.
pub(crate) struct StubEmbedder {
    available: bool,
    loaded: bool,
    loads: Arc<AtomicUsize>,
    image_calls: Arc<AtomicUsize>,
}

impl StubEmbedder {
    pub(crate) fn new() -> Self {
        Self {
            available: true,
            loaded: false,
            loads: Arc::new(AtomicUsize::new(0)),
            image_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every load attempt fails.
    pub(crate) fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub(crate) fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn load_counter(&self) -> Arc<AtomicUsize> {
        self.loads.clone()
    }

    pub(crate) fn image_call_counter(&self) -> Arc<AtomicUsize> {
        self.image_calls.clone()
    }
}

impl Embedder for StubEmbedder {
    fn ensure_loaded(&mut self) -> Result<()> {
        if !self.available {
            return Err(anyhow!("weights not found"));
        }
        if !self.loaded {
            self.loaded = true;
            self.loads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn embed_image(&mut self, image: &DynamicImage) -> Result<Vec<f32>> {
        self.ensure_loaded()?;
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        let rgb = first_pixel(image);
        if rgb == [255, 255, 255] {
            return Err(anyhow!("out of memory"));
        }
        Ok(l2_normalize(rgb.iter().map(|c| *c as f32 / 255.0).collect()))
    }

    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>> {
        self.ensure_loaded()?;
        let text = text.to_lowercase();
        if text.contains("red") {
            Ok(vec![1.0, 0.0, 0.0])
        } else if text.contains("green") {
            Ok(vec![0.0, 1.0, 0.0])
        } else if text.contains("blue") {
            Ok(vec![0.0, 0.0, 1.0])
        } else {
            Err(anyhow!("no colour in '{}'", text))
        }
    }
}

/// Returns fixed detections for frames of a given colour.
pub(crate) struct ScriptedDetector {
    available: bool,
    rules: Vec<([u8; 3], Detection)>,
}

impl ScriptedDetector {
    pub(crate) fn new() -> Self {
        Self {
            available: true,
            rules: Vec::new(),
        }
    }

    pub(crate) fn unavailable() -> Self {
        Self {
            available: false,
            rules: Vec::new(),
        }
    }

    pub(crate) fn on_color(mut self, rgb: [u8; 3], label: &str, confidence: f32) -> Self {
        self.rules.push((
            rgb,
            Detection {
                label: label.to_string(),
                confidence,
                bbox: BBox {
                    x: 0.0,
                    y: 0.0,
                    w: 8.0,
                    h: 8.0,
                },
            },
        ));
        self
    }
}

impl Detector for ScriptedDetector {
    fn ensure_loaded(&mut self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(anyhow!("detector weights not found"))
        }
    }

    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<Detection>> {
        self.ensure_loaded()?;
        let rgb = first_pixel(image);
        Ok(self
            .rules
            .iter()
            .filter(|(color, _)| *color == rgb)
            .map(|(_, detection)| detection.clone())
            .collect())
    }
}
