use super::VideoReader;
use anyhow::{anyhow, Result};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_HW_ACCELERATION,
        VIDEO_ACCELERATION_ANY,
    },
};

pub struct OpencvReader {
    path: String,
    capture: VideoCapture,
    source_fps: f64,
    total_frames: usize,
}

impl OpencvReader {
    pub fn new(path: &str) -> Result<Self> {
        if !std::path::Path::new(path).exists() {
            return Err(anyhow!("Video file not found: {}", path));
        }

        let mut capture = VideoCapture::from_file(path, CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video file: {}", path));
        }

        // VideoToolbox on macOS, VA-API on Linux, etc.
        match capture.set(CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY as f64) {
            Ok(true) => tracing::debug!("OpencvReader: hardware acceleration enabled"),
            _ => tracing::debug!("OpencvReader: hardware acceleration not available"),
        }

        let source_fps = capture.get(CAP_PROP_FPS)?;
        let raw_count = capture.get(CAP_PROP_FRAME_COUNT)?;
        let total_frames = if raw_count.is_finite() && raw_count > 0.0 {
            raw_count as usize
        } else {
            0
        };

        tracing::info!(
            "OpencvReader: opened {}, fps={:.2}, stream_frames={}",
            path,
            source_fps,
            total_frames
        );

        Ok(Self {
            path: path.to_string(),
            capture,
            source_fps,
            total_frames,
        })
    }
}

impl VideoReader for OpencvReader {
    fn frame_count(&self) -> Result<usize> {
        Ok(self.total_frames)
    }

    fn source_fps(&self) -> Result<f64> {
        Ok(self.source_fps)
    }

    fn read_frame(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn skip_frame(&mut self) -> Result<bool> {
        Ok(self.capture.grab()?)
    }
}

impl Drop for OpencvReader {
    fn drop(&mut self) {
        if let Err(e) = self.capture.release() {
            tracing::warn!("OpencvReader: failed to release {}: {}", self.path, e);
        } else {
            tracing::debug!("OpencvReader: released {}", self.path);
        }
    }
}
