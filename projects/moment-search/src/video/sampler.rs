use super::{VideoReader, VideoSource};
use crate::config::SearchConfig;
use crate::error::SearchError;
use opencv::core::Mat;

/// Give up on a stream after this many failed reads in a row.
const MAX_CONSECUTIVE_FAILURES: usize = 16;

/// One inspected frame. Consumed by scoring and dropped.
pub struct Sample {
    pub video_path: String,
    pub frame_index: usize,
    pub timestamp_ms: u64,
    pub image: Mat,
}

/// Converts a frame index into integer milliseconds, truncating.
pub fn frame_to_ms(frame_index: usize, fps: f64) -> u64 {
    (frame_index as f64 / fps * 1000.0) as u64
}

/// Lazy iterator over frames 0, stride, 2*stride, ... of one video.
///
/// The reader is dropped as soon as the stream is exhausted, and otherwise
/// when the sampler itself is dropped, so an early `break` releases it too.
pub struct FrameSampler {
    path: String,
    reader: Option<Box<dyn VideoReader>>,
    fps: f64,
    stride: usize,
    total_frames: usize,
    /// Index of the next frame the reader will produce
    position: usize,
    next_sample: usize,
    failures: usize,
}

impl FrameSampler {
    pub fn open(
        source: &dyn VideoSource,
        path: &str,
        config: &SearchConfig,
    ) -> Result<Self, SearchError> {
        let reader = source
            .open(path)
            .map_err(|e| SearchError::UnopenableVideo {
                path: path.to_string(),
                reason: format!("{:#}", e),
            })?;
        Ok(Self::from_reader(path, reader, config))
    }

    pub fn from_reader(path: &str, reader: Box<dyn VideoReader>, config: &SearchConfig) -> Self {
        let fps = match reader.source_fps() {
            Ok(fps) if fps.is_finite() && fps > 0.0 => fps,
            _ => {
                tracing::warn!(
                    "No frame rate reported for {}, assuming {:.1}",
                    path,
                    config.default_fps
                );
                config.default_fps
            }
        };
        let total_frames = reader.frame_count().unwrap_or(0);

        Self {
            path: path.to_string(),
            reader: Some(reader),
            fps,
            stride: config.stride(fps),
            total_frames,
            position: 0,
            next_sample: 0,
            failures: 0,
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of samples the stream should yield, 0 when the length is unknown.
    pub fn estimated_samples(&self) -> usize {
        self.total_frames.div_ceil(self.stride)
    }

    fn finish(&mut self) {
        if self.reader.take().is_some() {
            tracing::debug!("Sampler: finished {} at frame {}", self.path, self.position);
        }
    }

    /// Counts a failed read. Once the limit is reached the stream is closed and
    /// the truncation is returned for the caller to yield.
    fn note_failure(&mut self, frame_index: usize, err: &anyhow::Error) -> Option<SearchError> {
        self.failures += 1;
        if self.failures < MAX_CONSECUTIVE_FAILURES {
            return None;
        }
        tracing::warn!(
            "Sampler: {} failed reads in a row in {}, stopping at frame {}",
            self.failures,
            self.path,
            frame_index
        );
        let truncated = SearchError::TruncatedVideo {
            path: self.path.clone(),
            frame_index,
            reason: format!("{} failed reads in a row, last: {:#}", self.failures, err),
        };
        self.finish();
        Some(truncated)
    }
}

impl Iterator for FrameSampler {
    type Item = Result<Sample, SearchError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < self.next_sample {
            let reader = self.reader.as_mut()?;
            match reader.skip_frame() {
                Ok(true) => {
                    self.position += 1;
                    self.failures = 0;
                }
                Ok(false) => {
                    self.finish();
                    return None;
                }
                Err(e) => {
                    tracing::debug!("Sampler: skip failed at {}: {}", self.position, e);
                    let frame_index = self.position;
                    self.position += 1;
                    if let Some(truncated) = self.note_failure(frame_index, &e) {
                        return Some(Err(truncated));
                    }
                }
            }
        }

        let reader = self.reader.as_mut()?;
        let frame_index = self.position;
        let result = reader.read_frame();
        self.position += 1;
        self.next_sample += self.stride;

        match result {
            Ok(Some(image)) => {
                self.failures = 0;
                Some(Ok(Sample {
                    video_path: self.path.clone(),
                    frame_index,
                    timestamp_ms: frame_to_ms(frame_index, self.fps),
                    image,
                }))
            }
            Ok(None) => {
                self.finish();
                None
            }
            Err(e) => {
                if let Some(truncated) = self.note_failure(frame_index, &e) {
                    return Some(Err(truncated));
                }
                Some(Err(SearchError::FrameDecode {
                    path: self.path.clone(),
                    frame_index,
                    reason: format!("{:#}", e),
                }))
            }
        }
    }
}
