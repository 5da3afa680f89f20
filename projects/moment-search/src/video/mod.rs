pub mod ffmpeg_reader;
pub mod opencv_reader;
pub mod sampler;

use anyhow::Result;
use opencv::core::Mat;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use ffmpeg_reader::FfmpegReader;
use opencv_reader::OpencvReader;

/// Container extensions picked up when a directory is given as input.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv"];

/// Sequential access to the decoded frames of one video.
///
/// Dropping the reader releases the decoder.
pub trait VideoReader: Send {
    /// Frame count reported by the container, 0 when unknown.
    fn frame_count(&self) -> Result<usize>;
    /// Frame rate reported by the container, may be 0.0 when unknown.
    fn source_fps(&self) -> Result<f64>;
    /// Decodes the next frame as BGR. `Ok(None)` at end of stream.
    fn read_frame(&mut self) -> Result<Option<Mat>>;
    /// Advances past the next frame without converting it. `Ok(false)` at end of stream.
    fn skip_frame(&mut self) -> Result<bool>;
}

/// Opens readers for video paths.
pub trait VideoSource: Send {
    fn open(&self, path: &str) -> Result<Box<dyn VideoReader>>;
}

/// Picks the decode backend by name.
pub struct BackendSource {
    backend: String,
}

impl BackendSource {
    pub fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
        }
    }
}

impl VideoSource for BackendSource {
    fn open(&self, path: &str) -> Result<Box<dyn VideoReader>> {
        let reader: Box<dyn VideoReader> = match self.backend.as_str() {
            "ffmpeg" => Box::new(FfmpegReader::new(path)?),
            "opencv" => Box::new(OpencvReader::new(path)?),
            other => {
                tracing::warn!("Unknown backend '{}', using opencv", other);
                Box::new(OpencvReader::new(path)?)
            }
        };
        Ok(reader)
    }
}

fn has_video_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| VIDEO_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expands the given inputs into an ordered list of video files.
///
/// Files are kept as given (even when they do not exist, so the search can
/// report them); directories are walked and their video files appended in
/// sorted order.
pub fn collect_videos(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut videos = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(input)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| has_video_extension(e.path()))
                .map(|e| e.path().to_path_buf())
                .collect();
            tracing::debug!("Found {} videos under {:?}", found.len(), input);
            videos.append(&mut found);
        } else {
            videos.push(input.clone());
        }
    }
    videos
}
