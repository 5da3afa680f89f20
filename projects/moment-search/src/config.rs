use serde::{Deserialize, Serialize};

/// Engine policy knobs. Every search rescans from scratch using these values.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SearchConfig {
    /// Wall-clock spacing between inspected frames
    pub sample_interval_secs: f64,
    /// Minimum spacing between two accepted matches in the same video
    pub dedup_window_secs: f64,
    /// Cosine similarity threshold for image/text queries
    pub similarity_threshold: f32,
    /// Detector confidence threshold for category queries
    pub confidence_threshold: f32,
    /// Used when the container does not report a frame rate
    pub default_fps: f64,
    /// Decode backend, "opencv" or "ffmpeg"
    pub backend: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 1.0,
            dedup_window_secs: 2.0,
            similarity_threshold: 0.25,
            confidence_threshold: 0.5,
            default_fps: 25.0,
            backend: "opencv".to_string(),
        }
    }
}

impl SearchConfig {
    /// Frames between two inspected samples, never less than one.
    pub fn stride(&self, fps: f64) -> usize {
        ((fps * self.sample_interval_secs).round() as usize).max(1)
    }

    /// Dedup window expressed in frames.
    pub fn min_frame_gap(&self, fps: f64) -> usize {
        (fps * self.dedup_window_secs).round() as usize
    }
}

/// Where the inference backends find their weights.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ModelConfig {
    /// CLIP variant, e.g. "clip-vit-b32"
    pub clip_variant: String,
    /// ONNX file for the object detector
    pub detector_model: String,
    /// Run inference on CoreML where available
    pub accelerate: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            clip_variant: "clip-vit-b32".to_string(),
            detector_model: "rtdetr-v2-s-coco.onnx".to_string(),
            accelerate: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_and_gap_at_common_rates() {
        let config = SearchConfig::default();
        assert_eq!(config.stride(25.0), 25);
        assert_eq!(config.min_frame_gap(25.0), 50);
        assert_eq!(config.stride(29.97), 30);
        assert_eq!(config.min_frame_gap(29.97), 60);
    }

    #[test]
    fn test_stride_never_zero() {
        let config = SearchConfig {
            sample_interval_secs: 0.01,
            ..SearchConfig::default()
        };
        assert_eq!(config.stride(25.0), 1);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SearchConfig =
            serde_json::from_str(r#"{"similarity_threshold": 0.3}"#).unwrap();
        assert_eq!(config.similarity_threshold, 0.3);
        assert_eq!(config.confidence_threshold, 0.5);
        assert_eq!(config.backend, "opencv");
    }
}
