use serde::Serialize;
use thiserror::Error;

/// How far an error reaches: a single sample, a single video, or the whole search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorScope {
    Frame,
    Video,
    Session,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("cannot open video {path}: {reason}")]
    UnopenableVideo { path: String, reason: String },

    #[error("frame {frame_index} of {path} could not be decoded: {reason}")]
    FrameDecode {
        path: String,
        frame_index: usize,
        reason: String,
    },

    /// Reading gave up partway; frames from `frame_index` on were never scanned.
    #[error("stopped reading {path} at frame {frame_index}: {reason}")]
    TruncatedVideo {
        path: String,
        frame_index: usize,
        reason: String,
    },

    #[error("inference failed on frame {frame_index} of {path}: {reason}")]
    Inference {
        path: String,
        frame_index: usize,
        reason: String,
    },

    #[error("no usable query: {0}")]
    EmptyQuery(String),

    #[error("{capability} model unavailable: {reason}")]
    ModelUnavailable {
        capability: &'static str,
        reason: String,
    },
}

impl SearchError {
    pub fn scope(&self) -> ErrorScope {
        match self {
            SearchError::FrameDecode { .. } | SearchError::Inference { .. } => ErrorScope::Frame,
            SearchError::UnopenableVideo { .. } | SearchError::TruncatedVideo { .. } => {
                ErrorScope::Video
            }
            SearchError::EmptyQuery(_) | SearchError::ModelUnavailable { .. } => {
                ErrorScope::Session
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.scope() == ErrorScope::Session
    }

    pub(crate) fn model_unavailable(capability: &'static str, err: anyhow::Error) -> Self {
        SearchError::ModelUnavailable {
            capability,
            reason: format!("{:#}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_classification() {
        let frame = SearchError::Inference {
            path: "a.mp4".to_string(),
            frame_index: 25,
            reason: "oom".to_string(),
        };
        assert_eq!(frame.scope(), ErrorScope::Frame);
        assert!(!frame.is_fatal());

        let video = SearchError::UnopenableVideo {
            path: "missing.mp4".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(video.scope(), ErrorScope::Video);

        let truncated = SearchError::TruncatedVideo {
            path: "a.mp4".to_string(),
            frame_index: 400,
            reason: "16 failed reads in a row".to_string(),
        };
        assert_eq!(truncated.scope(), ErrorScope::Video);
        assert!(!truncated.is_fatal());

        let query = SearchError::EmptyQuery("all example images failed".to_string());
        assert!(query.is_fatal());

        let model = SearchError::model_unavailable("detector", anyhow::anyhow!("weights missing"));
        assert!(model.is_fatal());
        assert!(model.to_string().contains("weights missing"));
    }
}
