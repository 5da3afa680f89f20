use crate::error::{ErrorScope, SearchError};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Image,
    Text,
    Category,
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "image" => Ok(SearchMode::Image),
            "text" => Ok(SearchMode::Text),
            "category" => Ok(SearchMode::Category),
            other => Err(anyhow!("Unknown search mode: {}", other)),
        }
    }
}

/// What the user searches for. The variant selects the mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", content = "query", rename_all = "lowercase")]
pub enum QueryInput {
    Image(Vec<PathBuf>),
    Text(String),
    Category(String),
}

impl QueryInput {
    pub fn mode(&self) -> SearchMode {
        match self {
            QueryInput::Image(_) => SearchMode::Image,
            QueryInput::Text(_) => SearchMode::Text,
            QueryInput::Category(_) => SearchMode::Category,
        }
    }
}

/// Built once per search, before any video is opened, and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRepresentation {
    /// Unit-length embedding (image and text modes)
    Embedding(Vec<f32>),
    /// Lowercased, trimmed label (category mode)
    Category(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub video_paths: Vec<String>,
    #[serde(flatten)]
    pub query: QueryInput,
    /// Overrides the per-mode default threshold
    #[serde(default)]
    pub score_threshold: Option<f32>,
}

impl SearchRequest {
    pub fn new(video_paths: Vec<String>, query: QueryInput) -> Self {
        Self {
            video_paths,
            query,
            score_threshold: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    pub fn mode(&self) -> SearchMode {
        self.query.mode()
    }
}

/// One accepted moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub video_path: String,
    pub frame_index: usize,
    pub timestamp_ms: u64,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Video {
        completed_count: usize,
        total_videos: usize,
    },
    Frame {
        /// 1-based
        video_index: usize,
        processed_samples: usize,
        total_samples_estimate: usize,
        total_videos: usize,
    },
}

/// Status line keyed for localization by the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusMessage {
    pub key: &'static str,
    pub params: Map<String, Value>,
}

impl StatusMessage {
    fn new(key: &'static str, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { key, params }
    }

    pub fn searching_video(path: &str, idx: usize, total: usize) -> Self {
        Self::new(
            "searching_video",
            json!({ "name": display_name(path), "idx": idx, "total": total }),
        )
    }

    pub fn found_match(record: &MatchRecord) -> Self {
        Self::new(
            "found_match",
            json!({
                "name": display_name(&record.video_path),
                "sec": record.timestamp_ms / 1000,
                "score": record.score,
            }),
        )
    }

    pub fn video_unopenable(path: &str, reason: &str) -> Self {
        Self::new(
            "video_unopenable",
            json!({ "name": display_name(path), "reason": reason }),
        )
    }

    pub fn frame_skipped(path: &str, frame_index: usize, reason: &str) -> Self {
        Self::new(
            "frame_skipped",
            json!({ "name": display_name(path), "frame_index": frame_index, "reason": reason }),
        )
    }

    pub fn video_truncated(path: &str, frame_index: usize, reason: &str) -> Self {
        Self::new(
            "video_truncated",
            json!({ "name": display_name(path), "frame_index": frame_index, "reason": reason }),
        )
    }

    pub fn search_failed(reason: &str) -> Self {
        Self::new("search_failed", json!({ "reason": reason }))
    }

    /// English rendering for hosts without a translation table.
    pub fn render(&self) -> String {
        let p = |k: &str| {
            self.params
                .get(k)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };
        match self.key {
            "searching_video" => format!("Searching {} ({}/{})", p("name"), p("idx"), p("total")),
            "found_match" => format!("Match in {} at {}s", p("name"), p("sec")),
            "video_unopenable" => format!("Skipping {}: {}", p("name"), p("reason")),
            "frame_skipped" => format!("Skipped frame {} of {}", p("frame_index"), p("name")),
            "video_truncated" => format!(
                "Stopped reading {} at frame {}: {}",
                p("name"),
                p("frame_index"),
                p("reason")
            ),
            "search_failed" => format!("Search failed: {}", p("reason")),
            other => other.to_string(),
        }
    }
}

/// Error notification as seen by the host.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub scope: ErrorScope,
    pub message: String,
}

impl From<&SearchError> for ErrorReport {
    fn from(err: &SearchError) -> Self {
        Self {
            scope: err.scope(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SearchOutcome {
    Completed,
    Stopped,
    Failed { reason: String },
}

/// Everything a session sends to its host.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SearchEvent {
    Match(MatchRecord),
    Progress(ProgressEvent),
    Message(StatusMessage),
    Error(ErrorReport),
    /// Sent exactly once per session
    Finished(SearchOutcome),
}

fn display_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

/// Formats milliseconds as `HH:MM:SS`.
pub fn format_ms(ms: u64) -> String {
    let s = ms / 1000;
    format!("{:02}:{:02}:{:02}", s / 3600, (s % 3600) / 60, s % 60)
}
