// Match engine: drives sampling, scoring, thresholding and temporal dedup
//
// A search is a lazy iterator. Each call to `next` pulls samples from the
// current video until one is accepted, then yields it. Videos are visited in
// request order and matches within a video come out in frame order.

use super::query::QueryEncoder;
use super::session::SearchHandle;
use super::types::{
    MatchRecord, ProgressEvent, QueryRepresentation, SearchEvent, SearchMode, SearchOutcome,
    SearchRequest, StatusMessage,
};
use crate::config::{ModelConfig, SearchConfig};
use crate::error::SearchError;
use crate::models::clip::ClipEmbedder;
use crate::models::detection::RtDetrDetector;
use crate::models::{cosine, mat_to_dynamic_image, Detection, Detector, Embedder};
use crate::video::sampler::{FrameSampler, Sample};
use crate::video::{BackendSource, VideoSource};
use crossbeam::channel::Sender;

/// Side channel for progress, status messages and recoverable errors.
#[derive(Clone, Default)]
pub struct Reporter {
    tx: Option<Sender<SearchEvent>>,
}

impl Reporter {
    pub fn new(tx: Sender<SearchEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Drops every event.
    pub fn silent() -> Self {
        Self { tx: None }
    }

    fn send(&self, event: SearchEvent) {
        if let Some(tx) = &self.tx {
            // A host that stopped listening is not our problem
            let _ = tx.send(event);
        }
    }

    pub fn progress(&self, progress: ProgressEvent) {
        self.send(SearchEvent::Progress(progress));
    }

    pub fn message(&self, message: StatusMessage) {
        self.send(SearchEvent::Message(message));
    }

    pub fn error(&self, err: &SearchError) {
        self.send(SearchEvent::Error(err.into()));
    }
}

/// Owns the decode source and both model handles. One engine per concurrent search.
pub struct MatchEngine {
    config: SearchConfig,
    source: Box<dyn VideoSource>,
    embedder: Box<dyn Embedder>,
    detector: Box<dyn Detector>,
}

impl MatchEngine {
    pub fn new(
        config: SearchConfig,
        source: Box<dyn VideoSource>,
        embedder: Box<dyn Embedder>,
        detector: Box<dyn Detector>,
    ) -> Self {
        Self {
            config,
            source,
            embedder,
            detector,
        }
    }

    /// Engine backed by the configured decode backend and the usls models.
    /// Nothing is loaded until a search needs it.
    pub fn with_models(config: SearchConfig, models: &ModelConfig) -> Self {
        let source = Box::new(BackendSource::new(&config.backend));
        Self::new(
            config,
            source,
            Box::new(ClipEmbedder::new(models)),
            Box::new(RtDetrDetector::new(models)),
        )
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn threshold_for(&self, request: &SearchRequest) -> f32 {
        request.score_threshold.unwrap_or(match request.mode() {
            SearchMode::Category => self.config.confidence_threshold,
            SearchMode::Image | SearchMode::Text => self.config.similarity_threshold,
        })
    }

    /// Builds the query and returns the lazy match sequence.
    ///
    /// Session-fatal problems (no usable query, model cannot load) are
    /// returned here, before any video is opened.
    pub fn search<'a>(
        &'a mut self,
        request: &SearchRequest,
        handle: &'a SearchHandle,
        reporter: Reporter,
    ) -> Result<Matches<'a>, SearchError> {
        let threshold = self.threshold_for(request);
        let MatchEngine {
            config,
            source,
            embedder,
            detector,
        } = self;

        let query = QueryEncoder::new(&mut **embedder).encode(&request.query)?;
        let scorer = match query {
            QueryRepresentation::Embedding(query) => Scorer::Embedding { embedder, query },
            QueryRepresentation::Category(label) => {
                detector
                    .ensure_loaded()
                    .map_err(|e| SearchError::model_unavailable("detection", e))?;
                Scorer::Category { detector, label }
            }
        };

        tracing::info!(
            "Starting {:?} search over {} videos (threshold {:.3})",
            request.mode(),
            request.video_paths.len(),
            threshold
        );

        Ok(Matches {
            config,
            source: &**source,
            scorer,
            threshold,
            videos: request.video_paths.clone(),
            next_video: 0,
            current: None,
            handle,
            reporter,
            state: ScanState::Running,
        })
    }

    /// Runs a search to completion without a session.
    pub fn search_all(&mut self, request: &SearchRequest) -> Result<Vec<MatchRecord>, SearchError> {
        let handle = SearchHandle::new();
        self.search(request, &handle, Reporter::silent())?.collect()
    }
}

enum Scorer<'a> {
    Embedding {
        embedder: &'a mut Box<dyn Embedder>,
        query: Vec<f32>,
    },
    Category {
        detector: &'a mut Box<dyn Detector>,
        label: String,
    },
}

impl Scorer<'_> {
    fn score(&mut self, sample: &Sample) -> Result<f32, SearchError> {
        let image =
            mat_to_dynamic_image(&sample.image).map_err(|e| SearchError::FrameDecode {
                path: sample.video_path.clone(),
                frame_index: sample.frame_index,
                reason: format!("{:#}", e),
            })?;
        let inference_error = |e: anyhow::Error| SearchError::Inference {
            path: sample.video_path.clone(),
            frame_index: sample.frame_index,
            reason: format!("{:#}", e),
        };

        match self {
            Scorer::Embedding { embedder, query } => {
                let frame = embedder.embed_image(&image).map_err(inference_error)?;
                cosine(query.as_slice(), &frame).map_err(inference_error)
            }
            Scorer::Category { detector, label } => {
                let detections = detector.detect(&image).map_err(inference_error)?;
                Ok(category_score(&detections, label))
            }
        }
    }
}

/// Highest confidence among detections whose label contains, or is contained
/// by, the query label (case-insensitive). 0.0 when nothing relevant was seen.
pub fn category_score(detections: &[Detection], query_label: &str) -> f32 {
    detections
        .iter()
        .filter(|d| {
            let label = d.label.trim().to_lowercase();
            !label.is_empty() && (label.contains(query_label) || query_label.contains(&label))
        })
        .map(|d| d.confidence)
        .fold(0.0, f32::max)
}

/// Whether a sample is far enough from the last accepted match. Inclusive.
pub fn outside_dedup_window(last_match: Option<usize>, frame_index: usize, gap: usize) -> bool {
    last_match.map_or(true, |last| frame_index.saturating_sub(last) >= gap)
}

struct VideoScan {
    /// 1-based position in the request
    index: usize,
    sampler: FrameSampler,
    last_match_frame: Option<usize>,
    min_frame_gap: usize,
    processed: usize,
    estimate: usize,
    matches: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum ScanState {
    Running,
    Completed,
    Stopped,
    Failed(String),
}

/// Lazy, one-shot sequence of matches. Dropping it releases the open video.
pub struct Matches<'a> {
    config: &'a SearchConfig,
    source: &'a dyn VideoSource,
    scorer: Scorer<'a>,
    threshold: f32,
    videos: Vec<String>,
    next_video: usize,
    current: Option<VideoScan>,
    handle: &'a SearchHandle,
    reporter: Reporter,
    state: ScanState,
}

impl Matches<'_> {
    /// How the scan ended, `None` while it is still running.
    pub fn outcome(&self) -> Option<SearchOutcome> {
        match &self.state {
            ScanState::Running => None,
            ScanState::Completed => Some(SearchOutcome::Completed),
            ScanState::Stopped => Some(SearchOutcome::Stopped),
            ScanState::Failed(reason) => Some(SearchOutcome::Failed {
                reason: reason.clone(),
            }),
        }
    }

    fn total_videos(&self) -> usize {
        self.videos.len()
    }

    fn open_next_video(&mut self) {
        let index = self.next_video + 1;
        let path = self.videos[self.next_video].clone();
        self.next_video += 1;
        let total = self.total_videos();

        tracing::info!("Searching video {}/{}: {}", index, total, path);
        self.reporter
            .message(StatusMessage::searching_video(&path, index, total));
        self.reporter.progress(ProgressEvent::Video {
            completed_count: index - 1,
            total_videos: total,
        });

        match FrameSampler::open(self.source, &path, self.config) {
            Ok(sampler) => {
                let min_frame_gap = self.config.min_frame_gap(sampler.fps());
                let estimate = sampler.estimated_samples();
                tracing::debug!(
                    "{}: fps={:.2}, stride={}, dedup gap={} frames, ~{} samples",
                    path,
                    sampler.fps(),
                    sampler.stride(),
                    min_frame_gap,
                    estimate
                );
                self.current = Some(VideoScan {
                    index,
                    sampler,
                    last_match_frame: None,
                    min_frame_gap,
                    processed: 0,
                    estimate,
                    matches: 0,
                });
            }
            Err(e) => {
                tracing::warn!("{}", e);
                self.reporter.error(&e);
                self.reporter
                    .message(StatusMessage::video_unopenable(&path, &e.to_string()));
                self.reporter.progress(ProgressEvent::Video {
                    completed_count: index,
                    total_videos: total,
                });
            }
        }
    }

    fn finish_video(&mut self) {
        if let Some(scan) = self.current.take() {
            tracing::info!(
                "Finished video {}/{}: {} samples, {} matches",
                scan.index,
                self.total_videos(),
                scan.processed,
                scan.matches
            );
            self.reporter.progress(ProgressEvent::Video {
                completed_count: scan.index,
                total_videos: self.total_videos(),
            });
        }
    }

    fn frame_progress(&self) {
        let Some(scan) = &self.current else {
            return;
        };
        if scan.estimate > 1 {
            self.reporter.progress(ProgressEvent::Frame {
                video_index: scan.index,
                processed_samples: scan.processed,
                total_samples_estimate: scan.estimate.max(scan.processed),
                total_videos: self.total_videos(),
            });
        }
    }

    fn halt(&mut self) {
        if let Some(scan) = self.current.take() {
            tracing::info!(
                "Search stopped in video {} after {} samples",
                scan.index,
                scan.processed
            );
        }
        self.state = ScanState::Stopped;
    }

    fn report_skipped(&self, err: &SearchError) {
        tracing::warn!("{}", err);
        self.reporter.error(err);
        match err {
            SearchError::FrameDecode {
                path, frame_index, ..
            }
            | SearchError::Inference {
                path, frame_index, ..
            } => {
                self.reporter.message(StatusMessage::frame_skipped(
                    path,
                    *frame_index,
                    &err.to_string(),
                ));
            }
            SearchError::TruncatedVideo {
                path,
                frame_index,
                reason,
            } => {
                self.reporter
                    .message(StatusMessage::video_truncated(path, *frame_index, reason));
            }
            _ => {}
        }
    }
}

/// Scores one sample against the query, honouring the dedup window.
fn evaluate(
    scan: &mut VideoScan,
    scorer: &mut Scorer<'_>,
    threshold: f32,
    sample: &Sample,
) -> Result<Option<MatchRecord>, SearchError> {
    // Inside the window nothing can be accepted, so skip the inference
    if !outside_dedup_window(scan.last_match_frame, sample.frame_index, scan.min_frame_gap) {
        tracing::debug!("frame {}: inside dedup window", sample.frame_index);
        return Ok(None);
    }

    let score = scorer.score(sample)?;
    tracing::debug!("frame {}: score {:.4}", sample.frame_index, score);
    if score < threshold {
        return Ok(None);
    }

    scan.last_match_frame = Some(sample.frame_index);
    scan.matches += 1;
    Ok(Some(MatchRecord {
        video_path: sample.video_path.clone(),
        frame_index: sample.frame_index,
        timestamp_ms: sample.timestamp_ms,
        score,
    }))
}

impl Iterator for Matches<'_> {
    type Item = Result<MatchRecord, SearchError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.state != ScanState::Running {
                return None;
            }
            if self.handle.is_stopped() {
                self.halt();
                return None;
            }

            let Some(scan) = self.current.as_mut() else {
                if self.next_video >= self.videos.len() {
                    tracing::info!("Search completed over {} videos", self.total_videos());
                    self.state = ScanState::Completed;
                    return None;
                }
                self.open_next_video();
                continue;
            };

            let Some(item) = scan.sampler.next() else {
                self.finish_video();
                continue;
            };

            // Decoding may have taken a while; look again before inference
            if self.handle.is_stopped() {
                self.halt();
                return None;
            }

            let Some(scan) = self.current.as_mut() else {
                continue;
            };
            scan.processed += 1;
            let result =
                item.and_then(|sample| evaluate(scan, &mut self.scorer, self.threshold, &sample));
            self.frame_progress();

            match result {
                Ok(Some(record)) => {
                    tracing::info!(
                        "Match in {} at {}ms (score {:.3})",
                        record.video_path,
                        record.timestamp_ms,
                        record.score
                    );
                    self.reporter.message(StatusMessage::found_match(&record));
                    return Some(Ok(record));
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!("Search aborted: {}", e);
                    self.current = None;
                    self.state = ScanState::Failed(e.to_string());
                    return Some(Err(e));
                }
                Err(e) => self.report_skipped(&e),
            }
        }
    }
}
