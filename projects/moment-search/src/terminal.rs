// Terminal host: runs one search session and renders its events

use crate::cli::{Args, SearchArgs};
use anyhow::{anyhow, Context, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use moment_search::search::{
    format_ms, MatchEngine, MatchRecord, ProgressEvent, SearchEvent, SearchOutcome,
    SearchRequest, SearchSession,
};
use moment_search::video::collect_videos;
use serde::Serialize;
use std::path::Path;
use std::time::Instant;

/// One CSV row per match.
#[derive(Serialize, Debug)]
struct CsvRow<'a> {
    video_path: &'a str,
    frame_index: usize,
    timestamp_ms: u64,
    time: String,
    score: f32,
}

impl<'a> From<&'a MatchRecord> for CsvRow<'a> {
    fn from(record: &'a MatchRecord) -> Self {
        Self {
            video_path: &record.video_path,
            frame_index: record.frame_index,
            timestamp_ms: record.timestamp_ms,
            time: format_ms(record.timestamp_ms),
            score: record.score,
        }
    }
}

fn write_csv(path: &Path, records: &[MatchRecord]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;
    for record in records {
        writer.serialize(CsvRow::from(record))?;
    }
    writer.flush()?;
    Ok(())
}

/// Human-readable match line.
fn describe(record: &MatchRecord) -> String {
    format!(
        "{}  {}  (frame {}, score {:.3})",
        format_ms(record.timestamp_ms),
        record.video_path,
        record.frame_index,
        record.score
    )
}

struct Bars {
    multi: MultiProgress,
    videos: ProgressBar,
    samples: ProgressBar,
}

impl Bars {
    fn new(total_videos: usize) -> Result<Self> {
        let multi = MultiProgress::new();
        let videos = multi.add(ProgressBar::new(total_videos as u64));
        videos.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] videos [{bar:40.cyan/blue}] {pos}/{len}",
                )?
                .progress_chars("#>-"),
        );
        let samples = multi.add(ProgressBar::new(0));
        samples.set_style(
            ProgressStyle::default_bar()
                .template("  frames [{bar:40.yellow/blue}] {pos}/{len} ({per_sec:.1}, {eta})")?
                .progress_chars("#>-"),
        );
        Ok(Self {
            multi,
            videos,
            samples,
        })
    }

    fn update(&self, progress: &ProgressEvent) {
        match progress {
            ProgressEvent::Video {
                completed_count, ..
            } => {
                self.videos.set_position(*completed_count as u64);
                self.samples.reset();
                self.samples.set_length(0);
            }
            ProgressEvent::Frame {
                processed_samples,
                total_samples_estimate,
                ..
            } => {
                self.samples.set_length(*total_samples_estimate as u64);
                self.samples.set_position(*processed_samples as u64);
            }
        }
    }

    fn println(&self, line: &str) {
        if self.multi.println(line).is_err() {
            eprintln!("{}", line);
        }
    }

    fn finish(&self) {
        self.samples.finish_and_clear();
        self.videos.finish();
    }
}

pub async fn run_search(args: &Args, search: &SearchArgs) -> Result<()> {
    let mut config = args.search_config()?;
    search.apply_overrides(&mut config);

    let videos = collect_videos(&search.inputs);
    if videos.is_empty() {
        return Err(anyhow!("No videos found under {:?}", search.inputs));
    }
    let mut request = SearchRequest::new(
        videos
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect(),
        search.query_input(),
    );
    request.score_threshold = search.threshold;

    let engine = MatchEngine::with_models(config, &args.model_config());
    let session = SearchSession::start(engine, request)?;

    let handle = session.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping search");
            handle.stop();
        }
    });

    let total_videos = videos.len();
    let json = search.json;
    let start = Instant::now();
    let (records, outcome) =
        tokio::task::spawn_blocking(move || render_events(session, total_videos, json))
            .await??;

    if let Some(path) = &search.csv {
        write_csv(path, &records)?;
        tracing::info!("Wrote {} matches to {:?}", records.len(), path);
    }

    tracing::info!(
        "{} matches in {} videos ({:.1?})",
        records.len(),
        total_videos,
        start.elapsed()
    );
    match outcome {
        SearchOutcome::Failed { reason } => Err(anyhow!("Search failed: {}", reason)),
        SearchOutcome::Stopped | SearchOutcome::Completed => Ok(()),
    }
}

fn render_events(
    session: SearchSession,
    total_videos: usize,
    json: bool,
) -> Result<(Vec<MatchRecord>, SearchOutcome)> {
    let bars = Bars::new(total_videos)?;
    let mut records = Vec::new();
    let mut outcome = None;

    for event in session.events().iter() {
        match event {
            SearchEvent::Match(record) => {
                if json {
                    bars.println(&serde_json::to_string(&record)?);
                } else {
                    bars.println(&describe(&record));
                }
                records.push(record);
            }
            SearchEvent::Progress(progress) => bars.update(&progress),
            SearchEvent::Message(message) => tracing::debug!("{}", message.render()),
            // Already logged by the engine
            SearchEvent::Error(_) => {}
            SearchEvent::Finished(result) => outcome = Some(result),
        }
    }
    bars.finish();
    session.join()?;

    let outcome = outcome.ok_or_else(|| anyhow!("Search ended without an outcome"))?;
    Ok((records, outcome))
}
