// Registry of searches started over HTTP
//
// Each search runs in its own session. A pump thread copies the session's
// events into a replay log that status requests and SSE clients read at their
// own pace. Progress is kept as a single latest value outside the log.

use anyhow::Result;
use chrono::{DateTime, Utc};
use moment_search::search::{
    MatchEngine, MatchRecord, ProgressEvent, SearchEvent, SearchHandle, SearchMode,
    SearchOutcome, SearchRequest, SearchSession,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

/// Finished searches kept for status queries; older ones are evicted.
const MAX_FINISHED_SEARCHES: usize = 32;

/// Messages and errors kept per search. Matches and the final event are always kept.
const MAX_LOGGED_NOTICES: usize = 10_000;

lazy_static::lazy_static! {
    static ref SEARCH_REGISTRY: RwLock<HashMap<String, Arc<SearchEntry>>> =
        RwLock::new(HashMap::new());
}

static NEXT_SEARCH: AtomicU64 = AtomicU64::new(1);

/// Snapshot returned by the status endpoints
#[derive(Serialize, Debug, Clone)]
pub struct SearchStatus {
    pub id: String,
    pub mode: SearchMode,
    pub video_count: usize,
    pub started_at: DateTime<Utc>,
    pub is_active: bool,
    pub progress: Option<ProgressEvent>,
    pub matches: Vec<MatchRecord>,
    pub outcome: Option<SearchOutcome>,
    pub dropped_notices: usize,
}

#[derive(Default)]
struct EventLog {
    replay: Vec<SearchEvent>,
    progress: Option<ProgressEvent>,
    notices: usize,
    dropped_notices: usize,
    outcome: Option<SearchOutcome>,
}

impl EventLog {
    fn push(&mut self, event: SearchEvent) {
        match &event {
            SearchEvent::Progress(p) => {
                self.progress = Some(p.clone());
                return;
            }
            SearchEvent::Message(_) | SearchEvent::Error(_) => {
                if self.notices >= MAX_LOGGED_NOTICES {
                    self.dropped_notices += 1;
                    return;
                }
                self.notices += 1;
            }
            SearchEvent::Finished(outcome) => self.outcome = Some(outcome.clone()),
            SearchEvent::Match(_) => {}
        }
        self.replay.push(event);
    }
}

pub struct SearchEntry {
    pub id: String,
    pub mode: SearchMode,
    pub video_count: usize,
    pub started_at: DateTime<Utc>,
    handle: Arc<SearchHandle>,
    log: RwLock<EventLog>,
}

impl SearchEntry {
    fn new(id: String, request: &SearchRequest, handle: Arc<SearchHandle>) -> Self {
        Self {
            id,
            mode: request.mode(),
            video_count: request.video_paths.len(),
            started_at: Utc::now(),
            handle,
            log: RwLock::new(EventLog::default()),
        }
    }

    fn record(&self, event: SearchEvent) {
        if let Ok(mut log) = self.log.write() {
            log.push(event);
        }
    }

    /// Replayable events from `cursor` on, and whether the log is complete.
    pub fn events_since(&self, cursor: usize) -> (Vec<SearchEvent>, bool) {
        let Ok(log) = self.log.read() else {
            return (Vec::new(), true);
        };
        let batch = log.replay.get(cursor..).map(|s| s.to_vec()).unwrap_or_default();
        (batch, log.outcome.is_some())
    }

    pub fn latest_progress(&self) -> Option<ProgressEvent> {
        self.log.read().ok()?.progress.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.log.read().map(|log| log.outcome.is_some()).unwrap_or(true)
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn status(&self) -> SearchStatus {
        let (progress, matches, outcome, dropped_notices) = match self.log.read() {
            Ok(log) => {
                let matches = log
                    .replay
                    .iter()
                    .filter_map(|event| match event {
                        SearchEvent::Match(record) => Some(record.clone()),
                        _ => None,
                    })
                    .collect();
                (log.progress.clone(), matches, log.outcome.clone(), log.dropped_notices)
            }
            Err(_) => (None, Vec::new(), None, 0),
        };
        SearchStatus {
            id: self.id.clone(),
            mode: self.mode,
            video_count: self.video_count,
            started_at: self.started_at,
            is_active: outcome.is_none(),
            progress,
            matches,
            outcome,
            dropped_notices,
        }
    }
}

fn next_search_id() -> String {
    let n = NEXT_SEARCH.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), n)
}

pub fn get_search(id: &str) -> Option<Arc<SearchEntry>> {
    SEARCH_REGISTRY.read().ok()?.get(id).cloned()
}

pub fn list_searches() -> Vec<Arc<SearchEntry>> {
    let mut entries: Vec<Arc<SearchEntry>> = SEARCH_REGISTRY
        .read()
        .map(|registry| registry.values().cloned().collect())
        .unwrap_or_default();
    entries.sort_by_key(|e| e.started_at);
    entries
}

/// Drops the oldest finished searches beyond `keep`. Active searches are never evicted.
fn evict_finished(registry: &mut HashMap<String, Arc<SearchEntry>>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, String)> = registry
        .values()
        .filter(|entry| entry.is_finished())
        .map(|entry| (entry.started_at, entry.id.clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        tracing::debug!("Evicting finished search {}", id);
        registry.remove(&id);
    }
}

fn register_search(entry: Arc<SearchEntry>) {
    tracing::info!("Registering search {}", entry.id);
    if let Ok(mut registry) = SEARCH_REGISTRY.write() {
        evict_finished(&mut registry, MAX_FINISHED_SEARCHES);
        registry.insert(entry.id.clone(), entry);
    }
}

/// Starts a session for `request` and tracks it under a fresh id.
pub fn start_search(engine: MatchEngine, request: SearchRequest) -> Result<Arc<SearchEntry>> {
    let entry_request = request.clone();
    let session = SearchSession::start(engine, request)?;
    let entry = Arc::new(SearchEntry::new(
        next_search_id(),
        &entry_request,
        session.handle(),
    ));
    register_search(entry.clone());

    let pump_entry = entry.clone();
    thread::Builder::new()
        .name(format!("search-events-{}", entry.id))
        .spawn(move || {
            for event in session.events().iter() {
                pump_entry.record(event);
            }
            if let Err(e) = session.join() {
                tracing::error!("Search {} worker failed: {}", pump_entry.id, e);
            }
        })?;

    Ok(entry)
}
