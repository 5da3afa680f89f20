// Search session: runs one search on its own worker thread
//
// The host keeps the session, reads events from it and may ask it to stop.
// Every session ends with exactly one `Finished` event, including when the
// worker panics.

use super::engine::{MatchEngine, Reporter};
use super::types::{SearchEvent, SearchOutcome, SearchRequest, StatusMessage};
use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Cancellation flag shared between a session and its engine.
#[derive(Debug, Default)]
pub struct SearchHandle {
    stopped: AtomicBool,
}

impl SearchHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

/// Sends the terminal event when the worker leaves, however it leaves.
struct FinishGuard {
    tx: Sender<SearchEvent>,
    outcome: Option<SearchOutcome>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| SearchOutcome::Failed {
            reason: "search worker panicked".to_string(),
        });
        tracing::info!("Search finished: {:?}", outcome);
        let _ = self.tx.send(SearchEvent::Finished(outcome));
    }
}

pub struct SearchSession {
    handle: Arc<SearchHandle>,
    events: Receiver<SearchEvent>,
    worker: Option<JoinHandle<MatchEngine>>,
}

impl SearchSession {
    /// Starts the search in the background. The engine comes back from `join`.
    pub fn start(mut engine: MatchEngine, request: SearchRequest) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let handle = Arc::new(SearchHandle::new());
        let worker_handle = handle.clone();

        let worker = thread::Builder::new()
            .name("moment-search".to_string())
            .spawn(move || {
                run_search(&mut engine, &request, &worker_handle, tx);
                engine
            })
            .context("Failed to spawn search worker")?;

        Ok(Self {
            handle,
            events: rx,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> Arc<SearchHandle> {
        self.handle.clone()
    }

    /// Requests cancellation. Returns immediately.
    pub fn stop(&self) {
        tracing::info!("Stop requested");
        self.handle.stop();
    }

    /// Disconnects after the `Finished` event.
    pub fn events(&self) -> &Receiver<SearchEvent> {
        &self.events
    }

    /// Waits for the worker and hands the engine back for reuse.
    pub fn join(mut self) -> Result<MatchEngine> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("Search worker already joined"))?;
        worker
            .join()
            .map_err(|_| anyhow!("Search worker panicked"))
    }
}

impl Drop for SearchSession {
    fn drop(&mut self) {
        // Nobody is listening any more
        if self.worker.is_some() {
            self.handle.stop();
        }
    }
}

fn run_search(
    engine: &mut MatchEngine,
    request: &SearchRequest,
    handle: &SearchHandle,
    tx: Sender<SearchEvent>,
) {
    let mut guard = FinishGuard {
        tx: tx.clone(),
        outcome: None,
    };
    let reporter = Reporter::new(tx.clone());

    let outcome = match engine.search(request, handle, reporter.clone()) {
        Err(e) => {
            tracing::error!("Search could not start: {}", e);
            reporter.error(&e);
            reporter.message(StatusMessage::search_failed(&e.to_string()));
            SearchOutcome::Failed {
                reason: e.to_string(),
            }
        }
        Ok(mut matches) => {
            let mut failure = None;
            for item in matches.by_ref() {
                match item {
                    Ok(record) => {
                        if tx.send(SearchEvent::Match(record)).is_err() {
                            tracing::debug!("Event receiver dropped, stopping search");
                            handle.stop();
                        }
                    }
                    Err(e) => {
                        reporter.error(&e);
                        reporter.message(StatusMessage::search_failed(&e.to_string()));
                        failure = Some(e.to_string());
                    }
                }
            }
            match failure {
                Some(reason) => SearchOutcome::Failed { reason },
                None => matches.outcome().unwrap_or(SearchOutcome::Completed),
            }
        }
    };

    guard.outcome = Some(outcome);
}
