use crate::web::searches::{get_search, list_searches, start_search, SearchStatus};
use crate::web::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use moment_search::search::{MatchEngine, SearchEvent, SearchRequest};
use moment_search::video::collect_videos;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Expands directories in the request into their video files.
fn expand_request(mut request: SearchRequest) -> SearchRequest {
    let inputs: Vec<PathBuf> = request.video_paths.iter().map(PathBuf::from).collect();
    request.video_paths = collect_videos(&inputs)
        .into_iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    request
}

fn event_name(event: &SearchEvent) -> &'static str {
    match event {
        SearchEvent::Match(_) => "match",
        SearchEvent::Progress(_) => "progress",
        SearchEvent::Message(_) => "message",
        SearchEvent::Error(_) => "error",
        SearchEvent::Finished(_) => "finished",
    }
}

pub async fn start_search_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchStatus>, StatusCode> {
    let request = expand_request(request);
    if request.video_paths.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let engine = MatchEngine::with_models(state.search_config.clone(), &state.model_config);
    match start_search(engine, request) {
        Ok(entry) => Ok(Json(entry.status())),
        Err(e) => {
            tracing::error!("Failed to start search: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn list_searches_handler() -> Json<Vec<SearchStatus>> {
    Json(list_searches().iter().map(|e| e.status()).collect())
}

pub async fn get_search_handler(Path(id): Path<String>) -> Result<Json<SearchStatus>, StatusCode> {
    get_search(&id)
        .map(|entry| Json(entry.status()))
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn stop_search_handler(Path(id): Path<String>) -> StatusCode {
    match get_search(&id) {
        Some(entry) => {
            tracing::info!("Stop requested for search {}", id);
            entry.stop();
            StatusCode::ACCEPTED
        }
        None => StatusCode::NOT_FOUND,
    }
}

/// Replays the search's events from the start, then follows it until it finishes.
///
/// Progress is sent only when it changed since the last poll.
pub async fn search_events_handler(
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, StatusCode> {
    let entry = get_search(&id).ok_or(StatusCode::NOT_FOUND)?;

    let stream = async_stream::stream! {
        let mut cursor = 0;
        let mut last_progress = None;
        loop {
            if let Some(p) = entry.latest_progress() {
                if last_progress.as_ref() != Some(&p) {
                    let event = SearchEvent::Progress(p.clone());
                    yield Event::default().event(event_name(&event)).json_data(&event);
                    last_progress = Some(p);
                }
            }
            let (batch, done) = entry.events_since(cursor);
            cursor += batch.len();
            for event in batch {
                yield Event::default().event(event_name(&event)).json_data(&event);
            }
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use moment_search::search::{QueryInput, SearchOutcome};

    #[test]
    fn test_event_names() {
        assert_eq!(
            event_name(&SearchEvent::Finished(SearchOutcome::Completed)),
            "finished"
        );
    }

    #[test]
    fn test_expand_request_keeps_files_and_walks_dirs() {
        let dir = std::env::temp_dir().join(format!("moment-search-api-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("clip.mov"), b"").unwrap();

        let request = SearchRequest::new(
            vec!["direct.mp4".to_string(), dir.to_string_lossy().to_string()],
            QueryInput::Text("sunset".to_string()),
        );
        let request = expand_request(request);
        assert_eq!(request.video_paths.len(), 2);
        assert_eq!(request.video_paths[0], "direct.mp4");
        assert!(request.video_paths[1].ends_with("clip.mov"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
