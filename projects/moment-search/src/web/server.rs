use crate::web::api::{
    get_search_handler, list_searches_handler, search_events_handler, start_search_handler,
    stop_search_handler,
};
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use moment_search::{ModelConfig, SearchConfig};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Settings every search started over HTTP runs with
pub struct AppState {
    pub search_config: SearchConfig,
    pub model_config: ModelConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/searches",
            get(list_searches_handler).post(start_search_handler),
        )
        .route("/api/searches/:id", get(get_search_handler))
        .route("/api/searches/:id/events", get(search_events_handler))
        .route("/api/searches/:id/stop", post(stop_search_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(host: IpAddr, port: u16, state: AppState) -> Result<()> {
    let mut current_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Tokio requires a non-blocking socket
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port.wrapping_add(1);
                if current_port == 0 {
                    return Err(anyhow::anyhow!("No available ports found"));
                }
            }
        }
    };

    let app = router(Arc::new(state));

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Moment search server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app).await?;

    Ok(())
}
