mod http;
pub mod protocol;
mod ws;

use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tokio_util::sync::CancellationToken;

use kafka_ui_store::Store;

pub use http::collect_topics;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bind api :{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("axum serve: {0}")]
    Serve(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub port: u16,
    /// Capacity of the per-connection outbound frame queue.
    pub ws_buffer: usize,
    /// How long `GET /api/topics` waits for another topic before answering.
    pub topics_idle: Duration,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            port: 9002,
            ws_buffer: 64,
            topics_idle: Duration::from_millis(250),
        }
    }
}

#[derive(Clone)]
struct AppState {
    store: Store,
    ws_buffer: usize,
    topics_idle: Duration,
    shutdown: CancellationToken,
}

pub fn router(store: Store, settings: &ApiSettings, shutdown: CancellationToken) -> Router {
    let state = AppState {
        store,
        ws_buffer: settings.ws_buffer.max(1),
        topics_idle: settings.topics_idle,
        shutdown,
    };

    Router::new()
        .route("/api/topics", get(http::handle_list_topics))
        .route("/ws", get(ws::handle_ws))
        .with_state(state)
}

/// HTTP + WebSocket API server. Returns once `shutdown` fires and every
/// connection has drained.
pub async fn run(
    store: Store,
    settings: ApiSettings,
    shutdown: CancellationToken,
) -> Result<(), ApiError> {
    let port = settings.port;
    let app = router(store, &settings, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|source| ApiError::Bind { port, source })?;
    tracing::info!(port, "api server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ApiError::Serve)?;

    tracing::info!("api server stopped");
    Ok(())
}
