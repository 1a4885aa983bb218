//! REST server for Undertow
//!
//! Exposes the download façade over JSON. Every handler is a thin
//! translation onto [`DownloadManagerHandle`].

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use undertow_core::DownloadManagerHandle;
use undertow_core::config::DownloadDefaults;

use crate::handlers::{add_download, get_downloads, remove_download, stream_file, update_download};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: DownloadManagerHandle,
    /// Fallbacks for options a `PUT /downloads` leaves out.
    pub defaults: DownloadDefaults,
}

impl AppState {
    pub fn new(engine: DownloadManagerHandle, defaults: DownloadDefaults) -> Self {
        Self { engine, defaults }
    }
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/downloads", get(get_downloads).put(add_download))
        .route(
            "/downloads/{infohash}",
            axum::routing::delete(remove_download).patch(update_download),
        )
        .route("/downloads/{infohash}/stream/{file_index}", get(stream_file))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API on `addr` until `shutdown` resolves.
///
/// # Errors
/// - `std::io::Error` - the address could not be bound or serving failed
pub async fn run_server<F>(addr: SocketAddr, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("REST API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
