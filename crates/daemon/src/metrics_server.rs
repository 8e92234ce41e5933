//! Read-only status endpoint.

use axum::{extract::State, routing::get, Json, Router};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::{SharedStatus, StatusSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let snapshot = status.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Bind the status endpoint's listener.
pub async fn bind_status_listener(listen: &str) -> Result<TcpListener, ServerError> {
    Ok(TcpListener::bind(listen).await?)
}

/// Serve the status endpoint on `listener` until `shutdown` is cancelled.
pub async fn serve_status(
    listener: TcpListener,
    status: SharedStatus,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_status_router(status);
    info!(addr = %listener.local_addr()?, "status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Bind and serve the status endpoint until `shutdown` is cancelled.
///
/// # Arguments
/// * `status` - Shared snapshot to serve
/// * `listen` - Socket address, e.g. `127.0.0.1:7878`
pub async fn run_status_server(
    status: SharedStatus,
    listen: &str,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = bind_status_listener(listen).await?;
    serve_status(listener, status, shutdown).await
}
