pub mod mjpeg;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{RelayError, Result};
use crate::pipeline::{PipelineStatus, StreamPipeline};

/// `GET /` live stream, `GET /status` progress snapshot, 404 for the rest
pub fn router(pipeline: Arc<StreamPipeline>) -> Router {
    Router::new()
        .route("/", get(stream_handler))
        .route("/status", get(status_handler))
        .fallback(not_found)
        .with_state(pipeline)
}

async fn stream_handler(
    State(pipeline): State<Arc<StreamPipeline>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    info!(stream = %pipeline.name(), %peer, "Client connected");
    mjpeg::response(pipeline)
}

async fn status_handler(State(pipeline): State<Arc<StreamPipeline>>) -> Json<PipelineStatus> {
    Json(pipeline.status())
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| RelayError::Bind { addr, source })
}

/// Serve one pipeline until its shutdown token fires.
pub async fn serve(listener: TcpListener, pipeline: Arc<StreamPipeline>) -> Result<()> {
    let cancel = pipeline.cancel_token().clone();
    let app = router(pipeline).into_make_service_with_connect_info::<SocketAddr>();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
