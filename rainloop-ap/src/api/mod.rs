//! HTTP control surface
//!
//! A thin axum layer over [`EngineHandle`]: transport control, volume,
//! host visibility, diagnostics and an SSE event stream.

pub mod handlers;
pub mod sse;

use crate::service::EngineHandle;
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared handler state
#[derive(Clone)]
pub struct AppContext {
    pub engine: EngineHandle,
    pub port: u16,
}

pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Transport
        .route("/playback/state", get(handlers::get_state))
        .route("/playback/play", post(handlers::play))
        .route("/playback/pause", post(handlers::pause))
        .route("/playback/stop", post(handlers::stop))
        // Output
        .route("/audio/volume", get(handlers::get_volume).post(handlers::set_volume))
        .route("/audio/devices", get(handlers::list_audio_devices))
        // Host integration
        .route("/host/visibility", post(handlers::set_visibility))
        .route("/diagnostics", get(handlers::diagnostics))
        .route("/events", get(sse::event_stream))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the API on `0.0.0.0:port` until `shutdown` resolves
pub async fn run(ctx: AppContext, shutdown: impl Future<Output = ()> + Send + 'static) -> crate::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], ctx.port));
    let app = build_router(ctx);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP server stopped");
    Ok(())
}
