mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::AggregatorHandle;
use crate::probes::ProcessTable;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub handle: AggregatorHandle,
    /// Worker processes registered over HTTP; also the ticker's status provider.
    pub processes: Arc<ProcessTable>,
}

/// All routes, without body limits or middleware.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/workflows", get(handlers::list_workflows))
        .route(
            "/workflows/{name}",
            get(handlers::get_workflow).delete(handlers::delete_workflow),
        )
        .route("/events", post(handlers::post_event))
        .route("/events/stream", get(handlers::stream_events))
        .route("/sweep", post(handlers::sweep))
        .route(
            "/processes/{execution_id}",
            put(handlers::register_process).delete(handlers::remove_process),
        )
        .with_state(state)
}

/// Start the HTTP adapter and run until the listener fails or ctrl-c.
pub async fn serve(
    host: &str,
    port: u16,
    max_body: usize,
    handle: AggregatorHandle,
    processes: Arc<ProcessTable>,
) -> Result<()> {
    let state = Arc::new(AppState { handle, processes });

    let app = router(state)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("FlowPulse server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for ctrl-c");
            }
        })
        .await?;

    Ok(())
}
