//! issue-tally HTTP trigger surface.
//!
//! Exposes the [`orchestrator::RunRegistry`] over HTTP with [`axum`]. Starting a
//! run returns immediately with `202 Accepted`; the run executes in the
//! background and is polled through its status URL.
//!
//! ## Routes
//!
//! | Method | Path | Effect |
//! |--------|------|--------|
//! | `POST` | `/api/orchestrators/{org}` | Start a run over every repository of `org` |
//! | `GET` | `/api/runs` | List known runs, newest first |
//! | `GET` | `/api/runs/{id}` | Status and, once finished, the run report |
//! | `DELETE` | `/api/runs/{id}` | Request cancellation of a running run |
//! | `POST` | `/api/runs/{id}/retry` | Start a run over the failed subset of `id` |
//! | `GET` | `/health` | Liveness check |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Request parsing and status-code mapping only; every
//! decision about a run is made by the orchestrator.

mod error;
mod routes;

use std::future::Future;

use axum::routing::{get, post};
use axum::Router;
use orchestrator::RunRegistry;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use error::AppError;

/// Builds the application router over `registry`.
pub fn router(registry: RunRegistry) -> Router {
    Router::new()
        .route("/api/orchestrators/{org}", post(routes::start_run))
        .route("/api/runs", get(routes::list_runs))
        .route(
            "/api/runs/{id}",
            get(routes::get_run).delete(routes::cancel_run),
        )
        .route("/api/runs/{id}/retry", post(routes::retry_run))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Serves the router on `listener` until `shutdown` resolves.
///
/// In-flight runs are cancelled once the server stops accepting requests.
pub async fn serve<F>(listener: TcpListener, registry: RunRegistry, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Listening");
    }

    let app = router(registry.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("Shutdown signal received, cancelling in-flight runs");
            registry.shutdown();
        })
        .await
}
