//! HTTP endpoint exposing the metrics registry.

use std::future::Future;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use log::{error, info};
use tokio::net::TcpListener;

use crate::metrics::ExporterMetrics;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router(metrics: ExporterMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<ExporterMetrics>) -> impl IntoResponse {
    match metrics.gather() {
        Ok(body) => Ok(([(header::CONTENT_TYPE, TEXT_FORMAT)], body)),
        Err(e) => {
            error!("Failed to encode metrics: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Serves the metrics endpoint on `listener` until `shutdown` completes.
pub async fn serve<F>(listener: TcpListener, metrics: ExporterMetrics, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Serving metrics on http://{addr}/metrics");
    }
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(shutdown)
        .await
}
