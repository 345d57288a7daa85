//! Prometheus metrics shared by the pipeline and the HTTP server.

use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

const PREFIX: &str = "call_analytics";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref FILES_PROCESSED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_files_processed_total"),
            "Files the worker finished, by outcome"
        ),
        &["outcome"]
    )
    .expect("Failed to create files_processed_total metric");

    pub static ref STAGE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_stage_duration_seconds"),
            "Wall-clock duration of each pipeline stage"
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]),
        &["stage"]
    )
    .expect("Failed to create stage_duration_seconds metric");

    pub static ref UPLOADS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_uploads_total"),
            "Uploaded blobs by ingestion result"
        ),
        &["result"]
    )
    .expect("Failed to create uploads_total metric");

    pub static ref QUEUE_DEPTH: Gauge = Gauge::new(
        format!("{PREFIX}_queue_depth"),
        "Files waiting in the processing queue"
    )
    .expect("Failed to create queue_depth metric");

    pub static ref WS_CONNECTIONS: Gauge = Gauge::new(
        format!("{PREFIX}_ws_connections"),
        "Open progress WebSocket connections"
    )
    .expect("Failed to create ws_connections metric");
}

/// Register every metric with the shared registry. Safe to call once at
/// startup; re-registration errors are logged and ignored so tests can
/// initialize freely.
pub fn init_metrics() {
    let registrations: Vec<Result<(), prometheus::Error>> = vec![
        REGISTRY.register(Box::new(FILES_PROCESSED_TOTAL.clone())),
        REGISTRY.register(Box::new(STAGE_DURATION_SECONDS.clone())),
        REGISTRY.register(Box::new(UPLOADS_TOTAL.clone())),
        REGISTRY.register(Box::new(QUEUE_DEPTH.clone())),
        REGISTRY.register(Box::new(WS_CONNECTIONS.clone())),
    ];
    for result in registrations {
        if let Err(e) = result {
            warn!("Metric registration skipped: {}", e);
        }
    }
}

/// `GET /metrics` handler.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&REGISTRY.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        )
            .into_response(),
    }
}
