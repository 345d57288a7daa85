//! Route handlers and server wiring.

use std::net::SocketAddr;
use std::path::Path;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path as UrlPath, Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

use super::audio::stream_audio;
use super::state::*;
use super::websocket::ws_handler;
use crate::ingest::{IngestError, UploadedBlob};
use crate::metrics;
use crate::progress::stage_name;
use crate::store::{Analysis, FileStatus, ResultsFilter, ScoreQuote};

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
            details: None,
        }),
    )
        .into_response()
}

// === Upload ===

#[derive(Serialize)]
struct UploadResponse {
    file_ids: Vec<String>,
    operator: String,
    status: String,
    total_files: usize,
}

async fn upload(
    State(state): State<ServerState>,
    mut multipart: Multipart,
) -> Response {
    let mut operator_name = String::new();
    let mut blobs: Vec<UploadedBlob> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("malformed multipart body: {e}"),
                )
            }
        };
        let field_name = field.name().map(|s| s.to_string());
        match field_name.as_deref() {
            Some("operator_name") => {
                operator_name = field.text().await.unwrap_or_default();
            }
            Some("files") | Some("files[]") => {
                let filename = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                match field.bytes().await {
                    Ok(bytes) => blobs.push(UploadedBlob {
                        filename,
                        content: bytes.to_vec(),
                    }),
                    Err(e) => {
                        return error_response(
                            StatusCode::BAD_REQUEST,
                            format!("failed to read file field: {e}"),
                        )
                    }
                }
            }
            _ => {}
        }
    }

    match state.ingestion.ingest_batch(&operator_name, blobs).await {
        Ok(outcome) => {
            metrics::UPLOADS_TOTAL
                .with_label_values(&["accepted"])
                .inc_by(outcome.file_ids.len() as f64);
            Json(UploadResponse {
                file_ids: outcome.file_ids,
                operator: outcome.operator,
                status: "queued".to_string(),
                total_files: outcome.total_files,
            })
            .into_response()
        }
        Err(IngestError::BlankOperatorName) => error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "operator_name must not be blank",
        ),
        Err(e @ IngestError::BatchTooLarge(..)) => {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(IngestError::AllRejected(errors)) => {
            metrics::UPLOADS_TOTAL
                .with_label_values(&["rejected"])
                .inc_by(errors.len() as f64);
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "validation_error".to_string(),
                    details: serde_json::to_value(&errors).ok(),
                }),
            )
                .into_response()
        }
        Err(IngestError::Internal(e)) => {
            error!("Upload failed: {:#}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// === Results ===

#[derive(Debug, Deserialize)]
struct ResultsQuery {
    page: Option<usize>,
    limit: Option<usize>,
    operator: Option<String>,
    status: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    score_min: Option<i32>,
    score_max: Option<i32>,
    q: Option<String>,
}

#[derive(Serialize)]
struct AnalysisDto {
    standard: i32,
    loyalty: i32,
    kindness: i32,
    overall: i32,
    summary: String,
    quotes: Vec<ScoreQuote>,
    model: String,
    partial: bool,
}

impl From<Analysis> for AnalysisDto {
    fn from(a: Analysis) -> Self {
        Self {
            standard: a.standard,
            loyalty: a.loyalty,
            kindness: a.kindness,
            overall: a.overall,
            summary: a.summary,
            quotes: a.quotes,
            model: a.model,
            partial: a.partial,
        }
    }
}

#[derive(Serialize)]
struct ResultListItem {
    file_id: String,
    original_name: String,
    operator_id: Option<String>,
    operator_name: Option<String>,
    file_size: i64,
    duration_sec: Option<f64>,
    status: String,
    stage: i32,
    progress: i32,
    created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<AnalysisDto>,
}

#[derive(Serialize)]
struct PaginatedResults {
    items: Vec<ResultListItem>,
    total: usize,
    page: usize,
    limit: usize,
    pages: usize,
}

fn parse_date(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp())
        .ok()
}

async fn list_results(
    State(store): State<GuardedCallStore>,
    Query(query): Query<ResultsQuery>,
) -> Response {
    let status = match &query.status {
        Some(s) => match FileStatus::parse(s) {
            Some(status) => Some(status),
            None => return error_response(StatusCode::BAD_REQUEST, format!("unknown status: {s}")),
        },
        None => None,
    };
    let date_from = match &query.date_from {
        Some(v) => match parse_date(v) {
            Some(ts) => Some(ts),
            None => return error_response(StatusCode::BAD_REQUEST, "date_from must be RFC 3339"),
        },
        None => None,
    };
    let date_to = match &query.date_to {
        Some(v) => match parse_date(v) {
            Some(ts) => Some(ts),
            None => return error_response(StatusCode::BAD_REQUEST, "date_to must be RFC 3339"),
        },
        None => None,
    };

    let filter = ResultsFilter {
        page: query.page.unwrap_or(1).max(1),
        limit: query.limit.unwrap_or(20).clamp(1, 100),
        operator: query.operator.clone(),
        status,
        date_from,
        date_to,
        score_min: query.score_min,
        score_max: query.score_max,
        q: query.q.clone(),
    };

    match store.list_results(&filter) {
        Ok(page) => {
            let items = page
                .items
                .into_iter()
                .map(|row| ResultListItem {
                    file_id: row.record.id,
                    original_name: row.record.original_name,
                    operator_id: row.record.operator_id,
                    operator_name: row.operator_name,
                    file_size: row.record.file_size,
                    duration_sec: row.record.duration_sec,
                    status: row.record.status.as_str().to_string(),
                    stage: row.record.stage,
                    progress: row.record.progress,
                    created_at: row.record.created_at,
                    analysis: row.analysis.map(AnalysisDto::from),
                })
                .collect();
            Json(PaginatedResults {
                items,
                total: page.total,
                page: page.page,
                limit: page.limit,
                pages: page.pages,
            })
            .into_response()
        }
        Err(e) => {
            error!("Results listing failed: {:#}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

#[derive(Serialize)]
struct DiarizationDetail {
    method: String,
    confidence: Option<f64>,
    num_speakers: i32,
    segments: Vec<crate::store::SpeakerSegment>,
}

#[derive(Serialize)]
struct ResultDetail {
    file_id: String,
    original_name: String,
    operator_id: Option<String>,
    operator_name: Option<String>,
    file_size: i64,
    duration_sec: Option<f64>,
    status: String,
    stage: i32,
    progress: i32,
    error_message: Option<String>,
    created_at: i64,
    updated_at: i64,
    full_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diarization: Option<DiarizationDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<AnalysisDto>,
}

async fn get_result(
    State(store): State<GuardedCallStore>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    let record = match store.get_file(&id) {
        Ok(Some(record)) => record,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "File not found"),
        Err(e) => {
            error!("Result lookup failed: {:#}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let operator_name = record
        .operator_id
        .as_deref()
        .and_then(|op| store.get_operator(op).ok().flatten())
        .map(|op| op.name);
    let full_text = store
        .get_transcription(&id)
        .ok()
        .flatten()
        .map(|t| t.full_text);
    let diarization = store.get_diarization(&id).ok().flatten().map(|d| {
        DiarizationDetail {
            method: d.method.as_str().to_string(),
            confidence: d.confidence,
            num_speakers: d.num_speakers,
            segments: d.segments,
        }
    });
    let analysis = store
        .get_analysis(&id)
        .ok()
        .flatten()
        .map(AnalysisDto::from);

    Json(ResultDetail {
        file_id: record.id,
        original_name: record.original_name,
        operator_id: record.operator_id,
        operator_name,
        file_size: record.file_size,
        duration_sec: record.duration_sec,
        status: record.status.as_str().to_string(),
        stage: record.stage,
        progress: record.progress,
        error_message: record.error_message,
        created_at: record.created_at,
        updated_at: record.updated_at,
        full_text,
        diarization,
        analysis,
    })
    .into_response()
}

// === Status polling fallback ===

#[derive(Serialize)]
struct StatusResponse {
    file_id: String,
    status: String,
    progress: i32,
    stage: i32,
    stage_name: String,
    error: Option<String>,
}

async fn get_status(
    State(store): State<GuardedCallStore>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    match store.get_file(&id) {
        Ok(Some(record)) => {
            let error = if record.status == FileStatus::Failed {
                record.error_message.clone()
            } else {
                None
            };
            Json(StatusResponse {
                file_id: record.id,
                status: record.status.as_str().to_string(),
                progress: record.progress,
                stage: record.stage,
                stage_name: stage_name(record.stage).to_string(),
                error,
            })
            .into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "File not found"),
        Err(e) => {
            error!("Status lookup failed: {:#}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// === Operators ===

#[derive(Debug, Deserialize)]
struct OperatorsQuery {
    q: Option<String>,
    limit: Option<usize>,
}

async fn list_operators(
    State(store): State<GuardedCallStore>,
    Query(query): Query<OperatorsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    match store.list_operator_names(query.q.as_deref(), limit) {
        Ok(names) => Json(names).into_response(),
        Err(e) => {
            error!("Operator listing failed: {:#}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

#[derive(Serialize)]
struct OperatorDetail {
    id: String,
    name: String,
    created_at: i64,
    file_count: usize,
}

async fn get_operator(
    State(store): State<GuardedCallStore>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    match store.get_operator(&id) {
        Ok(Some(operator)) => {
            let file_count = store.count_operator_files(&id).unwrap_or(0);
            Json(OperatorDetail {
                id: operator.id,
                name: operator.name,
                created_at: operator.created_at,
                file_count,
            })
            .into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Operator not found"),
        Err(e) => {
            error!("Operator lookup failed: {:#}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// === Health ===

#[derive(Serialize)]
struct ServiceHealth {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl ServiceHealth {
    fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn bad(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    uptime_sec: u64,
    database: ServiceHealth,
    transcription: ServiceHealth,
    diarization: ServiceHealth,
    scoring: ServiceHealth,
    disk: ServiceHealth,
    queue_length: usize,
    current_file: Option<String>,
}

/// Free/total bytes of the filesystem holding `path`.
fn disk_usage(path: &Path) -> std::io::Result<(u64, u64)> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let free = stat.f_bavail as u64 * stat.f_frsize as u64;
        let total = stat.f_blocks as u64 * stat.f_frsize as u64;
        Ok((free, total))
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "disk usage unavailable on this platform",
        ))
    }
}

async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    let database = match state.store.ping() {
        Ok(()) => ServiceHealth {
            ok: true,
            detail: None,
        },
        Err(e) => ServiceHealth::bad(e.to_string()),
    };

    let transcription = ServiceHealth::ok(format!(
        "engine at {} (model={})",
        state.config.whisper_url, state.config.whisper_model
    ));
    let diarization = if state.separator.is_available() {
        ServiceHealth::ok("auth token configured")
    } else {
        ServiceHealth::bad("HF_TOKEN not set, single-speaker fallback active")
    };
    let scoring = if state.scorer.is_available() {
        ServiceHealth::ok("API key configured")
    } else {
        ServiceHealth::bad("OPENAI_API_KEY not set, analysis disabled")
    };

    let disk = match disk_usage(&state.config.uploads_dir) {
        Ok((free, total)) => {
            let free_gb = free as f64 / 1024f64.powi(3);
            let total_gb = total as f64 / 1024f64.powi(3);
            let used_pct = if total > 0 {
                (total - free) as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            ServiceHealth {
                ok: free_gb > 1.0,
                detail: Some(format!(
                    "{:.1} GB free / {:.1} GB total ({:.0}% used)",
                    free_gb, total_gb, used_pct
                )),
            }
        }
        Err(e) => ServiceHealth::bad(e.to_string()),
    };

    let status = if database.ok && disk.ok {
        "ok"
    } else if database.ok {
        "degraded"
    } else {
        "error"
    };

    Json(HealthResponse {
        status: status.to_string(),
        uptime_sec: state.start_time.elapsed().as_secs(),
        database,
        transcription,
        diarization,
        scoring,
        disk,
        queue_length: state.queue.queue_length(),
        current_file: state.queue.current_file_id(),
    })
}

// === Wiring ===

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring unparseable CORS origin {:?}", o);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn make_router(state: ServerState) -> Router {
    let body_limit = state.config.max_file_size_bytes() as usize
        * state.config.max_batch_size.max(1)
        + 1024 * 1024;
    let cors = cors_layer(&state.config.cors_origins_list());

    Router::new()
        .route("/api/v1/upload", post(upload))
        .route("/api/v1/results", get(list_results))
        .route("/api/v1/results/{id}", get(get_result))
        .route("/api/v1/status/{id}", get(get_status))
        .route("/api/v1/audio/{id}", get(stream_audio))
        .route("/api/v1/operators", get(list_operators))
        .route("/api/v1/operators/{id}", get(get_operator))
        .route("/api/v1/health", get(health))
        .route("/api/v1/ws", get(ws_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(
    state: ServerState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port).parse()?;
    let app = make_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
