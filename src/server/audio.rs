//! Audio playback streaming with byte-range support.

use axum::{
    body::Body,
    extract::{FromRequestParts, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tokio::{
    fs::File,
    io::{AsyncSeekExt, BufReader, SeekFrom},
};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::state::{GuardedCallStore, ServerState};

const HEADER_BYTE_RANGE: &str = "Range";
const STREAM_BUFFER: usize = 4096 * 16;

const MIME_MAP: &[(&str, &str)] = &[
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("flac", "audio/flac"),
    ("m4a", "audio/mp4"),
    ("webm", "audio/webm"),
];

fn mime_for(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_lowercase());
    ext.and_then(|e| {
        MIME_MAP
            .iter()
            .find(|(known, _)| *known == e)
            .map(|(_, mime)| *mime)
    })
    .unwrap_or("audio/mpeg")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    start_inclusive: Option<u64>,
    end_inclusive: Option<u64>,
}

impl ByteRange {
    fn parse<S: AsRef<str>>(s: S) -> Option<ByteRange> {
        let v = s.as_ref();
        let v = v.strip_prefix("bytes=")?;
        let (start, end) = v.split_once('-')?;
        Some(ByteRange {
            start_inclusive: start.parse::<u64>().ok(),
            end_inclusive: end.parse::<u64>().ok(),
        })
    }
}

pub struct ByteRangeExtractionError {}

impl IntoResponse for ByteRangeExtractionError {
    fn into_response(self) -> Response {
        StatusCode::BAD_REQUEST.into_response()
    }
}

impl FromRequestParts<ServerState> for Option<ByteRange> {
    type Rejection = ByteRangeExtractionError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        Ok(parts
            .headers
            .get(HEADER_BYTE_RANGE)
            .and_then(|x| x.to_str().ok())
            .and_then(ByteRange::parse))
    }
}

pub async fn stream_audio(
    byte_range: Option<ByteRange>,
    State(store): State<GuardedCallStore>,
    Path(id): Path<String>,
) -> Response {
    let record = match store.get_file(&id) {
        Ok(Some(record)) => record,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let Some(path) = record.audio_path else {
        debug!("File {} has no blob on disk", id);
        return StatusCode::NOT_FOUND.into_response();
    };
    if !std::path::Path::new(&path).exists() {
        debug!("Blob for {} is missing from disk: {}", id, path);
        return StatusCode::NOT_FOUND.into_response();
    }

    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let mut start_served = 0;
    if let Some(start) = byte_range.and_then(|x| x.start_inclusive) {
        if file.seek(SeekFrom::Start(start)).await.is_err() {
            return StatusCode::BAD_REQUEST.into_response();
        }
        start_served = start;
    }

    let file_length = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    let chunk_size = match byte_range {
        None
        | Some(ByteRange {
            start_inclusive: None,
            end_inclusive: None,
        }) => file_length,
        Some(ByteRange {
            start_inclusive: None,
            end_inclusive: Some(end),
        }) => end,
        Some(ByteRange {
            start_inclusive: Some(start),
            end_inclusive: None,
        }) => file_length.saturating_sub(start),
        Some(ByteRange {
            start_inclusive: Some(start),
            end_inclusive: Some(end),
        }) => end - start + 1,
    };
    let status_code = match byte_range {
        None
        | Some(ByteRange {
            start_inclusive: None,
            end_inclusive: None,
        }) => StatusCode::OK,
        _ => StatusCode::PARTIAL_CONTENT,
    };

    let reader = BufReader::with_capacity(STREAM_BUFFER, file);
    let body = Body::from_stream(ReaderStream::with_capacity(reader, STREAM_BUFFER));

    Response::builder()
        .status(status_code)
        .header("Content-Type", mime_for(&path))
        .header("Accept-Ranges", "bytes")
        .header(
            "Content-Range",
            format!(
                "bytes {}-{}/{}",
                start_served,
                start_served + chunk_size.saturating_sub(1),
                file_length
            ),
        )
        .header("Content-Length", chunk_size)
        .header(
            "Content-Disposition",
            format!("inline; filename=\"{}\"", record.original_name),
        )
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
