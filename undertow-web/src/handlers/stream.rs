//! Ranged file streaming
//!
//! Serves one file of a download with single-range support. Preparing the
//! stream switches the download to sequential mode with the file at top
//! priority; bytes are read in piece-aligned chunks.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;

use super::parse_infohash;
use crate::error::ApiError;
use crate::range::{RangeResolution, range_from_headers, resolve};
use crate::server::AppState;

/// `GET /downloads/{infohash}/stream/{file_index}`
pub async fn stream_file(
    State(state): State<AppState>,
    Path((infohash, file_index)): Path<(String, usize)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let infohash = parse_infohash(&infohash)?;
    let target = state.engine.prepare_stream(infohash, file_index).await?;
    let size = target.file_size;

    let (status, start, end) = match resolve(range_from_headers(&headers), size) {
        RangeResolution::NotSatisfiable => {
            tracing::debug!("Unsatisfiable range for file {} of {}", file_index, infohash);
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(CONTENT_RANGE, format!("bytes */{size}"))
                .body(Body::empty())
                .map_err(|e| ApiError::internal(e.to_string()));
        }
        RangeResolution::Full => (StatusCode::OK, 0, size.saturating_sub(1)),
        RangeResolution::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end),
    };
    let todo = if size == 0 { 0 } else { end - start + 1 };

    let mut response = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(ACCEPT_RANGES, "bytes")
        .header(CONTENT_LENGTH, todo);
    if status == StatusCode::PARTIAL_CONTENT {
        response = response.header(CONTENT_RANGE, format!("bytes {start}-{end}/{size}"));
    }

    let body = Body::from_stream(target.read_range(start, todo));
    response
        .body(body)
        .map_err(|e| ApiError::internal(e.to_string()))
}
