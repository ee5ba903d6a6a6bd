//! Probe byte pipes: echo, streamed random download, upload byte counter,
//! and the host fact sheet.

use std::convert::Infallible;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, Request, State};
use axum::http::header;
use axum::response::Response;
use futures::StreamExt;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use nettune_core::adapter::collect_server_info;

use super::response::{ok, ApiError};
use crate::state::SharedState;

/// Hard cap on one download request.
const MAX_DOWNLOAD_BYTES: u64 = 500 * 1024 * 1024;

/// Download size when the query omits `bytes`.
const DEFAULT_DOWNLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Stream chunk size; each chunk is flushed to the socket independently.
const CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize)]
struct EchoReply {
    ts: i64,
    ok: bool,
}

/// `GET /probe/echo`
pub async fn echo() -> Response {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    ok(EchoReply { ts, ok: true })
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    bytes: Option<u64>,
}

/// `GET /probe/download?bytes=N` - streams N cryptographically random bytes
/// with an exact `Content-Length`.
pub async fn download(
    params: Result<Query<DownloadParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params.map_err(|err| ApiError::invalid_request(err.to_string()))?;
    let bytes = params.bytes.unwrap_or(DEFAULT_DOWNLOAD_BYTES);

    if bytes == 0 {
        return Err(ApiError::invalid_request("bytes must be greater than zero"));
    }
    if bytes > MAX_DOWNLOAD_BYTES {
        return Err(ApiError::invalid_request(
            "bytes exceeds maximum allowed (500MiB)",
        ));
    }

    let stream = futures::stream::unfold(bytes, |remaining| async move {
        if remaining == 0 {
            return None;
        }
        let take = usize::try_from(remaining.min(CHUNK_BYTES as u64)).unwrap_or(CHUNK_BYTES);
        let mut chunk = vec![0u8; take];
        rand::thread_rng().fill_bytes(&mut chunk);
        Some((
            Ok::<Bytes, Infallible>(Bytes::from(chunk)),
            remaining - take as u64,
        ))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, bytes)
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(stream))
        .map_err(|err| ApiError::internal(err.to_string()))
}

#[derive(Debug, Serialize)]
struct UploadReply {
    received_bytes: u64,
    duration_ms: u64,
}

/// `POST /probe/upload` - reads the body to EOF and reports bytes and wall
/// time.
pub async fn upload(request: Request) -> Response {
    let started = Instant::now();
    let mut stream = request.into_body().into_data_stream();

    let mut received: u64 = 0;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => received += bytes.len() as u64,
            // The client hung up; report what arrived.
            Err(_) => break,
        }
    }

    ok(UploadReply {
        received_bytes: received,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

/// `GET /probe/info`
pub async fn info(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let host = state.host.clone();
    let info = tokio::task::spawn_blocking(move || collect_server_info(host.qdisc.as_ref())).await?;
    Ok(ok(info))
}
