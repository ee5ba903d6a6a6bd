//! Blocking HTTP client for the nettune API.
//!
//! The probe engine is thread-based by design, so the client is
//! `reqwest::blocking` with a per-request timeout. Responses use the
//! `{success, data?, error?}` envelope; an unsuccessful envelope becomes a
//! typed [`ClientError::Api`] carrying the server's stable error code.

use std::io::Read;
use std::time::{Duration, Instant};

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use nettune_core::apply::{ApplyRequest, ApplyResult, RollbackRequest, RollbackResult, SystemStatus};
use nettune_core::profile::{Profile, ProfileMeta};
use nettune_core::state::{ServerInfo, Snapshot, SnapshotMeta, SystemState};

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error envelope.
    #[error("{code}: {message}")]
    Api {
        /// Stable error code from the server.
        code: String,
        /// Server-provided message.
        message: String,
        /// Underlying tool output, when provided.
        details: Option<String>,
    },

    /// The response body did not match the expected shape.
    #[error("unexpected response (status {status}): {body}")]
    UnexpectedResponse {
        /// HTTP status of the response.
        status: StatusCode,
        /// Truncated response body.
        body: String,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EchoReply {
    /// Server wall clock in epoch milliseconds.
    pub ts: i64,
    /// Always true.
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct UploadReply {
    /// Bytes the server read before EOF.
    pub received_bytes: u64,
    /// Server-side wall time of the read.
    pub duration_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ProfilesReply {
    profiles: Vec<ProfileMeta>,
}

#[derive(Debug, Deserialize)]
struct SnapshotsReply {
    snapshots: Vec<SnapshotMeta>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SnapshotCreatedReply {
    /// Id of the new snapshot.
    pub snapshot_id: String,
    /// State observed at capture time.
    pub current_state: SystemState,
}

/// The nettune API client.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    /// Builds a client for `base_url` with a per-request `timeout`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn get(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(&self.api_key)
    }

    fn post(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.api_key)
    }

    /// One echo round trip.
    pub fn echo(&self) -> Result<EchoReply, ClientError> {
        decode(self.get("/probe/echo").send()?)
    }

    /// Downloads `bytes` random bytes, returning how many arrived and the
    /// wall time. A deadline abort mid-stream returns the partial count.
    pub fn download(&self, bytes: u64) -> Result<(u64, Duration), ClientError> {
        let started = Instant::now();
        let response = self
            .get(&format!("/probe/download?bytes={bytes}"))
            .send()?;
        if !response.status().is_success() {
            return Err(error_from(response));
        }

        let mut reader = response;
        let mut buf = [0u8; 64 * 1024];
        let mut received: u64 = 0;
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received += n as u64,
                // Deadline or connection abort: the partial result stands.
                Err(_) => break,
            }
        }
        Ok((received, started.elapsed()))
    }

    /// Uploads `data` and returns the server's byte count and duration.
    pub fn upload(&self, data: Vec<u8>) -> Result<UploadReply, ClientError> {
        decode(self.post("/probe/upload").body(data).send()?)
    }

    /// Host facts from the server.
    pub fn server_info(&self) -> Result<ServerInfo, ClientError> {
        decode(self.get("/probe/info").send()?)
    }

    /// All profiles known to the server.
    pub fn profiles(&self) -> Result<Vec<ProfileMeta>, ClientError> {
        decode::<ProfilesReply>(self.get("/profiles").send()?).map(|reply| reply.profiles)
    }

    /// One profile by id.
    pub fn profile(&self, id: &str) -> Result<Profile, ClientError> {
        decode(self.get(&format!("/profiles/{id}")).send()?)
    }

    /// Applies a profile.
    pub fn apply(&self, request: &ApplyRequest) -> Result<ApplyResult, ClientError> {
        decode(self.post("/sys/apply").json(request).send()?)
    }

    /// Rolls back.
    pub fn rollback(&self, request: &RollbackRequest) -> Result<RollbackResult, ClientError> {
        decode(self.post("/sys/rollback").json(request).send()?)
    }

    /// Current system status.
    pub fn status(&self) -> Result<SystemStatus, ClientError> {
        decode(self.get("/sys/status").send()?)
    }

    /// All snapshots.
    pub fn snapshots(&self) -> Result<Vec<SnapshotMeta>, ClientError> {
        decode::<SnapshotsReply>(self.get("/sys/snapshots").send()?).map(|reply| reply.snapshots)
    }

    /// One snapshot by id.
    pub fn snapshot(&self, id: &str) -> Result<Snapshot, ClientError> {
        decode(self.get(&format!("/sys/snapshot/{id}")).send()?)
    }

    /// Captures a new snapshot.
    pub fn create_snapshot(&self) -> Result<SnapshotCreatedReply, ClientError> {
        decode(self.post("/sys/snapshot").send()?)
    }
}

fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    let body = response.text()?;

    match serde_json::from_str::<Envelope<T>>(&body) {
        Ok(envelope) => {
            if let Some(error) = envelope.error {
                return Err(ClientError::Api {
                    code: error.code,
                    message: error.message,
                    details: error.details,
                });
            }
            match (envelope.success, envelope.data) {
                (true, Some(data)) => Ok(data),
                _ => Err(ClientError::UnexpectedResponse {
                    status,
                    body: truncate(&body),
                }),
            }
        }
        Err(_) => Err(ClientError::UnexpectedResponse {
            status,
            body: truncate(&body),
        }),
    }
}

fn error_from(response: Response) -> ClientError {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    match serde_json::from_str::<Envelope<serde_json::Value>>(&body) {
        Ok(Envelope {
            error: Some(error), ..
        }) => ClientError::Api {
            code: error.code,
            message: error.message,
            details: error.details,
        },
        _ => ClientError::UnexpectedResponse {
            status,
            body: truncate(&body),
        },
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_string()
    } else {
        format!("{}...", &body[..MAX])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_error_becomes_typed_api_error() {
        let body = r#"{"success":false,"error":{"code":"APPLY_IN_PROGRESS","message":"busy"}}"#;
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(body).unwrap();
        assert!(!envelope.success);
        let error = envelope.error.unwrap();
        assert_eq!(error.code, "APPLY_IN_PROGRESS");
        assert_eq!(error.message, "busy");
        assert!(error.details.is_none());
    }

    #[test]
    fn envelope_data_decodes_typed_payloads() {
        let body = r#"{"success":true,"data":{"ts":1722600000000,"ok":true}}"#;
        let envelope: Envelope<EchoReply> = serde_json::from_str(body).unwrap();
        let data = envelope.data.unwrap();
        assert!(data.ok);
        assert_eq!(data.ts, 1_722_600_000_000);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = ApiClient::new(
            "http://127.0.0.1:9876/",
            "key",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.url("/probe/echo"), "http://127.0.0.1:9876/probe/echo");
    }

    #[test]
    fn truncate_caps_long_bodies() {
        let long = "x".repeat(2000);
        let out = truncate(&long);
        assert!(out.len() < 600);
        assert!(out.ends_with("..."));
    }
}
