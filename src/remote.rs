//! Client side of the payroll backend: the remote authority that owns a
//! punch once it has been acknowledged.
//!
//! Every submission carries the queue entry id as an `Idempotency-Key`, so
//! resubmitting an entry whose first attempt had an unknown outcome never
//! records a second punch.

use crate::model::{ApprovalStatus, Correction, Punch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub remote_id: String,
    /// Set when the remote authority had already seen this idempotency key.
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub status: ApprovalStatus,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decided_by: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Transient(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("photo unavailable: {0}")]
    Media(String),
}

impl RemoteError {
    /// Whether the failure is expected to clear up on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Timeout(_))
    }
}

/// Operations the kiosk needs from the remote authority. Submissions must be
/// idempotent on `entry_id`.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Upload a captured photo blob and return the remote reference to
    /// attach to the punch record.
    async fn upload_photo(&self, entry_id: &str, photo_reference: &str)
        -> Result<String, RemoteError>;

    async fn submit_punch(
        &self,
        entry_id: &str,
        punch: &Punch,
        photo_id: Option<&str>,
    ) -> Result<Ack, RemoteError>;

    /// `original_remote_id` is the server id of the corrected punch, once
    /// that punch has been acknowledged.
    async fn submit_correction(
        &self,
        entry_id: &str,
        correction: &Correction,
        original_remote_id: Option<&str>,
    ) -> Result<Ack, RemoteError>;

    async fn get_approval_status(&self, correction_id: &str)
        -> Result<ApprovalDecision, RemoteError>;

    async fn health_check(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct PayrollClient {
    http: Client,
    base_url: Url,
    token: String,
    timeout: Duration,
}

impl fmt::Debug for PayrollClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayrollClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    id: String,
    #[serde(default)]
    duplicate: bool,
}

#[derive(Debug, Deserialize)]
struct PhotoResponse {
    id: String,
}

impl PayrollClient {
    pub fn new(base_url: Url, token: String, timeout: Duration) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .user_agent(concat!("punch-kiosk/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transient(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            token,
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url.join(path).map_err(|e| RemoteError::Rejected {
            status: 0,
            body: format!("invalid endpoint {}: {}", path, e),
        })
    }

    fn build_json_request(
        &self,
        path: &str,
        entry_id: &str,
        body: &Value,
    ) -> Result<reqwest::Request, RemoteError> {
        self.http
            .post(self.endpoint(path)?)
            .bearer_auth(&self.token)
            .header(IDEMPOTENCY_HEADER, entry_id)
            .json(body)
            .build()
            .map_err(|e| self.map_send_error(e))
    }

    pub fn build_punch_request(
        &self,
        entry_id: &str,
        punch: &Punch,
        photo_id: Option<&str>,
    ) -> Result<reqwest::Request, RemoteError> {
        self.build_json_request("v1/punches", entry_id, &punch_body(entry_id, punch, photo_id))
    }

    pub fn build_correction_request(
        &self,
        entry_id: &str,
        correction: &Correction,
        original_remote_id: Option<&str>,
    ) -> Result<reqwest::Request, RemoteError> {
        self.build_json_request(
            "v1/corrections",
            entry_id,
            &correction_body(entry_id, correction, original_remote_id),
        )
    }

    fn map_send_error(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Transient(err.to_string())
        }
    }

    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::Request,
    ) -> Result<T, RemoteError> {
        debug!(method = %request.method(), url = %request.url(), "payroll request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| self.map_send_error(e))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, body = %body, "payroll request failed");
            return Err(classify_status(status, body));
        }
        res.json::<T>()
            .await
            .map_err(|e| self.map_send_error(e))
    }

    async fn execute_ack(&self, request: reqwest::Request) -> Result<Ack, RemoteError> {
        let payload: AckResponse = self.execute(request).await?;
        Ok(Ack {
            remote_id: payload.id,
            duplicate: payload.duplicate,
        })
    }
}

/// 5xx, 408 and 429 are worth retrying; any other non-success is the remote
/// authority refusing the record.
pub fn classify_status(status: StatusCode, body: String) -> RemoteError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RemoteError::Transient(format!("{}: {}", status, body))
    } else {
        RemoteError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}

pub fn punch_body(entry_id: &str, punch: &Punch, photo_id: Option<&str>) -> Value {
    json!({
        "entry_id": entry_id,
        "employee_id": punch.employee_id,
        "company_id": punch.company_id,
        "punch_type": punch.punch_type.as_str(),
        "timestamp": punch.timestamp,
        "device_id": punch.device_id,
        "location": punch.location,
        "photo_id": photo_id,
        "pin_verified": punch.pin_verified,
    })
}

/// The corrected punch is named by its server id when it has one, falling
/// back to the local id the punch was submitted under.
pub fn correction_body(
    entry_id: &str,
    correction: &Correction,
    original_remote_id: Option<&str>,
) -> Value {
    json!({
        "entry_id": entry_id,
        "employee_id": correction.employee_id,
        "original_punch_id": original_remote_id.unwrap_or(&correction.original_punch_id),
        "original_local_punch_id": correction.original_punch_id,
        "corrected_timestamp": correction.corrected_timestamp,
        "reason": correction.reason,
        "reason_category": correction.reason_category.as_str(),
        "submitted_at": correction.submitted_at,
        "offline_submitted": correction.offline_submitted,
    })
}

fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl RemoteAuthority for PayrollClient {
    async fn upload_photo(
        &self,
        entry_id: &str,
        photo_reference: &str,
    ) -> Result<String, RemoteError> {
        let path = Path::new(photo_reference);
        let bytes = fs::read(path)
            .await
            .map_err(|e| RemoteError::Media(format!("{}: {}", path.display(), e)))?;
        let request = self
            .http
            .post(self.endpoint("v1/photos")?)
            .bearer_auth(&self.token)
            .header(IDEMPOTENCY_HEADER, entry_id)
            .header(reqwest::header::CONTENT_TYPE, content_type(path))
            .body(bytes)
            .build()
            .map_err(|e| self.map_send_error(e))?;
        let payload: PhotoResponse = self.execute(request).await?;
        Ok(payload.id)
    }

    async fn submit_punch(
        &self,
        entry_id: &str,
        punch: &Punch,
        photo_id: Option<&str>,
    ) -> Result<Ack, RemoteError> {
        let request = self.build_punch_request(entry_id, punch, photo_id)?;
        self.execute_ack(request).await
    }

    async fn submit_correction(
        &self,
        entry_id: &str,
        correction: &Correction,
        original_remote_id: Option<&str>,
    ) -> Result<Ack, RemoteError> {
        let request = self.build_correction_request(entry_id, correction, original_remote_id)?;
        self.execute_ack(request).await
    }

    async fn get_approval_status(
        &self,
        correction_id: &str,
    ) -> Result<ApprovalDecision, RemoteError> {
        let url = self.endpoint(&format!("v1/corrections/{}/status", correction_id))?;
        let request = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .build()
            .map_err(|e| self.map_send_error(e))?;
        self.execute(request).await
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        let request = self
            .http
            .get(self.endpoint("v1/health")?)
            .build()
            .map_err(|e| self.map_send_error(e))?;
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| self.map_send_error(e))?;
        if res.status().is_success() {
            Ok(())
        } else {
            let status = res.status();
            Err(classify_status(status, String::new()))
        }
    }
}
