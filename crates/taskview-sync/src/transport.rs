use crate::health::FailureTier;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;
use taskview_core::wire::{CitationsResponse, EventRow, FilesResponse, TaskSnapshot};
use taskview_core::ApprovalDecision;
use thiserror::Error;
use url::Url;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ApiError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
    #[error("request failed: {message}")]
    Unreachable { message: String },
    #[error("request timed out")]
    Timeout,
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("decode failed: {message}")]
    Decode { message: String },
}

impl ApiError {
    pub fn tier(&self) -> FailureTier {
        match self {
            ApiError::InvalidBaseUrl(_) | ApiError::Unreachable { .. } | ApiError::Timeout => {
                FailureTier::Unreachable
            }
            ApiError::Decode { .. } => FailureTier::Malformed,
            ApiError::Http { status, .. } => match *status {
                401 | 403 => FailureTier::Unauthorized,
                404 | 410 => FailureTier::NotFound,
                409 | 423 | 503 => FailureTier::Conflict,
                status if status >= 500 => FailureTier::ServerError,
                _ => FailureTier::Malformed,
            },
        }
    }

    /// The server is holding a lock and the call may succeed if repeated.
    pub fn is_busy(&self) -> bool {
        matches!(self, ApiError::Http { status: 409 | 423 | 503, .. })
    }
}

/// Server operations the engine pulls from and pushes commands to.
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Most recent `limit` events, ascending by seq.
    async fn history(&self, task_id: &str, limit: u32) -> Result<Vec<EventRow>, ApiError>;
    /// Events with seq strictly greater than `after`, ascending.
    async fn delta(&self, task_id: &str, after: u64, limit: u32) -> Result<Vec<EventRow>, ApiError>;
    async fn snapshot(&self, task_id: &str) -> Result<TaskSnapshot, ApiError>;
    async fn citations(&self, task_id: &str) -> Result<CitationsResponse, ApiError>;
    async fn files(&self, task_id: &str) -> Result<FilesResponse, ApiError>;
    async fn approve(
        &self,
        task_id: &str,
        step_id: &str,
        decision: ApprovalDecision,
        reason: Option<&str>,
    ) -> Result<(), ApiError>;
    async fn cancel(&self, task_id: &str) -> Result<(), ApiError>;
    async fn continue_task(&self, task_id: &str, message: &str) -> Result<(), ApiError>;
    async fn delete_task(&self, task_id: &str) -> Result<(), ApiError>;
    async fn open_file(&self, task_id: &str, file_id: &str) -> Result<(), ApiError>;
    /// Opens the server-sent-events channel and returns its raw body.
    async fn open_push(&self) -> Result<ByteStream, ApiError>;
}

#[derive(Debug, Clone)]
pub struct HttpTaskApiConfig {
    pub base_url: String,
    pub admin_token: Option<String>,
    pub connect_timeout: Duration,
}

impl HttpTaskApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            admin_token: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize)]
struct ApproveBody<'a> {
    decision: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ContinueBody<'a> {
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct OpenFileBody<'a> {
    file_id: &'a str,
}

/// `TaskApi` over plain HTTP/JSON with reqwest.
///
/// Per-call deadlines are applied by the caller; only the connect phase is
/// bounded here, so the push stream can stay open indefinitely.
#[derive(Debug, Clone)]
pub struct HttpTaskApi {
    base_url: Url,
    admin_token: Option<String>,
    http: reqwest::Client,
}

impl HttpTaskApi {
    pub fn new(config: HttpTaskApiConfig) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(&config.base_url)?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|err| ApiError::Unreachable {
                message: err.to_string(),
            })?;
        Ok(Self {
            base_url,
            admin_token: config
                .admin_token
                .filter(|token| !token.trim().is_empty()),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// Joins path segments onto the base URL, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn task_url(&self, task_id: &str, rest: &[&str]) -> Result<Url, ApiError> {
        let mut segments = vec!["api", "tasks", task_id.trim()];
        segments.extend_from_slice(rest);
        self.endpoint(&segments)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.admin_token {
            Some(token) => builder.header(ADMIN_TOKEN_HEADER, token),
            None => builder,
        }
    }

    pub fn history_request(&self, task_id: &str, limit: u32) -> Result<reqwest::RequestBuilder, ApiError> {
        let url = self.task_url(task_id, &["events"])?;
        Ok(self
            .request(reqwest::Method::GET, url)
            .query(&[("tail", "true")])
            .query(&[("limit", limit)]))
    }

    pub fn delta_request(
        &self,
        task_id: &str,
        after: u64,
        limit: u32,
    ) -> Result<reqwest::RequestBuilder, ApiError> {
        let url = self.task_url(task_id, &["events"])?;
        Ok(self
            .request(reqwest::Method::GET, url)
            .query(&[("after", after), ("limit", u64::from(limit))]))
    }

    async fn get_json<T>(&self, builder: reqwest::RequestBuilder) -> Result<T, ApiError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let response = builder.send().await.map_err(map_send_error)?;
        decode_json_response(response).await
    }

    async fn send_command<B>(
        &self,
        method: reqwest::Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<(), ApiError>
    where
        B: Serialize + ?Sized,
    {
        let mut builder = self.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(map_send_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let bytes = response.bytes().await.map_err(map_send_error)?;
        Err(format_http_error(status, &bytes))
    }
}

#[async_trait]
impl TaskApi for HttpTaskApi {
    async fn history(&self, task_id: &str, limit: u32) -> Result<Vec<EventRow>, ApiError> {
        self.get_json(self.history_request(task_id, limit)?).await
    }

    async fn delta(&self, task_id: &str, after: u64, limit: u32) -> Result<Vec<EventRow>, ApiError> {
        self.get_json(self.delta_request(task_id, after, limit)?).await
    }

    async fn snapshot(&self, task_id: &str) -> Result<TaskSnapshot, ApiError> {
        let url = self.task_url(task_id, &[])?;
        self.get_json(self.request(reqwest::Method::GET, url)).await
    }

    async fn citations(&self, task_id: &str) -> Result<CitationsResponse, ApiError> {
        let url = self.task_url(task_id, &["citations"])?;
        self.get_json(self.request(reqwest::Method::GET, url)).await
    }

    async fn files(&self, task_id: &str) -> Result<FilesResponse, ApiError> {
        let url = self.task_url(task_id, &["files"])?;
        self.get_json(self.request(reqwest::Method::GET, url)).await
    }

    async fn approve(
        &self,
        task_id: &str,
        step_id: &str,
        decision: ApprovalDecision,
        reason: Option<&str>,
    ) -> Result<(), ApiError> {
        let body = ApproveBody {
            decision: decision.as_str(),
            reason,
        };
        let url = self.task_url(task_id, &["approve", step_id.trim()])?;
        self.send_command(reqwest::Method::POST, url, Some(&body))
            .await
    }

    async fn cancel(&self, task_id: &str) -> Result<(), ApiError> {
        let url = self.task_url(task_id, &["cancel"])?;
        self.send_command::<()>(reqwest::Method::POST, url, None)
            .await
    }

    async fn continue_task(&self, task_id: &str, message: &str) -> Result<(), ApiError> {
        let url = self.task_url(task_id, &["continue"])?;
        self.send_command(reqwest::Method::POST, url, Some(&ContinueBody { message }))
            .await
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), ApiError> {
        let url = self.task_url(task_id, &[])?;
        self.send_command::<()>(reqwest::Method::DELETE, url, None)
            .await
    }

    async fn open_file(&self, task_id: &str, file_id: &str) -> Result<(), ApiError> {
        let url = self.task_url(task_id, &["files", "open"])?;
        self.send_command(reqwest::Method::POST, url, Some(&OpenFileBody { file_id }))
            .await
    }

    async fn open_push(&self) -> Result<ByteStream, ApiError> {
        let url = self.endpoint(&["api", "events"])?;
        let response = self
            .request(reqwest::Method::GET, url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(map_send_error)?;
        let status = response.status();
        if !status.is_success() {
            let bytes = response.bytes().await.map_err(map_send_error)?;
            return Err(format_http_error(status, &bytes));
        }
        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(map_send_error)
        });
        Ok(Box::pin(stream))
    }
}

/// Bounds a call by `limit`; an elapsed deadline becomes [`ApiError::Timeout`].
pub async fn with_deadline<T, F>(limit: Duration, call: F) -> Result<T, ApiError>
where
    F: std::future::Future<Output = Result<T, ApiError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout),
    }
}

pub fn normalize_base_url(base_url: &str) -> Result<Url, ApiError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(ApiError::InvalidBaseUrl("empty".to_string()));
    }
    let parsed = Url::parse(trimmed).map_err(|err| ApiError::InvalidBaseUrl(err.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::InvalidBaseUrl(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }
    Ok(parsed)
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> ApiError {
    let body = String::from_utf8_lossy(body).trim().to_string();
    let body = if body.is_empty() {
        "<empty>".to_string()
    } else {
        body
    };
    ApiError::Http {
        status: status.as_u16(),
        body,
    }
}

fn map_send_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        return ApiError::Timeout;
    }
    if err.is_decode() {
        return ApiError::Decode {
            message: err.to_string(),
        };
    }
    ApiError::Unreachable {
        message: err.to_string(),
    }
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, ApiError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = response.status();
    let bytes = response.bytes().await.map_err(map_send_error)?;
    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }
    serde_json::from_slice::<T>(&bytes).map_err(|err| ApiError::Decode {
        message: err.to_string(),
    })
}
