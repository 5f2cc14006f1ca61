mod validate;
mod wire;

pub use validate::{MAX_ID_LEN, parse_sync_request, validate_sync_request};
pub use wire::{
    BootstrapResponse, ErrorBody, RealtimeFrame, RejectedRow, SyncChanges, SyncRequest,
    SyncResponse,
};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use t8d_core::{T8dError, T8dResult, ValidationIssue};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SYNC_PATH: &str = "/sync";
pub const BOOTSTRAP_PATH: &str = "/sync/bootstrap";
pub const REALTIME_PATH: &str = "/realtime";
pub const HEALTH_PATH: &str = "/health";

/// HTTP client for the sync service.
#[derive(Debug, Clone)]
pub struct SyncApi {
    base_url: String,
    client: Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthData {
    pub status: String,
}

impl SyncApi {
    pub fn new(base_url: &str) -> T8dResult<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> T8dResult<Self> {
        let trimmed = base_url.trim().trim_end_matches('/').to_string();
        if trimmed.is_empty() {
            return Err(T8dError::usage("server URL cannot be empty"));
        }
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(T8dError::usage(format!(
                "server URL '{trimmed}' must start with http:// or https://"
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("t8d/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| T8dError::io(format!("failed to construct API client: {err}")))?;

        Ok(Self {
            base_url: trimmed,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// WebSocket URL of the realtime channel.
    pub fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{ws_base}{REALTIME_PATH}")
    }

    pub async fn sync(&self, token: &str, request: &SyncRequest) -> T8dResult<SyncResponse> {
        require_token(token)?;

        let response = self
            .client
            .post(self.url(SYNC_PATH))
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(network_error)?;

        parse_json_response(response).await
    }

    pub async fn bootstrap(&self, token: &str) -> T8dResult<BootstrapResponse> {
        require_token(token)?;

        let response = self
            .client
            .get(self.url(BOOTSTRAP_PATH))
            .bearer_auth(token)
            .send()
            .await
            .map_err(network_error)?;

        parse_json_response(response).await
    }

    pub async fn health(&self) -> T8dResult<HealthData> {
        let response = self
            .client
            .get(self.url(HEALTH_PATH))
            .send()
            .await
            .map_err(network_error)?;

        parse_json_response(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn require_token(token: &str) -> T8dResult<()> {
    if token.trim().is_empty() {
        return Err(T8dError::auth(
            "no bearer token configured; run `t8d auth login --token <token>` first",
        ));
    }
    Ok(())
}

async fn parse_json_response<T: DeserializeOwned>(response: Response) -> T8dResult<T> {
    let status = response.status();
    let headers = response.headers().clone();
    let body_text = response.text().await.unwrap_or_default();

    if !status.is_success() {
        return Err(parse_error_response(status, &body_text, Some(&headers)));
    }

    serde_json::from_str::<T>(&body_text).map_err(|err| {
        T8dError::sync(format!(
            "failed to map API response to expected shape: {err}"
        ))
    })
}

fn parse_error_response(
    status: StatusCode,
    body_text: &str,
    headers: Option<&HeaderMap>,
) -> T8dError {
    let body_trimmed = body_text.trim();
    let parsed = serde_json::from_str::<ErrorBody>(body_trimmed).ok();

    let message = parsed
        .as_ref()
        .map(|body| body.message.trim())
        .filter(|message| !message.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            if body_trimmed.is_empty() {
                format!("request failed with status {}", status.as_u16())
            } else {
                format!(
                    "request failed with status {}: {}",
                    status.as_u16(),
                    truncate_for_error(body_trimmed, 240)
                )
            }
        });

    let with_retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
        match headers.and_then(extract_retry_after_seconds) {
            Some(seconds) => format!("{message} [retry_after_seconds={seconds}]"),
            None => message,
        }
    } else {
        message
    };

    let tagged = format!("{} [http_status={}]", with_retry_after, status.as_u16());

    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            let issues: Vec<ValidationIssue> =
                parsed.map(|body| body.errors).unwrap_or_default();
            T8dError::validation(tagged, issues)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => T8dError::auth(tagged),
        _ => T8dError::sync(tagged),
    }
}

fn extract_retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .and_then(|value| value.parse::<u64>().ok())
}

fn truncate_for_error(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }

    let truncated: String = input.chars().take(max_chars).collect();
    format!("{truncated}...")
}

fn network_error(err: reqwest::Error) -> T8dError {
    if err.is_timeout() {
        return T8dError::sync(format!("network request failed: timed out: {err}"));
    }
    T8dError::sync(format!("network request failed: {err}"))
}
