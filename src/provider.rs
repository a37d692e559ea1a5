//! Client for the external compute provider (video generation task API).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::TaskStatus;

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;
const MAX_RESPONSE_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider response decode error: {0}")]
    Decode(String),
    #[error("provider has no task {task_id}")]
    NotFound { task_id: String },
    #[error("malformed task id {task_id:?}")]
    InvalidTaskId { task_id: String },
    #[error("provider client error: {0}")]
    Client(String),
}

/// Mirror of one provider task as last reported.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    /// `None` when the provider did not report progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Submits `payload` for `action_type`. `Ok` means the provider accepted the task.
    async fn create_task(
        &self,
        action_type: &str,
        payload: &Value,
    ) -> Result<TaskSnapshot, ProviderError>;

    async fn task_status(&self, task_id: &str) -> Result<TaskSnapshot, ProviderError>;
}

const MAX_TASK_ID_LEN: usize = 128;

/// Task ids are opaque provider tokens: ASCII letters, digits, `-` and `_`.
pub fn validate_task_id(task_id: &str) -> Result<(), ProviderError> {
    let well_formed = !task_id.is_empty()
        && task_id.len() <= MAX_TASK_ID_LEN
        && task_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if well_formed {
        Ok(())
    } else {
        Err(ProviderError::InvalidTaskId {
            task_id: task_id.to_string(),
        })
    }
}

/// Appends `segments` and then `task_id` to `base_url`, each as one escaped path segment.
pub(crate) fn task_url(
    base_url: &str,
    segments: &[&str],
    task_id: &str,
) -> Result<reqwest::Url, ProviderError> {
    validate_task_id(task_id)?;
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|err| ProviderError::Client(format!("invalid base url: {err}")))?;
    url.path_segments_mut()
        .map_err(|()| ProviderError::Client(format!("base url {base_url} cannot take a path")))?
        .pop_if_empty()
        .extend(segments)
        .push(task_id);
    Ok(url)
}

#[derive(Debug, Default, Deserialize)]
struct WireTask {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    progress: Option<WireProgress>,
    #[serde(default)]
    result: Option<WireResult>,
}

#[derive(Debug, Default, Deserialize)]
struct WireProgress {
    #[serde(default)]
    progress_pct: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct WireResult {
    #[serde(default)]
    output_url: Option<String>,
}

impl WireTask {
    fn into_snapshot(self, fallback_id: Option<&str>) -> Result<TaskSnapshot, ProviderError> {
        let id_from_number = match &self.id {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        let task_id = self
            .task_id
            .filter(|id| !id.trim().is_empty())
            .or(id_from_number)
            .or_else(|| fallback_id.map(str::to_string))
            .ok_or_else(|| ProviderError::Decode("response carries no task id".to_string()))?;

        let status = self
            .status
            .as_deref()
            .map(TaskStatus::from_provider)
            .unwrap_or(TaskStatus::Pending);
        let progress_pct = self
            .progress
            .and_then(|progress| progress.progress_pct)
            .filter(|pct| pct.is_finite())
            .map(|pct| pct.clamp(0.0, 100.0).round() as u8);
        let result_url = self
            .result
            .and_then(|result| result.output_url)
            .filter(|url| !url.trim().is_empty());
        let message = self.message.filter(|message| !message.trim().is_empty());

        Ok(TaskSnapshot {
            task_id,
            status,
            progress_pct,
            result_url,
            message,
        })
    }
}

#[derive(Clone)]
pub struct HttpComputeProvider {
    base_url: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpComputeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpComputeProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpComputeProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProviderError::Client(err.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
            client,
        })
    }

    fn classify(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            return ProviderError::Timeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            };
        }
        ProviderError::Transport(err.to_string())
    }

    async fn read_task(
        &self,
        response: reqwest::Response,
        fallback_id: Option<&str>,
    ) -> Result<TaskSnapshot, ProviderError> {
        let wire: WireTask =
            crate::utils::http::response_json_limited(response, MAX_RESPONSE_BODY_BYTES)
                .await
                .map_err(ProviderError::Decode)?;
        wire.into_snapshot(fallback_id)
    }
}

#[async_trait]
impl ComputeProvider for HttpComputeProvider {
    async fn create_task(
        &self,
        action_type: &str,
        payload: &Value,
    ) -> Result<TaskSnapshot, ProviderError> {
        let mut body = match payload {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            _ => {
                return Err(ProviderError::Client(
                    "task payload must be a JSON object".to_string(),
                ));
            }
        };
        body.insert("model".to_string(), Value::String(action_type.to_string()));

        let url = format!("{}/task/create", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        if !status.is_success() {
            let body =
                crate::utils::http::response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            tracing::warn!(status = status.as_u16(), action_type, "provider rejected task");
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let snapshot = self.read_task(response, None).await?;
        tracing::info!(task_id = %snapshot.task_id, action_type, "provider accepted task");
        Ok(snapshot)
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskSnapshot, ProviderError> {
        let url = task_url(&self.base_url, &["task"], task_id)?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound {
                task_id: task_id.to_string(),
            });
        }
        if !status.is_success() {
            let body =
                crate::utils::http::response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        self.read_task(response, Some(task_id)).await
    }
}
