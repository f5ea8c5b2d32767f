//! Client for the external recognition worker.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use plansight_ai::{FailureCause, JobId, ModelType};

use crate::config::WorkerConfig;

/// Body of one recognition call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionRequest {
    pub subject_ref: Uuid,
    pub file_ref: String,
    pub mime_type: String,
    pub model_config: JsonValue,
    pub processing_params: JsonValue,
    pub job_id: JobId,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("worker did not answer within {0:?}")]
    Timeout(Duration),
    #[error("worker returned HTTP {status}")]
    Status { status: u16, body: String },
    #[error("worker unreachable: {0}")]
    Network(String),
    #[error("worker response is not valid JSON: {0}")]
    Decode(String),
}

impl WorkerError {
    pub fn cause(&self) -> FailureCause {
        match self {
            WorkerError::Timeout(_) => FailureCause::Timeout,
            WorkerError::Status { status, .. } => FailureCause::WorkerStatus { status: *status },
            WorkerError::Network(_) => FailureCause::Network,
            WorkerError::Decode(_) => FailureCause::InvalidResponse,
        }
    }

    /// Extra context recorded on the job's error history.
    pub fn detail(&self) -> Option<String> {
        match self {
            WorkerError::Status { body, .. } if !body.is_empty() => {
                Some(body.chars().take(MAX_DETAIL_CHARS).collect())
            }
            _ => None,
        }
    }
}

const MAX_DETAIL_CHARS: usize = 500;
/// Enough bytes for `MAX_DETAIL_CHARS` of any UTF-8 text.
const MAX_ERROR_BODY_BYTES: usize = MAX_DETAIL_CHARS * 4;

/// A recognition backend. Returns the raw response; normalization happens
/// in `plansight_ai::ingest`.
#[async_trait]
pub trait RecognitionWorker: Send + Sync {
    async fn recognize(
        &self,
        model_type: ModelType,
        request: &RecognitionRequest,
        timeout: Duration,
    ) -> Result<JsonValue, WorkerError>;
}

/// HTTP worker: one POST per attempt to the model's endpoint.
#[derive(Debug, Clone)]
pub struct HttpRecognitionWorker {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    endpoints: HashMap<ModelType, String>,
}

impl HttpRecognitionWorker {
    pub fn new(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| WorkerError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone().filter(|t| !t.is_empty()),
            endpoints: ModelType::ALL
                .into_iter()
                .filter_map(|m| config.endpoint_override(m).map(|path| (m, path.to_string())))
                .collect(),
        })
    }

    /// Full URL for `model_type`, honouring configured endpoint overrides.
    pub fn endpoint_url(&self, model_type: ModelType) -> String {
        let path = self
            .endpoints
            .get(&model_type)
            .map(String::as_str)
            .unwrap_or_else(|| model_type.default_endpoint());
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl RecognitionWorker for HttpRecognitionWorker {
    async fn recognize(
        &self,
        model_type: ModelType,
        request: &RecognitionRequest,
        timeout: Duration,
    ) -> Result<JsonValue, WorkerError> {
        let url = self.endpoint_url(model_type);
        debug!(job_id = %request.job_id, url = %url, "calling recognition worker");

        let mut builder = self.client.post(&url).timeout(timeout).json(request);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| classify(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = read_error_body(response).await;
            return Err(WorkerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(|e| classify(e, timeout))?;
        serde_json::from_slice(&bytes).map_err(|e| WorkerError::Decode(e.to_string()))
    }
}

/// Read at most `MAX_ERROR_BODY_BYTES` of an error response; the rest is
/// never buffered.
async fn read_error_body(mut response: reqwest::Response) -> String {
    let mut body = Vec::new();
    while let Ok(Some(chunk)) = response.chunk().await {
        if !push_bounded(&mut body, &chunk, MAX_ERROR_BODY_BYTES) {
            break;
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Appends as much of `chunk` as fits under `cap`. Returns false once full.
fn push_bounded(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    buf.len() < cap
}

fn classify(err: reqwest::Error, timeout: Duration) -> WorkerError {
    if err.is_timeout() {
        WorkerError::Timeout(timeout)
    } else {
        WorkerError::Network(err.to_string())
    }
}
