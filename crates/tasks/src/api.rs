//! REST collaborator for generation tasks.
//!
//! [`GenerationApi`] is the seam the coordinator and the reconciler talk
//! through; [`HttpGenerationApi`] implements it over [`reqwest`] against
//! the backend's `/generation` endpoints.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use mangaforge_core::task::{
    GenerationConfig, TaskDescriptor, TaskId, TaskKind, TaskRecord, TaskStatusSnapshot,
};

/// Body of `POST /generation/batch`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(rename = "sceneIds")]
    pub subject_ids: Vec<String>,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<GenerationConfig>,
}

/// Errors from the generation REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, decode).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Generation API error ({status}): {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The backend refused to cancel the task (already finished or not
    /// cancellable in its current state).
    #[error("Task {0} cannot be cancelled")]
    NotCancellable(TaskId),
}

/// Backend operations used by the task subsystem.
#[async_trait]
pub trait GenerationApi: Send + Sync {
    /// Submit a batch in a single call. Returns one descriptor per task
    /// the backend created.
    async fn submit_batch(&self, request: &BatchRequest) -> Result<Vec<TaskDescriptor>, ApiError>;

    /// Current status of one task.
    async fn fetch_status(&self, task_id: &TaskId) -> Result<TaskStatusSnapshot, ApiError>;

    async fn cancel_task(&self, task_id: &TaskId) -> Result<(), ApiError>;

    /// Ask the backend to run a failed task again. The returned descriptor
    /// may carry a new task id.
    async fn retry_task(&self, task_id: &TaskId) -> Result<TaskDescriptor, ApiError>;

    /// Every task the backend still considers pending or running.
    async fn list_active(&self) -> Result<Vec<TaskRecord>, ApiError>;

    /// Tasks the backend has finished successfully.
    async fn list_completed(&self) -> Result<Vec<TaskRecord>, ApiError>;
}

/// HTTP client for the generation endpoints.
pub struct HttpGenerationApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpGenerationApi {
    /// * `base_url` - REST base URL, e.g. `http://host:8080/api/v1`.
    /// * `token`    - bearer credential attached to every request.
    /// * `timeout`  - per-request timeout.
    pub fn new(base_url: String, token: Option<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, token))
    }

    /// Reuse an existing [`reqwest::Client`] (connection pooling).
    pub fn with_client(client: reqwest::Client, base_url: String, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    // ---- private helpers ----

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or an [`ApiError::Http`] carrying
    /// the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl GenerationApi for HttpGenerationApi {
    async fn submit_batch(&self, request: &BatchRequest) -> Result<Vec<TaskDescriptor>, ApiError> {
        let response = self
            .request(reqwest::Method::POST, "/generation/batch")
            .json(request)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn fetch_status(&self, task_id: &TaskId) -> Result<TaskStatusSnapshot, ApiError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/generation/task/{task_id}"))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn cancel_task(&self, task_id: &TaskId) -> Result<(), ApiError> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/generation/task/{task_id}"))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(ApiError::NotCancellable(task_id.clone()));
        }
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn retry_task(&self, task_id: &TaskId) -> Result<TaskDescriptor, ApiError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/generation/task/{task_id}/retry"))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn list_active(&self) -> Result<Vec<TaskRecord>, ApiError> {
        let response = self
            .request(reqwest::Method::GET, "/generation/tasks/active")
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn list_completed(&self) -> Result<Vec<TaskRecord>, ApiError> {
        let response = self
            .request(reqwest::Method::GET, "/generation/tasks/completed")
            .send()
            .await?;
        Self::parse_response(response).await
    }
}
