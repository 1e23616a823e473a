//! Batch submission and cancellation.
//!
//! [`BatchCoordinator`] turns user intents into backend calls and seeds or
//! updates the store from the answers. Submission is all-or-nothing at the
//! client boundary: one backend call per batch, and no task is recorded
//! unless that call succeeds.

use std::sync::Arc;

use chrono::Utc;

use mangaforge_core::error::CoreError;
use mangaforge_core::task::{validate_batch, GenerationConfig, Task, TaskId, TaskKind};

use crate::api::{ApiError, BatchRequest, GenerationApi};
use crate::store::{TaskStore, UpdateOutcome};

/// Errors surfaced to callers of the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The request was rejected before reaching the backend.
    #[error(transparent)]
    Validation(#[from] CoreError),

    /// The backend call failed. Nothing was recorded locally.
    #[error("Generation API call failed: {0}")]
    Api(#[source] ApiError),

    /// The backend refused the cancellation, or the task already finished.
    #[error("Task {0} cannot be cancelled")]
    NotCancellable(TaskId),

    /// The task is not tracked by the store.
    #[error("Task {0} is not tracked")]
    UnknownTask(TaskId),
}

impl From<ApiError> for SubmitError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::NotCancellable(id) => SubmitError::NotCancellable(id),
            other => SubmitError::Api(other),
        }
    }
}

/// Submits batches and cancels tasks on behalf of the UI.
#[derive(Clone)]
pub struct BatchCoordinator {
    store: Arc<TaskStore>,
    api: Arc<dyn GenerationApi>,
}

impl BatchCoordinator {
    pub fn new(store: Arc<TaskStore>, api: Arc<dyn GenerationApi>) -> Self {
        Self { store, api }
    }

    /// Submit one task per subject in a single backend call.
    ///
    /// On success every returned descriptor is recorded as a pending task
    /// with zero progress. On failure nothing is recorded. The backend may
    /// still have accepted part of the batch; that is reported in the logs
    /// but not reconciled.
    pub async fn submit(
        &self,
        subject_ids: Vec<String>,
        kind: TaskKind,
        config: Option<GenerationConfig>,
    ) -> Result<Vec<Task>, SubmitError> {
        validate_batch(&subject_ids)?;

        let request = BatchRequest {
            subject_ids,
            kind,
            config,
        };
        let descriptors = match self.api.submit_batch(&request).await {
            Ok(descriptors) => descriptors,
            Err(e) => {
                tracing::error!(
                    count = request.subject_ids.len(),
                    kind = kind.as_str(),
                    error = %e,
                    "Batch submission failed",
                );
                return Err(e.into());
            }
        };

        if descriptors.len() != request.subject_ids.len() {
            tracing::warn!(
                requested = request.subject_ids.len(),
                accepted = descriptors.len(),
                "Backend accepted a different number of tasks than requested",
            );
        }

        let tasks: Vec<Task> = descriptors
            .into_iter()
            .map(|descriptor| descriptor.into_pending_task())
            .collect();
        self.store.upsert_all(tasks.iter().cloned());

        tracing::info!(
            count = tasks.len(),
            kind = kind.as_str(),
            "Batch submitted",
        );
        Ok(tasks)
    }

    /// Cancel a task on the backend, then mark it cancelled locally.
    ///
    /// The local write supersedes any push or poll update dated before the
    /// cancellation instant.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<Task, SubmitError> {
        let task = self
            .store
            .get(task_id.as_str())
            .ok_or_else(|| SubmitError::UnknownTask(task_id.clone()))?;
        if task.is_terminal() {
            return Err(SubmitError::NotCancellable(task_id.clone()));
        }

        if let Err(e) = self.api.cancel_task(task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "Cancellation rejected");
            return Err(e.into());
        }

        match self.store.cancel(task_id, Utc::now()) {
            UpdateOutcome::Applied => {
                tracing::info!(task_id = %task_id, "Task cancelled");
            }
            UpdateOutcome::TerminalLocked => {
                // Finished while the request was in flight.
                tracing::info!(task_id = %task_id, "Task finished before cancellation landed");
            }
            UpdateOutcome::Stale | UpdateOutcome::Unknown => {}
        }

        self.store
            .get(task_id.as_str())
            .ok_or_else(|| SubmitError::UnknownTask(task_id.clone()))
    }

    /// Ask the backend to run a failed task again and track the result as a
    /// fresh pending task.
    pub async fn retry(&self, task_id: &TaskId) -> Result<Task, SubmitError> {
        let descriptor = self.api.retry_task(task_id).await?;
        let task = descriptor.into_pending_task();

        if task.id != *task_id {
            self.store.remove(task_id);
        }
        self.store.replace(task.clone());

        tracing::info!(
            task_id = %task_id,
            new_task_id = %task.id,
            "Task retried",
        );
        Ok(task)
    }

    /// Load the backend's active and completed tasks into the store, e.g.
    /// at start-up.
    ///
    /// The active listing is required; a failed completed listing is
    /// logged and skipped. Returns the number of tasks inserted or updated.
    pub async fn hydrate(&self) -> Result<usize, SubmitError> {
        let (active, completed) =
            tokio::join!(self.api.list_active(), self.api.list_completed());
        let mut records = active?;
        match completed {
            Ok(completed) => records.extend(completed),
            Err(e) => {
                tracing::warn!(error = %e, "Could not load completed tasks");
            }
        }

        let outcomes = self
            .store
            .upsert_all(records.into_iter().map(|record| record.into_task()));
        let applied = outcomes.iter().filter(|o| o.is_applied()).count();

        tracing::info!(
            listed = outcomes.len(),
            applied,
            "Hydrated tasks",
        );
        Ok(applied)
    }
}
