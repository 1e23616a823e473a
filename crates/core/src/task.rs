//! Generation task model and the timestamp-ordered merge rule.
//!
//! A [`Task`] is written by two independent sources: push events and
//! periodic status polls. Both go through [`Task::merge`], which applies a
//! [`TaskPatch`] only when its source timestamp is not older than the
//! task's `updated_at` and the task has not already reached a terminal
//! status. The final state therefore depends on timestamps, never on the
//! order in which updates happen to arrive.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Timestamp;

/// Upper bound of [`Task::progress`].
pub const MAX_PROGRESS: u8 = 100;

/// Message recorded on tasks cancelled from this client.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Maximum number of subjects accepted in one batch submission.
pub const MAX_BATCH_SIZE: usize = 200;

// ---------------------------------------------------------------------------
// Identifiers and enums
// ---------------------------------------------------------------------------

/// Server-assigned, globally unique task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What a task generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Image,
    Video,
    Audio,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            other => Err(CoreError::Validation(format!(
                "unknown task kind '{other}' (expected image, video or audio)"
            ))),
        }
    }
}

/// Task lifecycle status. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Pending or processing: the task still needs status tracking.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Status as reported by the backend.
///
/// The backend knows a distinct `cancelled` status; locally it folds into
/// [`TaskStatus::Failed`] with a [`TaskErrorCode::Cancelled`] error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    Pending,
    #[serde(alias = "running")]
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ReportedStatus {
    pub fn status(self) -> TaskStatus {
        match self {
            Self::Pending => TaskStatus::Pending,
            Self::Processing => TaskStatus::Processing,
            Self::Completed => TaskStatus::Completed,
            Self::Failed | Self::Cancelled => TaskStatus::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors attached to failed tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorCode {
    /// The generation itself failed server-side.
    Generation,
    /// Cancelled by a user or by the system.
    Cancelled,
    #[serde(other)]
    Unknown,
}

/// Structured failure reason, present exactly when a task has failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub code: TaskErrorCode,
    pub message: String,
    #[serde(default, alias = "retry_able")]
    pub retryable: bool,
}

impl TaskError {
    pub fn generation(message: impl Into<String>) -> Self {
        Self {
            code: TaskErrorCode::Generation,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn cancelled_by_user() -> Self {
        Self {
            code: TaskErrorCode::Cancelled,
            message: CANCELLED_BY_USER.to_string(),
            retryable: true,
        }
    }

    pub fn unknown() -> Self {
        Self {
            code: TaskErrorCode::Unknown,
            message: "generation failed without a reported reason".to_string(),
            retryable: true,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == TaskErrorCode::Cancelled
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Failure reason as it appears on the wire: either a bare message or a
/// structured object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ReportedError {
    Detailed(TaskError),
    Message(String),
}

impl ReportedError {
    pub fn into_task_error(self) -> TaskError {
        match self {
            Self::Detailed(error) => error,
            Self::Message(message) => TaskError::generation(message),
        }
    }
}

/// Convert a reported progress value (possibly fractional or out of range)
/// into a whole percentage.
pub fn clamp_progress(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, MAX_PROGRESS as f64) as u8
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One unit of generation work tracked from submission to terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// The work item this task acts on, typically a scene id.
    pub subject_id: String,
    pub status: TaskStatus,
    /// Completion percentage, 0-100.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Reference (URL or id) to the produced media. Only when completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    /// Failure reason. Always set when failed, never otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// Status polling for this task has been failing repeatedly. The job
    /// may still be running server-side.
    #[serde(default)]
    pub degraded: bool,
    pub started_at: Timestamp,
    /// Source timestamp of the last applied write.
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

/// Result of merging a [`TaskPatch`] into a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// The patch's source timestamp predates the task's `updated_at`.
    Stale,
    /// The task is already terminal; its status is frozen.
    TerminalLocked,
}

impl Task {
    /// A freshly submitted task: pending, zero progress.
    pub fn pending(id: TaskId, kind: TaskKind, subject_id: impl Into<String>, at: Timestamp) -> Self {
        Self {
            id,
            kind,
            subject_id: subject_id.into(),
            status: TaskStatus::Pending,
            progress: 0,
            current_step: None,
            message: None,
            result_ref: None,
            error: None,
            degraded: false,
            started_at: at,
            updated_at: at,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == TaskStatus::Failed
            && self.error.as_ref().is_some_and(TaskError::is_cancellation)
    }

    /// Apply `patch` if `source` is not older than `updated_at` and the task
    /// is not terminal.
    pub fn merge(&mut self, patch: &TaskPatch, source: Timestamp) -> MergeOutcome {
        if source < self.updated_at {
            return MergeOutcome::Stale;
        }
        if self.is_terminal() {
            return MergeOutcome::TerminalLocked;
        }

        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress.min(MAX_PROGRESS);
        }
        if patch.current_step.is_some() {
            self.current_step.clone_from(&patch.current_step);
        }
        if patch.message.is_some() {
            self.message.clone_from(&patch.message);
        }
        if patch.result_ref.is_some() {
            self.result_ref.clone_from(&patch.result_ref);
        }
        if patch.error.is_some() {
            self.error.clone_from(&patch.error);
        }
        self.updated_at = source;
        self.normalize();

        MergeOutcome::Applied
    }

    /// Re-establish the status/result/error invariants after a write.
    fn normalize(&mut self) {
        match self.status {
            TaskStatus::Pending | TaskStatus::Processing => {
                self.result_ref = None;
                self.error = None;
                self.finished_at = None;
            }
            TaskStatus::Completed => {
                self.error = None;
                self.progress = MAX_PROGRESS;
                self.degraded = false;
                self.finished_at.get_or_insert(self.updated_at);
            }
            TaskStatus::Failed => {
                self.result_ref = None;
                if self.error.is_none() {
                    self.error = Some(TaskError::unknown());
                }
                self.degraded = false;
                self.finished_at.get_or_insert(self.updated_at);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

/// A partial change to a task. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub current_step: Option<String>,
    pub message: Option<String>,
    pub result_ref: Option<String>,
    pub error: Option<TaskError>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Processing at the given percentage.
    pub fn progress(progress: u8) -> Self {
        Self {
            status: Some(TaskStatus::Processing),
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn completed(result_ref: Option<String>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            result_ref,
            ..Default::default()
        }
    }

    pub fn failed(error: TaskError) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        Self::failed(TaskError::cancelled_by_user())
    }

    /// Build a patch from a backend-reported status, folding `cancelled`
    /// into a failed patch with a cancellation error.
    pub fn reported(status: ReportedStatus, error: Option<TaskError>) -> Self {
        let error = match (status, error) {
            (ReportedStatus::Cancelled, None) => Some(TaskError::cancelled_by_user()),
            (_, error) => error,
        };
        Self {
            status: Some(status.status()),
            error,
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_current_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Full task state returned by a status query.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusSnapshot {
    pub task_id: TaskId,
    pub status: ReportedStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "resultUrl")]
    pub result_ref: Option<String>,
    #[serde(default)]
    pub error: Option<ReportedError>,
    pub updated_at: Timestamp,
}

impl TaskStatusSnapshot {
    pub fn to_patch(&self) -> TaskPatch {
        let error = self.error.clone().map(ReportedError::into_task_error);
        TaskPatch {
            progress: self.progress.map(clamp_progress),
            current_step: self.current_step.clone(),
            message: self.message.clone(),
            result_ref: self.result_ref.clone(),
            ..TaskPatch::reported(self.status, error)
        }
    }
}

/// One entry of a batch submission response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    #[serde(alias = "id")]
    pub task_id: TaskId,
    #[serde(alias = "type")]
    pub kind: TaskKind,
    #[serde(alias = "sceneId")]
    pub subject_id: String,
    #[serde(alias = "startedAt")]
    pub created_at: Timestamp,
}

impl TaskDescriptor {
    pub fn into_pending_task(self) -> Task {
        Task::pending(self.task_id, self.kind, self.subject_id, self.created_at)
    }
}

/// A full task as listed by the backend (e.g. the active-task listing).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(alias = "id")]
    pub task_id: TaskId,
    #[serde(alias = "type")]
    pub kind: TaskKind,
    #[serde(alias = "sceneId")]
    pub subject_id: String,
    #[serde(alias = "createdAt")]
    pub started_at: Timestamp,
    pub status: ReportedStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "resultUrl")]
    pub result_ref: Option<String>,
    #[serde(default)]
    pub error: Option<ReportedError>,
    pub updated_at: Timestamp,
}

impl TaskRecord {
    /// Build the local task through the regular merge path so that the
    /// status invariants hold.
    pub fn into_task(self) -> Task {
        let error = self.error.map(ReportedError::into_task_error);
        let patch = TaskPatch {
            progress: self.progress.map(clamp_progress),
            current_step: self.current_step,
            message: self.message,
            result_ref: self.result_ref,
            ..TaskPatch::reported(self.status, error)
        };
        let mut task = Task::pending(self.task_id, self.kind, self.subject_id, self.started_at);
        task.merge(&patch, self.updated_at.max(self.started_at));
        task
    }
}

// ---------------------------------------------------------------------------
// Submission parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

/// Free-form generation parameters forwarded to the backend untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    /// Clip duration in seconds (video/audio).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Validate the subject list of a batch submission.
///
/// Rules:
/// - At least one subject, at most [`MAX_BATCH_SIZE`].
/// - No blank ids.
/// - No duplicates (the backend would create two tasks for one subject).
pub fn validate_batch(subject_ids: &[String]) -> Result<(), CoreError> {
    if subject_ids.is_empty() {
        return Err(CoreError::Validation(
            "batch must contain at least one subject".to_string(),
        ));
    }
    if subject_ids.len() > MAX_BATCH_SIZE {
        return Err(CoreError::Validation(format!(
            "batch of {} subjects exceeds the limit of {MAX_BATCH_SIZE}",
            subject_ids.len()
        )));
    }
    let mut seen = std::collections::HashSet::with_capacity(subject_ids.len());
    for id in subject_ids {
        if id.trim().is_empty() {
            return Err(CoreError::Validation("subject id must not be blank".to_string()));
        }
        if !seen.insert(id.as_str()) {
            return Err(CoreError::Validation(format!("duplicate subject id '{id}'")));
        }
    }
    Ok(())
}
