//! Shared fixtures for the task integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};

use mangaforge_core::task::{
    ReportedStatus, TaskDescriptor, TaskId, TaskRecord, TaskStatusSnapshot,
};
use mangaforge_core::types::Timestamp;
use mangaforge_tasks::{ApiError, BatchRequest, GenerationApi};

/// Fixed instant all fixtures are relative to.
pub fn at(secs: i64) -> Timestamp {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
}

pub fn snapshot(id: &str, status: ReportedStatus, progress: f64, updated: i64) -> TaskStatusSnapshot {
    TaskStatusSnapshot {
        task_id: TaskId::from(id),
        status,
        progress: Some(progress),
        current_step: None,
        message: None,
        result_ref: None,
        error: None,
        updated_at: at(updated),
    }
}

/// In-memory [`GenerationApi`] with scripted answers and call counters.
#[derive(Default)]
pub struct MockApi {
    next_id: AtomicU64,
    pub reject_submit: AtomicBool,
    /// Hang every status request until the caller gives up.
    pub hang_status: AtomicBool,
    pub submitted: Mutex<Vec<BatchRequest>>,
    statuses: Mutex<HashMap<TaskId, TaskStatusSnapshot>>,
    failing: Mutex<HashSet<TaskId>>,
    not_cancellable: Mutex<HashSet<TaskId>>,
    fetches: Mutex<HashMap<TaskId, usize>>,
    pub cancelled: Mutex<Vec<TaskId>>,
    pub active: Mutex<Vec<TaskRecord>>,
    pub completed: Mutex<Vec<TaskRecord>>,
    pub reject_completed: AtomicBool,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, snapshot: TaskStatusSnapshot) {
        self.statuses
            .lock()
            .unwrap()
            .insert(snapshot.task_id.clone(), snapshot);
    }

    /// Answer status requests for `id` with `snapshot`, whatever task it
    /// describes.
    pub fn set_status_for(&self, id: &str, snapshot: TaskStatusSnapshot) {
        self.statuses.lock().unwrap().insert(TaskId::from(id), snapshot);
    }

    pub fn fail_status(&self, id: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(TaskId::from(id));
        } else {
            set.remove(id);
        }
    }

    pub fn refuse_cancel(&self, id: &str) {
        self.not_cancellable.lock().unwrap().insert(TaskId::from(id));
    }

    pub fn fetch_count(&self, id: &str) -> usize {
        self.fetches.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }

    pub fn submit_calls(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    fn descriptor(&self, subject_id: &str, kind: mangaforge_core::task::TaskKind) -> TaskDescriptor {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        TaskDescriptor {
            task_id: TaskId::new(format!("task-{n}")),
            kind,
            subject_id: subject_id.to_string(),
            created_at: at(0),
        }
    }
}

#[async_trait]
impl GenerationApi for MockApi {
    async fn submit_batch(&self, request: &BatchRequest) -> Result<Vec<TaskDescriptor>, ApiError> {
        self.submitted.lock().unwrap().push(request.clone());
        if self.reject_submit.load(Ordering::SeqCst) {
            return Err(ApiError::Http {
                status: 503,
                body: "generation backend unavailable".into(),
            });
        }
        Ok(request
            .subject_ids
            .iter()
            .map(|subject| self.descriptor(subject, request.kind))
            .collect())
    }

    async fn fetch_status(&self, task_id: &TaskId) -> Result<TaskStatusSnapshot, ApiError> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(task_id.clone())
            .or_default() += 1;

        if self.hang_status.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.lock().unwrap().contains(task_id) {
            return Err(ApiError::Http {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        self.statuses
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| ApiError::Http {
                status: 404,
                body: format!("no task {task_id}"),
            })
    }

    async fn cancel_task(&self, task_id: &TaskId) -> Result<(), ApiError> {
        if self.not_cancellable.lock().unwrap().contains(task_id) {
            return Err(ApiError::NotCancellable(task_id.clone()));
        }
        self.cancelled.lock().unwrap().push(task_id.clone());
        Ok(())
    }

    async fn retry_task(&self, task_id: &TaskId) -> Result<TaskDescriptor, ApiError> {
        let _ = task_id;
        Ok(self.descriptor("retried", mangaforge_core::task::TaskKind::Image))
    }

    async fn list_active(&self) -> Result<Vec<TaskRecord>, ApiError> {
        Ok(self.active.lock().unwrap().clone())
    }

    async fn list_completed(&self) -> Result<Vec<TaskRecord>, ApiError> {
        if self.reject_completed.load(Ordering::SeqCst) {
            return Err(ApiError::Http {
                status: 500,
                body: "listing unavailable".into(),
            });
        }
        Ok(self.completed.lock().unwrap().clone())
    }
}
