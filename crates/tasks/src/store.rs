//! Observable in-memory task collection.
//!
//! [`TaskStore`] keeps every tracked [`Task`] in a [`TaskSnapshot`] published
//! through a [`tokio::sync::watch`] channel. Each mutation runs inside a
//! single `send_if_modified` closure: the map change and the recomputation
//! of the derived views (active, completed, failed, per-subject) happen
//! together, so no reader ever sees a view that disagrees with the map.
//! Rejected writes (stale or terminal-locked) do not notify observers.

use std::collections::HashMap;

use tokio::sync::watch;

use mangaforge_core::task::{MergeOutcome, Task, TaskId, TaskPatch, TaskStatus};
use mangaforge_core::types::Timestamp;

/// Result of a store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Older than the task's current `updated_at`; discarded.
    Stale,
    /// The task is already completed or failed; discarded.
    TerminalLocked,
    /// No task with that id is tracked.
    Unknown,
}

impl UpdateOutcome {
    pub fn is_applied(self) -> bool {
        self == UpdateOutcome::Applied
    }
}

impl From<MergeOutcome> for UpdateOutcome {
    fn from(outcome: MergeOutcome) -> Self {
        match outcome {
            MergeOutcome::Applied => UpdateOutcome::Applied,
            MergeOutcome::Stale => UpdateOutcome::Stale,
            MergeOutcome::TerminalLocked => UpdateOutcome::TerminalLocked,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskSnapshot
// ---------------------------------------------------------------------------

/// A consistent view of the task collection.
///
/// All views are ordered by `started_at`, then by id.
#[derive(Debug, Clone, Default)]
pub struct TaskSnapshot {
    tasks: HashMap<TaskId, Task>,
    ordered: Vec<TaskId>,
    active: Vec<TaskId>,
    completed: Vec<TaskId>,
    failed: Vec<TaskId>,
    by_subject: HashMap<String, Vec<TaskId>>,
}

impl TaskSnapshot {
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &Task> {
        self.resolve(&self.ordered)
    }

    /// Pending and processing tasks.
    pub fn active(&self) -> impl Iterator<Item = &Task> {
        self.resolve(&self.active)
    }

    pub fn completed(&self) -> impl Iterator<Item = &Task> {
        self.resolve(&self.completed)
    }

    /// Failed tasks, including cancelled ones.
    pub fn failed(&self) -> impl Iterator<Item = &Task> {
        self.resolve(&self.failed)
    }

    pub fn for_subject(&self, subject_id: &str) -> impl Iterator<Item = &Task> {
        let ids = self
            .by_subject
            .get(subject_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        self.resolve(ids)
    }

    pub fn active_ids(&self) -> &[TaskId] {
        &self.active
    }

    fn resolve<'a>(&'a self, ids: &'a [TaskId]) -> impl Iterator<Item = &'a Task> {
        ids.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Rebuild every derived view from the map.
    fn recompute(&mut self) {
        let mut ordered: Vec<&Task> = self.tasks.values().collect();
        ordered.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });

        let mut active = Vec::new();
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut by_subject: HashMap<String, Vec<TaskId>> = HashMap::new();
        for task in &ordered {
            match task.status {
                TaskStatus::Pending | TaskStatus::Processing => active.push(task.id.clone()),
                TaskStatus::Completed => completed.push(task.id.clone()),
                TaskStatus::Failed => failed.push(task.id.clone()),
            }
            by_subject
                .entry(task.subject_id.clone())
                .or_default()
                .push(task.id.clone());
        }

        self.ordered = ordered.into_iter().map(|t| t.id.clone()).collect();
        self.active = active;
        self.completed = completed;
        self.failed = failed;
        self.by_subject = by_subject;
    }

    fn upsert(&mut self, task: Task) -> UpdateOutcome {
        match self.tasks.get_mut(&task.id) {
            None => {
                self.tasks.insert(task.id.clone(), task);
                UpdateOutcome::Applied
            }
            Some(existing) => {
                let patch = TaskPatch {
                    status: Some(task.status),
                    progress: Some(task.progress),
                    current_step: task.current_step,
                    message: task.message,
                    result_ref: task.result_ref,
                    error: task.error,
                };
                existing.merge(&patch, task.updated_at).into()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Single source of truth for tracked tasks.
///
/// Shared as `Arc<TaskStore>` between the push handlers, the reconciler
/// and the coordinator. Observers call [`TaskStore::subscribe`].
pub struct TaskStore {
    tx: watch::Sender<TaskSnapshot>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(TaskSnapshot::default());
        Self { tx }
    }

    /// Insert an unseen task, or merge it into the existing one using its
    /// `updated_at` as the source timestamp.
    pub fn upsert(&self, task: Task) -> UpdateOutcome {
        let id = task.id.clone();
        let mut outcome = UpdateOutcome::Unknown;
        self.tx.send_if_modified(|snapshot| {
            outcome = snapshot.upsert(task);
            Self::finish(snapshot, outcome)
        });
        Self::log_rejection(&id, outcome);
        outcome
    }

    /// Upsert several tasks with a single notification.
    pub fn upsert_all(&self, tasks: impl IntoIterator<Item = Task>) -> Vec<UpdateOutcome> {
        let mut outcomes = Vec::new();
        self.tx.send_if_modified(|snapshot| {
            for task in tasks {
                let id = task.id.clone();
                let outcome = snapshot.upsert(task);
                Self::log_rejection(&id, outcome);
                outcomes.push(outcome);
            }
            let modified = outcomes.iter().any(|o| o.is_applied());
            if modified {
                snapshot.recompute();
            }
            modified
        });
        outcomes
    }

    /// Replace a task wholesale, bypassing the merge rule.
    ///
    /// Used when the backend re-issues a task id (retry). Returns the
    /// previous task, if any.
    pub fn replace(&self, task: Task) -> Option<Task> {
        let mut previous = None;
        self.tx.send_modify(|snapshot| {
            previous = snapshot.tasks.insert(task.id.clone(), task);
            snapshot.recompute();
        });
        previous
    }

    /// Merge `patch` into task `id` if `source` is not older than the
    /// task's `updated_at` and the task is not terminal.
    pub fn apply_update(&self, id: &TaskId, patch: &TaskPatch, source: Timestamp) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::Unknown;
        self.tx.send_if_modified(|snapshot| {
            outcome = match snapshot.tasks.get_mut(id) {
                Some(task) => task.merge(patch, source).into(),
                None => UpdateOutcome::Unknown,
            };
            Self::finish(snapshot, outcome)
        });
        Self::log_rejection(id, outcome);
        outcome
    }

    /// Merge a patch that carries no backend timestamp.
    ///
    /// The patch is stamped with the task's own `updated_at`, so it lands
    /// unless the task is terminal but never outranks a later answer that
    /// the backend did stamp.
    pub fn apply_unstamped(&self, id: &TaskId, patch: &TaskPatch) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::Unknown;
        self.tx.send_if_modified(|snapshot| {
            outcome = match snapshot.tasks.get_mut(id) {
                Some(task) => {
                    let stamp = task.updated_at;
                    task.merge(patch, stamp).into()
                }
                None => UpdateOutcome::Unknown,
            };
            Self::finish(snapshot, outcome)
        });
        Self::log_rejection(id, outcome);
        outcome
    }

    /// Optimistically mark a task as cancelled by the user.
    ///
    /// The write is stamped `max(at, updated_at)` so that it always
    /// supersedes what the store already holds.
    pub fn cancel(&self, id: &TaskId, at: Timestamp) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::Unknown;
        self.tx.send_if_modified(|snapshot| {
            outcome = match snapshot.tasks.get_mut(id) {
                Some(task) => {
                    let stamp = at.max(task.updated_at);
                    task.merge(&TaskPatch::cancelled(), stamp).into()
                }
                None => UpdateOutcome::Unknown,
            };
            Self::finish(snapshot, outcome)
        });
        Self::log_rejection(id, outcome);
        outcome
    }

    /// Set or clear the degraded flag. Does not touch `updated_at`.
    ///
    /// Returns `true` when the flag changed.
    pub fn mark_degraded(&self, id: &TaskId, degraded: bool) -> bool {
        self.tx.send_if_modified(|snapshot| match snapshot.tasks.get_mut(id) {
            Some(task) if !task.is_terminal() && task.degraded != degraded => {
                task.degraded = degraded;
                true
            }
            _ => false,
        })
    }

    pub fn remove(&self, id: &TaskId) -> Option<Task> {
        let mut removed = None;
        self.tx.send_if_modified(|snapshot| {
            removed = snapshot.tasks.remove(id);
            if removed.is_some() {
                snapshot.recompute();
            }
            removed.is_some()
        });
        removed
    }

    /// Drop every completed task. Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        let mut removed = 0;
        self.tx.send_if_modified(|snapshot| {
            let before = snapshot.tasks.len();
            snapshot
                .tasks
                .retain(|_, task| task.status != TaskStatus::Completed);
            removed = before - snapshot.tasks.len();
            if removed > 0 {
                snapshot.recompute();
            }
            removed > 0
        });
        removed
    }

    // ---- reads ----

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tx.borrow().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Task> {
        self.tx.borrow().all().cloned().collect()
    }

    pub fn active_tasks(&self) -> Vec<Task> {
        self.tx.borrow().active().cloned().collect()
    }

    pub fn active_ids(&self) -> Vec<TaskId> {
        self.tx.borrow().active_ids().to_vec()
    }

    pub fn completed_tasks(&self) -> Vec<Task> {
        self.tx.borrow().completed().cloned().collect()
    }

    pub fn failed_tasks(&self) -> Vec<Task> {
        self.tx.borrow().failed().cloned().collect()
    }

    pub fn tasks_for(&self, subject_id: &str) -> Vec<Task> {
        self.tx.borrow().for_subject(subject_id).cloned().collect()
    }

    pub fn has_active(&self) -> bool {
        self.tx.borrow().has_active()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.tx.borrow().clone()
    }

    /// Receive a notification after every applied mutation.
    pub fn subscribe(&self) -> watch::Receiver<TaskSnapshot> {
        self.tx.subscribe()
    }

    // ---- private helpers ----

    fn finish(snapshot: &mut TaskSnapshot, outcome: UpdateOutcome) -> bool {
        if outcome.is_applied() {
            snapshot.recompute();
            true
        } else {
            false
        }
    }

    fn log_rejection(id: &TaskId, outcome: UpdateOutcome) {
        match outcome {
            UpdateOutcome::Applied => {}
            UpdateOutcome::Stale => {
                tracing::debug!(task_id = %id, "Discarding stale task update");
            }
            UpdateOutcome::TerminalLocked => {
                tracing::debug!(task_id = %id, "Discarding update for terminal task");
            }
            UpdateOutcome::Unknown => {
                tracing::debug!(task_id = %id, "Discarding update for untracked task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use mangaforge_core::task::{TaskError, TaskKind, CANCELLED_BY_USER};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn pending(id: &str, subject: &str, started: i64) -> Task {
        Task::pending(TaskId::from(id), TaskKind::Image, subject, at(started))
    }

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn upsert_inserts_and_classifies() {
        let store = TaskStore::new();
        assert_eq!(store.upsert(pending("t-1", "s-1", 0)), UpdateOutcome::Applied);
        assert_eq!(store.len(), 1);
        assert_eq!(ids(&store.active_tasks()), ["t-1"]);
        assert!(store.completed_tasks().is_empty());
    }

    #[test]
    fn views_are_ordered_by_start_then_id() {
        let store = TaskStore::new();
        store.upsert_all([
            pending("t-b", "s-1", 5),
            pending("t-c", "s-2", 1),
            pending("t-a", "s-1", 5),
        ]);
        assert_eq!(ids(&store.all()), ["t-c", "t-a", "t-b"]);
        assert_eq!(ids(&store.tasks_for("s-1")), ["t-a", "t-b"]);
        assert!(store.tasks_for("missing").is_empty());
    }

    #[test]
    fn views_follow_status_changes() {
        let store = TaskStore::new();
        store.upsert_all([pending("t-1", "s-1", 0), pending("t-2", "s-2", 1)]);

        let id = TaskId::from("t-1");
        store.apply_update(&id, &TaskPatch::completed(Some("r.png".into())), at(3));
        store.apply_update(
            &TaskId::from("t-2"),
            &TaskPatch::failed(TaskError::generation("oom")),
            at(4),
        );

        assert!(store.active_tasks().is_empty());
        assert_eq!(ids(&store.completed_tasks()), ["t-1"]);
        assert_eq!(ids(&store.failed_tasks()), ["t-2"]);
        assert!(!store.has_active());
    }

    #[test]
    fn stale_update_does_not_notify() {
        let store = TaskStore::new();
        store.upsert(pending("t-1", "s-1", 0));
        let id = TaskId::from("t-1");
        store.apply_update(&id, &TaskPatch::progress(40), at(10));

        let mut rx = store.subscribe();
        rx.mark_unchanged();
        assert_eq!(
            store.apply_update(&id, &TaskPatch::progress(10), at(5)),
            UpdateOutcome::Stale
        );
        assert!(!rx.has_changed().unwrap());
        assert_eq!(store.get("t-1").unwrap().progress, 40);
    }

    #[test]
    fn applied_update_notifies() {
        let store = TaskStore::new();
        store.upsert(pending("t-1", "s-1", 0));
        let mut rx = store.subscribe();
        rx.mark_unchanged();

        store.apply_update(&TaskId::from("t-1"), &TaskPatch::progress(5), at(1));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().get("t-1").unwrap().progress, 5);
    }

    #[test]
    fn update_for_unknown_task() {
        let store = TaskStore::new();
        assert_eq!(
            store.apply_update(&TaskId::from("nope"), &TaskPatch::progress(5), at(1)),
            UpdateOutcome::Unknown
        );
        assert!(store.is_empty());
    }

    #[test]
    fn terminal_task_is_locked() {
        let store = TaskStore::new();
        store.upsert(pending("t-1", "s-1", 0));
        let id = TaskId::from("t-1");
        store.apply_update(&id, &TaskPatch::completed(None), at(5));
        assert_eq!(
            store.apply_update(&id, &TaskPatch::progress(50), at(9)),
            UpdateOutcome::TerminalLocked
        );
        assert_eq!(store.get("t-1").unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn upsert_existing_merges_by_timestamp() {
        let store = TaskStore::new();
        store.upsert(pending("t-1", "s-1", 0));

        let mut newer = pending("t-1", "s-1", 0);
        newer.status = TaskStatus::Processing;
        newer.progress = 30;
        newer.updated_at = at(4);
        assert_eq!(store.upsert(newer), UpdateOutcome::Applied);

        let older = pending("t-1", "s-1", 0);
        assert_eq!(store.upsert(older), UpdateOutcome::Stale);
        assert_eq!(store.get("t-1").unwrap().progress, 30);
    }

    #[test]
    fn cancel_supersedes_newer_local_state() {
        let store = TaskStore::new();
        store.upsert(pending("t-1", "s-1", 0));
        let id = TaskId::from("t-1");
        store.apply_update(&id, &TaskPatch::progress(40), at(20));

        // The cancellation instant predates the last update.
        assert_eq!(store.cancel(&id, at(10)), UpdateOutcome::Applied);
        let task = store.get("t-1").unwrap();
        assert!(task.is_cancelled());
        assert_eq!(task.error.unwrap().message, CANCELLED_BY_USER);
        assert_eq!(task.updated_at, at(20));
    }

    #[test]
    fn unstamped_update_keeps_timestamp() {
        let store = TaskStore::new();
        store.upsert(pending("t-1", "s-1", 0));
        let id = TaskId::from("t-1");
        store.apply_update(&id, &TaskPatch::progress(30), at(5));

        assert_eq!(
            store.apply_unstamped(&id, &TaskPatch::progress(90)),
            UpdateOutcome::Applied
        );
        let task = store.get("t-1").unwrap();
        assert_eq!(task.progress, 90);
        assert_eq!(task.updated_at, at(5));

        // A backend answer dated just after still lands.
        assert_eq!(
            store.apply_update(&id, &TaskPatch::completed(None), at(6)),
            UpdateOutcome::Applied
        );
        assert_eq!(
            store.apply_unstamped(&id, &TaskPatch::progress(10)),
            UpdateOutcome::TerminalLocked
        );
        assert_eq!(
            store.apply_unstamped(&TaskId::from("ghost"), &TaskPatch::progress(10)),
            UpdateOutcome::Unknown
        );
    }

    #[test]
    fn degraded_flag_does_not_move_timestamp() {
        let store = TaskStore::new();
        store.upsert(pending("t-1", "s-1", 0));
        let id = TaskId::from("t-1");

        assert!(store.mark_degraded(&id, true));
        assert!(!store.mark_degraded(&id, true));
        let task = store.get("t-1").unwrap();
        assert!(task.degraded);
        assert_eq!(task.updated_at, at(0));

        assert!(store.mark_degraded(&id, false));
        assert!(!store.get("t-1").unwrap().degraded);
    }

    #[test]
    fn remove_and_clear_completed() {
        let store = TaskStore::new();
        store.upsert_all([
            pending("t-1", "s-1", 0),
            pending("t-2", "s-1", 1),
            pending("t-3", "s-2", 2),
        ]);
        store.apply_update(&TaskId::from("t-1"), &TaskPatch::completed(None), at(3));
        store.apply_update(&TaskId::from("t-2"), &TaskPatch::cancelled(), at(3));

        assert_eq!(store.clear_completed(), 1);
        assert_eq!(ids(&store.all()), ["t-2", "t-3"]);

        let removed = store.remove(&TaskId::from("t-3")).unwrap();
        assert_eq!(removed.subject_id, "s-2");
        assert!(store.tasks_for("s-2").is_empty());
        assert!(store.remove(&TaskId::from("t-3")).is_none());
    }

    #[test]
    fn replace_bypasses_terminal_lock() {
        let store = TaskStore::new();
        store.upsert(pending("t-1", "s-1", 0));
        let id = TaskId::from("t-1");
        store.apply_update(&id, &TaskPatch::cancelled(), at(2));

        let previous = store.replace(pending("t-1", "s-1", 10)).unwrap();
        assert!(previous.is_cancelled());
        assert_eq!(store.get("t-1").unwrap().status, TaskStatus::Pending);
        assert_eq!(ids(&store.active_tasks()), ["t-1"]);
    }
}
