//! Batch submission, cancellation, retry and hydration against `MockApi`.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use assert_matches::assert_matches;

use mangaforge_core::error::CoreError;
use mangaforge_core::task::{
    GenerationConfig, Quality, ReportedStatus, TaskError, TaskId, TaskKind, TaskPatch, TaskRecord,
    TaskStatus,
};
use mangaforge_tasks::{ApiError, BatchCoordinator, SubmitError, TaskStore};

use common::{at, MockApi};

fn setup() -> (Arc<MockApi>, Arc<TaskStore>, BatchCoordinator) {
    let api = Arc::new(MockApi::new());
    let store = Arc::new(TaskStore::new());
    let coordinator = BatchCoordinator::new(Arc::clone(&store), api.clone());
    (api, store, coordinator)
}

fn scenes(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Test: submit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_sends_one_request_with_config() {
    let (api, store, coordinator) = setup();
    let config = GenerationConfig {
        style: Some("ink".into()),
        quality: Some(Quality::High),
        ..Default::default()
    };

    let tasks = coordinator
        .submit(scenes(&["s-1", "s-2"]), TaskKind::Video, Some(config.clone()))
        .await
        .unwrap();

    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].subject_id, "s-1");
    assert_eq!(tasks[1].subject_id, "s-2");
    assert_eq!(store.tasks_for("s-2").len(), 1);

    let submitted = api.submitted.lock().unwrap();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].kind, TaskKind::Video);
    assert_eq!(submitted[0].config.as_ref(), Some(&config));
}

#[tokio::test]
async fn failed_submit_records_nothing() {
    let (api, store, coordinator) = setup();
    api.reject_submit.store(true, Ordering::SeqCst);

    let err = coordinator
        .submit(scenes(&["s-1", "s-2", "s-3"]), TaskKind::Image, None)
        .await
        .unwrap_err();

    assert_matches!(err, SubmitError::Api(ApiError::Http { status: 503, .. }));
    assert!(store.is_empty());
    assert_eq!(api.submit_calls(), 1);
}

#[tokio::test]
async fn invalid_batch_never_reaches_backend() {
    let (api, store, coordinator) = setup();

    let err = coordinator
        .submit(Vec::new(), TaskKind::Image, None)
        .await
        .unwrap_err();
    assert_matches!(err, SubmitError::Validation(CoreError::Validation(_)));

    let err = coordinator
        .submit(scenes(&["s-1", "s-1"]), TaskKind::Image, None)
        .await
        .unwrap_err();
    assert_matches!(err, SubmitError::Validation(_));

    assert_eq!(api.submit_calls(), 0);
    assert!(store.is_empty());
}

// ---------------------------------------------------------------------------
// Test: cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_unknown_task() {
    let (api, _store, coordinator) = setup();
    let err = coordinator.cancel(&TaskId::from("ghost")).await.unwrap_err();
    assert_matches!(err, SubmitError::UnknownTask(id) if id.as_str() == "ghost");
    assert!(api.cancelled.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_refused_by_backend_leaves_task_untouched() {
    let (api, store, coordinator) = setup();
    let tasks = coordinator
        .submit(scenes(&["s-1"]), TaskKind::Image, None)
        .await
        .unwrap();
    let id = tasks[0].id.clone();
    api.refuse_cancel(id.as_str());

    let err = coordinator.cancel(&id).await.unwrap_err();
    assert_matches!(err, SubmitError::NotCancellable(_));

    let task = store.get(id.as_str()).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.error.is_none());
}

#[tokio::test]
async fn cancel_finished_task_skips_backend() {
    let (api, store, coordinator) = setup();
    let tasks = coordinator
        .submit(scenes(&["s-1"]), TaskKind::Image, None)
        .await
        .unwrap();
    let id = tasks[0].id.clone();
    store.apply_update(&id, &TaskPatch::completed(Some("https://cdn/1.png".into())), at(5));

    let err = coordinator.cancel(&id).await.unwrap_err();
    assert_matches!(err, SubmitError::NotCancellable(_));
    assert!(api.cancelled.lock().unwrap().is_empty());
    assert_eq!(store.get(id.as_str()).unwrap().status, TaskStatus::Completed);
}

// ---------------------------------------------------------------------------
// Test: retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_replaces_failed_task() {
    let (_api, store, coordinator) = setup();
    let tasks = coordinator
        .submit(scenes(&["s-1"]), TaskKind::Image, None)
        .await
        .unwrap();
    let old = tasks[0].id.clone();
    store.apply_update(&old, &TaskPatch::failed(TaskError::generation("oom")), at(3));

    let fresh = coordinator.retry(&old).await.unwrap();

    assert_ne!(fresh.id, old);
    assert_eq!(fresh.status, TaskStatus::Pending);
    assert!(store.get(old.as_str()).is_none());
    assert_eq!(store.get(fresh.id.as_str()).unwrap().status, TaskStatus::Pending);
    assert!(store.has_active());
}

// ---------------------------------------------------------------------------
// Test: hydrate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hydrate_loads_active_tasks() {
    let (api, store, coordinator) = setup();
    api.active.lock().unwrap().extend([
        TaskRecord {
            task_id: TaskId::from("a-1"),
            kind: TaskKind::Image,
            subject_id: "s-1".into(),
            started_at: at(0),
            status: ReportedStatus::Processing,
            progress: Some(55.4),
            current_step: Some("upscaling".into()),
            message: None,
            result_ref: None,
            error: None,
            updated_at: at(7),
        },
        TaskRecord {
            task_id: TaskId::from("a-2"),
            kind: TaskKind::Audio,
            subject_id: "s-2".into(),
            started_at: at(1),
            status: ReportedStatus::Pending,
            progress: None,
            current_step: None,
            message: None,
            result_ref: None,
            error: None,
            updated_at: at(1),
        },
    ]);

    let applied = coordinator.hydrate().await.unwrap();
    assert_eq!(applied, 2);

    let first = store.get("a-1").unwrap();
    assert_eq!(first.status, TaskStatus::Processing);
    assert_eq!(first.progress, 55);
    assert_eq!(first.current_step.as_deref(), Some("upscaling"));
    assert_eq!(first.updated_at, at(7));
    assert_eq!(store.active_ids().len(), 2);
}

fn completed_record(id: &str, subject: &str) -> TaskRecord {
    TaskRecord {
        task_id: TaskId::from(id),
        kind: TaskKind::Video,
        subject_id: subject.into(),
        started_at: at(0),
        status: ReportedStatus::Completed,
        progress: Some(100.0),
        current_step: None,
        message: None,
        result_ref: Some(format!("https://cdn/{id}.mp4")),
        error: None,
        updated_at: at(30),
    }
}

#[tokio::test]
async fn hydrate_restores_completed_view() {
    let (api, store, coordinator) = setup();
    api.completed
        .lock()
        .unwrap()
        .extend([completed_record("c-1", "s-1"), completed_record("c-2", "s-2")]);

    assert_eq!(coordinator.hydrate().await.unwrap(), 2);

    let completed = store.completed_tasks();
    assert_eq!(completed.len(), 2);
    let first = store.get("c-1").unwrap();
    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(first.result_ref.as_deref(), Some("https://cdn/c-1.mp4"));
    assert_eq!(first.finished_at, Some(at(30)));
    assert!(!store.has_active());
}

#[tokio::test]
async fn hydrate_survives_failed_completed_listing() {
    let (api, store, coordinator) = setup();
    api.reject_completed.store(true, Ordering::SeqCst);
    api.active.lock().unwrap().push(TaskRecord {
        status: ReportedStatus::Processing,
        result_ref: None,
        progress: Some(20.0),
        ..completed_record("a-1", "s-1")
    });

    assert_eq!(coordinator.hydrate().await.unwrap(), 1);
    assert_eq!(store.active_ids().len(), 1);
    assert!(store.completed_tasks().is_empty());
}
