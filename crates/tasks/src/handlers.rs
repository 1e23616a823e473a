//! Push event handlers feeding the task store.
//!
//! Translates `generation:*` envelopes into [`TaskPatch`]es and applies
//! them with the event's own timestamp, so that push updates go through
//! the same staleness rule as poll answers. Events without a timestamp
//! never outrank a later backend-stamped answer. Also logs connectivity
//! changes announced on the `system` category.

use std::sync::Arc;

use serde::Deserialize;

use mangaforge_core::events::{
    CATEGORY_GENERATION, CATEGORY_SYSTEM, EVENT_CANCELLED, EVENT_COMPLETED, EVENT_CONNECTED,
    EVENT_DISCONNECTED, EVENT_FAILED, EVENT_PROGRESS, EVENT_RECONNECT_FAILED,
};
use mangaforge_core::task::{
    clamp_progress, ReportedError, ReportedStatus, TaskError, TaskId, TaskPatch, TaskStatus,
};
use mangaforge_core::types::Timestamp;
use mangaforge_realtime::{Envelope, EventDispatcher, Subscription, SubscriptionKey};

use crate::store::{TaskStore, UpdateOutcome};

/// Payload of every `generation:*` push event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationEvent {
    pub task_id: TaskId,
    #[serde(default)]
    pub status: Option<ReportedStatus>,
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
    /// When the backend produced the event. When absent the update is
    /// stamped with the task's current `updated_at`; the local clock is
    /// never compared with backend timestamps.
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

/// Build the store patch for a generation event.
///
/// Returns `None` for event names the store does not understand and that
/// carry no explicit status.
pub fn event_patch(event: &str, payload: &GenerationEvent) -> Option<TaskPatch> {
    let base = match event {
        EVENT_PROGRESS => {
            let status = payload.status.unwrap_or(ReportedStatus::Processing);
            TaskPatch::reported(status, payload.error.clone().map(ReportedError::into_task_error))
        }
        EVENT_COMPLETED => TaskPatch::completed(payload.result_ref.clone()),
        EVENT_FAILED => TaskPatch::failed(failure_reason(payload)),
        EVENT_CANCELLED => TaskPatch::failed(match payload.error.clone() {
            Some(ReportedError::Detailed(error)) => error,
            _ => TaskError::cancelled_by_user(),
        }),
        _ => {
            let status = payload.status?;
            TaskPatch::reported(status, payload.error.clone().map(ReportedError::into_task_error))
        }
    };

    let mut patch = TaskPatch {
        progress: payload.progress.map(clamp_progress),
        current_step: payload.current_step.clone(),
        message: payload.message.clone(),
        ..base
    };
    if patch.status == Some(TaskStatus::Completed) && patch.result_ref.is_none() {
        patch.result_ref.clone_from(&payload.result_ref);
    }
    Some(patch)
}

fn failure_reason(payload: &GenerationEvent) -> TaskError {
    match (&payload.error, &payload.message) {
        (Some(error), _) => error.clone().into_task_error(),
        (None, Some(message)) => TaskError::generation(message.clone()),
        (None, None) => TaskError::unknown(),
    }
}

/// Apply one generation envelope to the store.
pub fn apply_generation_event(
    store: &TaskStore,
    envelope: &Envelope,
    payload: &GenerationEvent,
) -> UpdateOutcome {
    let Some(patch) = event_patch(&envelope.event, payload) else {
        tracing::debug!(
            event = %envelope.event,
            task_id = %payload.task_id,
            "Ignoring generation event without a status",
        );
        return UpdateOutcome::Unknown;
    };
    let outcome = match payload.updated_at {
        Some(source) => store.apply_update(&payload.task_id, &patch, source),
        None => store.apply_unstamped(&payload.task_id, &patch),
    };
    if outcome.is_applied() {
        tracing::debug!(
            event = %envelope.event,
            task_id = %payload.task_id,
            "Applied push update",
        );
    }
    outcome
}

/// Subscribe the store to every `generation` event.
pub fn register_generation_handlers(
    dispatcher: &EventDispatcher,
    store: Arc<TaskStore>,
) -> Subscription {
    dispatcher.on_typed(
        SubscriptionKey::category(CATEGORY_GENERATION),
        move |payload: GenerationEvent, envelope: &Envelope| {
            apply_generation_event(&store, envelope, &payload);
            Ok(())
        },
    )
}

/// Log push channel lifecycle events.
pub fn register_connectivity_logging(dispatcher: &EventDispatcher) -> Subscription {
    dispatcher.on(
        SubscriptionKey::category(CATEGORY_SYSTEM),
        |envelope: &Envelope| {
            match envelope.event.as_str() {
                EVENT_CONNECTED => {
                    tracing::info!(data = %envelope.data, "Push channel connected, polling is backup");
                }
                EVENT_DISCONNECTED => {
                    tracing::warn!(data = %envelope.data, "Push channel disconnected, polling is authoritative");
                }
                EVENT_RECONNECT_FAILED => {
                    tracing::error!(
                        data = %envelope.data,
                        "Push channel gave up reconnecting, relying on polling",
                    );
                }
                other => {
                    tracing::debug!(event = other, "Unhandled system event");
                }
            }
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use mangaforge_core::task::{Task, TaskErrorCode, TaskKind, CANCELLED_BY_USER};
    use serde_json::json;

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn payload(value: serde_json::Value) -> GenerationEvent {
        serde_json::from_value(value).unwrap()
    }

    fn tracked_store() -> Arc<TaskStore> {
        let store = Arc::new(TaskStore::new());
        store.upsert(Task::pending(TaskId::from("t-1"), TaskKind::Image, "s-1", at(0)));
        store
    }

    #[test]
    fn progress_event_becomes_processing_patch() {
        let p = payload(json!({ "taskId": "t-1", "progress": 39.6, "currentStep": "sampling" }));
        let patch = event_patch(EVENT_PROGRESS, &p).unwrap();
        assert_eq!(patch.status, Some(TaskStatus::Processing));
        assert_eq!(patch.progress, Some(40));
        assert_eq!(patch.current_step.as_deref(), Some("sampling"));
    }

    #[test]
    fn completed_event_carries_result() {
        let p = payload(json!({ "taskId": "t-1", "resultUrl": "https://cdn/x.png" }));
        let patch = event_patch(EVENT_COMPLETED, &p).unwrap();
        assert_eq!(patch.status, Some(TaskStatus::Completed));
        assert_eq!(patch.result_ref.as_deref(), Some("https://cdn/x.png"));
    }

    #[test]
    fn failed_event_uses_message_as_reason() {
        let p = payload(json!({ "taskId": "t-1", "message": "out of memory" }));
        let patch = event_patch(EVENT_FAILED, &p).unwrap();
        let error = patch.error.unwrap();
        assert_eq!(error.code, TaskErrorCode::Generation);
        assert_eq!(error.message, "out of memory");
    }

    #[test]
    fn cancelled_event_defaults_reason() {
        let p = payload(json!({ "taskId": "t-1" }));
        let patch = event_patch(EVENT_CANCELLED, &p).unwrap();
        assert_eq!(patch.status, Some(TaskStatus::Failed));
        assert_eq!(patch.error.unwrap().message, CANCELLED_BY_USER);
    }

    #[test]
    fn unknown_event_needs_explicit_status() {
        let p = payload(json!({ "taskId": "t-1" }));
        assert!(event_patch("queued", &p).is_none());

        let p = payload(json!({ "taskId": "t-1", "status": "running" }));
        assert_eq!(
            event_patch("queued", &p).unwrap().status,
            Some(TaskStatus::Processing)
        );
    }

    #[test]
    fn handler_applies_events_through_dispatcher() {
        let store = tracked_store();
        let dispatcher = EventDispatcher::new();
        let _sub = register_generation_handlers(&dispatcher, Arc::clone(&store));

        let frame = json!({
            "category": "generation",
            "event": "progress",
            "data": { "taskId": "t-1", "progress": 40, "updatedAt": at(10) }
        });
        assert_eq!(dispatcher.dispatch_raw(&frame.to_string()), 1);

        let task = store.get("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.progress, 40);
        assert_eq!(task.updated_at, at(10));
    }

    #[test]
    fn older_push_event_is_discarded() {
        let store = tracked_store();
        let id = TaskId::from("t-1");
        store.apply_update(&id, &TaskPatch::progress(60), at(20));

        let envelope = Envelope::new("generation", "progress", json!({}));
        let p = payload(json!({ "taskId": "t-1", "progress": 10, "updatedAt": at(5) }));
        assert_eq!(apply_generation_event(&store, &envelope, &p), UpdateOutcome::Stale);
        assert_eq!(store.get("t-1").unwrap().progress, 60);
    }

    #[test]
    fn missing_timestamp_keeps_task_timestamp() {
        let store = tracked_store();
        let envelope = Envelope::new("generation", "completed", json!({}));
        let p = payload(json!({ "taskId": "t-1" }));
        assert_eq!(apply_generation_event(&store, &envelope, &p), UpdateOutcome::Applied);
        let task = store.get("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.updated_at, at(0));
    }

    #[test]
    fn malformed_payload_does_not_touch_store() {
        let store = tracked_store();
        let dispatcher = EventDispatcher::new();
        let _sub = register_generation_handlers(&dispatcher, Arc::clone(&store));

        let frame = json!({ "category": "generation", "event": "progress", "data": { "progress": 5 } });
        assert_eq!(dispatcher.dispatch_raw(&frame.to_string()), 0);
        assert_eq!(store.get("t-1").unwrap().status, TaskStatus::Pending);
    }
}
