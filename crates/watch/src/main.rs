//! `mangaforge-watch` -- console front end for the task monitor.
//!
//! Starts a [`TaskMonitor`], optionally submits a batch, and logs every
//! task state change until interrupted.
//!
//! ```text
//! mangaforge-watch                  # track the backend's active tasks
//! mangaforge-watch scene-1 scene-2  # submit one task per scene, then track
//! ```
//!
//! # Environment variables
//!
//! Everything read by `MonitorConfig::from_env`, plus:
//!
//! | Variable          | Required | Default | Description                         |
//! |-------------------|----------|---------|-------------------------------------|
//! | `GENERATION_KIND` | no       | `image` | Task kind for submitted batches     |

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mangaforge_core::task::{Task, TaskId, TaskKind, TaskStatus};
use mangaforge_tasks::{HttpGenerationApi, MonitorConfig, TaskMonitor, TaskSnapshot};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mangaforge_watch=info,mangaforge_tasks=info,mangaforge_realtime=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MonitorConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    let kind: TaskKind = std::env::var("GENERATION_KIND")
        .ok()
        .map(|v| v.parse())
        .transpose()
        .context("GENERATION_KIND")?
        .unwrap_or(TaskKind::Image);

    let api = HttpGenerationApi::new(
        config.api_base_url.clone(),
        config.api_token.clone(),
        config.api_request_timeout,
    )
    .context("Failed to build HTTP client")?;

    tracing::info!(
        ws_url = %config.channel.ws_url,
        api_base_url = %config.api_base_url,
        "Starting mangaforge-watch",
    );

    let monitor = TaskMonitor::init(config, Arc::new(api));

    let subjects: Vec<String> = std::env::args().skip(1).collect();
    if subjects.is_empty() {
        match monitor.coordinator().hydrate().await {
            Ok(count) => tracing::info!(count, "Tracking active tasks"),
            Err(e) => tracing::warn!(error = %e, "Could not load active tasks"),
        }
    } else {
        match monitor.coordinator().submit(subjects, kind, None).await {
            Ok(tasks) => {
                for task in &tasks {
                    tracing::info!(
                        task_id = %task.id,
                        subject_id = %task.subject_id,
                        kind = kind.as_str(),
                        "Submitted",
                    );
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Batch submission failed");
                monitor.teardown().await;
                return Err(e.into());
            }
        }
    }

    let mut changes = monitor.store().subscribe();
    let mut seen: HashMap<TaskId, (TaskStatus, u8)> = HashMap::new();
    log_changes(&changes.borrow_and_update(), &mut seen);

    tokio::select! {
        () = shutdown_signal() => {}
        () = async {
            while changes.changed().await.is_ok() {
                log_changes(&changes.borrow_and_update(), &mut seen);
            }
        } => {}
    }

    monitor.teardown().await;
    Ok(())
}

/// Log every task whose status or progress moved since the last snapshot.
fn log_changes(snapshot: &TaskSnapshot, seen: &mut HashMap<TaskId, (TaskStatus, u8)>) {
    for task in snapshot.all() {
        let current = (task.status, task.progress);
        if seen.insert(task.id.clone(), current) == Some(current) {
            continue;
        }
        log_task(task);
    }
    seen.retain(|id, _| snapshot.get(id.as_str()).is_some());
}

fn log_task(task: &Task) {
    match task.status {
        TaskStatus::Completed => tracing::info!(
            task_id = %task.id,
            subject_id = %task.subject_id,
            result = task.result_ref.as_deref().unwrap_or("-"),
            "Completed",
        ),
        TaskStatus::Failed if task.is_cancelled() => tracing::info!(
            task_id = %task.id,
            subject_id = %task.subject_id,
            "Cancelled",
        ),
        TaskStatus::Failed => tracing::warn!(
            task_id = %task.id,
            subject_id = %task.subject_id,
            error = task.error.as_ref().map(|e| e.message.as_str()).unwrap_or("-"),
            "Failed",
        ),
        TaskStatus::Pending | TaskStatus::Processing => tracing::info!(
            task_id = %task.id,
            status = task.status.as_str(),
            progress = task.progress,
            step = task.current_step.as_deref().unwrap_or("-"),
            degraded = task.degraded,
            "Progress",
        ),
    }
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
