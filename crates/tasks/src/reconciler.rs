//! Background status polling.
//!
//! [`StatusReconciler`] polls the backend for every pending or processing
//! task on a fixed interval and merges the answers through the store's
//! staleness rule. It runs whether or not the push channel is connected:
//! without push it is the only source of truth, with push it is the
//! safety net for dropped events. When nothing is active the loop parks
//! until the store changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use mangaforge_core::task::TaskId;
use mangaforge_realtime::ConnectionState;

use crate::api::{ApiError, GenerationApi};
use crate::store::{TaskStore, UpdateOutcome};

/// Polling parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Time between ticks (default: 2s).
    pub interval: Duration,
    /// Upper bound on one status request (default: 5s).
    pub request_timeout: Duration,
    /// Consecutive failures before a task is flagged degraded (default: 3).
    pub degraded_after: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            degraded_after: 3,
        }
    }
}

/// Counters from one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub polled: usize,
    pub applied: usize,
    /// Answers discarded as stale or for tasks that turned terminal.
    pub discarded: usize,
    pub failed: usize,
}

/// Why a status request did not produce an answer.
#[derive(Debug)]
enum PollFailure {
    Api(ApiError),
    Timeout,
    /// The answer describes a different task than the one requested.
    WrongTask(TaskId),
}

impl std::fmt::Display for PollFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollFailure::Api(e) => e.fmt(f),
            PollFailure::Timeout => f.write_str("status request timed out"),
            PollFailure::WrongTask(other) => write!(f, "status response names task {other}"),
        }
    }
}

/// Periodic status poller for active tasks.
pub struct StatusReconciler {
    store: Arc<TaskStore>,
    api: Arc<dyn GenerationApi>,
    config: PollConfig,
    connectivity: Option<watch::Receiver<ConnectionState>>,
    /// Consecutive failures per task, cleared on success.
    failures: HashMap<TaskId, u32>,
}

impl StatusReconciler {
    pub fn new(store: Arc<TaskStore>, api: Arc<dyn GenerationApi>, config: PollConfig) -> Self {
        Self {
            store,
            api,
            config,
            connectivity: None,
            failures: HashMap::new(),
        }
    }

    /// Observe the push channel so that logs show which source is
    /// authoritative. Polling itself does not change.
    pub fn with_connectivity(mut self, state: watch::Receiver<ConnectionState>) -> Self {
        self.connectivity = Some(state);
        self
    }

    /// Run the poll loop until the cancellation token is triggered.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut changes = self.store.subscribe();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            poll_interval_ms = self.config.interval.as_millis() as u64,
            "Status reconciler started",
        );

        loop {
            if !self.store.has_active() {
                tracing::debug!("No active tasks, reconciler idle");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = changes.wait_for(|snapshot| snapshot.has_active()) => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
                ticker.reset();
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.poll_once() => {
                    tracing::trace!(?report, "Poll tick finished");
                }
            }
        }

        tracing::info!("Status reconciler shutting down");
    }

    /// One tick: query every active task concurrently and merge the
    /// answers. Tasks that are terminal at the start of the tick are not
    /// queried.
    pub async fn poll_once(&mut self) -> PollReport {
        let ids = self.store.active_ids();
        self.failures.retain(|id, _| ids.contains(id));
        if ids.is_empty() {
            return PollReport::default();
        }

        tracing::debug!(
            count = ids.len(),
            push_connected = self.push_connected(),
            "Polling active tasks",
        );

        let timeout = self.config.request_timeout;
        let api = &self.api;
        let results = futures::future::join_all(ids.iter().map(|id| async move {
            let result = match tokio::time::timeout(timeout, api.fetch_status(id)).await {
                Ok(Ok(snapshot)) if snapshot.task_id != *id => {
                    Err(PollFailure::WrongTask(snapshot.task_id))
                }
                Ok(Ok(snapshot)) => Ok(snapshot),
                Ok(Err(e)) => Err(PollFailure::Api(e)),
                Err(_) => Err(PollFailure::Timeout),
            };
            (id, result)
        }))
        .await;

        let mut report = PollReport {
            polled: ids.len(),
            ..Default::default()
        };

        for (id, result) in results {
            match result {
                Ok(snapshot) => {
                    self.failures.remove(id);
                    self.store.mark_degraded(id, false);

                    match self
                        .store
                        .apply_update(id, &snapshot.to_patch(), snapshot.updated_at)
                    {
                        UpdateOutcome::Applied => report.applied += 1,
                        _ => report.discarded += 1,
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    let count = self.failures.entry(id.clone()).or_default();
                    *count += 1;
                    tracing::warn!(
                        task_id = %id,
                        consecutive_failures = *count,
                        error = %e,
                        "Status poll failed",
                    );
                    if *count >= self.config.degraded_after && self.store.mark_degraded(id, true)
                    {
                        tracing::warn!(task_id = %id, "Task status degraded");
                    }
                }
            }
        }

        report
    }

    fn push_connected(&self) -> bool {
        self.connectivity
            .as_ref()
            .is_some_and(|state| state.borrow().is_open())
    }
}
