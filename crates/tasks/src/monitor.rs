//! Composition root for the task status subsystem.
//!
//! [`TaskMonitor`] owns one instance of every component: the event
//! dispatcher, the push connection, the task store, the reconciler's poll
//! loop and the batch coordinator. It is an explicit object created with
//! [`TaskMonitor::init`] and released with [`TaskMonitor::teardown`]; there
//! is no process-wide state.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mangaforge_realtime::{ConnectionManager, EventDispatcher, Subscription};

use crate::api::GenerationApi;
use crate::config::MonitorConfig;
use crate::coordinator::BatchCoordinator;
use crate::handlers::{register_connectivity_logging, register_generation_handlers};
use crate::reconciler::StatusReconciler;
use crate::store::TaskStore;

/// How long teardown waits for each background task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running task status subsystem.
pub struct TaskMonitor {
    store: Arc<TaskStore>,
    coordinator: BatchCoordinator,
    dispatcher: Arc<EventDispatcher>,
    connection: Arc<ConnectionManager>,
    subscriptions: Vec<Subscription>,
    cancel: CancellationToken,
    reconciler: Option<JoinHandle<()>>,
    connector: Option<JoinHandle<()>>,
}

impl TaskMonitor {
    /// Wire the components together and start them.
    ///
    /// Spawns the poll loop and begins connecting the push channel in the
    /// background; a failed first handshake only shows up in the logs and
    /// the connection state. Must be called inside a Tokio runtime.
    pub fn init(config: MonitorConfig, api: Arc<dyn GenerationApi>) -> Self {
        let store = Arc::new(TaskStore::new());
        let dispatcher = Arc::new(EventDispatcher::new());
        let connection = Arc::new(ConnectionManager::new(
            config.channel.clone(),
            Arc::clone(&dispatcher),
        ));
        let coordinator = BatchCoordinator::new(Arc::clone(&store), Arc::clone(&api));

        let subscriptions = vec![
            register_generation_handlers(&dispatcher, Arc::clone(&store)),
            register_connectivity_logging(&dispatcher),
        ];

        let cancel = CancellationToken::new();

        let reconciler = StatusReconciler::new(Arc::clone(&store), api, config.poll.clone())
            .with_connectivity(connection.subscribe_state());
        let reconciler_cancel = cancel.child_token();
        let reconciler = tokio::spawn(async move { reconciler.run(reconciler_cancel).await });

        let connector_cancel = cancel.child_token();
        let connector_conn = Arc::clone(&connection);
        let connector = tokio::spawn(async move {
            tokio::select! {
                _ = connector_cancel.cancelled() => {}
                result = connector_conn.connect() => {
                    if let Err(e) = result {
                        tracing::warn!(
                            error = %e,
                            "Initial push channel connect failed, retrying in background",
                        );
                    }
                }
            }
        });

        tracing::info!(
            ws_url = %config.channel.ws_url,
            api_base_url = %config.api_base_url,
            "Task monitor started",
        );

        Self {
            store,
            coordinator,
            dispatcher,
            connection,
            subscriptions,
            cancel,
            reconciler: Some(reconciler),
            connector: Some(connector),
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &BatchCoordinator {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Stop everything: close the push channel, stop polling and remove
    /// the monitor's subscriptions.
    pub async fn teardown(mut self) {
        tracing::info!("Shutting down task monitor");
        self.cancel.cancel();

        if let Some(connector) = self.connector.take() {
            join_or_abort("push connector", connector).await;
        }
        self.connection.disconnect().await;

        if let Some(reconciler) = self.reconciler.take() {
            join_or_abort("status reconciler", reconciler).await;
        }

        for subscription in std::mem::take(&mut self.subscriptions) {
            subscription.unsubscribe();
        }

        tracing::info!("Task monitor shut down complete");
    }
}

/// Wait for a cancelled background task, aborting it after
/// [`SHUTDOWN_TIMEOUT`] so nothing outlives the monitor.
async fn join_or_abort(name: &'static str, handle: JoinHandle<()>) {
    let abort = handle.abort_handle();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
        tracing::warn!(task = name, "Background task did not stop in time, aborting");
        abort.abort();
    }
}

impl Drop for TaskMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
