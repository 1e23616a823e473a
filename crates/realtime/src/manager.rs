//! Push channel connection manager.
//!
//! [`ConnectionManager`] owns one persistent WebSocket connection. A
//! background driver task runs connect -> session -> reconnect until the
//! channel is disconnected or the reconnect budget runs out. Connection
//! state is published on a [`tokio::sync::watch`] channel, and lifecycle
//! changes are announced to subscribers as `system` envelopes
//! (`connected`, `disconnected`, `reconnect_failed`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use mangaforge_core::events::{EVENT_CONNECTED, EVENT_DISCONNECTED, EVENT_RECONNECT_FAILED};

use crate::client::{ChannelClient, ChannelConnection, ConnectionError};
use crate::dispatcher::EventDispatcher;
use crate::envelope::Envelope;
use crate::reconnect::{reconnect_loop, ReconnectConfig, ReconnectOutcome};
use crate::session::{run_session, Heartbeat};

/// Default capacity of the outbound frame queue.
const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// How long `disconnect` waits for the driver task to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Observable state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no reconnection pending.
    Closed,
    /// A handshake is in flight. `attempt` is 0 for the initial connect
    /// and 1-based for reconnection attempts.
    Connecting { attempt: u32 },
    /// The session is open and frames are flowing.
    Open,
    /// Waiting `delay` before reconnection attempt `attempt`.
    Backoff { attempt: u32, delay: Duration },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    fn attempt(&self) -> u32 {
        match self {
            ConnectionState::Connecting { attempt } | ConnectionState::Backoff { attempt, .. } => {
                *attempt
            }
            ConnectionState::Open | ConnectionState::Closed => 0,
        }
    }

    /// Whether this state settles the handshake that was pending in
    /// `since`: the channel opened, closed, or the pending attempt failed
    /// and the driver moved on to a later backoff.
    fn settles(&self, since: &ConnectionState) -> bool {
        match self {
            ConnectionState::Open | ConnectionState::Closed => true,
            ConnectionState::Connecting { .. } => false,
            ConnectionState::Backoff { attempt, .. } => *attempt > since.attempt(),
        }
    }
}

// ---------------------------------------------------------------------------
// ChannelConfig
// ---------------------------------------------------------------------------

/// Connection parameters for [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub ws_url: String,
    /// Bearer credential attached to the handshake.
    pub token: Option<String>,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Frames queued by [`ConnectionManager::send`] beyond this are dropped.
    pub outbound_capacity: usize,
    /// Ping cadence and idle deadline of an open session.
    pub heartbeat: Heartbeat,
}

impl ChannelConfig {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            token: None,
            handshake_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            heartbeat: Heartbeat::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared driver state
// ---------------------------------------------------------------------------

/// State shared between the manager handle and its driver task.
///
/// Every write from a driver carries the generation it was started with;
/// `begin` and `invalidate` bump the generation so that a superseded
/// driver can no longer publish state or system events.
pub(crate) struct ChannelShared {
    pub(crate) state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    last_error: Mutex<Option<ConnectionError>>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    pub(crate) dispatcher: Arc<EventDispatcher>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChannelShared {
    pub(crate) fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Self {
            state,
            generation: AtomicU64::new(0),
            last_error: Mutex::new(None),
            outbound: Mutex::new(None),
            dispatcher,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Start a new driver generation in the `Connecting { attempt: 0 }` state.
    pub(crate) fn begin(&self) -> u64 {
        let mut generation = 0;
        self.state.send_modify(|state| {
            generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *state = ConnectionState::Connecting { attempt: 0 };
        });
        *lock(&self.last_error) = None;
        generation
    }

    /// Retire the current generation and publish `Closed`.
    fn invalidate(&self) {
        self.state.send_if_modified(|state| {
            self.generation.fetch_add(1, Ordering::AcqRel);
            let changed = *state != ConnectionState::Closed;
            *state = ConnectionState::Closed;
            changed
        });
        *lock(&self.outbound) = None;
        *lock(&self.last_error) = None;
    }

    /// Publish `next` if `generation` is still current.
    pub(crate) fn transition(&self, generation: u64, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if !self.is_current(generation) || *state == next {
                return false;
            }
            tracing::debug!(from = ?*state, to = ?next, "Push channel state change");
            *state = next;
            true
        });
    }

    pub(crate) fn record_failure(&self, generation: u64, error: ConnectionError) {
        if self.is_current(generation) {
            *lock(&self.last_error) = Some(error);
        }
    }

    pub(crate) fn last_error(&self) -> Option<ConnectionError> {
        lock(&self.last_error).clone()
    }

    fn emit_system(&self, generation: u64, event: &str, data: serde_json::Value) {
        if self.is_current(generation) {
            self.dispatcher.dispatch(&Envelope::system(event, data));
        }
    }

    fn opened(&self, generation: u64, client_id: &str, outbound: mpsc::Sender<Message>) {
        if !self.is_current(generation) {
            return;
        }
        *lock(&self.outbound) = Some(outbound);
        *lock(&self.last_error) = None;
        self.transition(generation, ConnectionState::Open);
        self.emit_system(
            generation,
            EVENT_CONNECTED,
            serde_json::json!({ "clientId": client_id }),
        );
    }

    fn closed(&self, generation: u64, reason: &str) {
        if !self.is_current(generation) {
            return;
        }
        *lock(&self.outbound) = None;
        self.emit_system(
            generation,
            EVENT_DISCONNECTED,
            serde_json::json!({ "reason": reason }),
        );
    }

    fn gave_up(&self, generation: u64, attempts: u32) {
        let error = self
            .last_error()
            .map(|e| e.to_string())
            .unwrap_or_default();
        self.transition(generation, ConnectionState::Closed);
        self.emit_system(
            generation,
            EVENT_RECONNECT_FAILED,
            serde_json::json!({ "attempts": attempts, "error": error }),
        );
    }

    fn outbound(&self) -> Option<mpsc::Sender<Message>> {
        lock(&self.outbound).clone()
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

struct Driver {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Owns the push channel connection and its reconnection policy.
///
/// Inbound frames are decoded and fed to the [`EventDispatcher`] passed at
/// construction. Dropping the manager cancels the driver task.
pub struct ConnectionManager {
    client: Arc<ChannelClient>,
    config: ChannelConfig,
    shared: Arc<ChannelShared>,
    driver: tokio::sync::Mutex<Option<Driver>>,
    /// Master token; every driver runs on a child of it.
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(config: ChannelConfig, dispatcher: Arc<EventDispatcher>) -> Self {
        let client = Arc::new(ChannelClient::new(
            config.ws_url.clone(),
            config.token.clone(),
            config.handshake_timeout,
        ));
        Self {
            client,
            config,
            shared: Arc::new(ChannelShared::new(dispatcher)),
            driver: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Open the channel, or join the attempt already in flight.
    ///
    /// Resolves once the pending handshake settles: `Ok` when the channel
    /// is open, `Err` with the handshake failure otherwise. A failed
    /// handshake leaves the driver in backoff, so the channel keeps trying
    /// in the background until its attempt budget runs out.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let since = {
            let mut driver = self.driver.lock().await;
            let current = *self.shared.state.borrow();
            match current {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Closed => {
                    if let Some(old) = driver.take() {
                        old.cancel.cancel();
                    }
                    let generation = self.shared.begin();
                    *driver = Some(self.spawn_driver(generation));
                    ConnectionState::Connecting { attempt: 0 }
                }
                pending => pending,
            }
        };

        let mut rx = self.shared.state.subscribe();
        let settled = *rx
            .wait_for(|state| state.settles(&since))
            .await
            .map_err(|_| ConnectionError::Shutdown)?;

        match settled {
            ConnectionState::Open => Ok(()),
            _ => Err(self.shared.last_error().unwrap_or(ConnectionError::Shutdown)),
        }
    }

    /// Close the channel and stop reconnecting.
    ///
    /// Waits up to five seconds for the driver to send its close frame and
    /// exit, then aborts it.
    pub async fn disconnect(&self) {
        let driver = self.driver.lock().await.take();
        if let Some(Driver { cancel, handle }) = driver {
            tracing::info!(url = self.client.ws_url(), "Disconnecting push channel");
            cancel.cancel();
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Push channel driver did not stop in time, aborting");
                abort.abort();
            }
        }
        self.shared.invalidate();
    }

    /// Queue a JSON message for the server.
    ///
    /// Returns `false` (and logs) when the channel is not open or the
    /// outbound queue is full. Nothing is buffered across reconnects.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        let Some(outbound) = self.shared.outbound() else {
            tracing::warn!("Push channel not connected, dropping outbound message");
            return false;
        };
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize outbound message");
                return false;
            }
        };
        match outbound.try_send(Message::Text(text)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Push channel outbound queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Push channel session ended, dropping outbound message");
                false
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.shared.dispatcher
    }

    /// The most recent handshake or session failure, cleared on open.
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.shared.last_error()
    }

    fn spawn_driver(&self, generation: u64) -> Driver {
        let cancel = self.cancel.child_token();
        let task = DriverTask {
            client: Arc::clone(&self.client),
            reconnect: self.config.reconnect.clone(),
            outbound_capacity: self.config.outbound_capacity.max(1),
            heartbeat: self.config.heartbeat,
            shared: Arc::clone(&self.shared),
            generation,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(async move {
            tracing::info!(url = task.client.ws_url(), generation, "Starting push channel driver");
            task.run().await;
            tracing::info!(generation, "Push channel driver exited");
        });
        Driver { cancel, handle }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Driver loop
// ---------------------------------------------------------------------------

struct DriverTask {
    client: Arc<ChannelClient>,
    reconnect: ReconnectConfig,
    outbound_capacity: usize,
    heartbeat: Heartbeat,
    shared: Arc<ChannelShared>,
    generation: u64,
    cancel: CancellationToken,
}

impl DriverTask {
    /// Core loop: connect -> run session -> reconnect.
    async fn run(self) {
        let initial = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.client.connect() => result,
        };

        let mut conn = match initial {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(
                    url = self.client.ws_url(),
                    error = %e,
                    "Connection failed, entering reconnect loop",
                );
                self.shared.record_failure(self.generation, e);
                match self.reconnect().await {
                    Some(conn) => conn,
                    None => return,
                }
            }
        };

        loop {
            let (tx, rx) = mpsc::channel(self.outbound_capacity);
            self.shared.opened(self.generation, &conn.client_id, tx);

            let end = run_session(
                conn.ws_stream,
                rx,
                &self.shared.dispatcher,
                &self.cancel,
                &conn.client_id,
                self.heartbeat,
            )
            .await;
            let reason = end.describe();
            self.shared.closed(self.generation, &reason);

            if self.cancel.is_cancelled() {
                return;
            }

            tracing::info!(
                client_id = %conn.client_id,
                reason = %reason,
                "Push channel lost, entering reconnect loop",
            );
            self.shared
                .record_failure(self.generation, ConnectionError::Closed(reason));
            conn = match self.reconnect().await {
                Some(conn) => conn,
                None => return,
            };
        }
    }

    async fn reconnect(&self) -> Option<ChannelConnection> {
        match reconnect_loop(
            &self.client,
            &self.reconnect,
            &self.shared,
            self.generation,
            &self.cancel,
        )
        .await
        {
            ReconnectOutcome::Connected(conn) => Some(conn),
            ReconnectOutcome::Cancelled => None,
            ReconnectOutcome::GaveUp { attempts } => {
                self.shared.gave_up(self.generation, attempts);
                None
            }
        }
    }
}
