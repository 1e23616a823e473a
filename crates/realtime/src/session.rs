//! Read/write loop for one open push channel session.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::WsStream;
use crate::dispatcher::EventDispatcher;

/// Upper bound on sending our own close frame during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Liveness checks for an open session.
///
/// A ping goes out every `ping_interval`; the session is considered lost
/// when no frame at all (pongs included) arrives for `idle_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(75),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// `disconnect` was requested; the close frame has been sent.
    Cancelled,
    /// The server sent a close frame.
    ClosedByPeer,
    /// The stream ended without a close frame.
    StreamEnded,
    /// A transport error broke the session.
    Error(String),
}

impl SessionEnd {
    pub(crate) fn describe(&self) -> String {
        match self {
            SessionEnd::Cancelled => "closed by client".to_string(),
            SessionEnd::ClosedByPeer => "closed by server".to_string(),
            SessionEnd::StreamEnded => "stream ended".to_string(),
            SessionEnd::Error(e) => e.clone(),
        }
    }
}

/// Pump frames until the session ends.
///
/// Inbound text frames are handed to [`EventDispatcher::dispatch_raw`];
/// outbound messages queued by `ConnectionManager::send` are forwarded to
/// the socket in order. A half-open connection ends the session once
/// `heartbeat.idle_timeout` passes without any inbound frame.
pub(crate) async fn run_session(
    ws_stream: WsStream,
    mut outbound: mpsc::Receiver<Message>,
    dispatcher: &EventDispatcher,
    cancel: &CancellationToken,
    client_id: &str,
    heartbeat: Heartbeat,
) -> SessionEnd {
    let (mut sink, mut stream) = ws_stream.split();

    // `interval_at` rejects a zero period.
    let period = heartbeat.ping_interval.max(Duration::from_millis(1));
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = tokio::time::sleep(heartbeat.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(client_id, error = %e, "Failed to send close frame");
                    }
                    Err(_) => {
                        tracing::debug!(client_id, "Timed out sending close frame");
                    }
                }
                return SessionEnd::Cancelled;
            }
            Some(msg) = outbound.recv() => {
                if let Err(e) = sink.send(msg).await {
                    tracing::warn!(client_id, error = %e, "Failed to send push channel frame");
                    return SessionEnd::Error(e.to_string());
                }
            }
            _ = ping.tick() => {
                tracing::trace!(client_id, "Push channel heartbeat ping");
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    tracing::warn!(client_id, error = %e, "Failed to send heartbeat ping");
                    return SessionEnd::Error(e.to_string());
                }
            }
            () = &mut idle => {
                tracing::warn!(
                    client_id,
                    idle_timeout_ms = heartbeat.idle_timeout.as_millis() as u64,
                    "No frames from server, dropping push channel session",
                );
                return SessionEnd::Error(format!(
                    "no frames received for {}ms",
                    heartbeat.idle_timeout.as_millis()
                ));
            }
            frame = stream.next() => {
                if matches!(frame, Some(Ok(_))) {
                    idle.as_mut().reset(Instant::now() + heartbeat.idle_timeout);
                }
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        dispatcher.dispatch_raw(&text);
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        tracing::trace!(client_id, len = bytes.len(), "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                        // Ping replies are handled by tungstenite.
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(client_id, ?frame, "Push channel closed by server");
                        return SessionEnd::ClosedByPeer;
                    }
                    Some(Err(e)) => {
                        tracing::error!(client_id, error = %e, "Push channel receive error");
                        return SessionEnd::Error(e.to_string());
                    }
                    None => return SessionEnd::StreamEnded,
                }
            }
        }
    }
}
