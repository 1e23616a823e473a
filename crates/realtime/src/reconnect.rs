//! Bounded exponential-backoff reconnection for the push channel.
//!
//! When a session drops unexpectedly the connection driver calls
//! [`reconnect_loop`], which retries with doubling delays until the
//! channel is restored, the attempt budget runs out, or the
//! [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ChannelClient, ChannelConnection};
use crate::manager::{ChannelShared, ConnectionState};

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Attempts made before giving up. Zero disables reconnection.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Delay before reconnection attempt `attempt` (1-based).
///
/// `base_delay * 2^(attempt - 1)`, clamped to [`ReconnectConfig::max_delay`].
pub fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    config
        .base_delay
        .checked_mul(factor)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}

/// How a reconnection run ended.
#[derive(Debug)]
pub(crate) enum ReconnectOutcome {
    Connected(ChannelConnection),
    Cancelled,
    GaveUp { attempts: u32 },
}

/// Retry the handshake with exponential backoff.
///
/// Publishes `Backoff` while waiting and `Connecting` while a handshake is
/// in flight, both tagged with `generation` so that a driver superseded by
/// `disconnect` cannot overwrite newer state.
pub(crate) async fn reconnect_loop(
    client: &ChannelClient,
    config: &ReconnectConfig,
    shared: &ChannelShared,
    generation: u64,
    cancel: &CancellationToken,
) -> ReconnectOutcome {
    for attempt in 1..=config.max_attempts {
        let delay = backoff_delay(attempt, config);
        shared.transition(generation, ConnectionState::Backoff { attempt, delay });

        tracing::info!(
            url = client.ws_url(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to push channel",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(url = client.ws_url(), "Reconnect cancelled");
                return ReconnectOutcome::Cancelled;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        shared.transition(generation, ConnectionState::Connecting { attempt });

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(url = client.ws_url(), "Reconnect cancelled");
                return ReconnectOutcome::Cancelled;
            }
            result = client.connect() => match result {
                Ok(conn) => {
                    tracing::info!(
                        url = client.ws_url(),
                        attempt,
                        "Reconnected to push channel",
                    );
                    return ReconnectOutcome::Connected(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        url = client.ws_url(),
                        error = %e,
                        "Reconnect attempt {attempt} failed",
                    );
                    shared.record_failure(generation, e);
                }
            }
        }
    }

    tracing::error!(
        url = client.ws_url(),
        attempts = config.max_attempts,
        "Giving up on push channel",
    );
    ReconnectOutcome::GaveUp {
        attempts: config.max_attempts,
    }
}
