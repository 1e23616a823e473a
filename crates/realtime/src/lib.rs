//! Push channel client for MangaForge task status.
//!
//! Provides the persistent WebSocket connection with bounded
//! exponential-backoff reconnection ([`manager::ConnectionManager`]), the
//! inbound frame codec ([`envelope`]), and the typed publish/subscribe
//! registry that routes decoded envelopes to subscribers
//! ([`dispatcher::EventDispatcher`]).

pub mod client;
pub mod dispatcher;
pub mod envelope;
pub mod manager;
pub mod reconnect;
mod session;

pub use client::ConnectionError;
pub use dispatcher::{EventDispatcher, Subscription, SubscriptionId, SubscriptionKey};
pub use envelope::Envelope;
pub use manager::{ChannelConfig, ConnectionManager, ConnectionState};
pub use reconnect::ReconnectConfig;
pub use session::Heartbeat;
