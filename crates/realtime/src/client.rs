//! WebSocket handshake for the push channel.
//!
//! [`ChannelClient`] holds the endpoint, the bearer credential and the
//! handshake timeout. Call [`ChannelClient::connect`] to establish a live
//! [`ChannelConnection`].

use std::time::Duration;

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// The raw WebSocket stream type used for push sessions.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection parameters for the push channel endpoint.
pub struct ChannelClient {
    ws_url: String,
    token: Option<String>,
    handshake_timeout: Duration,
}

/// A live push channel connection.
#[derive(Debug)]
pub struct ChannelConnection {
    /// Unique id sent during the handshake, used to correlate logs with
    /// the server side.
    pub client_id: String,
    pub ws_stream: WsStream,
}

impl ChannelClient {
    /// * `ws_url`            - WebSocket endpoint, e.g. `ws://host:8080/ws`.
    /// * `token`             - opaque bearer credential, if any.
    /// * `handshake_timeout` - upper bound on one handshake attempt.
    pub fn new(ws_url: String, token: Option<String>, handshake_timeout: Duration) -> Self {
        Self {
            ws_url,
            token,
            handshake_timeout,
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Open the WebSocket.
    ///
    /// Generates a `client_id` (UUID v4) and appends it as a query
    /// parameter. Attaches `Authorization: Bearer <token>` when a token is
    /// configured. Fails with [`ConnectionError::HandshakeTimeout`] when the
    /// server does not complete the handshake in time.
    pub async fn connect(&self) -> Result<ChannelConnection, ConnectionError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let request = self.build_request(&client_id)?;

        let (ws_stream, _response) =
            tokio::time::timeout(self.handshake_timeout, connect_async(request))
                .await
                .map_err(|_| ConnectionError::HandshakeTimeout(self.handshake_timeout))?
                .map_err(|e| {
                    ConnectionError::Handshake(format!(
                        "Failed to connect to {}: {e}",
                        self.ws_url
                    ))
                })?;

        tracing::info!(
            client_id = %client_id,
            "Connected to push channel at {}",
            self.ws_url,
        );

        Ok(ChannelConnection {
            client_id,
            ws_stream,
        })
    }

    fn build_request(&self, client_id: &str) -> Result<Request, ConnectionError> {
        let separator = if self.ws_url.contains('?') { '&' } else { '?' };
        let url = format!("{}{separator}clientId={client_id}", self.ws_url);

        let mut request = url
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidUrl(format!("{}: {e}", self.ws_url)))?;

        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                ConnectionError::InvalidUrl("bearer token contains invalid characters".into())
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        Ok(request)
    }
}

/// Errors from establishing or holding the push channel.
///
/// None of these reach UI callers as failures of their own operations;
/// they surface through [`crate::ConnectionManager::connect`] and the
/// connection state only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    /// The endpoint URL or handshake headers could not be built.
    #[error("Invalid push channel request: {0}")]
    InvalidUrl(String),

    /// The server refused or broke the WebSocket handshake.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The handshake did not complete within the configured timeout.
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// An established session ended.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// The manager was disconnected while the call was waiting.
    #[error("Connection was shut down")]
    Shutdown,
}
