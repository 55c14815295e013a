//! WebSocket client for the live event feed.
//!
//! [`ComfyClient`] holds the connection configuration for one ComfyUI
//! server. Call [`ComfyClient::connect`] to establish a live
//! [`ComfyConnection`] over WebSocket.

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Configuration handle for the event-feed connection.
pub struct ComfyClient {
    ws_url: String,
}

/// A live WebSocket connection to the backend.
pub struct ComfyConnection {
    /// Unique client ID sent during the WebSocket handshake.
    pub client_id: String,
    /// The raw WebSocket stream for reading frames.
    pub ws_stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

impl ComfyClient {
    /// Create a new client.
    ///
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: String) -> Self {
        Self { ws_url }
    }

    /// Connect to the backend WebSocket endpoint.
    ///
    /// Generates a unique `client_id` (UUID v4) and appends it as a
    /// query parameter so the server can address messages back to this
    /// specific client.
    pub async fn connect(&self) -> Result<ComfyConnection, ComfyClientError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyConnection {
            client_id,
            ws_stream,
        })
    }
}
