//! The execution-backend seam.
//!
//! [`ExecutionBackend`] abstracts the request/response surface (queue
//! and history snapshots, submission, cancellation) plus the live
//! event feed, so the tracker can run against either a real ComfyUI
//! server ([`HttpBackend`]) or the synthetic demo driver
//! ([`crate::synthetic::SyntheticBackend`]).

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyApi, ComfyApiError};
use crate::client::ComfyClient;
use crate::messages::{parse_message, ComfyMessage};
use crate::reconnect::{reconnect_loop, ReconnectConfig};
use crate::snapshot::{HistorySnapshot, QueueSnapshot};

/// Broadcast channel capacity for live messages.
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Errors surfaced by an execution backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The REST layer failed (transport or server error).
    #[error(transparent)]
    Api(#[from] ComfyApiError),

    /// The event-feed connection could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The referenced prompt is unknown to the backend.
    #[error("Prompt {0} not found")]
    PromptNotFound(String),
}

/// Request/response plus event-feed contract consumed by the tracker.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Current running/pending queue snapshot.
    async fn fetch_queue(&self) -> Result<QueueSnapshot, BackendError>;

    /// Up to `max_items` most recent terminated prompts.
    async fn fetch_history(&self, max_items: usize) -> Result<HistorySnapshot, BackendError>;

    /// Submit a workflow; returns the assigned prompt id.
    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, BackendError>;

    /// Remove a queued prompt from the backend queue.
    async fn cancel(&self, prompt_id: &str) -> Result<(), BackendError>;

    /// Remove one history entry.
    async fn delete_history_entry(&self, prompt_id: &str) -> Result<(), BackendError>;

    /// Drop all pending queue entries.
    async fn clear_queue(&self) -> Result<(), BackendError>;

    /// Drop the whole history.
    async fn clear_history(&self) -> Result<(), BackendError>;

    /// Interrupt whatever is executing right now.
    async fn interrupt(&self) -> Result<(), BackendError>;

    /// Subscribe to the live message feed.
    fn subscribe(&self) -> broadcast::Receiver<ComfyMessage>;
}

/// Live backend: REST over HTTP plus a persistent WebSocket feed.
///
/// Created via [`HttpBackend::start`], which spawns the connection
/// task (connect -> read frames -> reconnect). Dropping the handle
/// does not stop the task; call [`HttpBackend::shutdown`].
pub struct HttpBackend {
    api: ComfyApi,
    message_tx: broadcast::Sender<ComfyMessage>,
    cancel: CancellationToken,
}

impl HttpBackend {
    /// Connect to a ComfyUI server and start the event-feed task.
    ///
    /// * `api_url` - HTTP base URL, e.g. `http://host:8188`.
    /// * `ws_url`  - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn start(api_url: String, ws_url: String) -> Arc<Self> {
        let (message_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let backend = Arc::new(Self {
            api: ComfyApi::new(api_url),
            message_tx: message_tx.clone(),
            cancel: cancel.clone(),
        });

        let client = ComfyClient::new(ws_url);
        tokio::spawn(async move {
            run_connection_loop(&client, &message_tx, &cancel).await;
            tracing::info!("Event-feed task exited");
        });

        backend
    }

    /// Stop the event-feed task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ExecutionBackend for HttpBackend {
    async fn fetch_queue(&self) -> Result<QueueSnapshot, BackendError> {
        Ok(self.api.get_queue().await?)
    }

    async fn fetch_history(&self, max_items: usize) -> Result<HistorySnapshot, BackendError> {
        Ok(self.api.get_history(max_items).await?)
    }

    async fn submit(&self, workflow: &serde_json::Value) -> Result<String, BackendError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let response = self.api.queue_prompt(workflow, &client_id).await?;
        tracing::info!(
            prompt_id = %response.prompt_id,
            number = response.number,
            "Workflow submitted to ComfyUI",
        );
        Ok(response.prompt_id)
    }

    async fn cancel(&self, prompt_id: &str) -> Result<(), BackendError> {
        Ok(self.api.delete_queue_entry(prompt_id).await?)
    }

    async fn delete_history_entry(&self, prompt_id: &str) -> Result<(), BackendError> {
        Ok(self.api.delete_history_entry(prompt_id).await?)
    }

    async fn clear_queue(&self) -> Result<(), BackendError> {
        Ok(self.api.clear_queue().await?)
    }

    async fn clear_history(&self) -> Result<(), BackendError> {
        Ok(self.api.clear_history().await?)
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        Ok(self.api.interrupt().await?)
    }

    fn subscribe(&self) -> broadcast::Receiver<ComfyMessage> {
        self.message_tx.subscribe()
    }
}

/// Core connection loop: connect -> forward messages -> reconnect.
///
/// Runs until the cancellation token is triggered.
async fn run_connection_loop(
    client: &ComfyClient,
    message_tx: &broadcast::Sender<ComfyMessage>,
    cancel: &CancellationToken,
) {
    let reconnect_config = ReconnectConfig::default();

    loop {
        // Attempt to connect (or reconnect).
        let conn = match client.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Connection failed, entering reconnect loop",
                );
                match reconnect_loop(client, &reconnect_config, cancel).await {
                    Some(conn) => conn,
                    None => return, // cancelled
                }
            }
        };

        // Forward messages until the connection drops.
        let mut ws_stream = conn.ws_stream;
        forward_messages(&mut ws_stream, message_tx, cancel).await;

        if cancel.is_cancelled() {
            return;
        }

        tracing::info!("Connection lost, entering reconnect loop");
        match reconnect_loop(client, &reconnect_config, cancel).await {
            Some(_) => continue, // loop back and process again
            None => return,      // cancelled
        }
    }
}

/// Read frames from an open WebSocket, parse text frames, and forward
/// typed messages to the broadcast channel.
///
/// Returns when the WebSocket closes, a receive error occurs, or the
/// cancellation token fires. Binary frames (preview images) are
/// ignored.
async fn forward_messages(
    ws_stream: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    message_tx: &broadcast::Sender<ComfyMessage>,
    cancel: &CancellationToken,
) {
    loop {
        let msg_result = tokio::select! {
            _ = cancel.cancelled() => return,
            next = ws_stream.next() => match next {
                Some(r) => r,
                None => return,
            },
        };

        match msg_result {
            Ok(Message::Text(text)) => match parse_message(&text) {
                Ok(msg) => {
                    // Send fails only when no receiver is subscribed;
                    // that is fine during startup.
                    let _ = message_tx.send(msg);
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        raw_message = %text,
                        "Failed to parse ComfyUI message",
                    );
                }
            },
            Ok(Message::Binary(_)) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                return;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!(error = %e, "WebSocket receive error");
                return;
            }
        }
    }
}
