//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, snapshot parsing, WebSocket
//! connection management with reconnection, HTTP API wrappers, and the
//! [`backend::ExecutionBackend`] seam with a live HTTP implementation
//! and a deterministic synthetic one for running without a server.

pub mod api;
pub mod backend;
pub mod client;
pub mod messages;
pub mod reconnect;
pub mod snapshot;
pub mod synthetic;

pub use backend::{BackendError, ExecutionBackend};
pub use messages::ComfyMessage;
pub use snapshot::{HistoryEntry, HistorySnapshot, QueueEntry, QueueSnapshot};
