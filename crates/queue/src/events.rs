//! Platform events emitted by the tracker and download driver.
//!
//! High-level state changes the rest of the application cares about,
//! broadcast via [`tokio::sync::broadcast`] channels. Subscribers use
//! them as the change signal for recomputing derived views and for
//! user-facing notifications.

use serde::Serialize;

/// A state change in the workflow execution queue.
#[derive(Debug, Clone, Serialize)]
pub enum QueueEvent {
    /// A prompt moved from pending into the running slot.
    ExecutionStarted { prompt_id: String },

    /// A running prompt made progress.
    ExecutionProgress {
        prompt_id: String,
        /// Completion percentage (0-100).
        percent: u8,
        /// The node currently executing, if known.
        current_node: Option<String>,
    },

    /// A prompt finished and moved to history.
    ExecutionCompleted { prompt_id: String },

    /// A prompt failed and moved to history.
    ExecutionFailed { prompt_id: String, error: String },

    /// The backend reported its queue depth.
    QueueDepth { queue_remaining: u32 },

    /// A snapshot refresh finished reconciling.
    QueueRefreshed,
}

/// A state change in the download driver.
#[derive(Debug, Clone, Serialize)]
pub enum DownloadEvent {
    /// A download was promoted into the running slot.
    Started { id: String, name: String },

    /// A running download made progress.
    Progress {
        id: String,
        /// Completion percentage (0-100).
        percent: u8,
    },

    /// A download finished and its model was registered.
    ///
    /// This is the hook for the user-facing success notification.
    Completed {
        id: String,
        name: String,
        file_path: String,
    },

    /// A download failed.
    Failed { id: String, error: String },

    /// A download was cancelled by the user.
    Cancelled { id: String },
}
