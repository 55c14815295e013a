//! Job-queue and execution-progress tracking.
//!
//! Merges two independently-arriving inputs into one consistent view
//! of what is happening right now: polled queue/history snapshots from
//! the execution backend, and the live message feed describing
//! node-level execution progress. Also drives simulated model
//! downloads through their lifecycle and registers finished assets.
//!
//! Entry points: [`tracker::QueueTracker`] for workflow executions,
//! [`downloads::DownloadManager`] for downloads, and [`view`] for the
//! read-only aggregates a queue panel displays.

pub mod downloads;
pub mod events;
pub mod reducer;
pub mod registry;
pub mod snapshot;
pub mod tracker;
pub mod view;

pub use downloads::{DownloadConfig, DownloadManager, DownloadRequest};
pub use events::{DownloadEvent, QueueEvent};
pub use registry::JobRegistry;
pub use tracker::{QueueTracker, TrackerConfig, TrackerError};
pub use view::{DownloadStats, QueueStats};
