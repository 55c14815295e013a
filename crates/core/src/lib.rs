//! Shared domain types for the promptdeck job tracker.
//!
//! Pure data structures and helpers with no async or I/O dependencies:
//! job records and lifecycle states, output descriptors, download
//! metadata, and the imported-model registry.

pub mod download;
pub mod error;
pub mod job;
pub mod models;

pub use error::CoreError;
