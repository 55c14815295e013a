//! Model download job records, source detection, and validation.
//!
//! Downloads run entirely client-side through the simulated driver in
//! the queue crate; this module holds the data model and the pure
//! helpers (URL validation, source detection, progress math).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job::JobState;

// ---------------------------------------------------------------------------
// Model type constants
// ---------------------------------------------------------------------------

pub const MODEL_TYPE_CHECKPOINT: &str = "checkpoint";
pub const MODEL_TYPE_LORA: &str = "lora";
pub const MODEL_TYPE_VAE: &str = "vae";
pub const MODEL_TYPE_CONTROLNET: &str = "controlnet";
pub const MODEL_TYPE_EMBEDDING: &str = "embedding";

/// All valid model types for downloaded assets.
pub const VALID_MODEL_TYPES: &[&str] = &[
    MODEL_TYPE_CHECKPOINT,
    MODEL_TYPE_LORA,
    MODEL_TYPE_VAE,
    MODEL_TYPE_CONTROLNET,
    MODEL_TYPE_EMBEDDING,
];

/// Validate that a model type string is one of the known types.
pub fn validate_model_type(mt: &str) -> Result<(), CoreError> {
    if VALID_MODEL_TYPES.contains(&mt) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "Unknown model type: '{mt}'. Valid types: {}",
            VALID_MODEL_TYPES.join(", ")
        )))
    }
}

// ---------------------------------------------------------------------------
// Download source
// ---------------------------------------------------------------------------

/// Where a model download originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadSource {
    Civitai,
    HuggingFace,
    /// Any other direct URL.
    Direct,
}

impl DownloadSource {
    /// Detect the source from a URL by checking known domains.
    pub fn detect(url: &str) -> Self {
        if url.contains("civitai.com") {
            Self::Civitai
        } else if url.contains("huggingface.co") || url.contains("hf.co") {
            Self::HuggingFace
        } else {
            Self::Direct
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Civitai => "civitai",
            Self::HuggingFace => "huggingface",
            Self::Direct => "direct",
        }
    }
}

// ---------------------------------------------------------------------------
// Download job
// ---------------------------------------------------------------------------

/// Transfer progress for a running download.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// 0.0 - 100.0.
    pub percent: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: u64,
    pub eta_secs: u64,
}

/// Final result of a completed download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub file_path: String,
    pub size_bytes: u64,
}

/// A tracked model download.
///
/// Lifecycle: pending -> running -> completed/failed/cancelled, with at
/// most one download running at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: String,
    pub state: JobState,
    /// Model name shown to the user and registered on completion.
    pub name: String,
    pub source: DownloadSource,
    pub url: String,
    pub model_type: String,
    pub base_model: Option<String>,
    pub progress: Option<DownloadProgress>,
    pub result: Option<DownloadResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl DownloadJob {
    /// Create a new pending download.
    pub fn new(
        name: &str,
        url: &str,
        source: DownloadSource,
        model_type: &str,
        base_model: Option<&str>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: JobState::Pending,
            name: name.to_string(),
            source,
            url: url.to_string(),
            model_type: model_type.to_string(),
            base_model: base_model.map(str::to_string),
            progress: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Reset a terminal job back to pending for a retry.
    ///
    /// Only valid from failed or cancelled.
    pub fn reset_for_retry(&mut self) -> Result<(), CoreError> {
        if !matches!(self.state, JobState::Failed | JobState::Cancelled) {
            return Err(CoreError::InvalidTransition {
                from: self.state.as_str(),
                to: "pending",
            });
        }
        self.state = JobState::Pending;
        self.progress = None;
        self.result = None;
        self.started_at = None;
        self.completed_at = None;
        self.error_message = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation functions
// ---------------------------------------------------------------------------

/// Validate that a download URL is non-empty and starts with `http`.
pub fn validate_download_url(url: &str) -> Result<(), CoreError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation(
            "Download URL must not be empty".to_string(),
        ));
    }
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(CoreError::Validation(format!(
            "Download URL must start with http:// or https://, got: '{trimmed}'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filename extraction
// ---------------------------------------------------------------------------

/// Extract a filename from a URL by taking the last path segment.
///
/// Strips query parameters and fragments. Falls back to `"download"` if
/// no meaningful segment is found.
pub fn extract_filename_from_url(url: &str) -> String {
    let clean = url.split('?').next().unwrap_or(url);
    let clean = clean.split('#').next().unwrap_or(clean);

    // Strip scheme and domain to get the path only.
    let path = if let Some(rest) = clean
        .strip_prefix("https://")
        .or_else(|| clean.strip_prefix("http://"))
    {
        rest.find('/').map(|i| &rest[i..]).unwrap_or("")
    } else {
        clean
    };

    path.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}

// ---------------------------------------------------------------------------
// Progress calculation
// ---------------------------------------------------------------------------

/// Calculate download progress as a percentage (0.0-100.0).
///
/// Returns `None` if the total file size is unknown or zero.
pub fn download_progress_percent(downloaded: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(t) if t > 0 => {
            let pct = (downloaded as f64 / t as f64) * 100.0;
            Some(pct.min(100.0))
        }
        _ => None,
    }
}

/// Format a byte count as a human-readable size (`"1.5 GB"`, `"320 MB"`).
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.1} GB", b / GB)
    } else if b >= MB {
        format!("{:.0} MB", b / MB)
    } else if b >= KB {
        format!("{:.0} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
