//! Queue and history snapshot types and parsers.
//!
//! The backend's `GET /queue` response lists entries as heterogeneous
//! arrays (`[index, prompt_id, prompt, ...]`), and `GET /history` nests
//! output descriptors per node. Both are parsed leniently: malformed
//! entries are skipped with a warning instead of failing the whole
//! snapshot.

use serde::Deserialize;

use promptdeck_core::job::{JobOutput, OutputKind};

/// One entry in the backend's running or pending queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub queue_index: i64,
    pub prompt_id: String,
}

/// Point-in-time listing of the backend's running and pending queues.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub running: Vec<QueueEntry>,
    pub pending: Vec<QueueEntry>,
}

/// One terminated prompt from the backend's history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub prompt_id: String,
    pub queue_index: i64,
    /// `status.completed` from the backend; false means the prompt failed.
    pub completed: bool,
    /// Outputs flattened from all nodes.
    pub outputs: Vec<JobOutput>,
}

/// Point-in-time listing of terminated prompts.
#[derive(Debug, Clone, Default)]
pub struct HistorySnapshot {
    pub entries: Vec<HistoryEntry>,
}

// ---------------------------------------------------------------------------
// Queue parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawQueueResponse {
    #[serde(default)]
    queue_running: Vec<serde_json::Value>,
    #[serde(default)]
    queue_pending: Vec<serde_json::Value>,
}

/// Parse a `GET /queue` response body.
pub fn parse_queue_response(value: serde_json::Value) -> Result<QueueSnapshot, serde_json::Error> {
    let raw: RawQueueResponse = serde_json::from_value(value)?;
    Ok(QueueSnapshot {
        running: parse_entries(&raw.queue_running),
        pending: parse_entries(&raw.queue_pending),
    })
}

/// Extract `(index, prompt_id)` pairs from raw queue entry arrays.
fn parse_entries(raw: &[serde_json::Value]) -> Vec<QueueEntry> {
    let mut entries = Vec::with_capacity(raw.len());
    for entry in raw {
        let parsed = entry.as_array().and_then(|arr| {
            let queue_index = arr.first()?.as_i64()?;
            let prompt_id = arr.get(1)?.as_str()?.to_string();
            Some(QueueEntry {
                queue_index,
                prompt_id,
            })
        });
        match parsed {
            Some(e) => entries.push(e),
            None => tracing::warn!(raw = %entry, "Skipping malformed queue entry"),
        }
    }
    entries
}

// ---------------------------------------------------------------------------
// History parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawHistoryEntry {
    #[serde(default)]
    prompt: serde_json::Value,
    #[serde(default)]
    outputs: std::collections::BTreeMap<String, RawNodeOutput>,
    #[serde(default)]
    status: Option<RawStatus>,
}

#[derive(Debug, Deserialize)]
struct RawNodeOutput {
    #[serde(default)]
    images: Vec<RawImage>,
}

#[derive(Debug, Deserialize)]
struct RawImage {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    #[serde(default)]
    completed: bool,
}

/// Parse a `GET /history` response body (map of prompt_id -> entry).
pub fn parse_history_response(
    value: serde_json::Value,
) -> Result<HistorySnapshot, serde_json::Error> {
    let raw: std::collections::BTreeMap<String, RawHistoryEntry> = serde_json::from_value(value)?;

    let entries = raw
        .into_iter()
        .map(|(prompt_id, entry)| {
            // `prompt` is `[number, prompt_id, workflow, ...]`; the leading
            // number is the queue index at submission time.
            let queue_index = entry
                .prompt
                .as_array()
                .and_then(|arr| arr.first())
                .and_then(|v| v.as_i64())
                .unwrap_or(0);

            let pid = prompt_id.as_str();
            let outputs = entry
                .outputs
                .iter()
                .flat_map(|(node_id, node_output)| {
                    node_output.images.iter().map(move |img| {
                        JobOutput::new(
                            pid,
                            node_id,
                            &img.filename,
                            &img.subfolder,
                            OutputKind::parse(img.kind.as_deref().unwrap_or("output")),
                        )
                    })
                })
                .collect();

            HistoryEntry {
                completed: entry.status.map(|s| s.completed).unwrap_or(false),
                prompt_id,
                queue_index,
                outputs,
            }
        })
        .collect();

    Ok(HistorySnapshot { entries })
}

/// Extract image output descriptors from an `executed` message payload.
///
/// The payload shape is `{"images": [{filename, subfolder, type}, ...]}`.
/// Non-image outputs yield an empty vec.
pub fn parse_node_output(
    prompt_id: &str,
    node_id: &str,
    output: &serde_json::Value,
) -> Vec<JobOutput> {
    let Some(images) = output.get("images").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    images
        .iter()
        .filter_map(|img| {
            let filename = img.get("filename")?.as_str()?;
            let subfolder = img.get("subfolder").and_then(|v| v.as_str()).unwrap_or("");
            let kind = img.get("type").and_then(|v| v.as_str()).unwrap_or("output");
            Some(JobOutput::new(
                prompt_id,
                node_id,
                filename,
                subfolder,
                OutputKind::parse(kind),
            ))
        })
        .collect()
}
