//! Live message reducer.
//!
//! Applies incremental state transitions to the [`JobRegistry`] as
//! messages arrive from the backend's event feed, and maintains the
//! per-prompt execution progress table. Assumes in-order, at-most-once
//! delivery per prompt; messages for unknown prompts are dropped
//! silently rather than erroring.

use std::collections::HashMap;

use promptdeck_comfyui::messages::{ComfyMessage, ProgressData};
use promptdeck_comfyui::snapshot::parse_node_output;
use promptdeck_core::job::{JobState, WorkflowJob};

use crate::registry::JobRegistry;

/// Live progress of one executing prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionProgress {
    /// Name of the node currently executing.
    pub current_node: Option<String>,
    /// Percent complete of the current node (0-100).
    pub current_percent: f64,
    /// Percent complete of the whole prompt (0-100). Mirrors the
    /// current node's percent; true multi-node weighting would need
    /// the workflow graph.
    pub total_percent: f64,
}

/// Per-prompt progress entries plus the backend's reported queue depth.
///
/// Keyed by prompt id so concurrent executions do not clobber each
/// other's node pointer.
#[derive(Debug, Default)]
pub struct ProgressTable {
    entries: HashMap<String, ExecutionProgress>,
    pub queue_remaining: u32,
}

impl ProgressTable {
    pub fn get(&self, prompt_id: &str) -> Option<&ExecutionProgress> {
        self.entries.get(prompt_id)
    }

    /// Reset a prompt's entry to the initial zero state.
    pub fn reset(&mut self, prompt_id: &str) {
        self.entries
            .insert(prompt_id.to_string(), ExecutionProgress::default());
    }

    pub fn set_node(&mut self, prompt_id: &str, node: &str) {
        let entry = self.entries.entry(prompt_id.to_string()).or_default();
        entry.current_node = Some(node.to_string());
        // A new node starts from zero.
        entry.current_percent = 0.0;
    }

    pub fn set_percent(&mut self, prompt_id: &str, percent: f64) {
        let entry = self.entries.entry(prompt_id.to_string()).or_default();
        entry.current_percent = percent;
        entry.total_percent = percent;
    }

    /// Drop a prompt's entry (on terminal transition).
    pub fn clear(&mut self, prompt_id: &str) {
        self.entries.remove(prompt_id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a message application did to the registry, for event emission.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Started { prompt_id: String },
    Progress { prompt_id: String, percent: u8 },
    NodeChanged { prompt_id: String, node: String },
    Completed { prompt_id: String },
    Failed { prompt_id: String, error: String },
    OutputsAdded { prompt_id: String, count: usize },
    QueueDepth { queue_remaining: u32 },
    /// The message carried no applicable state change.
    Ignored,
}

/// Percent (0-100) from a step counter, guarding division by zero.
fn step_percent(value: i64, max: i64) -> f64 {
    if max <= 0 {
        return 0.0;
    }
    ((value as f64 / max as f64) * 100.0).clamp(0.0, 100.0)
}

/// Apply one live message to the registry and progress table.
pub fn apply(
    registry: &mut JobRegistry,
    progress: &mut ProgressTable,
    msg: &ComfyMessage,
) -> Applied {
    match msg {
        ComfyMessage::ExecutionStart(data) => {
            if !registry.start(&data.prompt_id) && !registry.contains(&data.prompt_id) {
                // The start message beat the first queue snapshot.
                registry.insert_running(WorkflowJob::new(
                    &data.prompt_id,
                    0,
                    JobState::Running,
                ));
            }
            progress.reset(&data.prompt_id);
            if registry.state_of(&data.prompt_id) == Some(JobState::Running) {
                Applied::Started {
                    prompt_id: data.prompt_id.clone(),
                }
            } else {
                Applied::Ignored
            }
        }

        ComfyMessage::Executing(data) => match &data.node {
            Some(node) => {
                progress.set_node(&data.prompt_id, node);
                Applied::NodeChanged {
                    prompt_id: data.prompt_id.clone(),
                    node: node.clone(),
                }
            }
            None => {
                // node == None means execution is complete for this prompt.
                let moved = registry.complete(&data.prompt_id);
                progress.clear(&data.prompt_id);
                if moved {
                    Applied::Completed {
                        prompt_id: data.prompt_id.clone(),
                    }
                } else {
                    tracing::debug!(
                        prompt_id = %data.prompt_id,
                        "Completion for prompt not in running, ignoring",
                    );
                    Applied::Ignored
                }
            }
        },

        ComfyMessage::Progress(data) => {
            let Some(prompt_id) = resolve_progress_prompt(registry, data) else {
                return Applied::Ignored;
            };
            let percent = step_percent(data.value, data.max);
            progress.set_percent(&prompt_id, percent);
            if let Some(node) = &data.node {
                if progress
                    .get(&prompt_id)
                    .and_then(|e| e.current_node.as_deref())
                    != Some(node.as_str())
                {
                    let entry = progress.entries.entry(prompt_id.clone()).or_default();
                    entry.current_node = Some(node.clone());
                }
            }
            Applied::Progress {
                prompt_id,
                percent: percent.round() as u8,
            }
        }

        ComfyMessage::Executed(data) => {
            let Some(job) = registry.find_running_mut(&data.prompt_id) else {
                return Applied::Ignored;
            };
            let outputs = parse_node_output(&data.prompt_id, &data.node, &data.output);
            let count = outputs.len();
            job.outputs.extend(outputs);
            if count > 0 {
                Applied::OutputsAdded {
                    prompt_id: data.prompt_id.clone(),
                    count,
                }
            } else {
                Applied::Ignored
            }
        }

        ComfyMessage::ExecutionError(data) => {
            let moved = registry.fail(&data.prompt_id, &data.exception_message);
            progress.clear(&data.prompt_id);
            if moved {
                Applied::Failed {
                    prompt_id: data.prompt_id.clone(),
                    error: data.exception_message.clone(),
                }
            } else {
                Applied::Ignored
            }
        }

        ComfyMessage::Status(data) => {
            progress.queue_remaining = data.status.exec_info.queue_remaining;
            Applied::QueueDepth {
                queue_remaining: data.status.exec_info.queue_remaining,
            }
        }

        ComfyMessage::ExecutionCached(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, "Execution used cache");
            Applied::Ignored
        }
    }
}

/// Which running prompt a `progress` message belongs to: the explicit
/// id when present, otherwise the single running job if there is
/// exactly one. An id naming a prompt that is not running (late event
/// for terminated work) resolves to `None`.
fn resolve_progress_prompt(registry: &JobRegistry, data: &ProgressData) -> Option<String> {
    if let Some(id) = &data.prompt_id {
        let is_running = registry.running().iter().any(|j| j.prompt_id == *id);
        return is_running.then(|| id.clone());
    }
    match registry.running() {
        [only] => Some(only.prompt_id.clone()),
        _ => None,
    }
}
