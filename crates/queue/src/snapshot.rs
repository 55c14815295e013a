//! Snapshot reconciliation.
//!
//! The backend's polled snapshots and the live message feed race: a
//! snapshot taken just before a completion message describes a job the
//! registry has already moved to history. Reconciliation therefore
//! merges by id instead of overwriting collections wholesale, with one
//! rule throughout: a job's locally-known state wins whenever it is
//! further along the pending -> running -> terminal order. Terminal
//! jobs are never resurrected and never duplicated.

use promptdeck_comfyui::snapshot::{HistorySnapshot, QueueSnapshot};
use promptdeck_core::job::{JobState, WorkflowJob};

use crate::registry::JobRegistry;

/// Merge a queue snapshot into the registry.
///
/// Snapshot entries already terminal locally are ignored. Local
/// pending jobs absent from the snapshot were removed server-side and
/// are dropped; local running jobs absent from the snapshot are left
/// alone until a terminal signal (live message or history entry)
/// arrives.
pub fn reconcile_queue(registry: &mut JobRegistry, snapshot: &QueueSnapshot) {
    for entry in &snapshot.running {
        match registry.state_of(&entry.prompt_id) {
            None => {
                registry.insert_running(WorkflowJob::new(
                    &entry.prompt_id,
                    entry.queue_index,
                    JobState::Running,
                ));
            }
            Some(JobState::Pending) => {
                registry.start(&entry.prompt_id);
                if let Some(job) = registry.find_running_mut(&entry.prompt_id) {
                    job.queue_index = entry.queue_index;
                }
            }
            Some(JobState::Running) => {
                if let Some(job) = registry.find_running_mut(&entry.prompt_id) {
                    job.queue_index = entry.queue_index;
                }
            }
            // Already terminal locally; the snapshot is stale.
            Some(_) => {
                tracing::debug!(
                    prompt_id = %entry.prompt_id,
                    "Snapshot lists terminal job as running, ignoring",
                );
            }
        }
    }

    for entry in &snapshot.pending {
        match registry.state_of(&entry.prompt_id) {
            None => {
                registry.insert_pending(WorkflowJob::new(
                    &entry.prompt_id,
                    entry.queue_index,
                    JobState::Pending,
                ));
            }
            Some(JobState::Pending) => {
                if let Some(job) = registry.find_pending_mut(&entry.prompt_id) {
                    job.queue_index = entry.queue_index;
                }
            }
            // Running or terminal locally; the snapshot is stale.
            Some(_) => {}
        }
    }

    // Pending jobs the backend no longer lists were deleted or started
    // server-side; if started, the running list above re-inserted them.
    let known: std::collections::HashSet<&str> = snapshot
        .running
        .iter()
        .chain(snapshot.pending.iter())
        .map(|e| e.prompt_id.as_str())
        .collect();
    let stale: Vec<String> = registry
        .pending()
        .iter()
        .filter(|j| !known.contains(j.prompt_id.as_str()))
        .map(|j| j.prompt_id.clone())
        .collect();
    for prompt_id in stale {
        registry.remove_pending(&prompt_id);
    }
}

/// Merge a history snapshot into the registry.
///
/// Jobs already in local history are refreshed in place (outputs may
/// arrive late), never duplicated. Jobs still active locally move to
/// the matching terminal state. Unknown jobs are inserted.
pub fn reconcile_history(registry: &mut JobRegistry, snapshot: &HistorySnapshot) {
    for entry in &snapshot.entries {
        let terminal_state = if entry.completed {
            JobState::Completed
        } else {
            JobState::Failed
        };

        match registry.state_of(&entry.prompt_id) {
            Some(state) if state.is_terminal() => {
                // Refresh outputs; live messages may have missed some.
                if let Some(job) = registry.find_history_mut(&entry.prompt_id) {
                    if job.outputs.len() < entry.outputs.len() {
                        job.outputs = entry.outputs.clone();
                    }
                }
            }
            Some(_) => {
                // Active locally but terminated server-side; the live
                // completion message was missed.
                if let Some(mut job) = registry.remove(&entry.prompt_id) {
                    job.state = terminal_state;
                    job.outputs = entry.outputs.clone();
                    registry.push_history(job);
                }
            }
            None => {
                let mut job =
                    WorkflowJob::new(&entry.prompt_id, entry.queue_index, JobState::Pending);
                job.state = terminal_state;
                job.outputs = entry.outputs.clone();
                registry.push_history(job);
            }
        }
    }
}
