//! Read-only aggregates derived from tracker and download state.
//!
//! Pure functions over the registry, progress table, and download
//! jobs. Nothing here mutates state; callers recompute on every
//! [`crate::events`] event.

use serde::Serialize;

use promptdeck_core::download::DownloadJob;
use promptdeck_core::job::JobState;

use crate::reducer::ProgressTable;
use crate::registry::JobRegistry;

/// Point-in-time summary of the workflow queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub running_count: usize,
    pub pending_count: usize,
    pub history_count: usize,
    pub has_running: bool,
    pub has_pending: bool,
    /// Queue depth as reported by the backend.
    pub queue_remaining: u32,
    /// Is anything executing right now?
    pub is_executing: bool,
    /// Prompt whose live progress a single-slot display should show
    /// (the most recently started running job).
    pub current_prompt_id: Option<String>,
    pub current_node: Option<String>,
    /// Percent complete of the current node (0-100).
    pub current_percent: u8,
    /// Percent complete of the current prompt (0-100).
    pub total_percent: u8,
}

impl QueueStats {
    pub fn collect(registry: &JobRegistry, progress: &ProgressTable) -> Self {
        let current = registry.newest_running();
        let entry = current.and_then(|job| progress.get(&job.prompt_id));

        Self {
            running_count: registry.running().len(),
            pending_count: registry.pending().len(),
            history_count: registry.history().len(),
            has_running: !registry.running().is_empty(),
            has_pending: !registry.pending().is_empty(),
            queue_remaining: progress.queue_remaining,
            is_executing: !registry.running().is_empty(),
            current_prompt_id: current.map(|job| job.prompt_id.clone()),
            current_node: entry.and_then(|e| e.current_node.clone()),
            current_percent: entry.map(|e| e.current_percent.round() as u8).unwrap_or(0),
            total_percent: entry.map(|e| e.total_percent.round() as u8).unwrap_or(0),
        }
    }
}

/// Point-in-time summary of the download queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadStats {
    pub running_count: usize,
    pub pending_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    /// Is anything queued or transferring?
    pub has_active: bool,
    /// Name and percent of the running download, if any.
    pub current_name: Option<String>,
    pub current_percent: u8,
}

impl DownloadStats {
    pub fn collect(jobs: &[DownloadJob]) -> Self {
        let mut stats = Self::default();
        for job in jobs {
            match job.state {
                JobState::Running => {
                    stats.running_count += 1;
                    stats.current_name = Some(job.name.clone());
                    stats.current_percent = job
                        .progress
                        .map(|p| p.percent.round() as u8)
                        .unwrap_or(0);
                }
                JobState::Pending => stats.pending_count += 1,
                JobState::Completed => stats.completed_count += 1,
                JobState::Failed => stats.failed_count += 1,
                JobState::Cancelled => {}
            }
        }
        stats.has_active = stats.running_count + stats.pending_count > 0;
        stats
    }
}

/// One entry in a combined "activity" panel: everything currently
/// pending or running, workflows before downloads.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActiveJob {
    Workflow {
        prompt_id: String,
        title: String,
        state: JobState,
        percent: u8,
        current_node: Option<String>,
    },
    Download {
        id: String,
        name: String,
        state: JobState,
        percent: u8,
    },
}

/// Collect all non-terminal jobs across both queues.
pub fn active_jobs(
    registry: &JobRegistry,
    progress: &ProgressTable,
    downloads: &[DownloadJob],
) -> Vec<ActiveJob> {
    let mut jobs = Vec::new();

    for job in registry.running().iter().chain(registry.pending()) {
        let entry = progress.get(&job.prompt_id);
        jobs.push(ActiveJob::Workflow {
            prompt_id: job.prompt_id.clone(),
            title: job.title.clone(),
            state: job.state,
            percent: entry.map(|e| e.total_percent.round() as u8).unwrap_or(0),
            current_node: entry.and_then(|e| e.current_node.clone()),
        });
    }

    for job in downloads {
        if job.state.is_terminal() {
            continue;
        }
        jobs.push(ActiveJob::Download {
            id: job.id.clone(),
            name: job.name.clone(),
            state: job.state,
            percent: job
                .progress
                .map(|p| p.percent.round() as u8)
                .unwrap_or(0),
        });
    }

    jobs
}
