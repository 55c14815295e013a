//! Single source of truth for workflow job collections.
//!
//! Three collections partition every tracked workflow job by lifecycle
//! phase: `pending`, `running`, and the bounded `history` (newest
//! first). Every mutation preserves two invariants: a job id appears
//! in at most one collection, and history never exceeds the cap.

use chrono::Utc;

use promptdeck_core::job::{JobState, WorkflowJob};

/// Default cap on retained history entries.
pub const DEFAULT_MAX_HISTORY_ITEMS: usize = 64;

/// In-memory workflow job collections.
#[derive(Debug)]
pub struct JobRegistry {
    running: Vec<WorkflowJob>,
    pending: Vec<WorkflowJob>,
    history: Vec<WorkflowJob>,
    max_history_items: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY_ITEMS)
    }
}

impl JobRegistry {
    pub fn new(max_history_items: usize) -> Self {
        Self {
            running: Vec::new(),
            pending: Vec::new(),
            history: Vec::new(),
            max_history_items,
        }
    }

    // ---- queries ----

    pub fn running(&self) -> &[WorkflowJob] {
        &self.running
    }

    pub fn pending(&self) -> &[WorkflowJob] {
        &self.pending
    }

    pub fn history(&self) -> &[WorkflowJob] {
        &self.history
    }

    pub fn max_history_items(&self) -> usize {
        self.max_history_items
    }

    pub fn contains(&self, prompt_id: &str) -> bool {
        self.state_of(prompt_id).is_some()
    }

    /// Current lifecycle state of a job, if tracked.
    pub fn state_of(&self, prompt_id: &str) -> Option<JobState> {
        self.find(prompt_id).map(|job| job.state)
    }

    pub fn find(&self, prompt_id: &str) -> Option<&WorkflowJob> {
        self.running
            .iter()
            .chain(self.pending.iter())
            .chain(self.history.iter())
            .find(|j| j.prompt_id == prompt_id)
    }

    pub fn find_running_mut(&mut self, prompt_id: &str) -> Option<&mut WorkflowJob> {
        self.running.iter_mut().find(|j| j.prompt_id == prompt_id)
    }

    pub fn find_pending_mut(&mut self, prompt_id: &str) -> Option<&mut WorkflowJob> {
        self.pending.iter_mut().find(|j| j.prompt_id == prompt_id)
    }

    pub fn find_history_mut(&mut self, prompt_id: &str) -> Option<&mut WorkflowJob> {
        self.history.iter_mut().find(|j| j.prompt_id == prompt_id)
    }

    /// Newest running job by start time; the one whose live progress a
    /// single-slot display should show.
    pub fn newest_running(&self) -> Option<&WorkflowJob> {
        self.running.iter().max_by_key(|j| j.started_at)
    }

    // ---- mutations ----

    /// Insert a job into `pending`. Refused (returns false) if the id
    /// is already tracked anywhere.
    pub fn insert_pending(&mut self, mut job: WorkflowJob) -> bool {
        if self.contains(&job.prompt_id) {
            return false;
        }
        job.state = JobState::Pending;
        self.pending.push(job);
        true
    }

    /// Insert a job into `running`. Refused if the id is already
    /// tracked anywhere.
    pub fn insert_running(&mut self, mut job: WorkflowJob) -> bool {
        if self.contains(&job.prompt_id) {
            return false;
        }
        job.state = JobState::Running;
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        self.running.push(job);
        true
    }

    /// Insert a terminal job directly into history, replacing any
    /// entry with the same id and trimming to the cap.
    pub fn push_history(&mut self, mut job: WorkflowJob) {
        debug_assert!(job.state.is_terminal());
        self.running.retain(|j| j.prompt_id != job.prompt_id);
        self.pending.retain(|j| j.prompt_id != job.prompt_id);
        self.history.retain(|j| j.prompt_id != job.prompt_id);
        if job.completed_at.is_none() {
            job.completed_at = Some(Utc::now());
        }
        self.history.insert(0, job);
        self.history.truncate(self.max_history_items);
    }

    /// Move a pending job into `running`, stamping its start time.
    /// Returns false if the job is not pending.
    pub fn start(&mut self, prompt_id: &str) -> bool {
        let Some(pos) = self.pending.iter().position(|j| j.prompt_id == prompt_id) else {
            return false;
        };
        let mut job = self.pending.remove(pos);
        job.state = JobState::Running;
        job.started_at = Some(Utc::now());
        self.running.push(job);
        true
    }

    /// Move a running job into history as completed. Returns false if
    /// the job is not running.
    pub fn complete(&mut self, prompt_id: &str) -> bool {
        self.finish(prompt_id, JobState::Completed, None)
    }

    /// Move a running job into history as failed with an error
    /// message. Returns false if the job is not running.
    pub fn fail(&mut self, prompt_id: &str, error_message: &str) -> bool {
        self.finish(prompt_id, JobState::Failed, Some(error_message.to_string()))
    }

    fn finish(&mut self, prompt_id: &str, state: JobState, error_message: Option<String>) -> bool {
        let Some(pos) = self.running.iter().position(|j| j.prompt_id == prompt_id) else {
            return false;
        };
        let mut job = self.running.remove(pos);
        job.state = state;
        job.completed_at = Some(Utc::now());
        job.error_message = error_message;
        self.history.insert(0, job);
        self.history.truncate(self.max_history_items);
        true
    }

    /// Remove a job from whichever collection holds it.
    pub fn remove(&mut self, prompt_id: &str) -> Option<WorkflowJob> {
        for collection in [&mut self.running, &mut self.pending, &mut self.history] {
            if let Some(pos) = collection.iter().position(|j| j.prompt_id == prompt_id) {
                return Some(collection.remove(pos));
            }
        }
        None
    }

    /// Remove a job only if it is pending (local effect of a cancel
    /// request; running jobs terminate via backend signals).
    pub fn remove_pending(&mut self, prompt_id: &str) -> Option<WorkflowJob> {
        let pos = self.pending.iter().position(|j| j.prompt_id == prompt_id)?;
        Some(self.pending.remove(pos))
    }

    /// Remove a job only if it is in history.
    pub fn remove_history(&mut self, prompt_id: &str) -> Option<WorkflowJob> {
        let pos = self.history.iter().position(|j| j.prompt_id == prompt_id)?;
        Some(self.history.remove(pos))
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_job(id: &str) -> WorkflowJob {
        WorkflowJob::new(id, 0, JobState::Pending)
    }

    fn assert_unique(registry: &JobRegistry, prompt_id: &str) {
        let count = registry
            .running()
            .iter()
            .chain(registry.pending())
            .chain(registry.history())
            .filter(|j| j.prompt_id == prompt_id)
            .count();
        assert_eq!(count, 1, "{prompt_id} appears {count} times");
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let mut registry = JobRegistry::default();
        assert!(registry.insert_pending(pending_job("p1")));
        assert!(!registry.insert_pending(pending_job("p1")));
        assert!(!registry.insert_running(pending_job("p1")));
        assert_unique(&registry, "p1");
    }

    #[test]
    fn start_moves_pending_to_running() {
        let mut registry = JobRegistry::default();
        registry.insert_pending(pending_job("p1"));
        assert!(registry.start("p1"));

        assert_eq!(registry.state_of("p1"), Some(JobState::Running));
        assert!(registry.find("p1").unwrap().started_at.is_some());
        assert_unique(&registry, "p1");
    }

    #[test]
    fn start_unknown_job_is_noop() {
        let mut registry = JobRegistry::default();
        assert!(!registry.start("ghost"));
    }

    #[test]
    fn complete_moves_running_to_history() {
        let mut registry = JobRegistry::default();
        registry.insert_pending(pending_job("p1"));
        registry.start("p1");
        assert!(registry.complete("p1"));

        let job = registry.find("p1").unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.completed_at.is_some());
        assert_unique(&registry, "p1");
    }

    #[test]
    fn complete_requires_running() {
        let mut registry = JobRegistry::default();
        registry.insert_pending(pending_job("p1"));
        // Still pending, not running.
        assert!(!registry.complete("p1"));
        assert_eq!(registry.state_of("p1"), Some(JobState::Pending));
    }

    #[test]
    fn fail_records_error_message() {
        let mut registry = JobRegistry::default();
        registry.insert_running(pending_job("p1"));
        assert!(registry.fail("p1", "OOM"));

        let job = registry.find("p1").unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_message.as_deref(), Some("OOM"));
    }

    #[test]
    fn history_is_capped_lifo() {
        let mut registry = JobRegistry::new(3);
        for i in 0..5 {
            let id = format!("p{i}");
            registry.insert_running(pending_job(&id));
            registry.complete(&id);
        }

        assert_eq!(registry.history().len(), 3);
        // Newest kept, oldest evicted.
        assert_eq!(registry.history()[0].prompt_id, "p4");
        assert_eq!(registry.history()[2].prompt_id, "p2");
        assert!(!registry.contains("p0"));
        assert!(!registry.contains("p1"));
    }

    #[test]
    fn push_history_deduplicates() {
        let mut registry = JobRegistry::default();
        registry.insert_running(pending_job("p1"));
        registry.complete("p1");

        let mut replacement = pending_job("p1");
        replacement.state = JobState::Completed;
        registry.push_history(replacement);

        assert_eq!(registry.history().len(), 1);
        assert_unique(&registry, "p1");
    }

    #[test]
    fn remove_pending_leaves_running_untouched() {
        let mut registry = JobRegistry::default();
        registry.insert_running(pending_job("p1"));
        assert!(registry.remove_pending("p1").is_none());
        assert_eq!(registry.state_of("p1"), Some(JobState::Running));
    }

    #[test]
    fn newest_running_prefers_latest_start() {
        let mut registry = JobRegistry::default();
        registry.insert_pending(pending_job("old"));
        registry.start("old");
        std::thread::sleep(std::time::Duration::from_millis(2));
        registry.insert_pending(pending_job("new"));
        registry.start("new");

        assert_eq!(registry.newest_running().unwrap().prompt_id, "new");
    }
}
