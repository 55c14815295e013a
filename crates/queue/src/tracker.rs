//! Queue tracker: the stateful core that owns the registry.
//!
//! Wires an [`ExecutionBackend`] to the [`JobRegistry`]: periodic
//! snapshot refreshes go through [`crate::snapshot`] reconciliation,
//! live messages go through the [`crate::reducer`], and every
//! meaningful change is re-broadcast as a [`QueueEvent`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use promptdeck_comfyui::{BackendError, ComfyMessage, ExecutionBackend};
use promptdeck_core::job::{JobState, WorkflowJob};

use crate::events::QueueEvent;
use crate::reducer::{self, Applied, ProgressTable};
use crate::registry::{JobRegistry, DEFAULT_MAX_HISTORY_ITEMS};
use crate::snapshot::{reconcile_history, reconcile_queue};
use crate::view::QueueStats;

/// Broadcast channel capacity for queue events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Tracker tunables.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Interval between snapshot refreshes.
    pub poll_interval: Duration,
    /// Cap on retained history entries (also the history fetch size).
    pub max_history_items: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_history_items: DEFAULT_MAX_HISTORY_ITEMS,
        }
    }
}

/// Owns the job registry and progress table, keeps them in sync with
/// the backend, and broadcasts [`QueueEvent`]s.
pub struct QueueTracker {
    backend: Arc<dyn ExecutionBackend>,
    config: TrackerConfig,
    registry: RwLock<JobRegistry>,
    progress: RwLock<ProgressTable>,
    event_tx: broadcast::Sender<QueueEvent>,
}

impl QueueTracker {
    pub fn new(backend: Arc<dyn ExecutionBackend>, config: TrackerConfig) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            backend,
            registry: RwLock::new(JobRegistry::new(config.max_history_items)),
            progress: RwLock::new(ProgressTable::default()),
            config,
            event_tx,
        })
    }

    /// Subscribe to queue state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    /// Read access to the registry for callers that need job details.
    pub async fn registry(&self) -> tokio::sync::RwLockReadGuard<'_, JobRegistry> {
        self.registry.read().await
    }

    /// Current derived view of the queue.
    pub async fn stats(&self) -> QueueStats {
        let registry = self.registry.read().await;
        let progress = self.progress.read().await;
        QueueStats::collect(&registry, &progress)
    }

    /// Fetch both snapshots and reconcile them into the registry.
    ///
    /// A failed fetch is logged and skipped; the other snapshot is
    /// still applied. Returns the first error encountered.
    pub async fn update(&self) -> Result<(), TrackerError> {
        let (queue, history) = tokio::join!(
            self.backend.fetch_queue(),
            self.backend.fetch_history(self.config.max_history_items),
        );

        let mut first_error = None;

        match queue {
            Ok(snapshot) => {
                let mut registry = self.registry.write().await;
                reconcile_queue(&mut registry, &snapshot);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Queue snapshot fetch failed");
                first_error = Some(e);
            }
        }

        match history {
            Ok(snapshot) => {
                let mut registry = self.registry.write().await;
                reconcile_history(&mut registry, &snapshot);
            }
            Err(e) => {
                tracing::warn!(error = %e, "History snapshot fetch failed");
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            return Err(e.into());
        }
        self.emit(QueueEvent::QueueRefreshed);
        Ok(())
    }

    /// Submit a workflow and track it as pending until the next
    /// snapshot confirms its queue position.
    pub async fn queue_prompt(
        &self,
        workflow: &serde_json::Value,
    ) -> Result<String, TrackerError> {
        let prompt_id = self.backend.submit(workflow).await?;

        let mut registry = self.registry.write().await;
        let queue_index = (registry.running().len() + registry.pending().len()) as i64;
        registry.insert_pending(WorkflowJob::new(&prompt_id, queue_index, JobState::Pending));
        tracing::info!(prompt_id = %prompt_id, "Workflow queued");
        Ok(prompt_id)
    }

    /// Cancel a queued prompt. Pending jobs are removed locally right
    /// away; a running prompt is interrupted and terminates through
    /// the normal error message path.
    pub async fn cancel_job(&self, prompt_id: &str) -> Result<(), TrackerError> {
        self.backend.cancel(prompt_id).await?;
        let mut registry = self.registry.write().await;
        if registry.remove_pending(prompt_id).is_some() {
            tracing::info!(prompt_id = %prompt_id, "Pending job cancelled");
        }
        Ok(())
    }

    /// Delete one history entry, locally and on the backend.
    pub async fn delete_job(&self, prompt_id: &str) -> Result<(), TrackerError> {
        self.backend.delete_history_entry(prompt_id).await?;
        self.registry.write().await.remove_history(prompt_id);
        Ok(())
    }

    /// Drop all pending jobs, locally and on the backend.
    pub async fn clear_queue(&self) -> Result<(), TrackerError> {
        self.backend.clear_queue().await?;
        self.registry.write().await.clear_pending();
        Ok(())
    }

    /// Drop the whole history, locally and on the backend.
    pub async fn clear_history(&self) -> Result<(), TrackerError> {
        self.backend.clear_history().await?;
        self.registry.write().await.clear_history();
        Ok(())
    }

    /// Interrupt whatever is executing right now.
    pub async fn interrupt(&self) -> Result<(), TrackerError> {
        Ok(self.backend.interrupt().await?)
    }

    /// Apply one live message and broadcast the resulting event.
    pub async fn handle_message(&self, msg: &ComfyMessage) {
        let applied = {
            let mut registry = self.registry.write().await;
            let mut progress = self.progress.write().await;
            reducer::apply(&mut registry, &mut progress, msg)
        };

        match applied {
            Applied::Started { prompt_id } => {
                self.emit(QueueEvent::ExecutionStarted { prompt_id });
            }
            Applied::Progress { prompt_id, percent } => {
                let current_node = {
                    let progress = self.progress.read().await;
                    progress
                        .get(&prompt_id)
                        .and_then(|e| e.current_node.clone())
                };
                self.emit(QueueEvent::ExecutionProgress {
                    prompt_id,
                    percent,
                    current_node,
                });
            }
            Applied::NodeChanged { prompt_id, node } => {
                self.emit(QueueEvent::ExecutionProgress {
                    prompt_id,
                    percent: 0,
                    current_node: Some(node),
                });
            }
            Applied::Completed { prompt_id } => {
                tracing::info!(prompt_id = %prompt_id, "Workflow completed");
                self.emit(QueueEvent::ExecutionCompleted { prompt_id });
            }
            Applied::Failed { prompt_id, error } => {
                tracing::warn!(prompt_id = %prompt_id, error = %error, "Workflow failed");
                self.emit(QueueEvent::ExecutionFailed { prompt_id, error });
            }
            Applied::QueueDepth { queue_remaining } => {
                self.emit(QueueEvent::QueueDepth { queue_remaining });
            }
            Applied::OutputsAdded { .. } | Applied::Ignored => {}
        }
    }

    /// Main loop: poll snapshots on an interval and apply live
    /// messages as they arrive, until cancelled.
    ///
    /// A lagged event feed triggers an immediate snapshot resync,
    /// since missed messages may include completions.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut messages = self.backend.subscribe();
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Queue tracker stopping");
                    return;
                }
                _ = poll.tick() => {
                    if let Err(e) = self.update().await {
                        tracing::warn!(error = %e, "Snapshot refresh failed");
                    }
                }
                msg = messages.recv() => match msg {
                    Ok(msg) => self.handle_message(&msg).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event feed lagged, resyncing from snapshots");
                        if let Err(e) = self.update().await {
                            tracing::warn!(error = %e, "Resync after lag failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event feed closed, tracker stopping");
                        return;
                    }
                },
            }
        }
    }

    fn emit(&self, event: QueueEvent) {
        // Send fails only when nobody is subscribed.
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use promptdeck_comfyui::synthetic::{SyntheticBackend, SyntheticConfig};
    use promptdeck_core::job::JobState;

    fn idle_backend() -> Arc<SyntheticBackend> {
        // Driver effectively never runs during the test.
        SyntheticBackend::start(SyntheticConfig {
            step_interval: Duration::from_secs(3600),
            ..Default::default()
        })
    }

    fn fast_backend() -> Arc<SyntheticBackend> {
        SyntheticBackend::start(SyntheticConfig {
            steps_per_node: 2,
            step_interval: Duration::from_millis(1),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn queue_prompt_tracks_job_as_pending() {
        let backend = idle_backend();
        let tracker = QueueTracker::new(backend.clone(), TrackerConfig::default());

        let id = tracker.queue_prompt(&serde_json::json!({})).await.unwrap();

        let registry = tracker.registry().await;
        assert_eq!(registry.state_of(&id), Some(JobState::Pending));
        backend.shutdown();
    }

    #[tokio::test]
    async fn update_reconciles_backend_snapshots() {
        let backend = idle_backend();
        let tracker = QueueTracker::new(backend.clone(), TrackerConfig::default());

        // Submitted behind the tracker's back.
        let id = backend.submit(&serde_json::json!({})).await.unwrap();
        tracker.update().await.unwrap();

        let registry = tracker.registry().await;
        assert_eq!(registry.state_of(&id), Some(JobState::Pending));
        backend.shutdown();
    }

    #[tokio::test]
    async fn cancel_removes_pending_job_locally() {
        let backend = idle_backend();
        let tracker = QueueTracker::new(backend.clone(), TrackerConfig::default());

        let id = tracker.queue_prompt(&serde_json::json!({})).await.unwrap();
        tracker.cancel_job(&id).await.unwrap();

        assert!(!tracker.registry().await.contains(&id));
        assert!(backend.fetch_queue().await.unwrap().pending.is_empty());
        backend.shutdown();
    }

    #[tokio::test]
    async fn cancel_unknown_prompt_surfaces_backend_error() {
        let backend = idle_backend();
        let tracker = QueueTracker::new(backend.clone(), TrackerConfig::default());

        let err = tracker.cancel_job("nope").await.unwrap_err();
        assert_matches!(err, TrackerError::Backend(BackendError::PromptNotFound(_)));
        backend.shutdown();
    }

    #[tokio::test]
    async fn tracker_follows_scripted_execution_to_completion() {
        let backend = fast_backend();
        let tracker = QueueTracker::new(backend.clone(), TrackerConfig::default());
        let mut events = tracker.subscribe();

        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&tracker).run(cancel.clone()));

        let id = tracker.queue_prompt(&serde_json::json!({})).await.unwrap();

        let mut saw_started = false;
        let mut saw_progress = false;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("tracker stalled")
                .expect("event channel closed");
            match event {
                QueueEvent::ExecutionStarted { prompt_id } if prompt_id == id => {
                    saw_started = true;
                }
                QueueEvent::ExecutionProgress { prompt_id, .. } if prompt_id == id => {
                    saw_progress = true;
                }
                QueueEvent::ExecutionCompleted { prompt_id } if prompt_id == id => break,
                _ => {}
            }
        }
        cancel.cancel();

        assert!(saw_started);
        assert!(saw_progress);

        let registry = tracker.registry().await;
        assert_eq!(registry.state_of(&id), Some(JobState::Completed));
        assert_eq!(registry.history().len(), 1);
        assert!(!registry.history()[0].outputs.is_empty());
        backend.shutdown();
    }

    #[tokio::test]
    async fn interrupt_drives_running_job_to_failed() {
        let backend = SyntheticBackend::start(SyntheticConfig {
            steps_per_node: 200,
            step_interval: Duration::from_millis(2),
            ..Default::default()
        });
        let tracker = QueueTracker::new(backend.clone(), TrackerConfig::default());
        let mut events = tracker.subscribe();

        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&tracker).run(cancel.clone()));

        let id = tracker.queue_prompt(&serde_json::json!({})).await.unwrap();

        // Wait until it is actually running, then interrupt.
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("tracker stalled")
                .expect("event channel closed");
            if matches!(&event, QueueEvent::ExecutionStarted { prompt_id } if *prompt_id == id) {
                break;
            }
        }
        tracker.interrupt().await.unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("tracker stalled")
                .expect("event channel closed");
            if let QueueEvent::ExecutionFailed { prompt_id, error } = event {
                assert_eq!(prompt_id, id);
                assert!(error.contains("interrupted"));
                break;
            }
        }
        cancel.cancel();

        let registry = tracker.registry().await;
        assert_eq!(registry.state_of(&id), Some(JobState::Failed));
        backend.shutdown();
    }

    #[tokio::test]
    async fn clear_history_empties_local_and_backend_state() {
        let backend = fast_backend();
        let tracker = QueueTracker::new(backend.clone(), TrackerConfig::default());
        let mut events = tracker.subscribe();

        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&tracker).run(cancel.clone()));

        let id = tracker.queue_prompt(&serde_json::json!({})).await.unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("tracker stalled")
                .expect("event channel closed");
            if matches!(&event, QueueEvent::ExecutionCompleted { prompt_id } if *prompt_id == id) {
                break;
            }
        }
        cancel.cancel();

        tracker.clear_history().await.unwrap();

        assert!(tracker.registry().await.history().is_empty());
        assert!(backend.fetch_history(10).await.unwrap().entries.is_empty());
        backend.shutdown();
    }
}
