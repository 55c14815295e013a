//! Deterministic synthetic execution backend.
//!
//! Stands in for a real ComfyUI server so the tracker can be exercised
//! end to end with no network: submissions enter an internal queue, a
//! driver task walks each prompt through a scripted node sequence and
//! emits the same message types a live server would, and the snapshot
//! endpoints reflect the internal state (so snapshot reconciliation
//! runs in demo mode too).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use promptdeck_core::job::{JobOutput, OutputKind};

use crate::backend::{BackendError, ExecutionBackend};
use crate::messages::{
    ComfyMessage, ErrorData, ExecInfo, ExecutedData, ExecutingData, ExecutionStartData,
    ProgressData, QueueStatus, StatusData,
};
use crate::snapshot::{HistoryEntry, HistorySnapshot, QueueEntry, QueueSnapshot};

/// Broadcast channel capacity for live messages.
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Tunables for the scripted execution.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Node names visited in order for every prompt.
    pub node_names: Vec<String>,
    /// Progress steps emitted per node.
    pub steps_per_node: i64,
    /// Delay between progress steps.
    pub step_interval: Duration,
    /// Cap on the internal history list.
    pub max_history: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            node_names: vec![
                "CLIP Text Encode".to_string(),
                "KSampler".to_string(),
                "VAE Decode".to_string(),
                "Save Image".to_string(),
            ],
            steps_per_node: 5,
            step_interval: Duration::from_millis(100),
            max_history: 64,
        }
    }
}

/// A prompt queued inside the synthetic backend.
#[derive(Debug, Clone)]
struct SynthJob {
    prompt_id: String,
    queue_index: i64,
}

/// A terminated prompt retained for history snapshots.
#[derive(Debug, Clone)]
struct SynthHistory {
    prompt_id: String,
    queue_index: i64,
    completed: bool,
}

#[derive(Debug, Default)]
struct SyntheticState {
    pending: VecDeque<SynthJob>,
    running: Option<SynthJob>,
    history: Vec<SynthHistory>,
    /// Set by `interrupt`/`cancel`; checked between progress steps.
    interrupt_requested: bool,
    counter: i64,
}

/// In-process execution backend with scripted progress.
pub struct SyntheticBackend {
    state: Mutex<SyntheticState>,
    config: SyntheticConfig,
    message_tx: broadcast::Sender<ComfyMessage>,
    cancel: CancellationToken,
}

impl SyntheticBackend {
    /// Create the backend and spawn the driver task.
    pub fn start(config: SyntheticConfig) -> Arc<Self> {
        let (message_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let backend = Arc::new(Self {
            state: Mutex::new(SyntheticState::default()),
            config,
            message_tx,
            cancel: CancellationToken::new(),
        });

        let driver = Arc::clone(&backend);
        tokio::spawn(async move {
            driver.run_driver().await;
            tracing::info!("Synthetic driver exited");
        });

        backend
    }

    /// Stop the driver task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Driver loop: promote the next pending prompt and execute it.
    async fn run_driver(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.step_interval) => {}
            }

            let job = {
                let mut state = self.state.lock().await;
                if state.running.is_none() {
                    if let Some(next) = state.pending.pop_front() {
                        state.running = Some(next.clone());
                        state.interrupt_requested = false;
                        Some(next)
                    } else {
                        None
                    }
                } else {
                    None
                }
            };

            if let Some(job) = job {
                self.execute(job).await;
            }
        }
    }

    /// Walk one prompt through the scripted node sequence.
    async fn execute(&self, job: SynthJob) {
        self.emit_status().await;
        self.emit(ComfyMessage::ExecutionStart(ExecutionStartData {
            prompt_id: job.prompt_id.clone(),
        }));

        let node_count = self.config.node_names.len();
        for (i, node) in self.config.node_names.iter().enumerate() {
            self.emit(ComfyMessage::Executing(ExecutingData {
                node: Some(node.clone()),
                prompt_id: job.prompt_id.clone(),
            }));

            for step in 1..=self.config.steps_per_node {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.step_interval) => {}
                }

                if self.take_interrupt().await {
                    self.emit(ComfyMessage::ExecutionError(ErrorData {
                        prompt_id: job.prompt_id.clone(),
                        node_id: node.clone(),
                        exception_message: "Execution interrupted".to_string(),
                        exception_type: "InterruptedError".to_string(),
                    }));
                    self.finish(&job, false).await;
                    return;
                }

                self.emit(ComfyMessage::Progress(ProgressData {
                    value: step,
                    max: self.config.steps_per_node,
                    prompt_id: Some(job.prompt_id.clone()),
                    node: Some(node.clone()),
                }));
            }

            // The final node saves an image.
            if i == node_count - 1 {
                self.emit(ComfyMessage::Executed(ExecutedData {
                    node: node.clone(),
                    prompt_id: job.prompt_id.clone(),
                    output: serde_json::json!({
                        "images": [{
                            "filename": "demo_output.png",
                            "subfolder": "",
                            "type": "output",
                        }],
                    }),
                }));
            }
        }

        self.emit(ComfyMessage::Executing(ExecutingData {
            node: None,
            prompt_id: job.prompt_id.clone(),
        }));
        self.finish(&job, true).await;
    }

    /// Move the running prompt into history and broadcast queue depth.
    async fn finish(&self, job: &SynthJob, completed: bool) {
        {
            let mut state = self.state.lock().await;
            state.running = None;
            state.history.insert(
                0,
                SynthHistory {
                    prompt_id: job.prompt_id.clone(),
                    queue_index: job.queue_index,
                    completed,
                },
            );
            state.history.truncate(self.config.max_history);
        }
        self.emit_status().await;
    }

    async fn take_interrupt(&self) -> bool {
        let mut state = self.state.lock().await;
        std::mem::take(&mut state.interrupt_requested)
    }

    async fn emit_status(&self) {
        let queue_remaining = {
            let state = self.state.lock().await;
            state.pending.len() as u32 + u32::from(state.running.is_some())
        };
        self.emit(ComfyMessage::Status(StatusData {
            status: QueueStatus {
                exec_info: ExecInfo { queue_remaining },
            },
        }));
    }

    fn emit(&self, msg: ComfyMessage) {
        // Send fails only when nobody is subscribed yet.
        let _ = self.message_tx.send(msg);
    }

    /// Synthetic image output for a completed prompt.
    fn history_outputs(prompt_id: &str) -> Vec<JobOutput> {
        vec![JobOutput::new(
            prompt_id,
            "save_image",
            "demo_output.png",
            "",
            OutputKind::Output,
        )]
    }
}

#[async_trait]
impl ExecutionBackend for SyntheticBackend {
    async fn fetch_queue(&self) -> Result<QueueSnapshot, BackendError> {
        let state = self.state.lock().await;
        Ok(QueueSnapshot {
            running: state
                .running
                .iter()
                .map(|j| QueueEntry {
                    queue_index: j.queue_index,
                    prompt_id: j.prompt_id.clone(),
                })
                .collect(),
            pending: state
                .pending
                .iter()
                .map(|j| QueueEntry {
                    queue_index: j.queue_index,
                    prompt_id: j.prompt_id.clone(),
                })
                .collect(),
        })
    }

    async fn fetch_history(&self, max_items: usize) -> Result<HistorySnapshot, BackendError> {
        let state = self.state.lock().await;
        Ok(HistorySnapshot {
            entries: state
                .history
                .iter()
                .take(max_items)
                .map(|h| HistoryEntry {
                    prompt_id: h.prompt_id.clone(),
                    queue_index: h.queue_index,
                    completed: h.completed,
                    outputs: if h.completed {
                        Self::history_outputs(&h.prompt_id)
                    } else {
                        Vec::new()
                    },
                })
                .collect(),
        })
    }

    async fn submit(&self, _workflow: &serde_json::Value) -> Result<String, BackendError> {
        let mut state = self.state.lock().await;
        state.counter += 1;
        let queue_index = state.counter;
        let prompt_id = format!("demo-{queue_index}");
        state.pending.push_back(SynthJob {
            prompt_id: prompt_id.clone(),
            queue_index,
        });
        tracing::debug!(prompt_id = %prompt_id, "Synthetic prompt queued");
        Ok(prompt_id)
    }

    async fn cancel(&self, prompt_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let before = state.pending.len();
        state.pending.retain(|j| j.prompt_id != prompt_id);
        if state.pending.len() < before {
            return Ok(());
        }
        if state
            .running
            .as_ref()
            .is_some_and(|j| j.prompt_id == prompt_id)
        {
            state.interrupt_requested = true;
            return Ok(());
        }
        Err(BackendError::PromptNotFound(prompt_id.to_string()))
    }

    async fn delete_history_entry(&self, prompt_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let before = state.history.len();
        state.history.retain(|h| h.prompt_id != prompt_id);
        if state.history.len() == before {
            return Err(BackendError::PromptNotFound(prompt_id.to_string()));
        }
        Ok(())
    }

    async fn clear_queue(&self) -> Result<(), BackendError> {
        self.state.lock().await.pending.clear();
        Ok(())
    }

    async fn clear_history(&self) -> Result<(), BackendError> {
        self.state.lock().await.history.clear();
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if state.running.is_some() {
            state.interrupt_requested = true;
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ComfyMessage> {
        self.message_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn fast_config() -> SyntheticConfig {
        SyntheticConfig {
            steps_per_node: 2,
            step_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn submit_populates_pending_queue() {
        let backend = SyntheticBackend::start(SyntheticConfig {
            // Long interval so the driver never starts the job during
            // the test.
            step_interval: Duration::from_secs(3600),
            ..Default::default()
        });

        let id = backend.submit(&serde_json::json!({})).await.unwrap();
        let snapshot = backend.fetch_queue().await.unwrap();
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.pending[0].prompt_id, id);

        backend.shutdown();
    }

    #[tokio::test]
    async fn cancel_unknown_prompt_errors() {
        let backend = SyntheticBackend::start(fast_config());
        let err = backend.cancel("nope").await.unwrap_err();
        assert_matches!(err, BackendError::PromptNotFound(_));
        backend.shutdown();
    }

    #[tokio::test]
    async fn scripted_execution_emits_full_sequence() {
        let backend = SyntheticBackend::start(fast_config());
        let mut rx = backend.subscribe();

        let id = backend.submit(&serde_json::json!({})).await.unwrap();

        let mut saw_start = false;
        let mut saw_executed = false;
        let mut progress_count = 0;

        // Drain messages until the terminal executing(None) arrives.
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("driver stalled")
                .expect("channel closed");
            match msg {
                ComfyMessage::ExecutionStart(data) => {
                    assert_eq!(data.prompt_id, id);
                    saw_start = true;
                }
                ComfyMessage::Progress(data) => {
                    assert_eq!(data.prompt_id.as_deref(), Some(id.as_str()));
                    progress_count += 1;
                }
                ComfyMessage::Executed(data) => {
                    assert!(data.output.get("images").is_some());
                    saw_executed = true;
                }
                ComfyMessage::Executing(data) if data.node.is_none() => break,
                _ => {}
            }
        }

        assert!(saw_start);
        assert!(saw_executed);
        // steps_per_node * node count
        assert_eq!(progress_count, 2 * 4);

        let history = backend.fetch_history(10).await.unwrap();
        assert_eq!(history.entries.len(), 1);
        assert!(history.entries[0].completed);
        assert_eq!(history.entries[0].outputs.len(), 1);

        backend.shutdown();
    }

    #[tokio::test]
    async fn interrupt_fails_running_prompt() {
        let backend = SyntheticBackend::start(SyntheticConfig {
            steps_per_node: 50,
            step_interval: Duration::from_millis(5),
            ..Default::default()
        });
        let mut rx = backend.subscribe();

        let id = backend.submit(&serde_json::json!({})).await.unwrap();

        // Wait for execution to start, then interrupt.
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("driver stalled")
                .expect("channel closed");
            if matches!(msg, ComfyMessage::ExecutionStart(_)) {
                break;
            }
        }
        backend.interrupt().await.unwrap();

        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("driver stalled")
                .expect("channel closed");
            if let ComfyMessage::ExecutionError(data) = msg {
                assert_eq!(data.prompt_id, id);
                break;
            }
        }

        let history = backend.fetch_history(10).await.unwrap();
        assert_eq!(history.entries.len(), 1);
        assert!(!history.entries[0].completed);

        backend.shutdown();
    }
}
