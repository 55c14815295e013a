//! Simulated model download driver.
//!
//! Walks [`DownloadJob`]s through pending -> running -> terminal with
//! at most one download running at a time. Transfers are simulated: a
//! ticker task accrues a random chunk per tick against a random total
//! size, so the progress surface (percent, speed, ETA) behaves like a
//! real transfer without touching the network. Completed downloads are
//! registered in the shared [`ModelRegistry`].
//!
//! The `failure_rate` knob injects random failures per tick so the
//! failed/retry paths can be exercised end to end.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use promptdeck_core::download::{
    download_progress_percent, extract_filename_from_url, format_size, validate_download_url,
    validate_model_type, DownloadJob, DownloadProgress, DownloadResult, DownloadSource,
};
use promptdeck_core::job::JobState;
use promptdeck_core::models::{ModelRegistry, NewModel};
use promptdeck_core::CoreError;

use crate::events::DownloadEvent;

/// Broadcast channel capacity for download events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Tunables for the simulated transfer.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Interval between simulation ticks.
    pub tick_interval: Duration,
    /// Range for the randomly chosen file size.
    pub min_total_bytes: u64,
    pub max_total_bytes: u64,
    /// Range for the bytes transferred per tick.
    pub min_tick_bytes: u64,
    pub max_tick_bytes: u64,
    /// Probability (0.0-1.0) that any given tick fails the download.
    pub failure_rate: f64,
    /// Cap on retained terminal jobs.
    pub max_finished_items: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            min_total_bytes: GIB,
            max_total_bytes: 5 * GIB,
            min_tick_bytes: 10 * MIB,
            max_tick_bytes: 50 * MIB,
            failure_rate: 0.0,
            max_finished_items: 64,
        }
    }
}

/// A user request to download a model.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub name: String,
    pub url: String,
    pub model_type: String,
    pub base_model: Option<String>,
}

#[derive(Debug, Default)]
struct DownloadState {
    pending: VecDeque<DownloadJob>,
    running: Option<DownloadJob>,
    /// Terminal jobs, newest first.
    finished: Vec<DownloadJob>,
}

impl DownloadState {
    fn find_any(&self, id: &str) -> Option<&DownloadJob> {
        self.running
            .iter()
            .chain(self.pending.iter())
            .chain(self.finished.iter())
            .find(|j| j.id == id)
    }

    /// Is this URL already pending, running, or completed?
    fn has_active_url(&self, url: &str) -> bool {
        self.running
            .iter()
            .chain(self.pending.iter())
            .any(|j| j.url == url)
            || self
                .finished
                .iter()
                .any(|j| j.url == url && j.state == JobState::Completed)
    }
}

/// Owns the download queue and drives the simulated transfers.
pub struct DownloadManager {
    state: Mutex<DownloadState>,
    config: DownloadConfig,
    models: Arc<ModelRegistry>,
    event_tx: broadcast::Sender<DownloadEvent>,
    cancel: CancellationToken,
}

impl DownloadManager {
    /// Create the manager and spawn the ticker task.
    pub fn start(config: DownloadConfig, models: Arc<ModelRegistry>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Arc::new(Self {
            state: Mutex::new(DownloadState::default()),
            config,
            models,
            event_tx,
            cancel: CancellationToken::new(),
        });

        let ticker = Arc::clone(&manager);
        tokio::spawn(async move {
            ticker.run_ticker().await;
            tracing::info!("Download ticker exited");
        });

        manager
    }

    /// Stop the ticker task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Subscribe to download lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    /// All tracked jobs: running first, then pending in queue order,
    /// then terminal jobs newest first.
    pub async fn jobs(&self) -> Vec<DownloadJob> {
        let state = self.state.lock().await;
        state
            .running
            .iter()
            .chain(state.pending.iter())
            .chain(state.finished.iter())
            .cloned()
            .collect()
    }

    /// The currently running download, if any.
    pub async fn active_download(&self) -> Option<DownloadJob> {
        self.state.lock().await.running.clone()
    }

    /// Validate and enqueue a download request.
    ///
    /// Rejects URLs already queued, running, or imported.
    pub async fn add_download(&self, request: DownloadRequest) -> Result<DownloadJob, CoreError> {
        validate_download_url(&request.url)?;
        validate_model_type(&request.model_type)?;

        let mut state = self.state.lock().await;
        if state.has_active_url(&request.url) || self.models.has_model_with_url(&request.url) {
            return Err(CoreError::Conflict(format!(
                "Model from '{}' is already downloaded or queued",
                request.url
            )));
        }

        let job = DownloadJob::new(
            &request.name,
            &request.url,
            DownloadSource::detect(&request.url),
            &request.model_type,
            request.base_model.as_deref(),
        );
        tracing::info!(id = %job.id, name = %job.name, source = job.source.as_str(), "Download queued");
        state.pending.push_back(job.clone());
        if state.running.is_none() {
            self.promote_next(&mut state);
        }
        Ok(job)
    }

    /// Cancel a pending or running download.
    pub async fn cancel_download(&self, id: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;

        let pending_pos = state.pending.iter().position(|j| j.id == id);
        if let Some(mut job) = pending_pos.and_then(|pos| state.pending.remove(pos)) {
            job.state = JobState::Cancelled;
            self.finish_job(&mut state, job);
            self.emit(DownloadEvent::Cancelled { id: id.to_string() });
            return Ok(());
        }

        if let Some(mut job) = state.running.take_if(|j| j.id == id) {
            job.state = JobState::Cancelled;
            self.finish_job(&mut state, job);
            self.emit(DownloadEvent::Cancelled { id: id.to_string() });
            self.promote_next(&mut state);
            return Ok(());
        }

        match state.find_any(id) {
            Some(job) => Err(CoreError::InvalidTransition {
                from: job.state.as_str(),
                to: "cancelled",
            }),
            None => Err(CoreError::NotFound {
                entity: "download",
                id: id.to_string(),
            }),
        }
    }

    /// Fail the running download immediately with the given reason.
    pub async fn fail_download(&self, id: &str, reason: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.running.take_if(|j| j.id == id) else {
            return Err(CoreError::NotFound {
                entity: "running download",
                id: id.to_string(),
            });
        };
        self.fail_job(&mut state, job, reason);
        self.promote_next(&mut state);
        Ok(())
    }

    /// Re-queue a failed or cancelled download.
    pub async fn retry_download(&self, id: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.finished.iter().position(|j| j.id == id) else {
            return Err(CoreError::NotFound {
                entity: "download",
                id: id.to_string(),
            });
        };

        // Leave the job in place if the reset is invalid (completed).
        state.finished[pos].reset_for_retry()?;
        let job = state.finished.remove(pos);
        tracing::info!(id = %job.id, name = %job.name, "Download re-queued");
        state.pending.push_back(job);
        if state.running.is_none() {
            self.promote_next(&mut state);
        }
        Ok(())
    }

    /// Drop a terminal job from the finished list.
    pub async fn remove_finished(&self, id: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let before = state.finished.len();
        state.finished.retain(|j| j.id != id);
        if state.finished.len() == before {
            return Err(CoreError::NotFound {
                entity: "download",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn run_ticker(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
            self.tick().await;
        }
    }

    /// One simulation step: advance (and maybe fail or complete) the
    /// running download. Promotes from pending if the slot is somehow
    /// free.
    async fn tick(&self) {
        let mut state = self.state.lock().await;

        let Some(mut job) = state.running.take() else {
            self.promote_next(&mut state);
            return;
        };

        let failure_roll: f64 = rand::rng().random();
        if failure_roll < self.config.failure_rate {
            self.fail_job(&mut state, job, "Simulated transfer failure");
            self.promote_next(&mut state);
            return;
        }

        let chunk = rand::rng().random_range(self.config.min_tick_bytes..=self.config.max_tick_bytes);
        let total = job
            .progress
            .map(|p| p.total_bytes)
            .unwrap_or(self.config.min_total_bytes);
        let downloaded = job
            .progress
            .map(|p| p.downloaded_bytes)
            .unwrap_or(0)
            .saturating_add(chunk)
            .min(total);

        let percent = download_progress_percent(downloaded, Some(total)).unwrap_or(0.0);
        let speed = (chunk as f64 / self.config.tick_interval.as_secs_f64().max(0.001)) as u64;
        let eta_secs = if speed > 0 {
            (total - downloaded) / speed
        } else {
            0
        };
        job.progress = Some(DownloadProgress {
            percent,
            downloaded_bytes: downloaded,
            total_bytes: total,
            speed_bytes_per_sec: speed,
            eta_secs,
        });
        self.emit(DownloadEvent::Progress {
            id: job.id.clone(),
            percent: percent.round() as u8,
        });

        if downloaded >= total {
            self.complete_job(&mut state, job);
            self.promote_next(&mut state);
        } else {
            state.running = Some(job);
        }
    }

    /// Move the front pending job into the running slot.
    fn promote_next(&self, state: &mut DownloadState) {
        let Some(mut job) = state.pending.pop_front() else {
            return;
        };

        let total = rand::rng().random_range(self.config.min_total_bytes..=self.config.max_total_bytes);
        job.state = JobState::Running;
        job.started_at = Some(chrono::Utc::now());
        job.progress = Some(DownloadProgress {
            percent: 0.0,
            downloaded_bytes: 0,
            total_bytes: total,
            speed_bytes_per_sec: 0,
            eta_secs: 0,
        });
        tracing::info!(
            id = %job.id,
            name = %job.name,
            size = %format_size(total),
            "Download started",
        );
        self.emit(DownloadEvent::Started {
            id: job.id.clone(),
            name: job.name.clone(),
        });
        state.running = Some(job);
    }

    /// Finalize a finished transfer: record the result and register
    /// the model.
    fn complete_job(&self, state: &mut DownloadState, mut job: DownloadJob) {
        let size_bytes = job.progress.map(|p| p.total_bytes).unwrap_or(0);
        let filename = extract_filename_from_url(&job.url);
        let file_path = format!("/models/{}/{}", job.model_type, filename);

        job.state = JobState::Completed;
        job.result = Some(DownloadResult {
            file_path: file_path.clone(),
            size_bytes,
        });

        self.models.add_model(NewModel {
            name: job.name.clone(),
            model_type: job.model_type.clone(),
            base_model: job.base_model.clone(),
            size: format_size(size_bytes),
            size_bytes,
            version: "1.0".to_string(),
            source: job.source,
            source_url: Some(job.url.clone()),
        });

        tracing::info!(id = %job.id, name = %job.name, path = %file_path, "Download completed");
        self.emit(DownloadEvent::Completed {
            id: job.id.clone(),
            name: job.name.clone(),
            file_path,
        });
        self.finish_job(state, job);
    }

    fn fail_job(&self, state: &mut DownloadState, mut job: DownloadJob, reason: &str) {
        job.state = JobState::Failed;
        job.error_message = Some(reason.to_string());
        tracing::warn!(id = %job.id, name = %job.name, error = %reason, "Download failed");
        self.emit(DownloadEvent::Failed {
            id: job.id.clone(),
            error: reason.to_string(),
        });
        self.finish_job(state, job);
    }

    /// Push a terminal job onto the finished list and trim the cap.
    fn finish_job(&self, state: &mut DownloadState, mut job: DownloadJob) {
        debug_assert!(job.state.is_terminal());
        if job.completed_at.is_none() {
            job.completed_at = Some(chrono::Utc::now());
        }
        state.finished.insert(0, job);
        state.finished.truncate(self.config.max_finished_items);
    }

    fn emit(&self, event: DownloadEvent) {
        // Send fails only when nobody is subscribed.
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use promptdeck_core::download::MODEL_TYPE_LORA;

    /// Deterministic sizes and an interval long enough that the
    /// background ticker never fires; tests drive `tick` directly.
    fn manual_config() -> DownloadConfig {
        DownloadConfig {
            tick_interval: Duration::from_secs(3600),
            min_total_bytes: 1000,
            max_total_bytes: 1000,
            min_tick_bytes: 250,
            max_tick_bytes: 250,
            failure_rate: 0.0,
            max_finished_items: 64,
        }
    }

    fn manual_manager(config: DownloadConfig) -> (Arc<DownloadManager>, Arc<ModelRegistry>) {
        let models = Arc::new(ModelRegistry::new());
        (DownloadManager::start(config, Arc::clone(&models)), models)
    }

    fn request(name: &str, url: &str) -> DownloadRequest {
        DownloadRequest {
            name: name.to_string(),
            url: url.to_string(),
            model_type: MODEL_TYPE_LORA.to_string(),
            base_model: Some("SDXL".to_string()),
        }
    }

    #[tokio::test]
    async fn add_download_validates_inputs() {
        let (manager, _) = manual_manager(manual_config());

        let bad_url = manager
            .add_download(request("m", "ftp://example.com/m.safetensors"))
            .await;
        assert_matches!(bad_url, Err(CoreError::Validation(_)));

        let mut bad_type = request("m", "https://example.com/m.safetensors");
        bad_type.model_type = "diffuser".to_string();
        assert_matches!(
            manager.add_download(bad_type).await,
            Err(CoreError::Validation(_))
        );

        manager.shutdown();
    }

    #[tokio::test]
    async fn duplicate_url_is_rejected() {
        let (manager, models) = manual_manager(manual_config());

        let url = "https://civitai.com/api/download/models/1";
        manager.add_download(request("a", url)).await.unwrap();
        assert_matches!(
            manager.add_download(request("b", url)).await,
            Err(CoreError::Conflict(_))
        );

        // Already-imported models are also duplicates.
        models.add_model(NewModel {
            name: "imported".to_string(),
            model_type: MODEL_TYPE_LORA.to_string(),
            base_model: None,
            size: "1.0 GB".to_string(),
            size_bytes: GIB,
            version: "1.0".to_string(),
            source: DownloadSource::Civitai,
            source_url: Some("https://civitai.com/api/download/models/2".to_string()),
        });
        assert_matches!(
            manager
                .add_download(request("c", "https://civitai.com/api/download/models/2"))
                .await,
            Err(CoreError::Conflict(_))
        );

        manager.shutdown();
    }

    #[tokio::test]
    async fn only_one_download_runs_at_a_time() {
        let (manager, _) = manual_manager(manual_config());

        let a = manager
            .add_download(request("a", "https://example.com/a.safetensors"))
            .await
            .unwrap();
        manager
            .add_download(request("b", "https://example.com/b.safetensors"))
            .await
            .unwrap();
        manager
            .add_download(request("c", "https://example.com/c.safetensors"))
            .await
            .unwrap();

        let active = manager.active_download().await.unwrap();
        assert_eq!(active.id, a.id);
        assert_eq!(active.state, JobState::Running);

        let jobs = manager.jobs().await;
        assert_eq!(
            jobs.iter().filter(|j| j.state == JobState::Running).count(),
            1
        );
        assert_eq!(
            jobs.iter().filter(|j| j.state == JobState::Pending).count(),
            2
        );

        manager.shutdown();
    }

    #[tokio::test]
    async fn completion_registers_model_and_promotes_next() {
        let (manager, models) = manual_manager(manual_config());
        let mut events = manager.subscribe();

        let a = manager
            .add_download(request("first", "https://example.com/first.safetensors"))
            .await
            .unwrap();
        let b = manager
            .add_download(request("second", "https://example.com/second.safetensors"))
            .await
            .unwrap();

        // 1000 bytes at 250 per tick: exactly 4 transfer ticks.
        for _ in 0..4 {
            manager.tick().await;
        }

        let jobs = manager.jobs().await;
        let done = jobs.iter().find(|j| j.id == a.id).unwrap();
        assert_eq!(done.state, JobState::Completed);
        let result = done.result.as_ref().unwrap();
        assert_eq!(result.file_path, "/models/lora/first.safetensors");
        assert_eq!(result.size_bytes, 1000);

        assert_eq!(models.len(), 1);
        assert!(models.has_model_with_url("https://example.com/first.safetensors"));

        // The next pending job was promoted right away.
        assert_eq!(manager.active_download().await.unwrap().id, b.id);

        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(&event, DownloadEvent::Completed { id, .. } if *id == a.id) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);

        manager.shutdown();
    }

    #[tokio::test]
    async fn failure_injection_and_retry() {
        let (manager, models) = manual_manager(DownloadConfig {
            failure_rate: 1.0,
            ..manual_config()
        });

        let job = manager
            .add_download(request("m", "https://example.com/m.safetensors"))
            .await
            .unwrap();

        manager.tick().await; // first transfer tick fails

        let jobs = manager.jobs().await;
        let failed = jobs.iter().find(|j| j.id == job.id).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert!(failed.error_message.is_some());
        assert!(models.is_empty());

        // Retry re-queues and, with the slot idle, restarts right away.
        manager.retry_download(&job.id).await.unwrap();
        let retried = manager.active_download().await.unwrap();
        assert_eq!(retried.id, job.id);
        assert_eq!(retried.state, JobState::Running);
        assert!(retried.error_message.is_none());

        manager.shutdown();
    }

    #[tokio::test]
    async fn fail_download_terminates_running_job() {
        let (manager, _) = manual_manager(manual_config());

        let job = manager
            .add_download(request("m", "https://example.com/m.safetensors"))
            .await
            .unwrap();
        manager.fail_download(&job.id, "disk full").await.unwrap();

        let jobs = manager.jobs().await;
        let failed = jobs.iter().find(|j| j.id == job.id).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("disk full"));

        assert_matches!(
            manager.fail_download(&job.id, "again").await,
            Err(CoreError::NotFound { .. })
        );

        manager.shutdown();
    }

    #[tokio::test]
    async fn cancelling_running_download_promotes_next_in_order() {
        let (manager, _) = manual_manager(manual_config());

        let a = manager
            .add_download(request("a", "https://example.com/a.safetensors"))
            .await
            .unwrap();
        let b = manager
            .add_download(request("b", "https://example.com/b.safetensors"))
            .await
            .unwrap();
        let c = manager
            .add_download(request("c", "https://example.com/c.safetensors"))
            .await
            .unwrap();

        manager.cancel_download(&a.id).await.unwrap();

        assert_eq!(manager.active_download().await.unwrap().id, b.id);
        let jobs = manager.jobs().await;
        let third = jobs.iter().find(|j| j.id == c.id).unwrap();
        assert_eq!(third.state, JobState::Pending);

        manager.shutdown();
    }

    #[tokio::test]
    async fn cancel_pending_and_running() {
        let (manager, _) = manual_manager(manual_config());

        let a = manager
            .add_download(request("a", "https://example.com/a.safetensors"))
            .await
            .unwrap();
        let b = manager
            .add_download(request("b", "https://example.com/b.safetensors"))
            .await
            .unwrap();

        manager.cancel_download(&b.id).await.unwrap();
        manager.cancel_download(&a.id).await.unwrap();

        let jobs = manager.jobs().await;
        assert!(jobs.iter().all(|j| j.state == JobState::Cancelled));
        assert!(manager.active_download().await.is_none());

        manager.shutdown();
    }

    #[tokio::test]
    async fn cancel_unknown_or_terminal_errors() {
        let (manager, _) = manual_manager(manual_config());

        assert_matches!(
            manager.cancel_download("nope").await,
            Err(CoreError::NotFound { .. })
        );

        let job = manager
            .add_download(request("m", "https://example.com/m.safetensors"))
            .await
            .unwrap();
        manager.cancel_download(&job.id).await.unwrap();
        assert_matches!(
            manager.cancel_download(&job.id).await,
            Err(CoreError::InvalidTransition { .. })
        );

        manager.shutdown();
    }

    #[tokio::test]
    async fn retry_completed_download_is_rejected() {
        let (manager, _) = manual_manager(manual_config());

        let job = manager
            .add_download(request("m", "https://example.com/m.safetensors"))
            .await
            .unwrap();
        for _ in 0..4 {
            manager.tick().await;
        }

        assert_matches!(
            manager.retry_download(&job.id).await,
            Err(CoreError::InvalidTransition { .. })
        );

        manager.shutdown();
    }

    #[tokio::test]
    async fn finished_list_is_capped() {
        let (manager, _) = manual_manager(DownloadConfig {
            max_finished_items: 2,
            ..manual_config()
        });

        for i in 0..4 {
            let job = manager
                .add_download(request(
                    &format!("m{i}"),
                    &format!("https://example.com/m{i}.safetensors"),
                ))
                .await
                .unwrap();
            manager.cancel_download(&job.id).await.unwrap();
        }

        assert_eq!(manager.jobs().await.len(), 2);
        manager.shutdown();
    }

    #[tokio::test]
    async fn ticker_drives_download_to_completion() {
        let (manager, models) = manual_manager(DownloadConfig {
            tick_interval: Duration::from_millis(1),
            ..manual_config()
        });
        let mut events = manager.subscribe();

        manager
            .add_download(request("m", "https://example.com/m.safetensors"))
            .await
            .unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("ticker stalled")
                .expect("event channel closed");
            if matches!(event, DownloadEvent::Completed { .. }) {
                break;
            }
        }

        assert_eq!(models.len(), 1);
        manager.shutdown();
    }
}
