//! Queue worker binary.
//!
//! Runs the tracker and download driver against either a live ComfyUI
//! server or the built-in synthetic backend, and logs every queue and
//! download event until interrupted.
//!
//! Environment:
//! - `PROMPTDECK_MODE`: `demo` (default) or `live`.
//! - `COMFYUI_API_URL`: HTTP base URL in live mode.
//! - `COMFYUI_WS_URL`: WebSocket base URL in live mode.
//! - `PROMPTDECK_POLL_SECS`: snapshot poll interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use promptdeck_comfyui::backend::HttpBackend;
use promptdeck_comfyui::synthetic::{SyntheticBackend, SyntheticConfig};
use promptdeck_comfyui::ExecutionBackend;
use promptdeck_core::models::ModelRegistry;
use promptdeck_queue::{
    DownloadConfig, DownloadEvent, DownloadManager, DownloadRequest, QueueEvent, QueueTracker,
    TrackerConfig,
};

#[derive(Debug)]
struct WorkerConfig {
    demo: bool,
    api_url: String,
    ws_url: String,
    poll_interval: Duration,
}

impl WorkerConfig {
    fn from_env() -> Self {
        let mode = std::env::var("PROMPTDECK_MODE").unwrap_or_else(|_| "demo".to_string());
        let poll_secs = std::env::var("PROMPTDECK_POLL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        Self {
            demo: mode != "live",
            api_url: std::env::var("COMFYUI_API_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8188".to_string()),
            ws_url: std::env::var("COMFYUI_WS_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8188".to_string()),
            poll_interval: Duration::from_secs(poll_secs),
        }
    }
}

/// Minimal text-to-image graph used for demo submissions.
fn demo_workflow() -> serde_json::Value {
    serde_json::json!({
        "3": {"class_type": "KSampler", "inputs": {"seed": 42, "steps": 20}},
        "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "a mountain lake at dawn"}},
        "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "promptdeck"}},
    })
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "promptdeck_worker=debug,promptdeck_queue=debug,promptdeck_comfyui=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env();
    tracing::info!(demo = config.demo, "Worker starting");

    let backend: Arc<dyn ExecutionBackend> = if config.demo {
        SyntheticBackend::start(SyntheticConfig::default())
    } else {
        tracing::info!(api_url = %config.api_url, ws_url = %config.ws_url, "Connecting to ComfyUI");
        HttpBackend::start(config.api_url.clone(), config.ws_url.clone())
    };

    let tracker = QueueTracker::new(
        backend,
        TrackerConfig {
            poll_interval: config.poll_interval,
            ..Default::default()
        },
    );
    let models = Arc::new(ModelRegistry::new());
    let downloads = DownloadManager::start(DownloadConfig::default(), Arc::clone(&models));

    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&tracker).run(cancel.clone()));

    if config.demo {
        seed_demo_work(&tracker, &downloads).await;
    }

    let mut queue_events = tracker.subscribe();
    let mut download_events = downloads.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            event = queue_events.recv() => match event {
                Ok(event) => log_queue_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Queue events lagged");
                }
                Err(RecvError::Closed) => {
                    tracing::warn!("Queue event stream closed");
                    break;
                }
            },
            event = download_events.recv() => match event {
                Ok(event) => log_download_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Download events lagged");
                }
                Err(RecvError::Closed) => {
                    tracing::warn!("Download event stream closed");
                    break;
                }
            },
        }
    }

    cancel.cancel();
    downloads.shutdown();

    let stats = tracker.stats().await;
    tracing::info!(
        completed = stats.history_count,
        models = models.len(),
        "Worker stopped",
    );
}

/// Queue a sample workflow and a sample download so demo mode has
/// something to show.
async fn seed_demo_work(tracker: &QueueTracker, downloads: &DownloadManager) {
    match tracker.queue_prompt(&demo_workflow()).await {
        Ok(prompt_id) => tracing::info!(%prompt_id, "Demo workflow queued"),
        Err(e) => tracing::error!(error = %e, "Failed to queue demo workflow"),
    }

    let request = DownloadRequest {
        name: "DreamShaper XL".to_string(),
        url: "https://civitai.com/api/download/models/351306".to_string(),
        model_type: promptdeck_core::download::MODEL_TYPE_CHECKPOINT.to_string(),
        base_model: Some("SDXL".to_string()),
    };
    match downloads.add_download(request).await {
        Ok(job) => tracing::info!(id = %job.id, "Demo download queued"),
        Err(e) => tracing::error!(error = %e, "Failed to queue demo download"),
    }
}

fn log_queue_event(event: &QueueEvent) {
    match event {
        QueueEvent::ExecutionStarted { prompt_id } => {
            tracing::info!(%prompt_id, "Execution started");
        }
        QueueEvent::ExecutionProgress {
            prompt_id,
            percent,
            current_node,
        } => {
            tracing::debug!(%prompt_id, percent, node = current_node.as_deref(), "Progress");
        }
        QueueEvent::ExecutionCompleted { prompt_id } => {
            tracing::info!(%prompt_id, "Execution completed");
        }
        QueueEvent::ExecutionFailed { prompt_id, error } => {
            tracing::warn!(%prompt_id, %error, "Execution failed");
        }
        QueueEvent::QueueDepth { queue_remaining } => {
            tracing::debug!(queue_remaining, "Queue depth");
        }
        QueueEvent::QueueRefreshed => {
            tracing::trace!("Snapshots reconciled");
        }
    }
}

fn log_download_event(event: &DownloadEvent) {
    match event {
        DownloadEvent::Started { id, name } => {
            tracing::info!(%id, %name, "Download started");
        }
        DownloadEvent::Progress { id, percent } => {
            tracing::debug!(%id, percent, "Download progress");
        }
        DownloadEvent::Completed { id, name, file_path } => {
            tracing::info!(%id, %name, %file_path, "Download completed");
        }
        DownloadEvent::Failed { id, error } => {
            tracing::warn!(%id, %error, "Download failed");
        }
        DownloadEvent::Cancelled { id } => {
            tracing::info!(%id, "Download cancelled");
        }
    }
}
