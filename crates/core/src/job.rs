//! Workflow job records and lifecycle states.
//!
//! A [`WorkflowJob`] tracks one prompt submitted to the execution
//! backend from creation through the pending/running queue into the
//! bounded history. State transitions are monotonic: pending -> running
//! -> terminal, with no backward edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state shared by workflow and download jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal (monotonic) transition.
    ///
    /// Pending work may be cancelled or failed directly without ever
    /// entering the running slot.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, n) if n.is_terminal() => true,
            (Self::Running, n) if n.is_terminal() => true,
            _ => false,
        }
    }

    /// Lowercase name, matching the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Storage class of an output file on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Output,
    Input,
    Temp,
}

impl OutputKind {
    /// Parse the backend's `type` field. Unknown values map to
    /// [`OutputKind::Output`], which is what the backend sends for
    /// final results.
    pub fn parse(s: &str) -> Self {
        match s {
            "input" => Self::Input,
            "temp" => Self::Temp,
            _ => Self::Output,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Input => "input",
            Self::Temp => "temp",
        }
    }
}

/// Media category inferred from an output filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    #[serde(rename = "3d")]
    ThreeD,
    Unknown,
}

impl MediaType {
    /// Infer the media type from the filename extension.
    pub fn from_filename(filename: &str) -> Self {
        let ext = filename
            .rsplit('.')
            .next()
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "webp" | "gif" => Self::Image,
            "mp4" | "webm" | "mov" => Self::Video,
            "mp3" | "wav" | "flac" => Self::Audio,
            "glb" | "gltf" | "obj" => Self::ThreeD,
            _ => Self::Unknown,
        }
    }
}

/// One file produced by a node during workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Stable identifier: `{prompt_id}-{node_id}-{filename}`.
    pub id: String,
    /// The node that produced this output.
    pub node_id: String,
    pub filename: String,
    pub subfolder: String,
    pub kind: OutputKind,
    pub media_type: MediaType,
}

impl JobOutput {
    /// Build an output descriptor, inferring the media type from the
    /// filename.
    pub fn new(prompt_id: &str, node_id: &str, filename: &str, subfolder: &str, kind: OutputKind) -> Self {
        Self {
            id: format!("{prompt_id}-{node_id}-{filename}"),
            node_id: node_id.to_string(),
            filename: filename.to_string(),
            subfolder: subfolder.to_string(),
            kind,
            media_type: MediaType::from_filename(filename),
        }
    }
}

/// A tracked workflow execution.
///
/// `id` equals the backend-assigned prompt id; the job appears in
/// exactly one of the pending/running/history collections at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: String,
    pub prompt_id: String,
    /// Position in the backend queue at the last snapshot.
    pub queue_index: i64,
    pub state: JobState,
    pub title: String,
    pub workflow_name: Option<String>,
    /// Outputs accumulate as nodes complete; ordered by arrival.
    pub outputs: Vec<JobOutput>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl WorkflowJob {
    /// Create a job in the given initial state.
    pub fn new(prompt_id: &str, queue_index: i64, state: JobState) -> Self {
        Self {
            id: prompt_id.to_string(),
            prompt_id: prompt_id.to_string(),
            queue_index,
            state,
            title: format!("Job #{queue_index}"),
            workflow_name: None,
            outputs: Vec::new(),
            created_at: Utc::now(),
            started_at: if state == JobState::Running {
                Some(Utc::now())
            } else {
                None
            },
            completed_at: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- JobState -------------------------------------------------------------

    #[test]
    fn pending_to_running_allowed() {
        assert!(JobState::Pending.can_transition_to(JobState::Running));
    }

    #[test]
    fn pending_to_terminal_allowed() {
        assert!(JobState::Pending.can_transition_to(JobState::Cancelled));
        assert!(JobState::Pending.can_transition_to(JobState::Failed));
    }

    #[test]
    fn running_to_terminal_allowed() {
        assert!(JobState::Running.can_transition_to(JobState::Completed));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(JobState::Running.can_transition_to(JobState::Cancelled));
    }

    #[test]
    fn backward_transitions_rejected() {
        assert!(!JobState::Running.can_transition_to(JobState::Pending));
        assert!(!JobState::Completed.can_transition_to(JobState::Running));
        assert!(!JobState::Failed.can_transition_to(JobState::Pending));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Completed));
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    // -- MediaType ------------------------------------------------------------

    #[test]
    fn image_extensions() {
        for f in ["a.png", "b.jpg", "c.JPEG", "d.webp", "e.gif"] {
            assert_eq!(MediaType::from_filename(f), MediaType::Image, "{f}");
        }
    }

    #[test]
    fn video_extensions() {
        for f in ["a.mp4", "b.webm", "c.mov"] {
            assert_eq!(MediaType::from_filename(f), MediaType::Video, "{f}");
        }
    }

    #[test]
    fn audio_extensions() {
        for f in ["a.mp3", "b.wav", "c.flac"] {
            assert_eq!(MediaType::from_filename(f), MediaType::Audio, "{f}");
        }
    }

    #[test]
    fn three_d_extensions() {
        for f in ["a.glb", "b.gltf", "c.obj"] {
            assert_eq!(MediaType::from_filename(f), MediaType::ThreeD, "{f}");
        }
    }

    #[test]
    fn unknown_extension() {
        assert_eq!(MediaType::from_filename("archive.zip"), MediaType::Unknown);
        assert_eq!(MediaType::from_filename("no_extension"), MediaType::Unknown);
    }

    // -- OutputKind -----------------------------------------------------------

    #[test]
    fn output_kind_parse() {
        assert_eq!(OutputKind::parse("output"), OutputKind::Output);
        assert_eq!(OutputKind::parse("input"), OutputKind::Input);
        assert_eq!(OutputKind::parse("temp"), OutputKind::Temp);
        assert_eq!(OutputKind::parse("something_else"), OutputKind::Output);
    }

    // -- JobOutput ------------------------------------------------------------

    #[test]
    fn job_output_id_and_media_type() {
        let out = JobOutput::new("p1", "9", "result.png", "", OutputKind::Output);
        assert_eq!(out.id, "p1-9-result.png");
        assert_eq!(out.media_type, MediaType::Image);
    }

    // -- WorkflowJob ----------------------------------------------------------

    #[test]
    fn new_running_job_has_start_time() {
        let job = WorkflowJob::new("p1", 3, JobState::Running);
        assert!(job.started_at.is_some());
        assert_eq!(job.title, "Job #3");
    }

    #[test]
    fn new_pending_job_has_no_start_time() {
        let job = WorkflowJob::new("p1", 0, JobState::Pending);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
    }
}
