use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle status of a pipeline job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a recording session, derived from its jobs'
/// furthest successful stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Uploaded,
    Processing,
    Ready,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uploaded => "Uploaded",
            SessionStatus::Processing => "Processing",
            SessionStatus::Ready => "Ready",
            SessionStatus::Completed => "Completed",
            SessionStatus::Error => "Error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pipeline step, dispatched by the worker.
///
/// A targeted transcription carries the speaker name as enum data rather
/// than an encoded string, so dispatch never string-splits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobStep {
    /// Transcribe every audio track, or a single speaker's track when
    /// `speaker` is set.
    Transcribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speaker: Option<String>,
    },
    /// Generate a summary, then run scripts and post to the webhook.
    Summarize,
    /// Generate a summary only (manual re-generation, no fan-out).
    SummarizeOnly,
    /// Manually re-post the existing summary to the webhook.
    PostWebhook,
    /// Manually re-run the campaign scripts.
    RunScripts,
}

impl JobStep {
    pub fn full_transcribe() -> Self {
        JobStep::Transcribe { speaker: None }
    }

    pub fn targeted_transcribe(speaker: impl Into<String>) -> Self {
        JobStep::Transcribe {
            speaker: Some(speaker.into()),
        }
    }
}

impl fmt::Display for JobStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStep::Transcribe { speaker: None } => f.write_str("transcribe"),
            JobStep::Transcribe {
                speaker: Some(name),
            } => write!(f, "transcribe:{}", name),
            JobStep::Summarize => f.write_str("summarize"),
            JobStep::SummarizeOnly => f.write_str("summarize-only"),
            JobStep::PostWebhook => f.write_str("post-to-webhook"),
            JobStep::RunScripts => f.write_str("run-scripts"),
        }
    }
}

/// A named grouping of sessions sharing a prompt, webhook target, and
/// script list. Created and edited by the web layer; read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: u64,
    pub name: String,
    pub is_default: bool,
    pub webhook_url: Option<String>,
    pub system_prompt: Option<String>,
    /// Script basenames, executed in order by the script runner.
    pub scripts: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// One recorded sitting with its audio, transcripts, and summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    pub campaign_id: u64,

    /// Display ordering hint; not guaranteed unique within a campaign.
    pub session_number: u32,

    /// Recording start time, parsed from the upload's info.txt.
    pub session_date: DateTime<Utc>,

    /// Filename of the uploaded archive.
    pub original_filename: String,

    /// Working directory. May legitimately not exist on disk (archived or
    /// space-reclaimed); always go through the restore manager before
    /// assuming files are present.
    pub directory_path: PathBuf,

    pub status: SessionStatus,

    /// Merged master transcript, once transcription has run.
    pub transcript_text: Option<String>,

    /// Generated recap including the metadata header, once summarization
    /// has run.
    pub summary_text: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Per-speaker transcript, unique by (session, speaker). Overwritten in
/// place on retry, never duplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub id: u64,
    pub session_id: u64,
    pub speaker: String,
    /// Audio filename this transcript came from.
    pub filename: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Structured per-speaker timing emitted by the transcription stage
/// alongside the human-readable log markers. Reporting computes metrics
/// from this rather than scraping the log text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub speaker: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Transcript lines produced for this speaker.
    pub lines: usize,
}

/// One pipeline work unit bound to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub session_id: u64,
    pub step: JobStep,
    pub status: JobStatus,

    /// Append-only diagnostic log. The transcription start/completed
    /// markers inside it are a parsing contract for the reporting layer.
    pub logs: String,

    /// Structured timing events collected while the job ran.
    pub events: Vec<StageEvent>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit row for one external LLM call. Append-only, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCall {
    pub id: u64,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub duration_secs: f64,
    pub http_status: u16,
    pub finish_reason: String,
    /// Request payload, possibly with inline attachments truncated.
    pub request_json: String,
    pub response_json: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_display_matches_wire_names() {
        assert_eq!(JobStep::full_transcribe().to_string(), "transcribe");
        assert_eq!(
            JobStep::targeted_transcribe("alice").to_string(),
            "transcribe:alice"
        );
        assert_eq!(JobStep::Summarize.to_string(), "summarize");
        assert_eq!(JobStep::SummarizeOnly.to_string(), "summarize-only");
        assert_eq!(JobStep::PostWebhook.to_string(), "post-to-webhook");
        assert_eq!(JobStep::RunScripts.to_string(), "run-scripts");
    }

    #[test]
    fn step_roundtrips_through_serde() {
        for step in [
            JobStep::full_transcribe(),
            JobStep::targeted_transcribe("bob"),
            JobStep::Summarize,
            JobStep::SummarizeOnly,
            JobStep::PostWebhook,
            JobStep::RunScripts,
        ] {
            let json = serde_json::to_string(&step).unwrap();
            let back: JobStep = serde_json::from_str(&json).unwrap();
            assert_eq!(step, back);
        }
    }
}
