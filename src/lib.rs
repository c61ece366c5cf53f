pub mod archive;
pub mod config;
pub mod intake;
pub mod llm;
pub mod post;
pub mod store;
pub mod transcribe;
pub mod worker;

pub use archive::{RestoreError, RestoreManager, RestoreOutcome};
pub use config::{AppConfig, ConfigCache};
pub use intake::{ingest_upload, request_retranscribe, UploadOutcome, ValidationError};
pub use llm::{LlmClient, LlmProvider, Summarizer, Summary};
pub use post::{ScriptRunner, WebhookPoster};
pub use store::{
    Campaign, Job, JobStatus, JobStep, JsonStore, Session, SessionStatus, Transcript,
};
pub use transcribe::{SpeechEngine, TranscriptionStage, WhisperEngine};
pub use worker::Worker;
