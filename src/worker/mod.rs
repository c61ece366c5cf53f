//! Background job orchestrator.
//!
//! A single task polls for the oldest pending job, claims it by flipping
//! its status to processing before any stage code runs, executes the
//! stage keyed by the job's step, and chains or finishes follow-on work.
//! Exactly one job is ever processing at a time by construction of the
//! poll-claim-execute sequence; there is no lock and no cancellation.
//! Any uncaught stage failure lands in the job log with the full error
//! chain, and both job and session flip to their error states.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::archive::RestoreManager;
use crate::config::{AppConfig, ConfigCache};
use crate::llm::{recap_header, Summarizer};
use crate::post::{ScriptRunner, WebhookPoster};
use crate::store::{Job, JobStatus, JobStep, JsonStore, Session, SessionStatus};
use crate::transcribe::{engine::SpeechEngine, TranscriptionStage};

const DEFAULT_PROMPT: &str = "Summarize this tabletop RPG session.";

pub struct Worker {
    store: Arc<JsonStore>,
    config: Arc<ConfigCache>,
    engine: Arc<dyn SpeechEngine>,
    summarizer: Arc<dyn Summarizer>,
    poster: WebhookPoster,
}

impl Worker {
    pub fn new(
        store: Arc<JsonStore>,
        config: Arc<ConfigCache>,
        engine: Arc<dyn SpeechEngine>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            store,
            config,
            engine,
            summarizer,
            poster: WebhookPoster::new(),
        }
    }

    /// Startup recovery: reset any orphaned processing job to pending.
    /// This is the sole recovery mechanism; there is no partial-progress
    /// resume within a stage.
    pub fn recover(&self) -> Result<usize> {
        self.store.reset_orphaned_jobs()
    }

    /// Run forever: recover once, then poll-claim-execute with a fixed
    /// sleep when the queue is empty.
    pub async fn run(&self) -> Result<()> {
        info!("Job manager started");
        self.recover()?;

        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => {
                    let interval = self
                        .config
                        .get()
                        .map(|c| c.worker.poll_interval_secs)
                        .unwrap_or(2);
                    tokio::time::sleep(Duration::from_secs(interval)).await;
                }
                Err(e) => {
                    error!("Job manager loop error: {:#}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// One poll: claim and run the oldest pending job, if any. Returns
    /// whether a job was processed. Exposed separately so tests can step
    /// the pipeline deterministically.
    pub async fn tick(&self) -> Result<bool> {
        let Some(job) = self.store.next_pending_job()? else {
            return Ok(false);
        };
        let cfg = self.config.get()?;
        self.process_job(job, &cfg).await?;
        Ok(true)
    }

    async fn process_job(&self, job: Job, cfg: &AppConfig) -> Result<()> {
        info!(
            "Processing Job #{} [{}] for Session #{}",
            job.id, job.step, job.session_id
        );

        if !self.store.claim_job(job.id)? {
            // Raced with a delete or an earlier claim; nothing to do.
            return Ok(());
        }

        // A fresh upload becomes an active session the moment its first
        // job is picked up.
        if let Some(session) = self.store.session(job.session_id)? {
            if session.status == SessionStatus::Uploaded {
                self.store
                    .set_session_status(session.id, SessionStatus::Processing)?;
            }
        }

        match self.execute(&job, cfg).await {
            Ok(()) => {
                self.store.set_job_status(job.id, JobStatus::Completed)?;
                info!("Job #{} completed", job.id);
            }
            Err(e) => {
                error!("Job #{} failed: {:#}", job.id, e);
                self.store
                    .append_job_log(job.id, &format!("CRITICAL ERROR: {}\n{:?}", e, e))?;
                self.store.set_job_status(job.id, JobStatus::Error)?;
                self.store
                    .set_session_status(job.session_id, SessionStatus::Error)?;
            }
        }
        Ok(())
    }

    /// Stage dispatch keyed by the job's step.
    async fn execute(&self, job: &Job, cfg: &AppConfig) -> Result<()> {
        match &job.step {
            JobStep::Transcribe { speaker: None } => {
                let stage =
                    TranscriptionStage::new(Arc::clone(&self.engine), Arc::clone(&self.store));
                stage.run(job, cfg).await?;

                // Chain exactly one summarize job, guarded against
                // duplicates left over from a retry.
                if !self.store.has_job(job.session_id, &JobStep::Summarize)? {
                    self.store
                        .create_job(job.session_id, JobStep::Summarize, "Job queued.")?;
                    self.store
                        .append_job_log(job.id, "Queued summarize job.")?;
                }
                Ok(())
            }
            JobStep::Transcribe { speaker: Some(_) } => {
                let stage =
                    TranscriptionStage::new(Arc::clone(&self.engine), Arc::clone(&self.store));
                stage.run(job, cfg).await?;

                // A targeted re-run does not chain a summarize job.
                self.store
                    .set_session_status(job.session_id, SessionStatus::Ready)?;
                Ok(())
            }
            JobStep::Summarize => {
                self.run_summarize(job, cfg, true).await?;
                self.run_scripts(job, cfg).await?;
                self.store
                    .set_session_status(job.session_id, SessionStatus::Completed)?;
                self.finish_cleanup(job, cfg)?;
                Ok(())
            }
            JobStep::SummarizeOnly => {
                self.run_summarize(job, cfg, false).await?;
                self.store
                    .set_session_status(job.session_id, SessionStatus::Ready)?;
                Ok(())
            }
            JobStep::PostWebhook => self.run_webhook(job, cfg).await,
            JobStep::RunScripts => self.run_scripts(job, cfg).await,
        }
    }

    /// Generate the summary and persist it; with `post_enabled`, also
    /// send it to the campaign webhook.
    async fn run_summarize(&self, job: &Job, cfg: &AppConfig, post_enabled: bool) -> Result<()> {
        let session = self.session(job)?;
        let campaign = self
            .store
            .campaign(session.campaign_id)?
            .context("Campaign not found")?;

        let transcript_path = session.directory_path.join("session_transcript.txt");
        if !transcript_path.exists() {
            // The working directory may have been reclaimed; the store
            // copy is canonical.
            match &session.transcript_text {
                Some(text) => {
                    fs::create_dir_all(&session.directory_path)?;
                    fs::write(&transcript_path, text)?;
                }
                None => bail!("Transcript file not found."),
            }
        }

        let prompt = campaign
            .system_prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PROMPT.to_string());

        self.store.append_job_log(
            job.id,
            &format!("Starting Summary with {}...", cfg.llm.provider),
        )?;

        let summary = match self
            .summarizer
            .summarize(&prompt, &transcript_path, &cfg.llm, cfg.storage.space_saver)
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                self.store
                    .append_job_log(job.id, &format!("LLM Error: {}", e))?;
                return Err(e).context("Summarization failed");
            }
        };

        let date_label = format_session_date(session.session_date);
        let final_content = format!(
            "{}{}",
            recap_header(&date_label, &summary.usage),
            summary.text
        );

        let recap_path = session.directory_path.join("session_recap.txt");
        fs::write(&recap_path, &final_content)
            .with_context(|| format!("Failed to write {}", recap_path.display()))?;
        self.store.set_session_summary(session.id, &final_content)?;
        self.store
            .append_job_log(job.id, "Summary generated successfully.")?;

        if post_enabled {
            if let Some(url) = webhook_url(&campaign.webhook_url) {
                self.store.append_job_log(job.id, "Sending to Discord...")?;
                self.poster
                    .post_summary(&url, &final_content, &date_label)
                    .await?;
                self.store.append_job_log(job.id, "Sent.")?;
            }
        }

        Ok(())
    }

    /// Manual re-post of an existing summary.
    async fn run_webhook(&self, job: &Job, _cfg: &AppConfig) -> Result<()> {
        let session = self.session(job)?;
        let campaign = self
            .store
            .campaign(session.campaign_id)?
            .context("Campaign not found")?;

        let summary = session
            .summary_text
            .clone()
            .context("No summary to post; run summarize first")?;
        let url =
            webhook_url(&campaign.webhook_url).context("Campaign has no webhook configured")?;

        let date_label = format_session_date(session.session_date);
        self.store.append_job_log(job.id, "Sending to Discord...")?;
        self.poster.post_summary(&url, &summary, &date_label).await?;
        self.store.append_job_log(job.id, "Sent.")?;
        Ok(())
    }

    /// Run the campaign's scripts against the recap and transcript. The
    /// input files are materialized from the store for the duration of
    /// the run and removed afterward unconditionally; the store copies
    /// stay canonical.
    async fn run_scripts(&self, job: &Job, cfg: &AppConfig) -> Result<()> {
        let session = self.session(job)?;
        let campaign = self
            .store
            .campaign(session.campaign_id)?
            .context("Campaign not found")?;

        if campaign.scripts.is_empty() {
            self.store
                .append_job_log(job.id, "No campaign scripts configured.")?;
            return Ok(());
        }

        self.store.append_job_log(
            job.id,
            &format!(
                "--- Executing {} Campaign Scripts ---",
                campaign.scripts.len()
            ),
        )?;

        fs::create_dir_all(&session.directory_path)?;
        let recap_path = session.directory_path.join("session_recap.txt");
        let transcript_path = session.directory_path.join("session_transcript.txt");
        fs::write(&recap_path, session.summary_text.as_deref().unwrap_or(""))?;
        fs::write(
            &transcript_path,
            session.transcript_text.as_deref().unwrap_or(""),
        )?;

        let runner = ScriptRunner::new(
            &cfg.paths.scripts_dir,
            Duration::from_secs(cfg.worker.script_timeout_secs),
        );
        let store = Arc::clone(&self.store);
        let job_id = job.id;
        runner
            .run_all(&campaign.scripts, &recap_path, &transcript_path, |line| {
                if let Err(e) = store.append_job_log(job_id, line) {
                    error!("Failed to append script log: {:#}", e);
                }
            })
            .await;

        let _ = fs::remove_file(&recap_path);
        let _ = fs::remove_file(&transcript_path);
        Ok(())
    }

    /// Completion housekeeping: archive the original upload and reclaim
    /// raw audio when configured. Problems here are warnings, never a
    /// job failure.
    fn finish_cleanup(&self, job: &Job, cfg: &AppConfig) -> Result<()> {
        if !cfg.storage.archive_zip {
            return Ok(());
        }

        let session = self.session(job)?;
        let restorer = RestoreManager::new(&cfg.paths.archive_dir);

        match restorer.archive_upload(
            &session.directory_path,
            &session.original_filename,
            session.session_date,
        ) {
            Ok(Some(dest)) => {
                self.store
                    .append_job_log(job.id, &format!("Archived zip to: {}", dest.display()))?;

                if cfg.storage.space_saver {
                    match restorer.reclaim_audio(
                        &session.directory_path,
                        &session.original_filename,
                        &cfg.storage.audio_extension,
                    ) {
                        Ok(removed) => {
                            self.store.append_job_log(
                                job.id,
                                &format!("Reclaimed {} audio files.", removed),
                            )?;
                        }
                        Err(e) => {
                            self.store
                                .append_job_log(job.id, &format!("Cleanup Warning: {}", e))?;
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.store
                    .append_job_log(job.id, &format!("Cleanup Warning: {}", e))?;
            }
        }
        Ok(())
    }

    fn session(&self, job: &Job) -> Result<Session> {
        self.store
            .session(job.session_id)?
            .context("Session not found")
    }
}

/// The recap/webhook date label, in the server's local timezone.
pub fn format_session_date(date: DateTime<Utc>) -> String {
    date.with_timezone(&Local).format("%B %-d, %Y").to_string()
}

fn webhook_url(configured: &Option<String>) -> Option<String> {
    configured
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}
