use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use super::records::{
    Campaign, Job, JobStatus, JobStep, LlmCall, Session, SessionStatus, StageEvent, Transcript,
};

/// Fields of an LLM audit row supplied by the caller; the store assigns
/// the id and timestamp.
#[derive(Debug, Clone)]
pub struct NewLlmCall {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub duration_secs: f64,
    pub http_status: u16,
    pub finish_reason: String,
    pub request_json: String,
    pub response_json: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    campaigns: Vec<Campaign>,
    sessions: Vec<Session>,
    jobs: Vec<Job>,
    transcripts: Vec<Transcript>,
    llm_calls: Vec<LlmCall>,
}

impl StoreState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Record store for the pipeline: campaigns, sessions, jobs, transcripts,
/// and the LLM audit trail, persisted as a single JSON document.
///
/// Every mutating call commits to disk before returning, so diagnostic
/// history survives a crash even though an in-flight job restarts from
/// scratch. Writes go through a temp file and rename, so a crash mid-save
/// never leaves a torn store behind.
pub struct JsonStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonStore {
    /// Open the store at `path`, creating an empty one if the file does
    /// not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let state = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse store file {}", path.display()))?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            StoreState::default()
        };

        let store = Self {
            path,
            state: Mutex::new(state),
        };
        {
            let state = store.lock()?;
            store.persist(&state)?;
        }

        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("store mutex poisoned"))
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(state)?;
        fs::write(&tmp, payload)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Run a mutation under the lock and commit the result to disk.
    /// All-or-nothing: if the mutation or the save fails, the in-memory
    /// state rolls back to the pre-call snapshot so memory and disk never
    /// diverge.
    fn commit<R>(&self, mutate: impl FnOnce(&mut StoreState) -> Result<R>) -> Result<R> {
        let mut state = self.lock()?;
        let snapshot = state.clone();
        match mutate(&mut state) {
            Ok(out) => match self.persist(&state) {
                Ok(()) => Ok(out),
                Err(e) => {
                    *state = snapshot;
                    Err(e)
                }
            },
            Err(e) => {
                *state = snapshot;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Campaigns
    // ========================================================================

    pub fn create_campaign(
        &self,
        name: &str,
        webhook_url: Option<String>,
        system_prompt: Option<String>,
        scripts: Vec<String>,
    ) -> Result<Campaign> {
        self.commit(|state| {
            let campaign = Campaign {
                id: state.allocate_id(),
                name: name.to_string(),
                is_default: state.campaigns.is_empty(),
                webhook_url,
                system_prompt,
                scripts,
                created_at: Utc::now(),
            };
            state.campaigns.push(campaign.clone());
            Ok(campaign)
        })
    }

    pub fn campaign(&self, id: u64) -> Result<Option<Campaign>> {
        Ok(self.lock()?.campaigns.iter().find(|c| c.id == id).cloned())
    }

    pub fn campaigns(&self) -> Result<Vec<Campaign>> {
        Ok(self.lock()?.campaigns.clone())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub fn create_session(
        &self,
        campaign_id: u64,
        session_number: u32,
        session_date: DateTime<Utc>,
        original_filename: &str,
        directory_path: &Path,
    ) -> Result<Session> {
        self.commit(|state| {
            if !state.campaigns.iter().any(|c| c.id == campaign_id) {
                return Err(anyhow!("campaign {} not found", campaign_id));
            }
            let session = Session {
                id: state.allocate_id(),
                campaign_id,
                session_number,
                session_date,
                original_filename: original_filename.to_string(),
                directory_path: directory_path.to_path_buf(),
                status: SessionStatus::Uploaded,
                transcript_text: None,
                summary_text: None,
                created_at: Utc::now(),
            };
            state.sessions.push(session.clone());
            Ok(session)
        })
    }

    pub fn session(&self, id: u64) -> Result<Option<Session>> {
        Ok(self.lock()?.sessions.iter().find(|s| s.id == id).cloned())
    }

    pub fn sessions_for_campaign(&self, campaign_id: u64) -> Result<Vec<Session>> {
        let mut rows: Vec<Session> = self
            .lock()?
            .sessions
            .iter()
            .filter(|s| s.campaign_id == campaign_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.created_at, s.id));
        Ok(rows)
    }

    pub fn set_session_status(&self, id: u64, status: SessionStatus) -> Result<()> {
        self.commit(|state| {
            let session = find_session(state, id)?;
            session.status = status;
            Ok(())
        })
    }

    pub fn set_session_transcript(&self, id: u64, text: &str) -> Result<()> {
        self.commit(|state| {
            let session = find_session(state, id)?;
            session.transcript_text = Some(text.to_string());
            Ok(())
        })
    }

    pub fn set_session_summary(&self, id: u64, text: &str) -> Result<()> {
        self.commit(|state| {
            let session = find_session(state, id)?;
            session.summary_text = Some(text.to_string());
            Ok(())
        })
    }

    /// Delete a session along with its jobs and transcripts. The records
    /// share the session's lifetime; LLM audit rows do not and stay.
    pub fn delete_session(&self, id: u64) -> Result<()> {
        self.commit(|state| {
            state.sessions.retain(|s| s.id != id);
            state.jobs.retain(|j| j.session_id != id);
            state.transcripts.retain(|t| t.session_id != id);
            Ok(())
        })
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub fn create_job(&self, session_id: u64, step: JobStep, initial_log: &str) -> Result<Job> {
        self.commit(|state| {
            if !state.sessions.iter().any(|s| s.id == session_id) {
                return Err(anyhow!("session {} not found", session_id));
            }
            let now = Utc::now();
            let job = Job {
                id: state.allocate_id(),
                session_id,
                step,
                status: JobStatus::Pending,
                logs: initial_log.to_string(),
                events: Vec::new(),
                created_at: now,
                updated_at: now,
            };
            state.jobs.push(job.clone());
            Ok(job)
        })
    }

    pub fn job(&self, id: u64) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.iter().find(|j| j.id == id).cloned())
    }

    pub fn jobs_for_session(&self, session_id: u64) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .lock()?
            .jobs
            .iter()
            .filter(|j| j.session_id == session_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    /// Whether the session already has a job with the given step, in any
    /// status. Used to guard against chaining duplicates on retry.
    pub fn has_job(&self, session_id: u64, step: &JobStep) -> Result<bool> {
        Ok(self
            .lock()?
            .jobs
            .iter()
            .any(|j| j.session_id == session_id && j.step == *step))
    }

    /// The oldest pending job, FIFO by creation time.
    pub fn next_pending_job(&self) -> Result<Option<Job>> {
        let state = self.lock()?;
        let job = state
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| (j.created_at, j.id))
            .cloned();
        Ok(job)
    }

    /// Claim a pending job by flipping it to processing. Returns false if
    /// the job is no longer pending (deleted or already claimed).
    pub fn claim_job(&self, id: u64) -> Result<bool> {
        self.commit(|state| {
            match state.jobs.iter_mut().find(|j| j.id == id) {
                Some(job) if job.status == JobStatus::Pending => {
                    job.status = JobStatus::Processing;
                    job.updated_at = Utc::now();
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    pub fn set_job_status(&self, id: u64, status: JobStatus) -> Result<()> {
        self.commit(|state| {
            let job = find_job(state, id)?;
            job.status = status;
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Append a line (or block) to the job's diagnostic log. The log is
    /// append-only; nothing ever rewrites earlier entries.
    pub fn append_job_log(&self, id: u64, text: &str) -> Result<()> {
        self.commit(|state| {
            let job = find_job(state, id)?;
            job.logs.push('\n');
            job.logs.push_str(text);
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    pub fn push_job_event(&self, id: u64, event: StageEvent) -> Result<()> {
        self.commit(|state| {
            let job = find_job(state, id)?;
            job.events.push(event);
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Startup recovery: any job still marked processing was orphaned by a
    /// crash (only one can ever be genuinely in flight). Reset each to
    /// pending with a log marker. Returns how many were reset.
    pub fn reset_orphaned_jobs(&self) -> Result<usize> {
        let count = self.commit(|state| {
            let mut count = 0;
            for job in state
                .jobs
                .iter_mut()
                .filter(|j| j.status == JobStatus::Processing)
            {
                job.status = JobStatus::Pending;
                job.logs
                    .push_str("\n\n[System Restart] Job was interrupted. Resetting to pending...");
                job.updated_at = Utc::now();
                count += 1;
            }
            Ok(count)
        })?;

        if count > 0 {
            warn!("Found {} stuck jobs. Reset to pending", count);
        }
        Ok(count)
    }

    /// User-initiated retry: back to pending with a marker, and the
    /// session back to Processing. Never triggered automatically.
    pub fn retry_job(&self, id: u64) -> Result<()> {
        self.commit(|state| {
            let session_id = {
                let job = find_job(state, id)?;
                job.status = JobStatus::Pending;
                job.logs.push_str(&format!(
                    "\n\n--- Retry initiated by user at {} ---\n",
                    Utc::now().format("%Y-%m-%d %H:%M:%S")
                ));
                job.updated_at = Utc::now();
                job.session_id
            };
            let session = find_session(state, session_id)?;
            session.status = SessionStatus::Processing;
            Ok(())
        })?;

        info!("Job {} queued for retry", id);
        Ok(())
    }

    // ========================================================================
    // Transcripts
    // ========================================================================

    /// Insert or overwrite the transcript row for (session, speaker).
    pub fn upsert_transcript(
        &self,
        session_id: u64,
        speaker: &str,
        filename: &str,
        content: &str,
    ) -> Result<()> {
        self.commit(|state| {
            if let Some(existing) = state
                .transcripts
                .iter_mut()
                .find(|t| t.session_id == session_id && t.speaker == speaker)
            {
                existing.filename = filename.to_string();
                existing.content = content.to_string();
            } else {
                let row = Transcript {
                    id: state.allocate_id(),
                    session_id,
                    speaker: speaker.to_string(),
                    filename: filename.to_string(),
                    content: content.to_string(),
                    created_at: Utc::now(),
                };
                state.transcripts.push(row);
            }
            Ok(())
        })
    }

    pub fn transcripts_for_session(&self, session_id: u64) -> Result<Vec<Transcript>> {
        let mut rows: Vec<Transcript> = self
            .lock()?
            .transcripts
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.speaker.cmp(&b.speaker));
        Ok(rows)
    }

    // ========================================================================
    // LLM audit trail
    // ========================================================================

    pub fn record_llm_call(&self, call: NewLlmCall) -> Result<LlmCall> {
        self.commit(|state| {
            let row = LlmCall {
                id: state.allocate_id(),
                provider: call.provider,
                model: call.model,
                prompt_tokens: call.prompt_tokens,
                completion_tokens: call.completion_tokens,
                total_tokens: call.total_tokens,
                cost: call.cost,
                duration_secs: call.duration_secs,
                http_status: call.http_status,
                finish_reason: call.finish_reason,
                request_json: call.request_json,
                response_json: call.response_json,
                created_at: Utc::now(),
            };
            state.llm_calls.push(row.clone());
            Ok(row)
        })
    }

    pub fn llm_calls(&self) -> Result<Vec<LlmCall>> {
        Ok(self.lock()?.llm_calls.clone())
    }
}

fn find_session(state: &mut StoreState, id: u64) -> Result<&mut Session> {
    state
        .sessions
        .iter_mut()
        .find(|s| s.id == id)
        .ok_or_else(|| anyhow!("session {} not found", id))
}

fn find_job(state: &mut StoreState, id: u64) -> Result<&mut Job> {
    state
        .jobs
        .iter_mut()
        .find(|j| j.id == id)
        .ok_or_else(|| anyhow!("job {} not found", id))
}
