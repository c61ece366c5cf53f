//! Speech transcription stage.
//!
//! Walks a session's working directory, runs speech-to-text per speaker
//! track, persists per-speaker transcripts to disk and to the store, and
//! merges everything into the chronological master transcript.

pub mod engine;
pub mod merge;

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::archive::{RestoreManager, RestoreOutcome};
use crate::config::AppConfig;
use crate::store::{Job, JobStep, JsonStore, StageEvent};
use merge::{format_line, merge, render, SpeakerSegments};

pub use engine::{EngineError, Segment, SpeechEngine, WhisperEngine};

/// Extract the speaker name from a track filename shaped
/// `<id>-<speakerName>.<ext>`.
pub fn parse_speaker(filename: &str) -> String {
    filename
        .split_once('-')
        .map(|(_, tail)| tail.rsplit_once('.').map_or(tail, |(stem, _)| stem))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// The transcription stage. Fatal only when the speech model fails to
/// load or no audio files exist; individual track failures are logged
/// and skipped.
pub struct TranscriptionStage {
    engine: Arc<dyn SpeechEngine>,
    store: Arc<JsonStore>,
}

impl TranscriptionStage {
    pub fn new(engine: Arc<dyn SpeechEngine>, store: Arc<JsonStore>) -> Self {
        Self { engine, store }
    }

    /// Run transcription for `job`. A targeted job (speaker set on the
    /// step) processes only that speaker's track and leaves the master
    /// transcript untouched.
    pub async fn run(&self, job: &Job, cfg: &AppConfig) -> Result<()> {
        let session = self
            .store
            .session(job.session_id)?
            .context("Session not found")?;

        let target = match &job.step {
            JobStep::Transcribe { speaker } => speaker.as_deref(),
            other => bail!("transcription stage dispatched with step {}", other),
        };

        self.store.append_job_log(
            job.id,
            &format!(
                "Starting transcription for: {}",
                session.original_filename
            ),
        )?;

        // The working directory may have been archived away; restore
        // before assuming anything is on disk.
        let extension = cfg.storage.audio_extension.as_str();
        let restorer = RestoreManager::new(&cfg.paths.archive_dir);
        match restorer.ensure_audio(
            &session.directory_path,
            &session.original_filename,
            extension,
            target,
        ) {
            Ok(RestoreOutcome::AlreadyPresent) => {}
            Ok(RestoreOutcome::Member(member)) => {
                self.store
                    .append_job_log(job.id, &format!("Restored from archive: {}", member))?;
            }
            Ok(RestoreOutcome::Full(count)) => {
                self.store.append_job_log(
                    job.id,
                    &format!("Restored {} files from archive", count),
                )?;
            }
            Err(e) => {
                self.store
                    .append_job_log(job.id, &format!("Restore failed: {}", e))?;
                return Err(e).context("Could not restore audio from archive");
            }
        }

        if let Err(e) = self.engine.prepare().await {
            self.store
                .append_job_log(job.id, &format!("FATAL: Failed to load model. {}", e))?;
            return Err(e).context("Speech model initialization failed");
        }
        info!("Speech engine ready: {}", self.engine.describe());

        let files = audio_files(&session.directory_path, extension)?;
        if files.is_empty() {
            bail!("No .{} files found.", extension);
        }

        self.store
            .append_job_log(job.id, &format!("Found {} files to transcribe.", files.len()))?;

        let mut speakers: Vec<SpeakerSegments> = Vec::new();

        for path in &files {
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let speaker = parse_speaker(&filename);

            if let Some(wanted) = target {
                if speaker != wanted {
                    continue;
                }
            }

            // Start marker: fixed shape, parsed by the reporting layer.
            self.store.append_job_log(
                job.id,
                &format!(
                    "[{}] Transcribing: {} (User: {})",
                    Local::now().format("%H:%M:%S"),
                    filename,
                    speaker
                ),
            )?;

            let started_at = Utc::now();
            let segments = match self.engine.transcribe(path).await {
                Ok(segments) => segments,
                Err(e) => {
                    warn!("Track failed, continuing: {}", e);
                    self.store.append_job_log(
                        job.id,
                        &format!("ERROR processing file {}: {}", filename, e),
                    )?;
                    continue;
                }
            };

            let segments: Vec<Segment> = segments
                .into_iter()
                .filter(|s| !s.text.trim().is_empty())
                .collect();

            let lines: Vec<String> = segments
                .iter()
                .map(|s| format_line(s.start, &speaker, s.text.trim()))
                .collect();
            let content = lines.join("\n");

            write_speaker_transcript(&session.directory_path, &speaker, &content)?;
            self.store
                .upsert_transcript(session.id, &speaker, &filename, &content)?;

            // Completed marker: fixed shape, parsed by the reporting layer.
            self.store.append_job_log(
                job.id,
                &format!(
                    "[{}] - Completed {}: {} lines saved.",
                    Local::now().format("%H:%M:%S"),
                    filename,
                    lines.len()
                ),
            )?;
            self.store.push_job_event(
                job.id,
                StageEvent {
                    speaker: speaker.clone(),
                    started_at,
                    finished_at: Utc::now(),
                    lines: lines.len(),
                },
            )?;

            speakers.push(SpeakerSegments { speaker, segments });
        }

        if target.is_some() {
            // Targeted re-run: the master transcript is rebuilt only by a
            // full transcription pass.
            return Ok(());
        }

        // Per-track failures never fail the stage; the master is rebuilt
        // from whatever tracks succeeded.
        let master = render(&merge(&speakers));
        let master_path = session.directory_path.join("session_transcript.txt");
        fs::write(&master_path, &master)
            .with_context(|| format!("Failed to write {}", master_path.display()))?;
        self.store.set_session_transcript(session.id, &master)?;
        self.store.append_job_log(
            job.id,
            &format!("Master transcript saved to: {}", master_path.display()),
        )?;

        Ok(())
    }
}

/// Per-speaker output file inside the session's working directory.
pub fn speaker_transcript_path(session_dir: &Path, speaker: &str) -> PathBuf {
    session_dir
        .join("transcripts")
        .join(format!("{}_transcript.txt", speaker))
}

fn write_speaker_transcript(session_dir: &Path, speaker: &str, content: &str) -> Result<()> {
    let path = speaker_transcript_path(session_dir, speaker);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Audio tracks in the working directory, sorted by filename so runs are
/// deterministic regardless of directory iteration order.
fn audio_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read working directory {}", dir.display()))?;

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(extension))
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaker_parses_from_track_filename() {
        assert_eq!(parse_speaker("1-alice.flac"), "alice");
        assert_eq!(parse_speaker("02-bob_the_dm.flac"), "bob_the_dm");
        // Only the extension is stripped; inner dots stay.
        assert_eq!(parse_speaker("3-carol.v2.flac"), "carol.v2");
        assert_eq!(parse_speaker("noseparator.flac"), "Unknown");
        assert_eq!(parse_speaker("4-.flac"), "Unknown");
    }

    #[test]
    fn speaker_transcript_path_is_under_transcripts_dir() {
        let path = speaker_transcript_path(Path::new("/work/s1"), "alice");
        assert_eq!(
            path,
            Path::new("/work/s1/transcripts/alice_transcript.txt")
        );
    }
}
