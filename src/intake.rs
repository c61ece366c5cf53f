//! Upload intake and operator-initiated session actions.
//!
//! Validates uploaded recording archives before any record exists,
//! unpacks them into a fresh working directory, and enqueues the first
//! transcription job. Also hosts the retry and re-transcription entry
//! points used by the operator surface.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::archive::{RestoreError, RestoreManager};
use crate::config::AppConfig;
use crate::store::{Job, JobStep, JsonStore, Session, SessionStatus};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Uploaded file is not a valid zip archive.")]
    NotAZip,
    #[error("Zip file is corrupted (Error in {0}).")]
    CorruptEntry(String),
    #[error("Zip file is empty.")]
    EmptyZip,
    #[error("Campaign not found.")]
    CampaignMissing,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Store(String),
}

/// What a successful upload produced.
#[derive(Debug)]
pub struct UploadOutcome {
    pub session: Session,
    pub job: Job,
}

/// Validate and ingest an uploaded session archive.
///
/// The zip is copied into a fresh timestamped working directory under
/// the input root, verified member by member, extracted, and stripped of
/// the recorder's `raw.dat` scratch file. The session date comes from
/// the recorder's `info.txt` when present. Nothing is recorded in the
/// store until validation passes; any failure removes the working
/// directory again.
pub fn ingest_upload(
    store: &JsonStore,
    cfg: &AppConfig,
    campaign_id: u64,
    source_zip: &Path,
    original_filename: &str,
) -> Result<UploadOutcome, ValidationError> {
    if store
        .campaign(campaign_id)
        .map_err(|e| ValidationError::Store(e.to_string()))?
        .is_none()
    {
        return Err(ValidationError::CampaignMissing);
    }

    let working_dir = cfg
        .paths
        .data_dir
        .join(Local::now().format("%Y%m%d_%H%M%S%3f").to_string());
    fs::create_dir_all(&working_dir)?;

    match ingest_into(store, campaign_id, source_zip, original_filename, &working_dir) {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            // Leave no half-extracted directory behind.
            if let Err(cleanup) = fs::remove_dir_all(&working_dir) {
                warn!(
                    "Failed to clean up {} after rejected upload: {}",
                    working_dir.display(),
                    cleanup
                );
            }
            Err(e)
        }
    }
}

fn ingest_into(
    store: &JsonStore,
    campaign_id: u64,
    source_zip: &Path,
    original_filename: &str,
    working_dir: &Path,
) -> Result<UploadOutcome, ValidationError> {
    let zip_path = working_dir.join(original_filename);
    fs::copy(source_zip, &zip_path)?;

    validate_zip(&zip_path)?;

    let mut archive = ZipArchive::new(File::open(&zip_path)?).map_err(|_| ValidationError::NotAZip)?;
    archive
        .extract(working_dir)
        .map_err(|e| ValidationError::CorruptEntry(e.to_string()))?;

    // The recorder's scratch buffer has no value past upload.
    let raw = working_dir.join("raw.dat");
    if raw.exists() {
        let _ = fs::remove_file(raw);
    }

    let session_date = parse_session_date(&working_dir.join("info.txt")).unwrap_or_else(Utc::now);

    let session_number = store
        .sessions_for_campaign(campaign_id)
        .map_err(|e| ValidationError::Store(e.to_string()))?
        .len() as u32
        + 1;

    let session = store
        .create_session(
            campaign_id,
            session_number,
            session_date,
            original_filename,
            working_dir,
        )
        .map_err(|e| ValidationError::Store(e.to_string()))?;
    let job = store
        .create_job(session.id, JobStep::full_transcribe(), "Job queued.")
        .map_err(|e| ValidationError::Store(e.to_string()))?;

    info!(
        "Ingested upload {} as Session #{} (Job #{})",
        original_filename, session.id, job.id
    );
    Ok(UploadOutcome { session, job })
}

/// Reject anything that is not a readable, non-empty zip whose every
/// member passes its CRC check.
fn validate_zip(path: &Path) -> Result<(), ValidationError> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(file).map_err(|_| ValidationError::NotAZip)?;

    if archive.len() == 0 {
        return Err(ValidationError::EmptyZip);
    }

    for index in 0..archive.len() {
        let mut member = archive
            .by_index(index)
            .map_err(|e| ValidationError::CorruptEntry(e.to_string()))?;
        let name = member.name().to_string();
        // Reading to the end verifies the stored CRC.
        if io::copy(&mut member, &mut io::sink()).is_err() {
            return Err(ValidationError::CorruptEntry(name));
        }
    }
    Ok(())
}

/// Pull the session start time out of the recorder's `info.txt`. The
/// file carries a `Start time:` line in RFC 3339, possibly with a bare
/// `Z` suffix.
pub fn parse_session_date(info_path: &Path) -> Option<DateTime<Utc>> {
    let raw = fs::read_to_string(info_path).ok()?;
    let value = raw
        .lines()
        .find_map(|line| line.strip_prefix("Start time:"))?
        .trim();
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Re-queue a failed job exactly as it was.
pub fn retry_job(store: &JsonStore, job_id: u64) -> Result<()> {
    store.retry_job(job_id)
}

/// Queue a new transcription pass for an existing session, optionally
/// scoped to a single speaker. Fails up front when neither the working
/// directory nor the archive can supply the audio.
pub fn request_retranscribe(
    store: &JsonStore,
    cfg: &AppConfig,
    session_id: u64,
    speaker: Option<&str>,
) -> Result<Job> {
    let session = store.session(session_id)?.context("Session not found")?;

    let extension = cfg.storage.audio_extension.as_str();
    if !RestoreManager::has_audio(&session.directory_path, extension, speaker) {
        let restorer = RestoreManager::new(&cfg.paths.archive_dir);
        if restorer.find_archive(&session.original_filename).is_none() {
            return Err(RestoreError::ArchiveMissing(session.original_filename.clone()).into());
        }
    }

    let step = match speaker {
        Some(name) => JobStep::targeted_transcribe(name),
        None => JobStep::full_transcribe(),
    };
    store.set_session_status(session_id, SessionStatus::Processing)?;
    let job = store.create_job(session_id, step, "Job queued.")?;
    Ok(job)
}

/// Remove a session's working directory and its records. Archived zips
/// and the LLM audit trail are kept.
pub fn delete_session(store: &JsonStore, session_id: u64) -> Result<()> {
    let session = store.session(session_id)?.context("Session not found")?;
    if session.directory_path.exists() {
        fs::remove_dir_all(&session.directory_path).with_context(|| {
            format!(
                "Failed to remove working directory {}",
                session.directory_path.display()
            )
        })?;
    }
    store.delete_session(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn session_date_parses_z_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let info = dir.path().join("info.txt");
        let mut f = File::create(&info).unwrap();
        writeln!(f, "Recorder: craig").unwrap();
        writeln!(f, "Start time: 2024-03-09T19:30:00Z").unwrap();

        let parsed = parse_session_date(&info).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-03-09T19:30:00+00:00");
    }

    #[test]
    fn session_date_parses_offset() {
        let dir = tempfile::tempdir().unwrap();
        let info = dir.path().join("info.txt");
        fs::write(&info, "Start time: 2024-03-09T19:30:00-05:00\n").unwrap();

        let parsed = parse_session_date(&info).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-03-10T00:30:00+00:00");
    }

    #[test]
    fn session_date_missing_line_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let info = dir.path().join("info.txt");
        fs::write(&info, "Recorder: craig\n").unwrap();
        assert!(parse_session_date(&info).is_none());
    }

    #[test]
    fn validate_rejects_non_zip_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.zip");
        fs::write(&path, b"definitely not a zip").unwrap();
        assert!(matches!(validate_zip(&path), Err(ValidationError::NotAZip)));
    }

    #[test]
    fn validate_rejects_empty_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.zip");
        let file = File::create(&path).unwrap();
        zip::ZipWriter::new(file).finish().unwrap();
        assert!(matches!(validate_zip(&path), Err(ValidationError::EmptyZip)));
    }

    #[test]
    fn validate_accepts_well_formed_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.zip");
        let file = File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("1-alice.flac", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"fake audio bytes").unwrap();
        writer.finish().unwrap();
        assert!(validate_zip(&path).is_ok());
    }
}
