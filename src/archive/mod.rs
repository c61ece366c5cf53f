//! Cold-storage archive handling.
//!
//! Uploads can be moved out of the working filesystem once a session
//! completes; this module is what makes that reversible. Before any stage
//! reads raw audio it goes through [`RestoreManager::ensure_audio`], which
//! re-extracts from the archived zip when the working directory has been
//! reclaimed.

use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("no archive found for {0}")]
    ArchiveMissing(String),

    #[error("archive {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What a restore actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Required files were already on disk; nothing extracted.
    AlreadyPresent,
    /// Smart extract pulled a single matching member.
    Member(String),
    /// Whole archive extracted (no target, or no member matched).
    Full(usize),
}

pub struct RestoreManager {
    archive_dir: PathBuf,
}

impl RestoreManager {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
        }
    }

    /// Locate the archived zip for a session's original upload filename.
    /// Accepts an exact name match or a suffix match, tolerating the date
    /// prefix applied at archival time.
    pub fn find_archive(&self, original_filename: &str) -> Option<PathBuf> {
        let exact = self.archive_dir.join(original_filename);
        if exact.is_file() {
            return Some(exact);
        }

        let entries = fs::read_dir(&self.archive_dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.ends_with(original_filename) {
                    return Some(path);
                }
            }
        }
        None
    }

    /// Whether the working directory already holds the audio a stage
    /// needs: any track for a full run, or one whose name contains the
    /// target speaker for a targeted run.
    pub fn has_audio(dir: &Path, extension: &str, target: Option<&str>) -> bool {
        let Ok(entries) = fs::read_dir(dir) else {
            return false;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let has_ext = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(extension));
            if !has_ext {
                continue;
            }
            match target {
                None => return true,
                Some(speaker) => {
                    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    if name.contains(speaker) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Make sure the required audio is present, restoring from the
    /// archive if it is not.
    pub fn ensure_audio(
        &self,
        working_dir: &Path,
        original_filename: &str,
        extension: &str,
        target: Option<&str>,
    ) -> Result<RestoreOutcome, RestoreError> {
        if Self::has_audio(working_dir, extension, target) {
            return Ok(RestoreOutcome::AlreadyPresent);
        }
        self.restore(working_dir, original_filename, extension, target)
    }

    /// Extract from the archived zip into the working directory.
    ///
    /// With a target speaker, scans the member list for a name that both
    /// contains the speaker and carries the expected audio extension, and
    /// extracts only that member. Falls back to extracting everything if
    /// no member matches, so a full extraction can still satisfy the
    /// request.
    pub fn restore(
        &self,
        working_dir: &Path,
        original_filename: &str,
        extension: &str,
        target: Option<&str>,
    ) -> Result<RestoreOutcome, RestoreError> {
        let archive_path = self
            .find_archive(original_filename)
            .ok_or_else(|| RestoreError::ArchiveMissing(original_filename.to_string()))?;

        info!(
            "Restoring {} from archive {}",
            original_filename,
            archive_path.display()
        );

        let corrupt = |message: String| RestoreError::Corrupt {
            path: archive_path.display().to_string(),
            message,
        };

        let file = File::open(&archive_path)?;
        let mut archive = ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;

        fs::create_dir_all(working_dir)?;

        if let Some(speaker) = target {
            let suffix = format!(".{}", extension);
            let wanted = archive
                .file_names()
                .find(|name| name.contains(speaker) && name.ends_with(&suffix))
                .map(|name| name.to_string());

            if let Some(member) = wanted {
                let mut entry = archive
                    .by_name(&member)
                    .map_err(|e| corrupt(e.to_string()))?;
                let out_name = entry
                    .enclosed_name()
                    .and_then(|p| p.file_name().map(|n| n.to_os_string()))
                    .ok_or_else(|| corrupt(format!("unsafe member name: {}", member)))?;
                let out_path = working_dir.join(out_name);
                let mut out = File::create(&out_path)?;
                io::copy(&mut entry, &mut out)?;

                info!("Smart extract: {} -> {}", member, out_path.display());
                return Ok(RestoreOutcome::Member(member));
            }

            warn!(
                "No member matching speaker '{}' in {}; extracting whole archive",
                speaker,
                archive_path.display()
            );
        }

        let count = archive.len();
        archive
            .extract(working_dir)
            .map_err(|e| corrupt(e.to_string()))?;

        info!(
            "Extracted {} members into {}",
            count,
            working_dir.display()
        );
        Ok(RestoreOutcome::Full(count))
    }

    /// Move the original upload zip from the working directory into cold
    /// storage under a `YYYY-MM-DD_` prefix. Returns the destination, or
    /// None if the zip is no longer in the working directory.
    pub fn archive_upload(
        &self,
        working_dir: &Path,
        original_filename: &str,
        session_date: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, RestoreError> {
        let zip_path = working_dir.join(original_filename);
        if !zip_path.is_file() {
            return Ok(None);
        }

        fs::create_dir_all(&self.archive_dir)?;
        let archived_name = format!(
            "{}{}",
            session_date.format("%Y-%m-%d_"),
            original_filename
        );
        let dest = self.archive_dir.join(archived_name);

        // Rename first; fall back to copy+remove across filesystems.
        if fs::rename(&zip_path, &dest).is_err() {
            fs::copy(&zip_path, &dest)?;
            fs::remove_file(&zip_path)?;
        }

        info!("Archived zip to: {}", dest.display());
        Ok(Some(dest))
    }

    /// Delete raw audio tracks from the working directory to reclaim
    /// space. Refuses unless a matching archive actually exists, so the
    /// deletion stays reversible through `restore`.
    pub fn reclaim_audio(
        &self,
        working_dir: &Path,
        original_filename: &str,
        extension: &str,
    ) -> Result<usize, RestoreError> {
        if self.find_archive(original_filename).is_none() {
            return Err(RestoreError::ArchiveMissing(original_filename.to_string()));
        }

        let mut removed = 0;
        for entry in fs::read_dir(working_dir)?.flatten() {
            let path = entry.path();
            let is_track = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(extension));
            if is_track {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }

        info!(
            "Reclaimed {} audio files from {}",
            removed,
            working_dir.display()
        );
        Ok(removed)
    }
}
