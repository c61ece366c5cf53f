use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// How one campaign script ended. A failure here never aborts the
/// remaining scripts or the enclosing job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStatus {
    Finished,
    Failed { code: Option<i32> },
    TimedOut,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    pub name: String,
    pub status: ScriptStatus,
}

/// Runs operator-supplied post-processing scripts from a fixed directory.
///
/// Scripts are looked up by basename only; anything resembling a path is
/// refused. Each script gets the recap path and transcript path as its
/// two positional arguments and runs under a wall-clock timeout.
pub struct ScriptRunner {
    scripts_dir: PathBuf,
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(scripts_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            timeout,
        }
    }

    /// Execute every configured script in order, appending progress and
    /// captured output through `log`.
    pub async fn run_all(
        &self,
        scripts: &[String],
        recap: &Path,
        transcript: &Path,
        mut log: impl FnMut(&str),
    ) -> Vec<ScriptOutcome> {
        let mut outcomes = Vec::new();

        for raw_name in scripts {
            let name = raw_name.trim();
            if name.is_empty() {
                continue;
            }

            let Some(script_path) = self.resolve(name) else {
                warn!("Refusing script name with path components: {}", name);
                log(&format!("Skipping: {} (invalid name)", name));
                outcomes.push(ScriptOutcome {
                    name: name.to_string(),
                    status: ScriptStatus::Skipped,
                });
                continue;
            };

            if !script_path.is_file() {
                log(&format!("Skipping: {} (File not found)", name));
                outcomes.push(ScriptOutcome {
                    name: name.to_string(),
                    status: ScriptStatus::Skipped,
                });
                continue;
            }

            ensure_executable(&script_path);

            log(&format!("Running: {}", name));
            info!("Running script: {}", script_path.display());

            let status = self.run_one(&script_path, recap, transcript, &mut log).await;
            match &status {
                ScriptStatus::Finished => log(&format!("Finished: {} (Success)", name)),
                ScriptStatus::Failed { code } => log(&format!(
                    "Failed: {} (Exit Code {})",
                    name,
                    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
                )),
                ScriptStatus::TimedOut => log(&format!(
                    "Failed: {} (Timed out after {}s)",
                    name,
                    self.timeout.as_secs()
                )),
                ScriptStatus::Skipped => {}
            }

            outcomes.push(ScriptOutcome {
                name: name.to_string(),
                status,
            });
        }

        outcomes
    }

    /// Resolve a script basename inside the scripts directory. Returns
    /// None for anything that is not a bare filename.
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let is_bare = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n == name);
        if !is_bare || name.starts_with('.') {
            return None;
        }
        Some(self.scripts_dir.join(name))
    }

    async fn run_one(
        &self,
        script: &Path,
        recap: &Path,
        transcript: &Path,
        log: &mut impl FnMut(&str),
    ) -> ScriptStatus {
        let run = Command::new(script)
            .arg(recap)
            .arg(transcript)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if !stdout.trim().is_empty() {
                    log(&format!("[STDOUT]: {}", stdout.trim_end()));
                }
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    log(&format!("[STDERR]: {}", stderr.trim_end()));
                }

                if output.status.success() {
                    ScriptStatus::Finished
                } else {
                    ScriptStatus::Failed {
                        code: output.status.code(),
                    }
                }
            }
            Ok(Err(e)) => {
                log(&format!("Script execution error: {}", e));
                ScriptStatus::Failed { code: None }
            }
            Err(_) => ScriptStatus::TimedOut,
        }
    }
}

#[cfg(unix)]
fn ensure_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        if perms.mode() & 0o111 == 0 {
            perms.set_mode(0o755);
            if let Err(e) = std::fs::set_permissions(path, perms) {
                warn!("Could not mark {} executable: {}", path.display(), e);
            }
        }
    }
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_accepts_bare_names_only() {
        let runner = ScriptRunner::new("/data/scripts", Duration::from_secs(1));
        assert!(runner.resolve("notify.sh").is_some());
        assert!(runner.resolve("../escape.sh").is_none());
        assert!(runner.resolve("/etc/passwd").is_none());
        assert!(runner.resolve("sub/dir.sh").is_none());
        assert!(runner.resolve(".hidden").is_none());
    }
}
