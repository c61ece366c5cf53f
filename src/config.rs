use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Top-level application configuration. Every section has defaults, so a
/// missing config file yields a runnable (local-only) setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub worker: WorkerConfig,
    pub whisper: WhisperConfig,
    pub llm: LlmConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for per-session working directories.
    pub data_dir: PathBuf,

    /// Flat directory of operator-supplied post-processing scripts,
    /// looked up by basename only.
    pub scripts_dir: PathBuf,

    /// Cold-storage directory of archived upload zips.
    pub archive_dir: PathBuf,

    /// Record store file.
    pub store_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep between polls when no pending job exists.
    pub poll_interval_secs: u64,

    /// Wall-clock limit per campaign script.
    pub script_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    /// Path to a ggml model file.
    pub model_path: PathBuf,
    pub language: String,
    pub threads: Option<u16>,

    /// Beam search width; greedy sampling when unset.
    pub beam_size: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// One of: Google, Anthropic, OpenAI, Ollama.
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub ollama_url: String,
    pub max_tokens: u32,

    /// Dollar cost per million prompt tokens. Kept as a string because it
    /// is operator-edited; malformed values count as zero.
    pub input_cost: String,

    /// Dollar cost per million completion tokens, same rules.
    pub output_cost: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Move the original upload zip to the archive directory when a
    /// session completes.
    pub archive_zip: bool,

    /// Reclaim space: strip inline LLM payloads from audit rows, and
    /// delete raw audio from the working directory once an archive is
    /// confirmed to exist.
    pub space_saver: bool,

    /// Extension of the per-speaker audio tracks inside uploads.
    pub audio_extension: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            worker: WorkerConfig::default(),
            whisper: WhisperConfig::default(),
            llm: LlmConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data/input"),
            scripts_dir: PathBuf::from("/data/scripts"),
            archive_dir: PathBuf::from("/data/archive"),
            store_file: PathBuf::from("/data/store.json"),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            script_timeout_secs: 300,
        }
    }
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("/data/models/ggml-small.bin"),
            language: "en".to_string(),
            threads: None,
            beam_size: None,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "Google".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key: String::new(),
            ollama_url: "http://ollama:11434".to_string(),
            max_tokens: 4096,
            input_cost: "0".to_string(),
            output_cost: "0".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            archive_zip: false,
            space_saver: true,
            audio_extension: "flac".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path` (any format the config crate
    /// understands), layered over the defaults. A missing file is fine.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

/// Cached view of the on-disk configuration with an explicit expiry
/// contract: `get` returns the cached copy until `ttl` has elapsed, then
/// reloads from disk. Operators edit settings through the web layer, so
/// the worker picks changes up within one TTL without a restart.
pub struct ConfigCache {
    path: String,
    ttl: Duration,
    cached: Mutex<Option<(Instant, AppConfig)>>,
}

impl ConfigCache {
    pub fn new(path: impl Into<String>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Result<AppConfig> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| anyhow::anyhow!("config cache mutex poisoned"))?;

        if let Some((loaded_at, config)) = cached.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return Ok(config.clone());
            }
        }

        let fresh = AppConfig::load(&self.path)?;
        *cached = Some((Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    /// Drop the cached copy so the next `get` reloads immediately.
    pub fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.worker.poll_interval_secs, 2);
        assert_eq!(cfg.storage.audio_extension, "flac");
        assert_eq!(cfg.llm.provider, "Google");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = AppConfig::load("/nonexistent/sessionscribe-config").unwrap();
        assert_eq!(cfg.worker.script_timeout_secs, 300);
    }

    #[test]
    fn cache_serves_cached_copy_within_ttl() {
        let cache = ConfigCache::new(
            "/nonexistent/sessionscribe-config",
            Duration::from_secs(60),
        );
        let first = cache.get().unwrap();
        let second = cache.get().unwrap();
        assert_eq!(first.llm.model, second.llm.model);
    }
}
