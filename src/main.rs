use anyhow::Result;
use clap::Parser;
use sessionscribe::llm::LlmClient;
use sessionscribe::{AppConfig, ConfigCache, JsonStore, WhisperEngine, Worker};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "sessionscribe",
    about = "Transcribes and summarizes tabletop gaming sessions",
    version
)]
struct Args {
    /// Configuration file, without extension (TOML/YAML/JSON).
    #[arg(long, default_value = "config/sessionscribe")]
    config: String,

    /// Seconds a cached configuration read stays fresh.
    #[arg(long, default_value_t = 30)]
    config_ttl: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let cfg = AppConfig::load(&args.config)?;

    info!("sessionscribe v{}", env!("CARGO_PKG_VERSION"));
    info!("Input directory: {}", cfg.paths.data_dir.display());
    info!("Archive directory: {}", cfg.paths.archive_dir.display());
    info!("Store file: {}", cfg.paths.store_file.display());
    info!("LLM provider: {} ({})", cfg.llm.provider, cfg.llm.model);

    for dir in [
        &cfg.paths.data_dir,
        &cfg.paths.scripts_dir,
        &cfg.paths.archive_dir,
    ] {
        std::fs::create_dir_all(dir)?;
    }
    if let Some(parent) = cfg.paths.store_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = Arc::new(JsonStore::open(&cfg.paths.store_file)?);
    if store.campaigns()?.is_empty() {
        store.create_campaign("Default Campaign", None, None, Vec::new())?;
        info!("Created default campaign");
    }

    let engine = Arc::new(WhisperEngine::new(cfg.whisper.clone()));
    let summarizer = Arc::new(LlmClient::new(Arc::clone(&store)));
    let config = Arc::new(ConfigCache::new(
        args.config,
        Duration::from_secs(args.config_ttl),
    ));

    Worker::new(store, config, engine, summarizer).run().await
}
