use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use call_analytics_server::config::{
    AppConfig, CliArgs, ENGINE_TIMEOUT_SEC, SCORING_MODEL, SCORING_TIMEOUT_SEC,
};
use call_analytics_server::engines::{
    ChatScorer, FfmpegAudioTool, PyannoteClient, WhisperClient,
};
use call_analytics_server::ingest::{IngestionManager, Validator};
use call_analytics_server::metrics;
use call_analytics_server::pipeline::PipelineEngines;
use call_analytics_server::progress::ProgressBus;
use call_analytics_server::queue::{JobQueue, QueueWorker};
use call_analytics_server::server::{run_server, ServerState};
use call_analytics_server::store::{CallStore, SqliteCallStore};

/// Grace period for the worker to drain its current job on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let config = Arc::new(AppConfig::resolve(&cli_args)?);

    info!("Configuration loaded:");
    info!("  database_path: {:?}", config.database_path);
    info!("  uploads_dir: {:?}", config.uploads_dir);
    info!("  host: {} port: {}", config.host, config.port);
    info!("  scoring.enabled: {}", config.openai_api_key.is_some());
    info!("  separation.enabled: {}", config.hf_token.is_some());

    std::fs::create_dir_all(&config.uploads_dir)?;
    std::fs::create_dir_all(&config.audio_dir)?;
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    if !config.database_path.exists() {
        info!("Creating new call database at {:?}", config.database_path);
    }
    let store: Arc<dyn CallStore> = Arc::new(SqliteCallStore::open(&config.database_path)?);

    info!("Initializing metrics...");
    metrics::init_metrics();

    let engines = PipelineEngines {
        probe: Arc::new(FfmpegAudioTool),
        transcriber: Arc::new(WhisperClient::new(
            config.whisper_url.clone(),
            config.whisper_model.clone(),
            config.whisper_device.clone(),
            config.whisper_language.clone(),
            ENGINE_TIMEOUT_SEC,
        )),
        separator: Arc::new(PyannoteClient::new(
            config.pyannote_url.clone(),
            config.hf_token.clone(),
            ENGINE_TIMEOUT_SEC,
        )),
        scorer: Arc::new(ChatScorer::new(
            config.openai_base_url.clone(),
            SCORING_MODEL,
            config.openai_api_key.clone(),
            SCORING_TIMEOUT_SEC,
        )),
    };

    let bus = Arc::new(ProgressBus::new());
    let (queue, receiver) = JobQueue::new();

    let ingestion = Arc::new(IngestionManager::new(
        store.clone(),
        queue.clone(),
        engines.probe.clone(),
        Validator::new(
            config.max_file_size_mb,
            config.min_duration_sec,
            config.max_duration_sec,
        ),
        config.uploads_dir.clone(),
        config.max_batch_size,
    ));

    let worker = QueueWorker::new(
        queue.clone(),
        receiver,
        store.clone(),
        engines.clone(),
        bus.clone(),
    );

    // Recovery runs before the worker serves: interrupted files are
    // requeued with their stage preserved.
    let recovered = worker.recover_interrupted()?;
    if recovered > 0 {
        info!("Requeued {} interrupted file(s)", recovered);
    }

    let shutdown_token = CancellationToken::new();
    let worker_handle = tokio::spawn(worker.run(shutdown_token.child_token()));

    let state = ServerState {
        config: config.clone(),
        start_time: Instant::now(),
        store,
        ingestion,
        queue,
        bus,
        scorer: engines.scorer.clone(),
        separator: engines.separator.clone(),
    };

    info!("Ready to serve at port {}!", config.port);

    tokio::select! {
        result = run_server(state, shutdown_token.child_token()) => {
            info!("HTTP server stopped: {:?}", result);
            shutdown_token.cancel();
            result
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            shutdown_token.cancel();
            match tokio::time::timeout(SHUTDOWN_GRACE, worker_handle).await {
                Ok(_) => info!("Worker drained"),
                Err(_) => warn!("Worker did not stop within the grace period"),
            }
            Ok(())
        }
    }
}
