mod handlers;
mod metrics;
mod routes;

use anyhow::{Context, Result};
use arbiter_common::config::{PipelineConfig, StoreBackend};
use arbiter_pipeline::language::LanguageRegistry;
use arbiter_pipeline::memory::{MemoryCatalog, MemoryEventSink, MemoryStore, QuestionsFile};
use arbiter_pipeline::sandbox::DockerSandbox;
use arbiter_pipeline::store::RedisBackend;
use arbiter_pipeline::{Backends, EvaluationService};
use metrics::Metrics;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EvaluationService>,
    pub metrics: Arc<Metrics>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_backends(config: &PipelineConfig) -> Result<Backends> {
    match config.store_backend {
        StoreBackend::Redis => {
            let redis = Arc::new(
                RedisBackend::connect(&config.redis_url)
                    .await
                    .context("Failed to connect to Redis")?,
            );
            info!("Connected to Redis: {}", config.redis_url);
            Ok(Backends {
                store: redis.clone(),
                catalog: redis.clone(),
                events: redis,
            })
        }
        StoreBackend::Memory => {
            let questions = QuestionsFile::read(Path::new(&config.questions_path))?.questions;
            warn!(
                questions = questions.len(),
                "Using in-memory store; submissions are lost on restart"
            );
            Ok(Backends {
                store: Arc::new(MemoryStore::new()),
                catalog: Arc::new(MemoryCatalog::from_questions(questions)),
                events: Arc::new(MemoryEventSink::new()),
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Arbiter API booting...");

    let config = PipelineConfig::from_env();
    let languages = Arc::new(LanguageRegistry::load(Path::new(&config.languages_path))?);
    info!(languages = ?languages.list_languages(), "Language registry loaded");

    let sandbox = Arc::new(DockerSandbox::connect(Arc::clone(&languages))?);
    let backends = build_backends(&config).await?;
    let service = EvaluationService::new(&config, languages, sandbox, backends);

    let state = AppState {
        service: Arc::new(service),
        metrics: Arc::new(Metrics::new().context("Failed to register metrics")?),
    };
    let app = routes::router(state);

    let listener = TcpListener::bind(&config.api_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api_addr))?;
    info!(
        pool_size = config.worker_pool_size,
        case_timeout_ms = config.case_timeout_ms,
        "HTTP server listening on {}",
        config.api_addr
    );

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
