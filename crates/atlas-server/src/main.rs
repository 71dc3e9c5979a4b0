//! atlasd - the context graph server
//!
//! Opens both stores, spawns the four consumers, and serves the HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use atlas_core::config::AtlasConfig;
use atlas_core::consumers::{spawn_consumers, ConsumerContext};
use atlas_core::embeddings::{Embedder, EMBEDDING_DIMENSIONS};
use atlas_core::eventstore::{EventStore, EventStoreOptions};
use atlas_core::extraction::{ExtractionProvider, HttpExtractionProvider, RuleBasedExtractor};
use atlas_core::graph::GraphStore;
use atlas_core::metrics::Metrics;
use atlas_core::payloads::PayloadStore;
use atlas_core::retrieval::RetrievalEngine;

use atlas_server::{build_router, AppState};

#[derive(Debug, Parser)]
#[command(name = "atlasd", version, about = "Provenance-annotated context graph server")]
struct Args {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the port
    #[arg(long)]
    port: Option<u16>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = match &args.config {
        Some(path) => AtlasConfig::load(path).context("loading config")?,
        None => AtlasConfig::default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // Backing stores
    let events = Arc::new(
        EventStore::open(
            config.event_store_path(),
            EventStoreOptions {
                fsync: config.storage.fsync,
                dedup_ttl: std::time::Duration::from_secs(config.storage.dedup_ttl_hours * 3600),
            },
        )
        .context("opening event store")?,
    );
    let graph = Arc::new(GraphStore::open(config.graph_store_path()).context("opening graph store")?);
    let payloads = Arc::new(
        PayloadStore::open(config.payload_store_path(), config.payload_key_dir())
            .context("opening payload store")?,
    );

    let embedder = Arc::new(build_embedder());
    let provider = build_provider(&config);
    let metrics = Arc::new(Metrics::new());
    let config = Arc::new(config);

    let ctx = ConsumerContext {
        events: Arc::clone(&events),
        graph: Arc::clone(&graph),
        payloads: Arc::clone(&payloads),
        embedder: Arc::clone(&embedder),
        provider,
        metrics: Arc::clone(&metrics),
        config: Arc::clone(&config),
    };
    let consumers = spawn_consumers(ctx.clone()).context("spawning consumers")?;

    let engine = Arc::new(RetrievalEngine::new(
        graph,
        events,
        embedder,
        config.retrieval.clone(),
        config.scoring.clone(),
        metrics,
    ));
    let state = AppState::new(&ctx, engine);
    let router = build_router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, version = atlas_core::VERSION, "atlasd listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("serving")?;

    consumers.shutdown();
    for handle in consumers.handles {
        let _ = handle.await;
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(feature = "embeddings")]
fn build_embedder() -> Embedder {
    match Embedder::local() {
        Ok(embedder) => embedder,
        Err(error) => {
            tracing::warn!(%error, "local embedding model unavailable, using hashed embedder");
            Embedder::hashed(EMBEDDING_DIMENSIONS)
        }
    }
}

#[cfg(not(feature = "embeddings"))]
fn build_embedder() -> Embedder {
    Embedder::hashed(EMBEDDING_DIMENSIONS)
}

fn build_provider(config: &AtlasConfig) -> Arc<dyn ExtractionProvider> {
    match (&config.extraction.llm_endpoint, &config.extraction.llm_model) {
        (Some(endpoint), Some(model)) => {
            match std::env::var(&config.extraction.api_key_env) {
                Ok(api_key) if !api_key.is_empty() => {
                    tracing::info!(%endpoint, %model, "using LLM extraction provider");
                    return Arc::new(HttpExtractionProvider::new(endpoint, api_key, model));
                }
                _ => tracing::warn!(
                    env = %config.extraction.api_key_env,
                    "LLM endpoint configured but no API key found, falling back to rules"
                ),
            }
        }
        _ => tracing::info!("no LLM endpoint configured, using rule-based extraction"),
    }
    Arc::new(RuleBasedExtractor)
}
