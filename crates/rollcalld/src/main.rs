use anyhow::{Context, Result};
use rollcall_core::{EmbeddingStore, MatchEngine, OnnxExtractor};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load().context("loading configuration")?;
    tracing::info!(
        store = %config.store_path.display(),
        models = %config.model_dir.display(),
        metric = %config.metric,
        threshold = config.threshold,
        "configuration loaded"
    );

    // Fail fast if models are missing, before claiming the bus name.
    let extractor = OnnxExtractor::load(&config.model_dir, config.min_detection_confidence)
        .context("loading face models")?;
    let store = EmbeddingStore::new(&config.store_path);
    let matcher = MatchEngine::new(config.metric, config.threshold);
    let engine = engine::spawn_engine(extractor, store, matcher)?;

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RollcallService::new(engine, config))?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(bus = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
