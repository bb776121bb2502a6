use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use veriface_core::BackendSet;
use veriface_store::FsDescriptorStore;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{VerifierService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("verifaced starting");

    let config = config::Config::from_env()?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        store_dir = %config.store_dir.display(),
        timeout_secs = config.verify_timeout_secs,
        system_bus = config.system_bus,
        "configuration loaded"
    );

    let store = Arc::new(FsDescriptorStore::open(&config.store_dir)?);
    let backends = BackendSet::from_model_dir(&config.model_dir);
    let engine = engine::spawn_engine(
        backends,
        store.clone(),
        config.engine.clone(),
        config.verify_timeout(),
    )?;

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, VerifierService::new(engine, store))?
        .build()
        .await?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "verifaced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("verifaced shutting down");

    Ok(())
}
