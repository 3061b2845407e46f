//! MaroonedPods Controller
//!
//! Gives every pod labelled `maroonedpods.io/maroon` a KubeVirt VM of its own
//! that joins the cluster as a dedicated node:
//! - Gated pods get a dedicated VMI sized from their requests, or claim a
//!   pre-booted one from the warm pool
//! - The pod's scheduling gate is lifted once the node has registered
//! - Deleted pods release their VMI (deleted, or returned to the pool)

mod backoff;
mod cluster;
mod config;
mod controller;
mod engine;
mod error;
mod events;
mod http;
mod metrics;
mod patches;
mod queue;
mod reconciler;
mod sizing;
mod store;
mod vmi_builder;
mod warm_pool;
mod watcher;

#[cfg(test)]
mod test_utils;

use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::ControllerConfig;
use crate::error::ControllerError;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // Another component may have installed a provider already.
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting MaroonedPods controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Workers: {}", config.worker_threads);
    info!("  Pool namespace: {}", config.pool_namespace);
    info!("  Pool interval: {}s", config.pool_reconcile_interval.as_secs());
    info!("  Metrics address: {}", config.metrics_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
