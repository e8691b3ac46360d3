//! The `agentflow-runner` binary: wires [`RunnerConfig`], a `PgPool`-backed
//! `PostgresStore`, and a [`RunnerService`] together, then runs until
//! interrupted (§4.5, §6.1).
//!
//! This binary ships with no facet handlers registered — it claims nothing
//! on its own. An embedding agent process links this crate, registers its
//! own handlers for the facet names it implements, and calls `start`; this
//! binary is the reference wiring for that, runnable as-is against a flow
//! with no event facets, or as a template for a purpose-built agent binary.

use agentflow_runner::{RunnerConfig, RunnerService};
use agentflow_store::PostgresStore;
use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Local-dev convenience: load a plain `.env` if present. Separate from
    // `RunnerConfig::from_env`'s own well-known `agentflow.env` lookup.
    dotenvy::dotenv().ok();

    let config = RunnerConfig::from_env().context("resolving runner configuration")?;

    tracing::info!(runner_id = %config.runner_id, "connecting to store");
    let store = PostgresStore::connect(&config.database_url)
        .await
        .context("connecting to agentflow store")?;

    let service = RunnerService::new(std::sync::Arc::new(store), config);
    service.start().await.context("starting runner service")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received, draining");

    service.shutdown().await.context("shutting down runner service")?;
    Ok(())
}
