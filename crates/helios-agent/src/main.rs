// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Helios Update Agent binary.
//!
//! Wires the fetcher, installer, supervisor, and scheduler together and runs
//! until a shutdown signal arrives.

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use helios_agent::backoff::BackoffPolicy;
use helios_agent::config::AgentConfig;
use helios_agent::fetcher::UpdateFetcher;
use helios_agent::installer::{InstallerConfig, ScriptInstaller};
use helios_agent::metadata::MetadataStore;
use helios_agent::scheduler::{PollScheduler, SchedulerConfig};
use helios_agent::supervisor::{ScriptSupervisor, SupervisorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "helios_agent=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = AgentConfig::from_env()?;

    info!(
        device_id = %config.device_id,
        origin_url = %config.origin_url,
        script_path = %config.script_path().display(),
        poll_interval_secs = config.poll_interval.as_secs(),
        "Starting Helios update agent"
    );

    fs::create_dir_all(&config.script_dir).await?;
    if let Some(parent) = config.metadata_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let shutdown = CancellationToken::new();
    let backoff = BackoffPolicy::doubling(config.restart_backoff, config.max_restart_backoff);

    let supervisor = ScriptSupervisor::new(
        SupervisorConfig {
            script_path: config.script_path(),
            interpreter: config.interpreter.clone(),
            health_wait: config.health_wait,
            restart_backoff: backoff,
            stop_grace: config.stop_grace,
        },
        shutdown.clone(),
    );
    let store = MetadataStore::new(config.metadata_path.clone());
    let fetcher = UpdateFetcher::new(&config)?;
    let installer = ScriptInstaller::new(
        InstallerConfig {
            script_path: config.script_path(),
            backup_keep: config.backup_keep,
            origin_url: config.origin_url.clone(),
        },
        store.clone(),
        supervisor.clone(),
    );
    let scheduler = PollScheduler::new(
        SchedulerConfig {
            poll_interval: config.poll_interval,
            max_fetch_retries: config.max_fetch_retries,
            retry_backoff: backoff,
        },
        fetcher,
        installer,
        supervisor.clone(),
        store,
        shutdown.clone(),
    );

    let scheduler_task = tokio::spawn(scheduler.run());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown: stop polling first, then retire the worker
    shutdown.cancel();
    let _ = scheduler_task.await;
    supervisor.shutdown_current().await;

    info!("Helios update agent shut down");

    Ok(())
}
