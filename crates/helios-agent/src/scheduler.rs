// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic update polling.
//!
//! A single cooperative loop drives fetch+install cycles, so at most one
//! install is ever in flight. Cycle failures are logged and deferred to the
//! next poll; only a shutdown request stops the loop.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::{AgentError, Result};
use crate::fetcher::{FetchOutcome, UpdateFetcher};
use crate::installer::{CacheValidators, InstallOutcome, ScriptInstaller};
use crate::metadata::MetadataStore;
use crate::supervisor::ScriptSupervisor;

/// Scheduler parameters, split out of [`crate::AgentConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between update polls.
    pub poll_interval: Duration,
    /// Fetch attempts per cycle before deferring to the next poll.
    pub max_fetch_retries: u32,
    /// Backoff between fetch attempts within a cycle.
    pub retry_backoff: BackoffPolicy,
}

/// Drives periodic fetch+install cycles over the assembled components.
pub struct PollScheduler {
    config: SchedulerConfig,
    fetcher: UpdateFetcher,
    installer: ScriptInstaller,
    supervisor: ScriptSupervisor,
    store: MetadataStore,
    shutdown: CancellationToken,
}

impl PollScheduler {
    /// Create a scheduler.
    pub fn new(
        config: SchedulerConfig,
        fetcher: UpdateFetcher,
        installer: ScriptInstaller,
        supervisor: ScriptSupervisor,
        store: MetadataStore,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            fetcher,
            installer,
            supervisor,
            store,
            shutdown,
        }
    }

    /// Run until shutdown.
    ///
    /// A failed bootstrap cycle is logged, never fatal, and an
    /// already-installed script resumes even when the bootstrap found no
    /// change.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Update scheduler started"
        );

        if let Err(e) = self.run_once().await {
            warn!(error = %e, "Startup update cycle failed");
        }
        if let Err(e) = self.supervisor.ensure_running().await {
            warn!(error = %e, "Failed to resume installed script");
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Update scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Update cycle failed");
                    }
                }
            }
        }

        info!("Update scheduler stopped");
    }

    /// Run one fetch+install cycle.
    ///
    /// Transient fetch errors are retried with backoff up to the configured
    /// attempt limit; exhaustion is reported to the caller, which defers to
    /// the next poll. A signature failure aborts the cycle immediately: the
    /// content is discarded and the previous script keeps running.
    pub async fn run_once(&self) -> Result<()> {
        let meta = self.store.load().await;
        let etag = meta.as_ref().and_then(|m| m.etag.clone());
        let last_modified = meta.as_ref().and_then(|m| m.last_modified.clone());

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .fetcher
                .fetch(etag.as_deref(), last_modified.as_deref())
                .await
            {
                Ok(FetchOutcome::NotModified) => {
                    debug!("Origin reports script unchanged");
                    self.supervisor.ensure_running().await?;
                    return Ok(());
                }
                Ok(FetchOutcome::Updated {
                    content,
                    etag,
                    last_modified,
                }) => {
                    let outcome = self
                        .installer
                        .install(
                            &content,
                            CacheValidators {
                                etag,
                                last_modified,
                            },
                        )
                        .await?;
                    match outcome {
                        InstallOutcome::Installed => {}
                        InstallOutcome::NoChange => self.supervisor.ensure_running().await?,
                        InstallOutcome::Failed { reason } => {
                            warn!(reason = %reason, "Install rejected");
                        }
                    }
                    return Ok(());
                }
                Err(e @ AgentError::Signature(_)) => return Err(e),
                Err(e) if attempt >= self.config.max_fetch_retries => {
                    warn!(error = %e, attempts = attempt, "Fetch failed after retries");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.config.retry_backoff.next(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
