// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Atomic installation of fetched script versions.
//!
//! The installer is the sole mutation path for the live script, its backups,
//! and the metadata record. A new version is backed up over, written via
//! temp-file-then-rename, health-checked, and either adopted or rolled back;
//! a partially written script is never visible under the live name.

use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::fs_util;
use crate::metadata::{MetadataStore, ScriptMetadata};
use crate::supervisor::ScriptSupervisor;

/// Cache validators accompanying a fetched script version.
#[derive(Debug, Default, Clone)]
pub struct CacheValidators {
    /// Entity tag of the fetched version.
    pub etag: Option<String>,
    /// Last-Modified of the fetched version.
    pub last_modified: Option<String>,
}

/// Result of an install attempt.
#[derive(Debug)]
pub enum InstallOutcome {
    /// The new version is on disk and its process has been adopted.
    Installed,
    /// Content hash matches the installed version; nothing to do.
    NoChange,
    /// The install was rejected and rolled back.
    Failed {
        /// Why the install was rejected.
        reason: String,
    },
}

/// Installer parameters, split out of [`crate::AgentConfig`].
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Path of the live worker script.
    pub script_path: PathBuf,
    /// Number of rotated backups to retain.
    pub backup_keep: usize,
    /// Recorded as the `source` of installed versions.
    pub origin_url: String,
}

/// Installs verified script content with backup, health check, and rollback.
#[derive(Clone)]
pub struct ScriptInstaller {
    config: InstallerConfig,
    store: MetadataStore,
    supervisor: ScriptSupervisor,
}

impl ScriptInstaller {
    /// Create an installer over the metadata store and supervisor.
    pub fn new(config: InstallerConfig, store: MetadataStore, supervisor: ScriptSupervisor) -> Self {
        Self {
            config,
            store,
            supervisor,
        }
    }

    /// Install `content` if it differs from the current version.
    ///
    /// Idempotent on content: an identical hash is a no-op, so repeated
    /// fetches of an unchanged script are safe and cheap. The caller
    /// serializes installs; at most one is in flight at a time.
    pub async fn install(
        &self,
        content: &[u8],
        validators: CacheValidators,
    ) -> Result<InstallOutcome> {
        let content_hash = hex::encode(Sha256::digest(content));
        let current = self.store.load().await;
        if current.as_ref().map(|m| m.content_hash.as_str()) == Some(content_hash.as_str()) {
            debug!(hash = %content_hash, "Content hash unchanged, skipping install");
            return Ok(InstallOutcome::NoChange);
        }

        let backup = self.back_up_current().await;

        fs_util::atomic_write(&self.config.script_path, content).await?;

        let mut child = match self.supervisor.start_candidate() {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "New worker failed to start, rolling back");
                self.roll_back(backup.as_deref()).await;
                return Ok(InstallOutcome::Failed {
                    reason: format!("failed to start worker: {e}"),
                });
            }
        };
        if !self.supervisor.await_health(&mut child).await? {
            self.roll_back(backup.as_deref()).await;
            return Ok(InstallOutcome::Failed {
                reason: "worker exited during health window".to_string(),
            });
        }

        self.supervisor.adopt(child);

        let meta = ScriptMetadata {
            content_hash: content_hash.clone(),
            etag: validators.etag,
            last_modified: validators.last_modified,
            updated_at: Utc::now(),
            source: self.config.origin_url.clone(),
        };
        if let Err(e) = self.store.save(&meta).await {
            // Best effort: the worker already runs the new version; the next
            // cycle re-fetches and reinstalls the same content.
            error!(error = %e, "Failed to persist install metadata");
        }
        info!(hash = %content_hash, etag = ?meta.etag, "Update applied");
        Ok(InstallOutcome::Installed)
    }

    /// Copy the live script aside before replacement.
    ///
    /// A failed copy is logged and the install proceeds without a rollback
    /// net. Rotation runs after each successful copy; prune failures are
    /// non-fatal.
    async fn back_up_current(&self) -> Option<PathBuf> {
        let script_path = &self.config.script_path;
        match fs::try_exists(script_path).await {
            Ok(true) => {}
            _ => return None,
        }
        let backup_path = backup_path_for(script_path);
        if let Err(e) = fs::copy(script_path, &backup_path).await {
            warn!(
                path = %backup_path.display(),
                error = %e,
                "Backup copy failed, continuing without rollback"
            );
            return None;
        }
        debug!(path = %backup_path.display(), "Backed up current script");
        if let Err(e) = rotate_backups(script_path, self.config.backup_keep).await {
            warn!(error = %e, "Backup rotation failed");
        }
        Some(backup_path)
    }

    /// Undo a failed install.
    ///
    /// Restores the backup taken at the start of this install, or deletes the
    /// broken script when none exists so the agent does not keep booting a
    /// known-bad file.
    async fn roll_back(&self, backup: Option<&Path>) {
        match backup {
            Some(backup) => {
                warn!(path = %backup.display(), "Restoring previous script from backup");
                match fs::read(backup).await {
                    Ok(content) => {
                        if let Err(e) =
                            fs_util::atomic_write(&self.config.script_path, &content).await
                        {
                            error!(error = %e, "Restore failed");
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to read backup for restore"),
                }
            }
            None => {
                warn!("No backup available, removing broken script");
                if let Err(e) = fs::remove_file(&self.config.script_path).await {
                    warn!(error = %e, "Failed to remove broken script");
                }
            }
        }
    }
}

/// Backup name for the live script, tagged with the current time.
fn backup_path_for(script_path: &Path) -> PathBuf {
    let mut name = script_path.as_os_str().to_os_string();
    name.push(format!(".bak.{}", Utc::now().timestamp_millis()));
    PathBuf::from(name)
}

/// Delete the oldest backups of `script_path` beyond `keep`.
pub(crate) async fn rotate_backups(script_path: &Path, keep: usize) -> std::io::Result<()> {
    let Some(dir) = script_path.parent() else {
        return Ok(());
    };
    let Some(base) = script_path.file_name().and_then(|n| n.to_str()) else {
        return Ok(());
    };
    let prefix = format!("{base}.bak.");

    let mut backups = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&prefix) {
            backups.push(entry.path());
        }
    }
    // Millisecond suffixes sort lexically in creation order.
    backups.sort();
    while backups.len() > keep {
        let oldest = backups.remove(0);
        match fs::remove_file(&oldest).await {
            Ok(()) => debug!(path = %oldest.display(), "Pruned old backup"),
            Err(e) => warn!(path = %oldest.display(), error = %e, "Failed to prune old backup"),
        }
    }
    Ok(())
}
