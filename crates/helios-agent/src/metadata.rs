// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted install metadata.
//!
//! A small JSON record tracking what is currently installed. `content_hash`
//! is the single source of truth for "is an update needed": it always
//! reflects the script on disk after a successful install. The record is
//! rewritten atomically so a crash mid-write never corrupts it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::error::Result;
use crate::fs_util;

/// Record of the most recent successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptMetadata {
    /// Hex SHA-256 of the script currently on disk.
    pub content_hash: String,
    /// Entity tag the origin returned for this version, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Last-Modified value the origin returned for this version, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// When this version was installed.
    pub updated_at: DateTime<Utc>,
    /// Origin URL the version was fetched from.
    pub source: String,
}

/// Durable store for [`ScriptMetadata`].
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    /// Create a store persisting to `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the current record.
    ///
    /// A missing file yields `None`. An unreadable or corrupt record is
    /// logged and also treated as absent, so a damaged file never wedges the
    /// agent; the next install rewrites it.
    pub async fn load(&self) -> Option<ScriptMetadata> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read metadata file");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Discarding corrupt metadata file");
                None
            }
        }
    }

    /// Persist `meta` via write-temp-then-rename.
    pub async fn save(&self, meta: &ScriptMetadata) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(meta)?;
        fs_util::atomic_write(&self.path, &json).await?;
        Ok(())
    }
}
