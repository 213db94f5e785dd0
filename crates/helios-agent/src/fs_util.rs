// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Atomic file replacement.
//!
//! Writers stage content in a temp sibling and rename it over the target, so
//! readers only ever observe a complete file.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;

/// Temp sibling used to stage an atomic replacement of `path`.
pub(crate) fn scratch_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".tmp.{}", Utc::now().timestamp_millis()));
    PathBuf::from(name)
}

/// Write `content` to `path` atomically (temp sibling, then rename).
pub(crate) async fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp = scratch_path(path);
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
