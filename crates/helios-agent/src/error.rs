// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the update agent.

use thiserror::Error;

/// Agent errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Request to the script origin failed.
    #[error("Origin request error: {0}")]
    Http(#[from] reqwest::Error),

    /// The origin answered with a status the agent does not accept.
    #[error("Origin returned unexpected status: {0}")]
    Origin(reqwest::StatusCode),

    /// Script signature was missing or did not verify.
    #[error("invalid signature: {0}")]
    Signature(&'static str),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type using [`AgentError`].
pub type Result<T> = std::result::Result<T, AgentError>;
