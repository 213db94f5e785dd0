// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conditional fetch and signature verification of the worker script.
//!
//! The fetcher is the trust boundary of the agent: it has no side effects,
//! and unverified bytes never leave it. Retry policy belongs to the caller.

use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use reqwest::header;
use sha2::Sha256;
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};

/// Signature headers the origin sends, in preference order.
const SIGNATURE_HEADERS: [&str; 2] = ["x-signature", "x-signature-256"];

/// Result of a conditional fetch against the origin.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The origin reports the script is unchanged.
    NotModified,
    /// A new, signature-verified script version.
    Updated {
        /// Raw script bytes.
        content: Vec<u8>,
        /// Entity tag of this version, if the origin sent one.
        etag: Option<String>,
        /// Last-Modified of this version, if the origin sent one.
        last_modified: Option<String>,
    },
}

/// Fetches the worker script from the origin and verifies its signature.
#[derive(Debug, Clone)]
pub struct UpdateFetcher {
    client: reqwest::Client,
    origin_url: String,
    shared_secret: String,
}

impl UpdateFetcher {
    /// Build a fetcher from the agent configuration.
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()?;
        Ok(Self {
            client,
            origin_url: config.origin_url.clone(),
            shared_secret: config.shared_secret.clone(),
        })
    }

    /// Perform one conditional fetch.
    ///
    /// Prior validators are sent as `If-None-Match` / `If-Modified-Since`.
    /// A 304 maps to [`FetchOutcome::NotModified`]; any other non-success
    /// status is an error. Full bodies are verified against the origin's
    /// signature header before they are returned.
    pub async fn fetch(
        &self,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchOutcome> {
        let mut request = self.client.get(&self.origin_url);
        if let Some(etag) = etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = last_modified {
            request = request.header(header::IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !response.status().is_success() {
            return Err(AgentError::Origin(response.status()));
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let signature = SIGNATURE_HEADERS.iter().find_map(|name| {
            response
                .headers()
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        });

        let content = response.bytes().await?.to_vec();
        verify_signature(&self.shared_secret, &content, signature.as_deref())?;

        debug!(bytes = content.len(), etag = ?etag, "Fetched new script version");
        Ok(FetchOutcome::Updated {
            content,
            etag,
            last_modified,
        })
    }
}

/// Check the origin's HMAC-SHA256 signature over the raw body.
///
/// The comparison is constant-time (`Mac::verify_slice`). A missing header,
/// undecodable hex, or a mismatch all fail closed.
fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> Result<()> {
    let Some(signature) = signature else {
        return Err(AgentError::Signature("missing signature header"));
    };
    let raw = hex::decode(signature.trim())
        .map_err(|_| AgentError::Signature("signature header is not valid hex"))?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| AgentError::Signature("unusable shared secret"))?;
    mac.update(body);
    mac.verify_slice(&raw)
        .map_err(|_| AgentError::Signature("signature mismatch"))
}
