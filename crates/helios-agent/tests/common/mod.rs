// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for helios-agent integration tests.
//!
//! Provides an in-process stand-in for the server-side script endpoint and a
//! fully wired agent over a temp directory, driven manually by the tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use helios_agent::backoff::BackoffPolicy;
use helios_agent::config::AgentConfig;
use helios_agent::fetcher::UpdateFetcher;
use helios_agent::installer::{InstallerConfig, ScriptInstaller};
use helios_agent::metadata::MetadataStore;
use helios_agent::scheduler::{PollScheduler, SchedulerConfig};
use helios_agent::supervisor::{ScriptSupervisor, SupervisorConfig};

/// Shared secret used by the stub origin and the agent under test.
pub const TEST_SECRET: &str = "helios-test-secret";

/// Current script version served by the stub origin.
#[derive(Debug, Clone)]
pub struct OriginVersion {
    pub body: Vec<u8>,
    pub etag: String,
    pub last_modified: String,
    pub signature: String,
}

/// Request counters of the stub origin.
#[derive(Debug, Default, Clone)]
pub struct OriginStats {
    pub requests: u32,
    pub full_responses: u32,
    pub not_modified: u32,
}

struct OriginState {
    version: OriginVersion,
    stats: OriginStats,
}

/// Minimal in-process stand-in for the server-side script endpoint.
///
/// Speaks just enough HTTP/1.1 for the agent: conditional GET with
/// `If-None-Match`, and `ETag` / `Last-Modified` / `X-Signature` response
/// headers shaped like the real endpoint's.
pub struct ScriptOrigin {
    pub addr: SocketAddr,
    state: Arc<Mutex<OriginState>>,
}

impl ScriptOrigin {
    /// Start the origin serving `body` as the current version.
    pub async fn start(body: &[u8]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(OriginState {
            version: version_for(body, TEST_SECRET),
            stats: OriginStats::default(),
        }));
        let serve_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(socket, serve_state.clone()));
            }
        });
        Self { addr, state }
    }

    /// Script endpoint URL of this origin.
    pub fn url(&self) -> String {
        format!("http://{}/remote/1/script", self.addr)
    }

    /// Publish a new signed version.
    pub fn publish(&self, body: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.version = version_for(body, TEST_SECRET);
    }

    /// Publish a version whose signature will not verify.
    pub fn publish_with_signature(&self, body: &[u8], signature: &str) {
        let mut state = self.state.lock().unwrap();
        let mut version = version_for(body, TEST_SECRET);
        version.signature = signature.to_string();
        state.version = version;
    }

    /// Snapshot of the request counters.
    pub fn stats(&self) -> OriginStats {
        self.state.lock().unwrap().stats.clone()
    }
}

async fn handle_connection(mut socket: TcpStream, state: Arc<Mutex<OriginState>>) {
    let mut buf = vec![0u8; 8192];
    let mut len = 0;
    loop {
        if len == buf.len() {
            break;
        }
        match socket.read(&mut buf[len..]).await {
            Ok(0) => break,
            Ok(n) => {
                len += n;
                if buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            Err(_) => return,
        }
    }
    let request = String::from_utf8_lossy(&buf[..len]).to_string();
    let response = {
        let mut state = state.lock().unwrap();
        state.stats.requests += 1;
        let if_none_match = request_header(&request, "if-none-match");
        if if_none_match.as_deref() == Some(state.version.etag.as_str()) {
            state.stats.not_modified += 1;
            not_modified_response(&state.version)
        } else {
            state.stats.full_responses += 1;
            full_response(&state.version)
        }
    };
    let _ = socket.write_all(&response).await;
    let _ = socket.shutdown().await;
}

fn request_header(request: &str, name: &str) -> Option<String> {
    for line in request.lines().skip(1) {
        if let Some((key, value)) = line.split_once(':')
            && key.trim().eq_ignore_ascii_case(name)
        {
            return Some(value.trim().to_string());
        }
    }
    None
}

fn full_response(version: &OriginVersion) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
         content-type: application/javascript\r\n\
         etag: {}\r\n\
         last-modified: {}\r\n\
         x-signature: {}\r\n\
         x-signature-256: {}\r\n\
         content-length: {}\r\n\
         connection: close\r\n\r\n",
        version.etag,
        version.last_modified,
        version.signature,
        version.signature,
        version.body.len()
    )
    .into_bytes();
    response.extend_from_slice(&version.body);
    response
}

fn not_modified_response(version: &OriginVersion) -> Vec<u8> {
    format!(
        "HTTP/1.1 304 Not Modified\r\n\
         etag: {}\r\n\
         last-modified: {}\r\n\
         x-signature: {}\r\n\
         connection: close\r\n\r\n",
        version.etag, version.last_modified, version.signature
    )
    .into_bytes()
}

/// Hex HMAC-SHA256 of `body` under `secret`, as the origin signs scripts.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Hex SHA-256 of `body`, matching the agent's content hash.
pub fn content_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

fn version_for(body: &[u8], secret: &str) -> OriginVersion {
    OriginVersion {
        etag: format!("\"{}\"", content_hash(body)),
        last_modified: Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        signature: sign(secret, body),
        body: body.to_vec(),
    }
}

/// Worker script that starts and stays up.
pub fn healthy_script(tag: &str) -> Vec<u8> {
    format!("#!/bin/sh\necho {tag} started\nexec sleep 600\n").into_bytes()
}

/// Worker script that exits immediately with an error.
pub fn crashing_script() -> Vec<u8> {
    b"#!/bin/sh\necho boom >&2\nexit 7\n".to_vec()
}

/// Worker script that passes the health window, then crashes.
pub fn late_crashing_script() -> Vec<u8> {
    b"#!/bin/sh\nsleep 1\nexit 1\n".to_vec()
}

/// Fully wired agent over a temp directory, driven manually in tests.
pub struct TestAgent {
    pub scheduler: PollScheduler,
    pub supervisor: ScriptSupervisor,
    pub installer: ScriptInstaller,
    pub store: MetadataStore,
    pub config: AgentConfig,
    pub shutdown: CancellationToken,
    _temp_dir: tempfile::TempDir,
}

impl TestAgent {
    /// Wire an agent against `origin_url` with test-sized timings.
    pub fn new(origin_url: &str) -> Self {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = AgentConfig::new("test-device", TEST_SECRET);
        config.origin_url = origin_url.to_string();
        config.script_dir = temp_dir.path().join("scripts");
        config.script_file = "worker.sh".to_string();
        config.metadata_path = temp_dir.path().join("state/meta.json");
        config.interpreter = PathBuf::from("sh");
        config.poll_interval = Duration::from_millis(200);
        config.fetch_timeout = Duration::from_secs(5);
        config.health_wait = Duration::from_millis(300);
        config.restart_backoff = Duration::from_millis(50);
        config.max_restart_backoff = Duration::from_millis(400);
        config.stop_grace = Duration::from_millis(500);
        config.max_fetch_retries = 2;
        config.backup_keep = 3;
        std::fs::create_dir_all(&config.script_dir).unwrap();

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
        let fetcher = UpdateFetcher::new(&config).unwrap();
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
            installer.clone(),
            supervisor.clone(),
            store.clone(),
            shutdown.clone(),
        );

        Self {
            scheduler,
            supervisor,
            installer,
            store,
            config,
            shutdown,
            _temp_dir: temp_dir,
        }
    }

    /// Path of the live worker script.
    pub fn script_path(&self) -> PathBuf {
        self.config.script_path()
    }

    /// Backup files next to the live script, sorted oldest first.
    pub fn backups(&self) -> Vec<PathBuf> {
        let prefix = format!("{}.bak.", self.config.script_file);
        let mut backups: Vec<PathBuf> = std::fs::read_dir(&self.config.script_dir)
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .map(|e| e.path())
            .collect();
        backups.sort();
        backups
    }

    /// Cancel background work and stop the supervised worker.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.supervisor.shutdown_current().await;
    }
}

/// Whether `pid` still refers to a live process.
pub fn pid_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// Wait until `predicate` holds, or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}
