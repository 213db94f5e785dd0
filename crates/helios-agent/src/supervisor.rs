// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker process lifecycle.
//!
//! The supervisor owns the one authoritative child handle. Every adopted
//! process carries a generation number, and both paths that touch the handle
//! (the crash-restart path and the install handoff) check the generation
//! before acting, so a delayed restart can never clobber a fresher process.
//!
//! Restart delays grow as `min(base × 2^attempts, max)`. The attempt counter
//! resets whenever a process is adopted as current, so backoff reflects
//! consecutive failures of the current script only.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::Result;

/// Supervisor parameters, split out of [`crate::AgentConfig`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path of the live worker script.
    pub script_path: PathBuf,
    /// Interpreter the script is launched with.
    pub interpreter: PathBuf,
    /// How long a fresh process must stay alive to be adopted.
    pub health_wait: Duration,
    /// Crash-restart backoff policy.
    pub restart_backoff: BackoffPolicy,
    /// Grace period between SIGTERM and SIGKILL when stopping a worker.
    pub stop_grace: Duration,
}

/// Handle of an adopted worker process.
#[derive(Debug, Clone)]
struct ChildHandle {
    generation: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SupervisorState {
    current: Option<ChildHandle>,
    restart_attempts: u32,
    next_generation: u64,
}

/// Supervises the currently installed worker script as a child process.
#[derive(Clone)]
pub struct ScriptSupervisor {
    config: SupervisorConfig,
    state: Arc<Mutex<SupervisorState>>,
    shutdown: CancellationToken,
}

impl ScriptSupervisor {
    /// Create a supervisor. No process is started until
    /// [`ScriptSupervisor::ensure_running`] or an install adopts one.
    pub fn new(config: SupervisorConfig, shutdown: CancellationToken) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(SupervisorState::default())),
            shutdown,
        }
    }

    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pid of the currently adopted worker, if any.
    pub fn current_pid(&self) -> Option<u32> {
        self.state().current.as_ref().and_then(|h| h.pid)
    }

    /// When the currently adopted worker was started, if any.
    pub fn current_started_at(&self) -> Option<DateTime<Utc>> {
        self.state().current.as_ref().map(|h| h.started_at)
    }

    /// Consecutive crash count of the current worker.
    pub fn restart_attempts(&self) -> u32 {
        self.state().restart_attempts
    }

    /// Spawn the worker script without adopting it.
    ///
    /// Output is forwarded into the agent log with stream attribution. The
    /// caller decides, after a health wait, whether the process is adopted.
    pub fn start_candidate(&self) -> Result<Child> {
        let mut command = Command::new(&self.config.interpreter);
        command
            .arg(&self.config.script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        info!(
            path = %self.config.script_path.display(),
            pid = ?child.id(),
            "Started worker process"
        );
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }
        Ok(child)
    }

    /// Wait the health window and report whether the candidate survived it.
    ///
    /// Returns `false` if the process exited early, or if shutdown was
    /// requested mid-wait (the candidate is killed in that case).
    pub async fn await_health(&self, child: &mut Child) -> Result<bool> {
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                let _ = child.start_kill();
                Ok(false)
            }
            _ = tokio::time::sleep(self.config.health_wait) => {
                match child.try_wait()? {
                    Some(status) => {
                        warn!(status = %status, "Worker exited during health window");
                        Ok(false)
                    }
                    None => Ok(true),
                }
            }
        }
    }

    /// Make `child` the current worker.
    ///
    /// Resets the restart counter and retires the previous worker in the
    /// background: SIGTERM, escalating to SIGKILL after the grace period.
    pub fn adopt(&self, child: Child) {
        let pid = child.id();
        let (generation, previous) = {
            let mut state = self.state();
            let generation = state.next_generation;
            state.next_generation += 1;
            let previous = state.current.replace(ChildHandle {
                generation,
                pid,
                started_at: Utc::now(),
            });
            state.restart_attempts = 0;
            (generation, previous)
        };
        if let Some(old) = previous
            && let Some(old_pid) = old.pid
        {
            info!(pid = old_pid, "Retiring previous worker");
            tokio::spawn(terminate(old_pid, self.config.stop_grace));
        }
        self.spawn_monitor(child, generation);
    }

    /// Resume supervising an already-installed script.
    ///
    /// Idempotent: a live handle means there is nothing to do. A missing
    /// install path is a quiet no-op; the next successful install starts the
    /// worker instead.
    pub async fn ensure_running(&self) -> Result<()> {
        if self.state().current.is_some() {
            return Ok(());
        }
        if !self.config.script_path.exists() {
            debug!(path = %self.config.script_path.display(), "No worker script installed yet");
            return Ok(());
        }
        let mut child = self.start_candidate()?;
        if !self.await_health(&mut child).await? {
            warn!("Installed script did not survive its health window");
            return Ok(());
        }
        self.adopt(child);
        info!(
            path = %self.config.script_path.display(),
            "Resumed supervising installed script"
        );
        Ok(())
    }

    /// Gracefully stop the current worker as part of agent shutdown.
    ///
    /// Taking the handle first means the exit observer sees a stale
    /// generation and schedules no restart.
    pub async fn shutdown_current(&self) {
        let handle = self.state().current.take();
        if let Some(handle) = handle
            && let Some(pid) = handle.pid
        {
            info!(pid, "Stopping worker");
            terminate(pid, self.config.stop_grace).await;
        }
    }

    fn spawn_monitor(&self, mut child: Child, generation: u64) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(generation, status = %status, "Worker exited"),
                Err(e) => error!(generation, error = %e, "Failed waiting on worker"),
            }
            drop(child);
            supervisor.handle_exit(generation).await;
        });
    }

    /// Crash-restart path, driven by process-exit notification.
    async fn handle_exit(&self, generation: u64) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let (delay, attempts) = {
            let mut state = self.state();
            match &state.current {
                Some(handle) if handle.generation == generation => {
                    state.restart_attempts += 1;
                    let attempts = state.restart_attempts;
                    (self.config.restart_backoff.next(attempts), attempts)
                }
                // Deliberate stop, or already superseded by a newer install.
                _ => return,
            }
        };
        warn!(
            generation,
            attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling worker restart"
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        // The handle may have changed while we slept; a stale restart must
        // not replace a fresher process.
        {
            let state = self.state();
            match &state.current {
                Some(handle) if handle.generation == generation => {}
                _ => return,
            }
        }
        self.restart(generation);
    }

    /// Replace the crashed worker `superseded` with a fresh process.
    ///
    /// The attempt counter is left as-is: only adoption of a fresh install
    /// resets it.
    fn restart(&self, superseded: u64) {
        let child = match self.start_candidate() {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Failed to restart worker");
                let mut state = self.state();
                if matches!(&state.current, Some(h) if h.generation == superseded) {
                    // Drop the dead handle so ensure_running retries at the
                    // next poll.
                    state.current = None;
                }
                return;
            }
        };
        let pid = child.id();
        let adopted = {
            let mut state = self.state();
            match &state.current {
                Some(handle) if handle.generation == superseded => {
                    let generation = state.next_generation;
                    state.next_generation += 1;
                    state.current = Some(ChildHandle {
                        generation,
                        pid,
                        started_at: Utc::now(),
                    });
                    Some(generation)
                }
                _ => None,
            }
        };
        match adopted {
            Some(generation) => self.spawn_monitor(child, generation),
            None => {
                // A newer install won the race while we were spawning.
                if let Some(pid) = pid {
                    tokio::spawn(terminate(pid, Duration::ZERO));
                }
            }
        }
    }
}

/// Forward one output stream of the worker into the agent log.
async fn forward_output<R>(stream: R, stream_name: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(stream = stream_name, "worker: {line}");
    }
}

/// Ask `pid` to stop with SIGTERM, escalating to SIGKILL after `grace`.
pub(crate) async fn terminate(pid: u32, grace: Duration) {
    let target = Pid::from_raw(pid as i32);
    match signal::kill(target, Signal::SIGTERM) {
        Ok(()) => debug!(pid, "Sent SIGTERM to worker"),
        Err(Errno::ESRCH) => return,
        Err(e) => warn!(pid, error = %e, "Failed to send SIGTERM"),
    }
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(target) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if process_alive(target) {
        warn!(pid, "Worker still alive after grace period, sending SIGKILL");
        let _ = signal::kill(target, Signal::SIGKILL);
    }
}

fn process_alive(pid: Pid) -> bool {
    signal::kill(pid, None).is_ok()
}
