//! Renderer process supervision
//!
//! [`ProcessSupervisor`] keeps exactly one renderer child alive:
//!
//! ```text
//! Starting ──spawn ok──► Running ──exit──► Starting
//!    │                      │
//!    └─spawn failed: log, sleep retry delay, Starting
//! ```
//!
//! The pid of the live child is published through a [`ProcessSlot`]; the
//! change applier only ever holds the read side ([`ReloadTarget`]) and uses
//! it to deliver reload signals.

use super::task::{Resumable, Step};
use mct_core::config::Settings;
use mct_core::signal;
use std::convert::Infallible;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a stopping renderer gets between SIGTERM and SIGKILL
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of one reload attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Hang-up delivered to this pid
    Sent(u32),
    /// No renderer is running; nothing to do
    NoProcess,
    /// Delivery to this pid failed (it most likely just exited)
    Failed(u32),
}

/// Something that can ask the renderer to reload.
pub trait ReloadSignal: Send + Sync {
    fn reload(&self) -> ReloadOutcome;
}

/// Create the write side (for the supervisor) and read side (for reloads)
/// of the current-renderer handle. Both start empty.
pub fn process_slot() -> (ProcessSlot, ReloadTarget) {
    let (tx, rx) = watch::channel(None);
    (ProcessSlot { tx }, ReloadTarget { rx })
}

/// Write side of the current-renderer handle. Owned by the supervisor.
#[derive(Debug)]
pub struct ProcessSlot {
    tx: watch::Sender<Option<u32>>,
}

impl ProcessSlot {
    pub fn set(&self, pid: u32) {
        self.tx.send_replace(Some(pid));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn current(&self) -> Option<u32> {
        *self.tx.borrow()
    }

    /// Another read handle onto this slot.
    pub fn target(&self) -> ReloadTarget {
        ReloadTarget {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of the current renderer, used as the reload target.
#[derive(Debug, Clone)]
pub struct ReloadTarget {
    rx: watch::Receiver<Option<u32>>,
}

impl ReloadTarget {
    pub fn current(&self) -> Option<u32> {
        *self.rx.borrow()
    }

    /// Wait until a renderer is running and return its pid.
    pub async fn wait_for_process(&mut self) -> Option<u32> {
        self.rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|pid| *pid)
    }
}

impl ReloadSignal for ReloadTarget {
    fn reload(&self) -> ReloadOutcome {
        let Some(pid) = self.current() else {
            debug!("No renderer running; skipping reload");
            return ReloadOutcome::NoProcess;
        };
        match signal::send_hangup(pid) {
            Ok(()) => {
                debug!("Sent reload signal to renderer pid {}", pid);
                ReloadOutcome::Sent(pid)
            }
            Err(e) => {
                warn!("Reload signal to renderer pid {} failed: {}", pid, e);
                ReloadOutcome::Failed(pid)
            }
        }
    }
}

/// Renderer invocation and timing
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Renderer binary
    pub bin: PathBuf,
    /// Passed as `-config <path>`
    pub config: PathBuf,
    /// Pause after a failed spawn
    pub spawn_retry_delay: Duration,
    /// Pause between spawn and the first hang-up
    pub reload_grace: Duration,
}

impl From<&Settings> for SupervisorSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            bin: settings.renderer_bin.clone(),
            config: settings.renderer_config.clone(),
            spawn_retry_delay: settings.spawn_retry_delay,
            reload_grace: settings.reload_grace,
        }
    }
}

/// Supervisor state
#[derive(Debug)]
pub enum SupervisorState {
    /// No child; the next step spawns one
    Starting,
    /// Child is alive; the next step waits for it to exit
    Running(Child),
    /// Shut down on request; terminal
    Stopped,
}

/// Spawns, watches and respawns the renderer forever.
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    slot: ProcessSlot,
    cancel: CancellationToken,
    spawn_count: u64,
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    GraceElapsed,
    Stop,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings, slot: ProcessSlot, cancel: CancellationToken) -> Self {
        Self {
            settings,
            slot,
            cancel,
            spawn_count: 0,
        }
    }

    /// Number of successful spawns so far
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count
    }

    async fn start(&mut self) -> Step<SupervisorState> {
        let mut cmd = Command::new(&self.settings.bin);
        cmd.arg("-config")
            .arg(&self.settings.config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(
                    "Failed to spawn renderer {}: {}; retrying in {:?}",
                    self.settings.bin.display(),
                    e,
                    self.settings.spawn_retry_delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.spawn_retry_delay) => {}
                    _ = self.cancel.cancelled() => {}
                }
                return Step::Continue(SupervisorState::Starting);
            }
        };

        self.spawn_count += 1;
        let pid = child.id().unwrap_or_default();
        if pid != 0 {
            self.slot.set(pid);
        }
        info!(
            "Renderer started: {} -config {} (pid {}, spawn #{})",
            self.settings.bin.display(),
            self.settings.config.display(),
            pid,
            self.spawn_count
        );

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout", pid);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr", pid);
        }

        Step::Continue(SupervisorState::Running(child))
    }

    async fn supervise(&mut self, mut child: Child) -> Step<SupervisorState> {
        let pid = child.id();

        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            _ = tokio::time::sleep(self.settings.reload_grace) => Wake::GraceElapsed,
            _ = self.cancel.cancelled() => Wake::Stop,
        };

        let status = match wake {
            Wake::Exited(status) => status,
            Wake::Stop => return self.stop(child).await,
            Wake::GraceElapsed => {
                // Give the renderer its first reload once it has had time to install handlers
                if let Some(pid) = pid {
                    match signal::send_hangup(pid) {
                        Ok(()) => debug!("Sent initial reload to renderer pid {}", pid),
                        Err(e) => warn!("Initial reload to renderer pid {} failed: {}", pid, e),
                    }
                }
                let wake = tokio::select! {
                    status = child.wait() => Wake::Exited(status),
                    _ = self.cancel.cancelled() => Wake::Stop,
                };
                match wake {
                    Wake::Exited(status) => status,
                    _ => return self.stop(child).await,
                }
            }
        };

        self.slot.clear();
        match status {
            Ok(status) if status.success() => info!("Renderer exited: {}; restarting", status),
            Ok(status) => warn!("Renderer exited: {}; restarting", status),
            Err(e) => error!("Failed waiting for renderer: {}; restarting", e),
        }
        Step::Continue(SupervisorState::Starting)
    }

    async fn stop(&mut self, mut child: Child) -> Step<SupervisorState> {
        info!("Stopping renderer");
        if let Some(pid) = child.id()
            && let Err(e) = signal::send_terminate(pid)
        {
            warn!("Failed to send SIGTERM to renderer pid {}: {}", pid, e);
        }

        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => info!("Renderer stopped: {}", status),
            Ok(Err(e)) => error!("Failed waiting for renderer: {}", e),
            Err(_) => {
                warn!("Renderer did not stop within {:?}; killing", STOP_TIMEOUT);
                if let Err(e) = child.kill().await {
                    error!("Failed to kill renderer: {}", e);
                }
            }
        }

        self.slot.clear();
        Step::Complete(SupervisorState::Stopped)
    }
}

impl Resumable for ProcessSupervisor {
    type State = SupervisorState;
    type Error = Infallible;

    async fn step(&mut self, state: SupervisorState) -> Result<Step<SupervisorState>, Infallible> {
        Ok(match state {
            SupervisorState::Starting => self.start().await,
            SupervisorState::Running(child) => self.supervise(child).await,
            SupervisorState::Stopped => Step::Complete(SupervisorState::Stopped),
        })
    }
}

fn forward_output<R>(reader: R, stream: &'static str, pid: u32)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(stream, pid, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    warn!(stream, pid, "Failed reading renderer output: {}", e);
                    break;
                }
            }
        }
        debug!(stream, pid, "Renderer output closed");
    });
}
