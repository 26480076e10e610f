//! Peer lifecycle -- one interface over subprocess and in-process nodes.
//!
//! State machine: NotStarted -> Starting -> Ready -> ShuttingDown -> Terminated.
//!
//! Each started peer has exactly one owning task (see `subprocess_task` and
//! `in_process_task`). The peer talks to it only through one-shot channels:
//! the shutdown signal out, an early-exit notice and the `Termination` back.
//! All are consumed on use, so a peer can be signalled and reaped at most once.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::oneshot;
use whisper_client::{ClientError, WhisperClient};

use crate::config::NodeSection;
use crate::readiness::ReadinessProbe;
use crate::subprocess_task::{self, SpawnSpec};
use crate::{expand_tilde, in_process_task};

/// Fired once when the peer should stop.
pub type ShutdownSignal = oneshot::Receiver<()>;

/// Sent by an owning task when its node stops before shutdown was asked for.
/// Carries the exit, rendered for the operator.
pub type ExitedNotice = oneshot::Sender<String>;

/// Entry point of a node hosted inside this process.
///
/// Receives the shutdown signal and resolves when the node has stopped.
pub type NodeEntry = Box<
    dyn FnOnce(ShutdownSignal) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    NotStarted,
    Starting,
    Ready,
    ShuttingDown,
    Terminated,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::NotStarted => "not-started",
            PeerState::Starting => "starting",
            PeerState::Ready => "ready",
            PeerState::ShuttingDown => "shutting-down",
            PeerState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a peer ended.
#[derive(Debug)]
pub enum Exit {
    /// Never started; nothing to reap.
    NotStarted,
    /// The process could not be spawned.
    SpawnFailed(String),
    /// Process reaped with this status.
    Status(std::process::ExitStatus),
    /// Reaping the process failed.
    WaitFailed(String),
    /// In-process entry returned cleanly.
    Returned,
    /// In-process entry returned an error or panicked.
    Failed(String),
}

impl Exit {
    /// True when the peer ran and was reaped or returned without error.
    /// Exit codes are not interpreted.
    pub fn is_clean(&self) -> bool {
        matches!(self, Exit::Status(_) | Exit::Returned | Exit::NotStarted)
    }
}

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exit::NotStarted => f.write_str("not started"),
            Exit::SpawnFailed(reason) => write!(f, "spawn failed: {reason}"),
            Exit::Status(status) => write!(f, "{status}"),
            Exit::WaitFailed(reason) => write!(f, "wait failed: {reason}"),
            Exit::Returned => f.write_str("returned"),
            Exit::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Final report from a peer's owning task. Sent exactly once.
#[derive(Debug)]
pub struct Termination {
    pub peer: String,
    pub exit: Exit,
    /// Set when sending the kill signal failed. Logged, never escalated.
    pub kill_error: Option<String>,
    /// Captured standard error, one entry per line.
    pub stderr: Vec<String>,
}

impl Termination {
    pub(crate) fn new(peer: &str, exit: Exit) -> Self {
        Self {
            peer: peer.to_string(),
            exit,
            kill_error: None,
            stderr: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{peer}: cannot move from {from} to {to}")]
    InvalidTransition {
        peer: String,
        from: PeerState,
        to: PeerState,
    },
    #[error("{peer}: spawn failed: {reason}")]
    Spawn { peer: String, reason: String },
    #[error("{peer}: exited before becoming ready: {status}")]
    Exited { peer: String, status: String },
    #[error("{peer}: not ready after {waited:?}: {last_error}")]
    NotReady {
        peer: String,
        waited: Duration,
        last_error: String,
    },
    #[error("{peer}: lifecycle task ended without reporting")]
    TaskLost { peer: String },
    #[error("{peer}: {source}")]
    Client {
        peer: String,
        #[source]
        source: ClientError,
    },
}

/// A node the harness can start, probe, stop and reap.
pub trait Peer: Send {
    fn name(&self) -> &str;

    /// JSON-RPC endpoint URL.
    fn endpoint(&self) -> &str;

    fn state(&self) -> PeerState;

    /// NotStarted -> Starting. Spawns the owning task.
    fn start(&mut self) -> impl Future<Output = Result<(), LifecycleError>> + Send;

    /// Starting -> Ready, once the probe gets an answer.
    fn wait_ready(
        &mut self,
        probe: &ReadinessProbe,
    ) -> impl Future<Output = Result<Duration, LifecycleError>> + Send;

    /// Fire the shutdown signal. Repeated calls are no-ops.
    fn shutdown(&mut self);

    /// ShuttingDown -> Terminated. Awaits the owning task's single report.
    fn terminated(&mut self) -> impl Future<Output = Result<Termination, LifecycleError>> + Send;
}

/// State and channel ends shared by both peer kinds.
struct Lifecycle {
    name: String,
    endpoint: String,
    state: PeerState,
    start_failure: Option<String>,
    /// Set once the owning task reported an exit before shutdown.
    early_exit: Option<String>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    exited_rx: Option<oneshot::Receiver<String>>,
    done_rx: Option<oneshot::Receiver<Termination>>,
}

/// The owning task's ends of the lifecycle channels.
struct TaskEnds {
    shutdown: ShutdownSignal,
    exited: ExitedNotice,
    done: oneshot::Sender<Termination>,
}

impl Lifecycle {
    fn new(name: String, endpoint: String) -> Self {
        Self {
            name,
            endpoint,
            state: PeerState::NotStarted,
            start_failure: None,
            early_exit: None,
            shutdown_tx: None,
            exited_rx: None,
            done_rx: None,
        }
    }

    fn transition_error(&self, to: PeerState) -> LifecycleError {
        LifecycleError::InvalidTransition {
            peer: self.name.clone(),
            from: self.state,
            to,
        }
    }

    /// Create the channels and hand the task its ends.
    fn begin_start(&mut self) -> Result<TaskEnds, LifecycleError> {
        if self.state != PeerState::NotStarted {
            return Err(self.transition_error(PeerState::Starting));
        }
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);
        self.exited_rx = Some(exited_rx);
        self.done_rx = Some(done_rx);
        self.state = PeerState::Starting;
        tracing::info!(peer = %self.name, endpoint = %self.endpoint, "starting");
        Ok(TaskEnds {
            shutdown: shutdown_rx,
            exited: exited_tx,
            done: done_tx,
        })
    }

    fn exited_error(&self, status: &str) -> LifecycleError {
        LifecycleError::Exited {
            peer: self.name.clone(),
            status: status.to_string(),
        }
    }

    async fn wait_ready(&mut self, probe: &ReadinessProbe) -> Result<Duration, LifecycleError> {
        match self.state {
            PeerState::Ready => return Ok(Duration::ZERO),
            PeerState::Starting => {}
            _ => return Err(self.transition_error(PeerState::Ready)),
        }
        if let Some(reason) = &self.start_failure {
            return Err(LifecycleError::Spawn {
                peer: self.name.clone(),
                reason: reason.clone(),
            });
        }
        if let Some(status) = &self.early_exit {
            return Err(self.exited_error(status));
        }

        let client = WhisperClient::new(self.endpoint.clone(), probe.rpc_timeout).map_err(|e| {
            LifecycleError::Client {
                peer: self.name.clone(),
                source: e,
            }
        })?;
        // A node that dies while starting ends the wait at once.
        let raced = match self.exited_rx.as_mut() {
            Some(exited_rx) => tokio::select! {
                ready = probe.wait(&self.name, &client) => Ok(ready),
                Ok(status) = exited_rx => Err(status),
            },
            None => Ok(probe.wait(&self.name, &client).await),
        };

        match raced {
            Ok(ready) => {
                let waited = ready?;
                self.state = PeerState::Ready;
                Ok(waited)
            }
            Err(status) => {
                tracing::warn!(peer = %self.name, %status, "exited while starting");
                self.exited_rx = None;
                let err = self.exited_error(&status);
                self.early_exit = Some(status);
                Err(err)
            }
        }
    }

    fn shutdown(&mut self) {
        match self.state {
            PeerState::Starting | PeerState::Ready => {
                if let Some(tx) = self.shutdown_tx.take() {
                    // The task may already be gone; its report is still in the channel.
                    let _ = tx.send(());
                }
                tracing::info!(peer = %self.name, from = %self.state, "shutdown signalled");
                self.state = PeerState::ShuttingDown;
            }
            PeerState::NotStarted | PeerState::ShuttingDown | PeerState::Terminated => {}
        }
    }

    async fn terminated(&mut self) -> Result<Termination, LifecycleError> {
        match self.state {
            PeerState::NotStarted => {
                self.state = PeerState::Terminated;
                Ok(Termination::new(&self.name, Exit::NotStarted))
            }
            PeerState::ShuttingDown => {
                let done_rx = self.done_rx.take().ok_or_else(|| LifecycleError::TaskLost {
                    peer: self.name.clone(),
                })?;
                let termination = done_rx.await.map_err(|_| LifecycleError::TaskLost {
                    peer: self.name.clone(),
                })?;
                self.state = PeerState::Terminated;
                tracing::info!(
                    peer = %self.name,
                    exit = ?termination.exit,
                    stderr_lines = termination.stderr.len(),
                    "terminated"
                );
                Ok(termination)
            }
            _ => Err(self.transition_error(PeerState::Terminated)),
        }
    }
}

// ============================================================================
// Subprocess peer
// ============================================================================

/// A node binary launched as a child process.
pub struct SubprocessPeer {
    lifecycle: Lifecycle,
    spec: SpawnSpec,
    pid: Option<u32>,
}

impl SubprocessPeer {
    pub fn new(spec: SpawnSpec, endpoint: impl Into<String>) -> Self {
        Self {
            lifecycle: Lifecycle::new(spec.peer.clone(), endpoint.into()),
            spec,
            pid: None,
        }
    }

    /// Build from a `[sender]`/`[receiver]` config section.
    pub fn from_config(node: &NodeSection, fallback_name: &str) -> Self {
        let mut env = Vec::new();
        if let Some(secret) = &node.secret {
            env.push((node.secret_env.clone(), secret.clone()));
        }
        let spec = SpawnSpec {
            peer: node.name_or(fallback_name).to_string(),
            program: expand_tilde(&node.binary),
            args: node.command_args(),
            workdir: node.workdir.as_deref().map(expand_tilde),
            env,
        };
        Self::new(spec, node.endpoint())
    }

    /// OS process id, once spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &PathBuf {
        &self.spec.program
    }
}

impl Peer for SubprocessPeer {
    fn name(&self) -> &str {
        &self.lifecycle.name
    }

    fn endpoint(&self) -> &str {
        &self.lifecycle.endpoint
    }

    fn state(&self) -> PeerState {
        self.lifecycle.state
    }

    async fn start(&mut self) -> Result<(), LifecycleError> {
        let ends = self.lifecycle.begin_start()?;
        let (spawned_tx, spawned_rx) = oneshot::channel();
        tokio::spawn(subprocess_task::run_subprocess_task(
            self.spec.clone(),
            spawned_tx,
            ends.shutdown,
            ends.exited,
            ends.done,
        ));

        match spawned_rx.await {
            Ok(Ok(pid)) => {
                self.pid = pid;
                Ok(())
            }
            Ok(Err(reason)) => {
                self.lifecycle.start_failure = Some(reason.clone());
                Err(LifecycleError::Spawn {
                    peer: self.lifecycle.name.clone(),
                    reason,
                })
            }
            Err(_) => Err(LifecycleError::TaskLost {
                peer: self.lifecycle.name.clone(),
            }),
        }
    }

    async fn wait_ready(&mut self, probe: &ReadinessProbe) -> Result<Duration, LifecycleError> {
        self.lifecycle.wait_ready(probe).await
    }

    fn shutdown(&mut self) {
        self.lifecycle.shutdown();
    }

    async fn terminated(&mut self) -> Result<Termination, LifecycleError> {
        self.lifecycle.terminated().await
    }
}

// ============================================================================
// In-process peer
// ============================================================================

/// A node whose entry point runs as a task inside this process.
pub struct InProcessPeer {
    lifecycle: Lifecycle,
    entry: Option<NodeEntry>,
}

impl InProcessPeer {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, entry: NodeEntry) -> Self {
        Self {
            lifecycle: Lifecycle::new(name.into(), endpoint.into()),
            entry: Some(entry),
        }
    }
}

impl Peer for InProcessPeer {
    fn name(&self) -> &str {
        &self.lifecycle.name
    }

    fn endpoint(&self) -> &str {
        &self.lifecycle.endpoint
    }

    fn state(&self) -> PeerState {
        self.lifecycle.state
    }

    async fn start(&mut self) -> Result<(), LifecycleError> {
        let ends = self.lifecycle.begin_start()?;
        let Some(entry) = self.entry.take() else {
            return Err(LifecycleError::TaskLost {
                peer: self.lifecycle.name.clone(),
            });
        };
        tokio::spawn(in_process_task::run_in_process_task(
            self.lifecycle.name.clone(),
            entry,
            ends.shutdown,
            ends.exited,
            ends.done,
        ));
        Ok(())
    }

    async fn wait_ready(&mut self, probe: &ReadinessProbe) -> Result<Duration, LifecycleError> {
        self.lifecycle.wait_ready(probe).await
    }

    fn shutdown(&mut self) {
        self.lifecycle.shutdown();
    }

    async fn terminated(&mut self) -> Result<Termination, LifecycleError> {
        self.lifecycle.terminated().await
    }
}
