//! Subprocess owning task -- spawn, watch stderr, kill and reap on shutdown.
//!
//! The task is the only owner of the child and its stderr pipe. It reports
//! the spawn result once, then always waits for the shutdown signal before
//! sending its single `Termination`, even when the spawn failed or the child
//! exited early. An early exit is announced right away on the exited notice
//! so a pending readiness wait can give up.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStderr, Command};
use tokio::sync::oneshot;

use crate::peer::{Exit, ExitedNotice, ShutdownSignal, Termination};

/// How long to keep reading stderr after the child has been reaped.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// Stderr lines kept per peer; later lines are counted and dropped.
const MAX_STDERR_LINES: usize = 2000;

/// Everything needed to launch one node process.
#[derive(Clone)]
pub struct SpawnSpec {
    pub peer: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// Extra environment for the child only (e.g. the account password).
    pub env: Vec<(String, String)>,
}

impl std::fmt::Debug for SpawnSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("SpawnSpec")
            .field("peer", &self.peer)
            .field("program", &self.program)
            .field("args", &self.args)
            .field("workdir", &self.workdir)
            .field("env_keys", &env_keys)
            .finish()
    }
}

impl SpawnSpec {
    /// Relative paths with a directory component resolve against `workdir`,
    /// so `./wnode-status` works the same on every platform.
    fn resolved_program(&self) -> PathBuf {
        match &self.workdir {
            Some(dir) if self.program.is_relative() && self.program.components().count() > 1 => {
                dir.join(&self.program)
            }
            _ => self.program.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.resolved_program());
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Run one subprocess lifecycle to completion.
///
/// `spawned_tx` gets the pid (or the spawn error) as soon as it is known.
/// `exited_tx` fires only if the child exits before shutdown.
/// `done_tx` gets the termination report exactly once.
pub async fn run_subprocess_task(
    spec: SpawnSpec,
    spawned_tx: oneshot::Sender<Result<Option<u32>, String>>,
    mut shutdown: ShutdownSignal,
    exited_tx: ExitedNotice,
    done_tx: oneshot::Sender<Termination>,
) {
    let peer = spec.peer.as_str();
    tracing::info!(peer, program = %spec.resolved_program().display(), args = ?spec.args, "spawning node");

    let mut child = match spec.command().spawn() {
        Ok(child) => child,
        Err(e) => {
            let reason = format!("{}: {e}", spec.resolved_program().display());
            tracing::error!(peer, "spawn failed: {reason}");
            let _ = spawned_tx.send(Err(reason.clone()));
            // Keep the lifecycle symmetric: the caller still signals and reaps.
            let _ = (&mut shutdown).await;
            let _ = done_tx.send(Termination::new(peer, Exit::SpawnFailed(reason)));
            return;
        }
    };

    let pid = child.id();
    tracing::info!(peer, pid, "node spawned");
    let _ = spawned_tx.send(Ok(pid));

    let mut lines = child.stderr.take().map(|s| BufReader::new(s).lines());
    let mut stderr = StderrBuffer::default();
    let mut early_exit = None;
    let mut exited_tx = Some(exited_tx);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(line) = next_line(peer, &mut lines) => stderr.push(line),
            status = child.wait(), if early_exit.is_none() => {
                tracing::warn!(peer, pid, ?status, "node exited before shutdown");
                let shown = match &status {
                    Ok(status) => Exit::Status(*status).to_string(),
                    Err(e) => Exit::WaitFailed(e.to_string()).to_string(),
                };
                if let Some(tx) = exited_tx.take() {
                    let _ = tx.send(shown);
                }
                early_exit = Some(status);
            }
        }
    }

    let mut kill_error = None;
    let status = match early_exit {
        Some(status) => status,
        None => {
            tracing::info!(peer, pid, "killing node");
            if let Err(e) = child.start_kill() {
                tracing::warn!(peer, pid, "kill failed: {e}");
                kill_error = Some(e.to_string());
            }
            child.wait().await
        }
    };

    let _ = tokio::time::timeout(STDERR_DRAIN, async {
        while let Some(line) = next_line(peer, &mut lines).await {
            stderr.push(line);
        }
    })
    .await;

    let exit = match status {
        Ok(status) => {
            tracing::info!(peer, pid, %status, "node reaped");
            Exit::Status(status)
        }
        Err(e) => {
            tracing::warn!(peer, pid, "wait failed: {e}");
            Exit::WaitFailed(e.to_string())
        }
    };
    if stderr.dropped > 0 {
        tracing::debug!(peer, dropped = stderr.dropped, "stderr lines dropped");
    }

    let mut termination = Termination::new(peer, exit);
    termination.kill_error = kill_error;
    termination.stderr = stderr.lines;
    let _ = done_tx.send(termination);
}

#[derive(Default)]
struct StderrBuffer {
    lines: Vec<String>,
    dropped: usize,
}

impl StderrBuffer {
    fn push(&mut self, line: String) {
        if self.lines.len() < MAX_STDERR_LINES {
            self.lines.push(line);
        } else {
            self.dropped += 1;
        }
    }
}

/// Next stderr line, or `None` once the pipe is closed or broken.
async fn next_line(
    peer: &str,
    lines: &mut Option<Lines<BufReader<ChildStderr>>>,
) -> Option<String> {
    let reader = lines.as_mut()?;
    match reader.next_line().await {
        Ok(Some(line)) => {
            tracing::debug!(peer, "stderr: {line}");
            Some(line)
        }
        Ok(None) => {
            *lines = None;
            None
        }
        Err(e) => {
            tracing::warn!(peer, "stderr read failed: {e}");
            *lines = None;
            None
        }
    }
}
