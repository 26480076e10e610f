//! In-process owning task -- runs a hosted node entry until shutdown.

use tokio::sync::oneshot;

use crate::peer::{Exit, ExitedNotice, NodeEntry, ShutdownSignal, Termination};

/// Drive `entry` and report its end exactly once.
///
/// The entry gets its own shutdown channel; this task forwards the caller's
/// signal to it. An entry that returns early is announced on `exited_tx`
/// and reported on `done_tx` only after the caller's shutdown arrives.
pub async fn run_in_process_task(
    peer: String,
    entry: NodeEntry,
    mut shutdown: ShutdownSignal,
    exited_tx: ExitedNotice,
    done_tx: oneshot::Sender<Termination>,
) {
    let (entry_tx, entry_rx) = oneshot::channel();
    let mut node = tokio::spawn(entry(entry_rx));
    tracing::info!(peer = %peer, "in-process node started");

    let (joined, early) = tokio::select! {
        joined = &mut node => (joined, true),
        _ = &mut shutdown => {
            let _ = entry_tx.send(());
            (node.await, false)
        }
    };

    let exit = match joined {
        Ok(Ok(())) => Exit::Returned,
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer, "in-process node failed: {e:#}");
            Exit::Failed(format!("{e:#}"))
        }
        Err(e) => {
            tracing::error!(peer = %peer, "in-process node panicked: {e}");
            Exit::Failed(format!("task failed: {e}"))
        }
    };

    if early {
        tracing::warn!(peer = %peer, %exit, "in-process node returned before shutdown");
        let _ = exited_tx.send(exit.to_string());
        let _ = (&mut shutdown).await;
    }
    let _ = done_tx.send(Termination::new(&peer, exit));
}
