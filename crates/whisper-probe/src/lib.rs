//! Whisper Probe -- library crate for the two-node pub/sub harness.
//!
//! Re-exports the lifecycle, readiness and scenario modules so integration
//! tests can drive in-process mock nodes through the same code path the
//! binary uses for real node processes.

pub mod config;
pub mod in_process_task;
pub mod peer;
pub mod readiness;
pub mod scenario;
pub mod subprocess_task;

pub use peer::{
    Exit, InProcessPeer, LifecycleError, NodeEntry, Peer, PeerState, ShutdownSignal,
    SubprocessPeer, Termination,
};
pub use readiness::ReadinessProbe;
pub use scenario::{run_pubsub, ScenarioError, ScenarioOutcome, ScenarioSettings, Step};

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
