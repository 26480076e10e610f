//! Readiness probing -- poll a cheap RPC method until the node answers.
//!
//! A node counts as ready once it returns either a result or a JSON-RPC
//! error object: both prove the HTTP RPC server is up and dispatching.
//! Transport and decode failures keep the probe waiting.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use whisper_client::{ErrorKind, WhisperClient};

use crate::config::ProbeConfig;
use crate::peer::LifecycleError;

#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    pub method: String,
    /// Overall budget for the node to come up.
    pub timeout: Duration,
    /// Pause between attempts.
    pub interval: Duration,
    /// Per-attempt RPC timeout, also used for the probe's client.
    pub rpc_timeout: Duration,
}

impl ReadinessProbe {
    pub fn from_config(cfg: &ProbeConfig) -> Self {
        Self {
            method: cfg.readiness.method.clone(),
            timeout: Duration::from_secs(cfg.readiness.timeout_secs),
            interval: Duration::from_millis(cfg.readiness.interval_ms),
            rpc_timeout: cfg.rpc_timeout(),
        }
    }

    /// Poll `client` until it answers or the deadline passes.
    /// Returns how long the node took to become ready.
    pub async fn wait(&self, peer: &str, client: &WhisperClient) -> Result<Duration, LifecycleError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut attempts = 0u32;
        let mut last_error = String::from("no attempt made");

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = tokio::time::timeout(
                remaining.min(self.rpc_timeout),
                client.call_raw(&self.method, json!([])),
            )
            .await;

            match attempt {
                Ok(Ok(_)) => {
                    let waited = started.elapsed();
                    tracing::info!(peer, attempts, ?waited, "node ready");
                    return Ok(waited);
                }
                Ok(Err(e)) if e.kind() == ErrorKind::Rpc => {
                    let waited = started.elapsed();
                    tracing::info!(peer, attempts, ?waited, "node ready (answered with rpc error: {e})");
                    return Ok(waited);
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer, attempts, "not ready: {e}");
                    last_error = e.to_string();
                }
                Err(_) => {
                    tracing::debug!(peer, attempts, "not ready: probe attempt timed out");
                    last_error = "probe attempt timed out".into();
                }
            }

            if Instant::now() + self.interval > deadline {
                return Err(LifecycleError::NotReady {
                    peer: peer.to_string(),
                    waited: started.elapsed(),
                    last_error,
                });
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
