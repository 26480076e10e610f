//! Two-node publish/subscribe scenario.
//!
//! Sender creates a key, the receiver installs its material, registers a
//! filter, the sender posts, the receiver polls until the message shows up
//! or the delivery bound runs out. Teardown always runs.

use std::time::Duration;

use tokio::time::Instant;
use whisper_client::{ClientError, WhisperClient};
use whisper_protocol::{Envelope, FilterId, PostAck, ReceivedMessage, SymKeyId};

use crate::config::ProbeConfig;
use crate::peer::{LifecycleError, Peer, Termination};
use crate::readiness::ReadinessProbe;

/// Scenario stage, reported with every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    StartNodes,
    CreateKey,
    FetchKey,
    InstallKey,
    RegisterFilter,
    PostMessage,
    AwaitDelivery,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::StartNodes => "start-nodes",
            Step::CreateKey => "create-key",
            Step::FetchKey => "fetch-key",
            Step::InstallKey => "install-key",
            Step::RegisterFilter => "register-filter",
            Step::PostMessage => "post-message",
            Step::AwaitDelivery => "await-delivery",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("{step}: {source}")]
    Lifecycle {
        step: Step,
        #[source]
        source: LifecycleError,
    },
    #[error("{step}: {source}")]
    Client {
        step: Step,
        #[source]
        source: ClientError,
    },
    #[error("post-message: {peer} did not accept the message ({ack:?})")]
    NotAccepted { peer: String, ack: PostAck },
    #[error("await-delivery: no matching message after {waited:?} ({polls} polls)")]
    NotDelivered { waited: Duration, polls: u32 },
}

impl ScenarioError {
    pub fn step(&self) -> Step {
        match self {
            ScenarioError::Lifecycle { step, .. } | ScenarioError::Client { step, .. } => *step,
            ScenarioError::NotAccepted { .. } => Step::PostMessage,
            ScenarioError::NotDelivered { .. } => Step::AwaitDelivery,
        }
    }
}

fn at(step: Step) -> impl FnOnce(ClientError) -> ScenarioError {
    move |source| ScenarioError::Client { step, source }
}

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct ScenarioSettings {
    pub envelope: Envelope,
    pub delivery_timeout: Duration,
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
    pub readiness: ReadinessProbe,
}

impl ScenarioSettings {
    pub fn from_config(cfg: &ProbeConfig) -> anyhow::Result<Self> {
        Ok(Self {
            envelope: cfg.scenario.envelope()?,
            delivery_timeout: cfg.scenario.delivery_timeout(),
            poll_interval: cfg.scenario.poll_interval(),
            rpc_timeout: cfg.rpc_timeout(),
            readiness: ReadinessProbe::from_config(cfg),
        })
    }
}

/// Key handles for the same material on both nodes. Never equal by assumption.
#[derive(Debug, Clone)]
pub struct KeyExchange {
    pub sender_key: SymKeyId,
    pub receiver_key: SymKeyId,
}

/// A matching message found by polling.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: ReceivedMessage,
    pub polls: u32,
    pub waited: Duration,
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub keys: KeyExchange,
    pub filter: FilterId,
    pub ack: PostAck,
    pub delivery: Delivery,
}

/// Scenario result plus both teardown reports. Lifecycle trouble in
/// teardown is reported here and never replaces `result`.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub result: Result<DeliveryReport, ScenarioError>,
    pub terminations: Vec<Result<Termination, LifecycleError>>,
}

impl ScenarioOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// True when every peer was reaped without a lifecycle failure.
    pub fn clean_teardown(&self) -> bool {
        self.terminations.iter().all(|t| match t {
            Ok(t) => t.exit.is_clean() && t.kill_error.is_none(),
            Err(_) => false,
        })
    }
}

/// Run the full scenario, teardown included.
pub async fn run_pubsub<S: Peer, R: Peer>(
    sender: &mut S,
    receiver: &mut R,
    settings: &ScenarioSettings,
) -> ScenarioOutcome {
    let result = drive(sender, receiver, settings).await;
    match &result {
        Ok(report) => tracing::info!(
            polls = report.delivery.polls,
            waited = ?report.delivery.waited,
            "message delivered"
        ),
        Err(e) => tracing::error!(step = %e.step(), "scenario failed: {e}"),
    }
    let terminations = teardown(sender, receiver).await;
    ScenarioOutcome {
        result,
        terminations,
    }
}

async fn drive<S: Peer, R: Peer>(
    sender: &mut S,
    receiver: &mut R,
    settings: &ScenarioSettings,
) -> Result<DeliveryReport, ScenarioError> {
    let lifecycle = |source| ScenarioError::Lifecycle {
        step: Step::StartNodes,
        source,
    };

    sender.start().await.map_err(lifecycle)?;
    receiver.start().await.map_err(lifecycle)?;
    tokio::try_join!(
        sender.wait_ready(&settings.readiness),
        receiver.wait_ready(&settings.readiness)
    )
    .map_err(lifecycle)?;

    let a = WhisperClient::new(sender.endpoint(), settings.rpc_timeout)
        .map_err(at(Step::StartNodes))?;
    let b = WhisperClient::new(receiver.endpoint(), settings.rpc_timeout)
        .map_err(at(Step::StartNodes))?;

    let keys = exchange_key(&a, &b).await?;

    let topic = settings.envelope.topic;
    let filter = b
        .register_filter(&keys.receiver_key, &[topic])
        .await
        .map_err(at(Step::RegisterFilter))?;
    tracing::info!(peer = receiver.name(), %filter, %topic, "filter registered");

    let ack = a
        .post_message(&keys.sender_key, &settings.envelope)
        .await
        .map_err(at(Step::PostMessage))?;
    if !ack.accepted() {
        return Err(ScenarioError::NotAccepted {
            peer: sender.name().to_string(),
            ack,
        });
    }
    tracing::info!(peer = sender.name(), ?ack, "message posted");

    let delivery = await_delivery(
        &b,
        &filter,
        &settings.envelope,
        settings.delivery_timeout,
        settings.poll_interval,
    )
    .await?;

    Ok(DeliveryReport {
        keys,
        filter,
        ack,
        delivery,
    })
}

/// Create a key on `sender` and install its material on `receiver`.
pub async fn exchange_key(
    sender: &WhisperClient,
    receiver: &WhisperClient,
) -> Result<KeyExchange, ScenarioError> {
    let sender_key = sender.create_sym_key().await.map_err(at(Step::CreateKey))?;
    let material = sender
        .fetch_sym_key(&sender_key)
        .await
        .map_err(at(Step::FetchKey))?;
    let receiver_key = receiver
        .install_sym_key(&material)
        .await
        .map_err(at(Step::InstallKey))?;

    tracing::info!(%sender_key, %receiver_key, "symmetric key exchanged");
    Ok(KeyExchange {
        sender_key,
        receiver_key,
    })
}

/// Poll `filter` until a message matching `envelope` arrives or `timeout`
/// passes. Empty polls are normal; an RPC failure ends the wait.
pub async fn await_delivery(
    client: &WhisperClient,
    filter: &FilterId,
    envelope: &Envelope,
    timeout: Duration,
    interval: Duration,
) -> Result<Delivery, ScenarioError> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut polls = 0u32;

    loop {
        let messages = client
            .poll_filter(filter)
            .await
            .map_err(at(Step::AwaitDelivery))?;
        polls += 1;

        let unrelated = messages.len();
        if let Some(message) = messages.into_iter().find(|m| m.matches(envelope)) {
            return Ok(Delivery {
                message,
                polls,
                waited: started.elapsed(),
            });
        }
        if unrelated > 0 {
            tracing::debug!(%filter, unrelated, "poll returned non-matching messages");
        }

        if Instant::now() + interval > deadline {
            return Err(ScenarioError::NotDelivered {
                waited: started.elapsed(),
                polls,
            });
        }
        tokio::time::sleep(interval).await;
    }
}

/// Signal both peers, then reap both. Failures are logged, not raised.
pub async fn teardown<S: Peer, R: Peer>(
    sender: &mut S,
    receiver: &mut R,
) -> Vec<Result<Termination, LifecycleError>> {
    sender.shutdown();
    receiver.shutdown();
    let (a, b) = tokio::join!(sender.terminated(), receiver.terminated());

    for t in [&a, &b] {
        match t {
            Ok(t) => {
                if let Some(e) = &t.kill_error {
                    tracing::warn!(peer = %t.peer, "kill failed during teardown: {e}");
                }
                if !t.exit.is_clean() {
                    tracing::warn!(peer = %t.peer, exit = ?t.exit, "peer ended uncleanly");
                }
            }
            Err(e) => tracing::warn!("teardown: {e}"),
        }
    }
    vec![a, b]
}
