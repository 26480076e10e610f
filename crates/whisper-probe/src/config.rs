//! Configuration types for whisper-probe.
//! Parsed from ~/.whisper-probe/config.toml; every field has a default.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

use whisper_protocol::{Envelope, Topic, DEFAULT_POW_TARGET, DEFAULT_POW_TIME, DEFAULT_TTL};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub rpc: RpcSection,
    #[serde(default)]
    pub readiness: ReadinessSection,
    #[serde(default)]
    pub scenario: ScenarioSection,
    #[serde(default = "default_sender", deserialize_with = "sender_section")]
    pub sender: NodeSection,
    #[serde(default = "default_receiver", deserialize_with = "receiver_section")]
    pub receiver: NodeSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcSection {
    /// Per-request timeout (connect + send + body read).
    #[serde(default = "default_10")]
    pub timeout_secs: u64,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessSection {
    /// Lightweight method polled until the node answers.
    #[serde(default = "default_readiness_method")]
    pub method: String,
    #[serde(default = "default_15")]
    pub timeout_secs: u64,
    #[serde(default = "default_250")]
    pub interval_ms: u64,
}

impl Default for ReadinessSection {
    fn default() -> Self {
        Self {
            method: default_readiness_method(),
            timeout_secs: 15,
            interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSection {
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_payload")]
    pub payload: String,
    #[serde(default = "default_pow_target")]
    pub pow_target: f64,
    #[serde(default = "default_pow_time")]
    pub pow_time: u32,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    /// Upper bound on waiting for the posted message to reach the receiver.
    #[serde(default = "default_10")]
    pub delivery_timeout_secs: u64,
    #[serde(default = "default_500")]
    pub poll_interval_ms: u64,
}

impl Default for ScenarioSection {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            payload: default_payload(),
            pow_target: DEFAULT_POW_TARGET,
            pow_time: DEFAULT_POW_TIME,
            ttl: DEFAULT_TTL,
            delivery_timeout_secs: 10,
            poll_interval_ms: 500,
        }
    }
}

/// How to launch and reach one node.
///
/// Parsed through `NodeOverrides`, so a partial section keeps the
/// defaults of its role (port 8537 for the sender, 8536 for the receiver).
#[derive(Debug, Clone, Serialize)]
pub struct NodeSection {
    pub name: Option<String>,
    pub binary: String,
    /// Working directory for the child; relative binaries resolve against it.
    pub workdir: Option<String>,
    pub host: String,
    pub http_port: u16,
    pub port_flag: String,
    pub args: Vec<String>,
    /// Environment variable the node reads its account password from.
    pub secret_env: String,
    /// Only ever placed in the child's environment.
    pub secret: Option<String>,
}

/// A `[sender]`/`[receiver]` table as written; unset keys fall back to the role.
#[derive(Debug, Deserialize)]
struct NodeOverrides {
    name: Option<String>,
    binary: Option<String>,
    workdir: Option<String>,
    host: Option<String>,
    http_port: Option<u16>,
    port_flag: Option<String>,
    args: Option<Vec<String>>,
    secret_env: Option<String>,
    secret: Option<String>,
}

impl NodeOverrides {
    fn over(self, base: NodeSection) -> NodeSection {
        NodeSection {
            name: self.name.or(base.name),
            binary: self.binary.unwrap_or(base.binary),
            workdir: self.workdir.or(base.workdir),
            host: self.host.unwrap_or(base.host),
            http_port: self.http_port.unwrap_or(base.http_port),
            port_flag: self.port_flag.unwrap_or(base.port_flag),
            args: self.args.unwrap_or(base.args),
            secret_env: self.secret_env.unwrap_or(base.secret_env),
            secret: self.secret.or(base.secret),
        }
    }
}

fn sender_section<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NodeSection, D::Error> {
    Ok(NodeOverrides::deserialize(deserializer)?.over(default_sender()))
}

fn receiver_section<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<NodeSection, D::Error> {
    Ok(NodeOverrides::deserialize(deserializer)?.over(default_receiver()))
}

impl NodeSection {
    pub fn name_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(fallback)
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }

    /// Full argument list: the port flag first, then the extra args.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![format!("{}={}", self.port_flag, self.http_port)];
        args.extend(self.args.iter().cloned());
        args
    }
}

// Default value functions
fn default_sender() -> NodeSection {
    NodeSection {
        name: Some("node-a".into()),
        binary: default_binary(),
        workdir: None,
        host: default_host(),
        http_port: 8537,
        port_flag: default_port_flag(),
        args: default_args(),
        secret_env: default_secret_env(),
        secret: None,
    }
}
fn default_receiver() -> NodeSection {
    NodeSection {
        name: Some("node-b".into()),
        http_port: 8536,
        ..default_sender()
    }
}
fn default_binary() -> String {
    "./build/bin/wnode-status".into()
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port_flag() -> String {
    "-httpport".into()
}
fn default_args() -> Vec<String> {
    vec!["-http=true".into()]
}
fn default_secret_env() -> String {
    "ACCOUNT_PASSWORD".into()
}
fn default_readiness_method() -> String {
    "shh_version".into()
}
fn default_topic() -> String {
    "0xe00123a5".into()
}
fn default_payload() -> String {
    "sent before filter was active (symmetric)".into()
}
fn default_pow_target() -> f64 {
    DEFAULT_POW_TARGET
}
fn default_pow_time() -> u32 {
    DEFAULT_POW_TIME
}
fn default_ttl() -> u32 {
    DEFAULT_TTL
}
fn default_10() -> u64 {
    10
}
fn default_15() -> u64 {
    15
}
fn default_250() -> u64 {
    250
}
fn default_500() -> u64 {
    500
}

impl ProbeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ProbeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Checks the `call` and `ready` commands need: RPC and readiness timing.
    pub fn validate_rpc(&self) -> anyhow::Result<()> {
        if self.rpc.timeout_secs == 0 {
            anyhow::bail!("rpc.timeout_secs must be > 0");
        }
        if self.readiness.timeout_secs == 0 || self.readiness.interval_ms == 0 {
            anyhow::bail!("readiness timeout and interval must be > 0");
        }
        Ok(())
    }

    /// Reject configs the scenario cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_rpc()?;
        if self.sender.endpoint() == self.receiver.endpoint() {
            anyhow::bail!(
                "sender and receiver share endpoint {}",
                self.sender.endpoint()
            );
        }
        if self.scenario.delivery_timeout_secs == 0 || self.scenario.poll_interval_ms == 0 {
            anyhow::bail!("scenario delivery timeout and poll interval must be > 0");
        }
        self.scenario.envelope()?;
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.timeout_secs)
    }
}

impl ScenarioSection {
    /// The message the scenario posts.
    pub fn envelope(&self) -> anyhow::Result<Envelope> {
        let topic: Topic = self
            .topic
            .parse()
            .map_err(|e| anyhow::anyhow!("scenario.topic {:?}: {e}", self.topic))?;
        Ok(Envelope::new(topic, self.payload.as_bytes().to_vec())
            .with_pow(self.pow_target, self.pow_time)
            .with_ttl(self.ttl))
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            rpc: RpcSection::default(),
            readiness: ReadinessSection::default(),
            scenario: ScenarioSection::default(),
            sender: default_sender(),
            receiver: default_receiver(),
        }
    }
}
