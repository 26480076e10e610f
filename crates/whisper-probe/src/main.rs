//! Whisper Probe -- two-node publish/subscribe check for shh_* nodes.
//!
//! Usage:
//!   whisper-probe                          # Run the scenario with default config
//!   whisper-probe --config path.toml run   # Run with custom config
//!   whisper-probe call URL METHOD [PARAMS] # One raw JSON-RPC call
//!   whisper-probe ready URL                # Wait for a node to answer

use clap::{Parser, Subcommand};

use whisper_client::WhisperClient;
use whisper_probe::config::ProbeConfig;
use whisper_probe::scenario::{run_pubsub, ScenarioOutcome, ScenarioSettings};
use whisper_probe::{expand_tilde, ReadinessProbe, SubprocessPeer};

#[derive(Parser)]
#[command(name = "whisper-probe", about = "Two-node Whisper pub/sub harness")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.whisper-probe/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch both nodes and run the scenario (default)
    Run,
    /// Send one JSON-RPC request and print the result
    Call {
        /// Node endpoint, e.g. http://127.0.0.1:8537
        endpoint: String,
        /// Method name, e.g. shh_version
        method: String,
        /// Params as a JSON array
        #[arg(default_value = "[]")]
        params: String,
    },
    /// Poll an endpoint until it answers or the readiness timeout passes
    Ready {
        endpoint: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper_probe=info,whisper_client=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = ProbeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => {
            let outcome = run_scenario(&cfg).await?;
            print_summary(&outcome);
            if !outcome.is_success() {
                std::process::exit(1);
            }
        }
        Some(Commands::Call {
            endpoint,
            method,
            params,
        }) => {
            cfg.validate_rpc()?;
            cli_rpc_call(&cfg, endpoint, &method, &params).await?;
        }
        Some(Commands::Ready { endpoint }) => {
            cfg.validate_rpc()?;
            let probe = ReadinessProbe::from_config(&cfg);
            let client = WhisperClient::new(endpoint, cfg.rpc_timeout())?;
            match probe.wait(client.endpoint(), &client).await {
                Ok(waited) => println!("ready after {}ms", waited.as_millis()),
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
        }
        Some(Commands::Config) => {
            let mut shown = cfg.clone();
            for node in [&mut shown.sender, &mut shown.receiver] {
                if node.secret.is_some() {
                    node.secret = Some("<redacted>".into());
                }
            }
            print!("{}", toml::to_string_pretty(&shown)?);
        }
    }

    Ok(())
}

async fn run_scenario(cfg: &ProbeConfig) -> anyhow::Result<ScenarioOutcome> {
    cfg.validate()?;
    let settings = ScenarioSettings::from_config(cfg)?;

    let mut sender = SubprocessPeer::from_config(&cfg.sender, "node-a");
    let mut receiver = SubprocessPeer::from_config(&cfg.receiver, "node-b");

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        sender = %cfg.sender.endpoint(),
        receiver = %cfg.receiver.endpoint(),
        topic = %settings.envelope.topic,
        delivery_timeout = ?settings.delivery_timeout,
        "starting whisper-probe"
    );
    if cfg.sender.secret.is_none() || cfg.receiver.secret.is_none() {
        tracing::warn!("no node secret configured; nodes may prompt or refuse to start");
    }

    Ok(run_pubsub(&mut sender, &mut receiver, &settings).await)
}

fn print_summary(outcome: &ScenarioOutcome) {
    match &outcome.result {
        Ok(report) => {
            println!("delivered");
            println!("  sender key:   {}", report.keys.sender_key);
            println!("  receiver key: {}", report.keys.receiver_key);
            println!("  filter:       {}", report.filter);
            println!(
                "  payload:      {}",
                String::from_utf8_lossy(&report.delivery.message.payload)
            );
            println!(
                "  waited:       {}ms over {} polls",
                report.delivery.waited.as_millis(),
                report.delivery.polls
            );
        }
        Err(e) => {
            println!("FAILED at {}", e.step());
            println!("  {e}");
        }
    }

    for t in &outcome.terminations {
        match t {
            Ok(t) => {
                println!("{}: {}", t.peer, t.exit);
                if !outcome.is_success() {
                    for line in t.stderr.iter().rev().take(10).rev() {
                        println!("  | {line}");
                    }
                }
            }
            Err(e) => println!("teardown: {e}"),
        }
    }
}

/// One raw JSON-RPC call; prints the result, or the RPC error and exits 1.
async fn cli_rpc_call(
    cfg: &ProbeConfig,
    endpoint: String,
    method: &str,
    params: &str,
) -> anyhow::Result<()> {
    let params: serde_json::Value = serde_json::from_str(params)
        .map_err(|e| anyhow::anyhow!("params must be JSON: {e}"))?;
    let client = WhisperClient::new(endpoint, cfg.rpc_timeout())?;

    match client.call_raw(method, params).await {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error ({:?}): {e}", e.kind());
            std::process::exit(1);
        }
    }
}
