//! ---
//! atelier_section: "05-operator-tooling"
//! atelier_subsection: "binary"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Operator CLI for publishing to and inspecting the Atelier bus."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use atelier_common::config::{AdapterMode, AppConfig};
use atelier_common::logging::init_tracing;
use atelier_pubsub::{connect_adapter, handler, PubSubAdapter, SharedAdapter};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value as JsonValue};
use tokio::signal;
use tracing::{debug, info, warn};

const DEFAULT_CONFIG_PATH: &str = "configs/atelier.toml";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Atelier pub/sub bus utility",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, global = true, help = "Override the adapter mode")]
    mode: Option<CliMode>,

    #[arg(long, global = true, help = "Override the broker URL")]
    url: Option<String>,

    #[arg(long, global = true, help = "Override the channel namespace")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Local,
    Distributed,
}

impl From<CliMode> for AdapterMode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Local => AdapterMode::Local,
            CliMode::Distributed => AdapterMode::Distributed,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Publish one JSON payload to a channel")]
    Publish {
        channel: String,
        #[arg(help = "JSON document, e.g. '{\"greeting\":\"hi\"}'")]
        payload: String,
        #[arg(long, help = "Sender id to stamp instead of this instance's id")]
        sender_id: Option<String>,
    },
    #[command(about = "Print received envelopes as JSON lines until interrupted")]
    Listen {
        target: String,
        #[arg(long, help = "Treat the target as a `*` pattern")]
        pattern: bool,
    },
    #[command(about = "Connect and report adapter readiness")]
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing("atelier-bus", &config.logging)?;
    info!(
        mode = %config.pubsub.mode,
        namespace = %config.pubsub.namespace,
        "configuration loaded"
    );

    let adapter = connect_adapter(&config.pubsub)
        .await
        .with_context(|| format!("unable to start {} adapter", config.pubsub.mode))?;

    let outcome = match cli.command {
        Commands::Publish {
            channel,
            payload,
            sender_id,
        } => publish(&adapter, &channel, &payload, sender_id.as_deref()).await,
        Commands::Listen { target, pattern } => listen(&adapter, &target, pattern).await,
        Commands::Check => {
            check(&adapter, &config);
            Ok(())
        }
    };

    adapter.close().await?;
    outcome
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        if !path.exists() {
            bail!("configuration file {} does not exist", path.display());
        }
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));

    let from_env = std::env::var_os(AppConfig::ENV_CONFIG_PATH).is_some();
    let mut config = if from_env || candidates.iter().any(|path| path.exists()) {
        let loaded = AppConfig::load_with_source(&candidates)?;
        debug!(source = %loaded.source.display(), "configuration file selected");
        loaded.config
    } else {
        AppConfig::default()
    };

    config.apply_env_overrides()?;
    if let Some(mode) = cli.mode {
        config.pubsub.mode = mode.into();
    }
    if let Some(url) = &cli.url {
        config.pubsub.url = Some(url.clone());
    }
    if let Some(namespace) = &cli.namespace {
        config.pubsub.namespace = namespace.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn publish(
    adapter: &SharedAdapter,
    channel: &str,
    payload: &str,
    sender_id: Option<&str>,
) -> Result<()> {
    let payload: JsonValue =
        serde_json::from_str(payload).context("payload must be a JSON document")?;
    adapter.publish(channel, payload, sender_id).await?;
    info!(channel, adapter = adapter.name(), "payload published");
    Ok(())
}

async fn listen(adapter: &SharedAdapter, target: &str, pattern: bool) -> Result<()> {
    let print = handler(|envelope| {
        println!("{}", serde_json::to_string(&envelope)?);
        Ok(())
    });
    if pattern {
        adapter.pattern_subscribe(target, print).await?;
    } else {
        adapter.subscribe(target, print).await?;
    }
    info!(target, pattern, "listening; press Ctrl-C to stop");
    shutdown_signal().await;
    info!("shutdown requested");
    Ok(())
}

fn check(adapter: &SharedAdapter, config: &AppConfig) {
    let report = json!({
        "adapter": adapter.name(),
        "instanceId": adapter.instance_id(),
        "ready": adapter.is_ready(),
        "mode": config.pubsub.mode.as_str(),
        "namespace": config.pubsub.namespace,
    });
    println!("{report}");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = signal::ctrl_c() => {},
        _ = terminate => {},
    }
}
