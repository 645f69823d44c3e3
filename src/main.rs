//! VoxBridge CLI
//!
//! Runs the bridge for every enabled account, or inspects the resolved
//! configuration. The `run` subcommand wires the built-in echo agent;
//! embedders that want a real back-end use the library and implement
//! [`voxbridge::AgentClient`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use voxbridge::bridge::{AgentBridge, EchoAgent};
use voxbridge::config::{BridgeConfig, ChannelConfig};
use voxbridge::monitor::{ChannelMonitor, WatchSink};
use voxbridge::session::SessionStore;

#[derive(Parser)]
#[command(name = "voxbridge")]
#[command(version)]
#[command(about = "FortiVoice-to-agent bridge")]
struct Cli {
    /// Configuration file path (.json)
    #[arg(short, long, env = "VOXBRIDGE_CONFIG", default_value = "voxbridge.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and run the bridge for every enabled account
    Run {
        /// Run a single account instead of all configured ones
        #[arg(long)]
        account: Option<String>,
    },
    /// List resolved accounts with their enabled/configured state
    Accounts,
    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
            }),
        )
        .init();

    let config = BridgeConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let channel = config.fortivoice();

    match cli.command {
        Commands::Run { account } => run(channel, account).await,
        Commands::Accounts => accounts(&channel),
        Commands::Check => check(&channel),
    }
}

async fn run(channel: ChannelConfig, only: Option<String>) -> Result<()> {
    let store = Arc::new(SessionStore::new());
    let mut handles = Vec::new();

    let ids = match only {
        Some(id) => vec![id],
        None => channel.list_account_ids(),
    };

    for id in ids {
        let account = channel.resolve_account(Some(&id));
        if !account.enabled {
            tracing::info!(account = %account.account_id, "account disabled, skipping");
            continue;
        }
        if !account.configured {
            // Fatal for this account; never dial without a url and phone.
            tracing::error!(
                account = %account.account_id,
                "account is missing a valid url or phone, not connecting"
            );
            continue;
        }

        let sessions = store.account(&account.account_id);
        let bridge = Arc::new(AgentBridge::new(
            account.account_id.clone(),
            account.markdown.clone(),
            Arc::new(EchoAgent),
            sessions.clone(),
        ));
        let (sink, _status_rx) = WatchSink::new();
        let monitor = ChannelMonitor::new(account, sessions, bridge, sink)?;
        handles.push(monitor.spawn());
    }

    if handles.is_empty() {
        anyhow::bail!("no account is enabled and configured");
    }

    tracing::warn!("no agent back-end wired; replies come from the built-in echo agent");
    tracing::info!(accounts = handles.len(), "bridge running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");

    for handle in &handles {
        handle.stop();
    }
    for handle in handles {
        handle.stopped().await;
    }
    Ok(())
}

fn accounts(channel: &ChannelConfig) -> Result<()> {
    for id in channel.list_account_ids() {
        let account = channel.resolve_account(Some(&id));
        println!(
            "{}  enabled={} configured={} url={} phone={}",
            account.account_id,
            account.enabled,
            account.configured,
            account.url.as_deref().unwrap_or("-"),
            account.phone.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn check(channel: &ChannelConfig) -> Result<()> {
    let default = channel.resolve_account(None);
    if !default.configured {
        anyhow::bail!(
            "default account {} is not configured (valid url and phone required)",
            default.account_id
        );
    }
    println!("configuration ok: default account {}", default.account_id);
    Ok(())
}
