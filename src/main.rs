// =============================================================================
// grvt-sentinel — hedged-pair rebalance & unwind control plane
// =============================================================================
//
// Keeps two GRVT sub-accounts solvent and equity-balanced: a periodic loop
// sweeps funding wallets, equalises equity through the three-hop transfer
// chain, and de-risks both legs of the hedge with reduce-only orders when
// margin stress crosses the configured threshold. A Telegram bot serves the
// operator's status view.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod bot;
mod config;
mod flow;
mod grvt;
mod rebalance;
mod retry;
mod runner;
mod snapshot;
mod state_files;
mod telegram;
#[cfg(test)]
mod testing;
mod timeutil;
mod types;
mod unwind;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::AlertSink;
use crate::bot::BotSupervisor;
use crate::config::ConfigRepository;
use crate::grvt::client::GrvtAccount;
use crate::rebalance::RebalanceEngine;
use crate::runner::RebalanceRunner;
use crate::snapshot::SnapshotBus;
use crate::telegram::TelegramClient;
use crate::types::AccountSide;
use crate::unwind::UnwindEngine;

#[derive(Parser)]
#[command(name = "grvt-sentinel", about = "Hedged-pair rebalance and unwind control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rebalance loop and the Telegram bot until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run => run().await,
    }
}

async fn run() -> anyhow::Result<()> {
    let repo = ConfigRepository::new();
    let env = repo.env();
    let cfg = repo.base();
    let state_dir = repo.state_dir().to_path_buf();

    info!(
        env = %env,
        trigger = %cfg.trigger_value,
        interval_sec = cfg.rebalance_interval_sec,
        unwind_enabled = cfg.unwind.enabled,
        unwind_dry_run = cfg.unwind.dry_run,
        state_dir = %state_dir.display(),
        "grvt-sentinel starting"
    );

    // Credentials are required up front; a misconfigured account must fail
    // the process, not a tick.
    let (creds_a, creds_b) = repo.accounts();
    creds_a.validate("A")?;
    creds_b.validate("B")?;

    let telegram = TelegramClient::from_env();
    if telegram.is_none() {
        warn!("TELEGRAM_BOT_TOKEN not set, alerts and bot commands are disabled");
    }

    let alerts = Arc::new(AlertSink::new(&state_dir, telegram.clone()));
    let snapshot = Arc::new(SnapshotBus::new());
    let stop = Arc::new(AtomicBool::new(false));

    let account_a = GrvtAccount::connect(AccountSide::A, creds_a, env, alerts.clone());
    let account_b = GrvtAccount::connect(AccountSide::B, creds_b, env, alerts.clone());

    let unwind = UnwindEngine::new(
        cfg.unwind.clone(),
        env,
        alerts.clone(),
        snapshot.clone(),
        stop.clone(),
    );
    let engine = Arc::new(RebalanceEngine::new(
        cfg.clone(),
        env,
        account_a,
        account_b,
        alerts.clone(),
        snapshot.clone(),
        unwind,
    ));
    let bot = BotSupervisor::new(&state_dir, env, cfg.clone(), telegram, snapshot.clone());
    let runner = RebalanceRunner::new(cfg, env, &state_dir, engine, bot, stop);

    runner.clone().start();
    info!("all workers running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping");
    runner.stop(std::time::Duration::from_secs(10)).await;

    info!("grvt-sentinel shut down complete");
    Ok(())
}
