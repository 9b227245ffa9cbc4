// =============================================================================
// Control Loop — periodic rebalance driver with cooperative cancellation
// =============================================================================
//
// On start: write runtime settings, start the bot supervisor, then repeat
// { rebalance_once; interruptible interval wait } until the stop flag rises.
// Any failure inside a tick is logged and surfaced as a warning; the loop
// never dies on its own. On stop: the interval wait aborts within a second,
// the bot supervisor is stopped, and the runtime settings are marked
// not-running.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bot::BotSupervisor;
use crate::config::AppConfig;
use crate::rebalance::RebalanceEngine;
use crate::state_files::{RuntimeSettings, RuntimeUnwind};
use crate::timeutil::unix_now;
use crate::types::Env;

pub struct RebalanceRunner {
    cfg: AppConfig,
    env: Env,
    state_dir: PathBuf,
    engine: Arc<RebalanceEngine>,
    bot: Arc<BotSupervisor>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RebalanceRunner {
    pub fn new(
        cfg: AppConfig,
        env: Env,
        state_dir: impl Into<PathBuf>,
        engine: Arc<RebalanceEngine>,
        bot: Arc<BotSupervisor>,
        stop: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            env,
            state_dir: state_dir.into(),
            engine,
            bot,
            stop,
            handle: Mutex::new(None),
        })
    }

    pub fn running(&self) -> bool {
        !self.stop.load(Ordering::SeqCst)
            && self
                .handle
                .lock()
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false)
    }

    /// Launch the loop worker. Returns false when it is already running.
    pub fn start(self: Arc<Self>) -> bool {
        if self.running() {
            return false;
        }
        self.stop.store(false, Ordering::SeqCst);
        let runner = self.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        *self.handle.lock() = Some(handle);
        true
    }

    /// Raise the stop flag; the loop observes it within a second.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Request stop and wait up to `timeout` for the loop to finish; the
    /// worker is abandoned past the deadline.
    pub async fn stop(&self, timeout: std::time::Duration) {
        self.request_stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("rebalance loop did not stop in time, abandoning");
            }
        }
    }

    fn write_settings(&self, running: bool) {
        let settings = RuntimeSettings {
            env: self.env.to_string(),
            pid: std::process::id(),
            running,
            trigger_value: self.cfg.trigger_value,
            unwind: RuntimeUnwind::from(&self.cfg.unwind),
            ts: unix_now(),
        };
        if let Err(e) = settings.save(&self.state_dir) {
            warn!(error = %e, "failed to write runtime settings");
        }
    }

    /// Interruptible wait in 1 s slices; returns true when stop was raised.
    async fn wait_interval(&self, secs: u64) -> bool {
        for _ in 0..secs.max(1) {
            if self.stop.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        self.stop.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>) {
        let trigger = self.cfg.trigger_value;
        let interval = self.cfg.rebalance_interval_sec;

        self.write_settings(true);
        let bot_status = self.bot.clone().start();
        info!(
            pid = std::process::id(),
            trigger = %trigger,
            interval_sec = interval,
            bot_started = bot_status.started,
            bot_reason = ?bot_status.reason,
            "rebalance loop started"
        );

        while !self.stop.load(Ordering::SeqCst) {
            let outcome = self.engine.rebalance_once(trigger).await;
            info!(
                action = %outcome.action,
                transfer = ?outcome.transfer_usdt,
                eq_a = %outcome.eq_a,
                eq_b = %outcome.eq_b,
                "rebalance tick"
            );

            if self.wait_interval(interval).await {
                break;
            }
        }

        info!(pid = std::process::id(), "rebalance loop stopped");
        self.bot.stop().await;
        self.write_settings(false);
    }
}

impl std::fmt::Debug for RebalanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceRunner")
            .field("env", &self.env)
            .field("running", &self.running())
            .finish()
    }
}
