// =============================================================================
// Bot Supervisor — Telegram long-poll worker, watchdog, single-instance lock
// =============================================================================
//
// Commands: /start (menu keyboard), /view | view | 查看 (status text), plus
// the `view_noop` inline-button callback. The status text is composed from
// the snapshot bus and the runtime settings file — the bot never calls the
// exchange.
//
// One polling worker per state directory, enforced by an exclusive pid lock
// file. A watchdog restarts the worker when it dies or its heartbeat goes
// stale. The heartbeat file doubles as the stale-lock detector for takeover
// after a crash.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::snapshot::{SnapshotBus, StatusSnapshot, UnwindProgress};
use crate::state_files::{BotState, RuntimeSettings};
use crate::telegram::{menu_keyboard, TelegramClient, Update};
use crate::timeutil::{fmt_usd, now_sh, unix_now};
use crate::types::Env;

/// Heartbeat older than this marks the polling worker as stale.
const HEARTBEAT_STALE_SECS: f64 = 60.0;
/// Watchdog cadence.
const WATCHDOG_INTERVAL_SECS: u64 = 30;
/// A lock whose owner's heartbeat is older than this may be taken over.
const LOCK_STALE_SECS: f64 = 30.0;
/// Pause between stopping a stale worker and relaunching it.
const RESTART_DELAY_SECS: u64 = 3;
/// Backoff after a failed long-poll.
const POLL_ERROR_BACKOFF_SECS: u64 = 5;

/// Result of a start attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotStartStatus {
    pub started: bool,
    pub reason: Option<&'static str>,
}

pub struct BotSupervisor {
    state_dir: PathBuf,
    env: Env,
    cfg: AppConfig,
    telegram: Option<TelegramClient>,
    snapshot: Arc<SnapshotBus>,
    stop_polling: Arc<AtomicBool>,
    stop_watchdog: Arc<AtomicBool>,
    polling_handle: Mutex<Option<JoinHandle<()>>>,
    watchdog_handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    lock_held: AtomicBool,
}

impl BotSupervisor {
    pub fn new(
        state_dir: impl Into<PathBuf>,
        env: Env,
        cfg: AppConfig,
        telegram: Option<TelegramClient>,
        snapshot: Arc<SnapshotBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state_dir: state_dir.into(),
            env,
            cfg,
            telegram,
            snapshot,
            stop_polling: Arc::new(AtomicBool::new(false)),
            stop_watchdog: Arc::new(AtomicBool::new(false)),
            polling_handle: Mutex::new(None),
            watchdog_handle: Mutex::new(None),
            started: AtomicBool::new(false),
            lock_held: AtomicBool::new(false),
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Acquire the lock and launch the polling worker and watchdog. A second
    /// call while running is a no-op reporting `already_started`.
    pub fn start(self: Arc<Self>) -> BotStartStatus {
        if self.telegram.is_none() {
            warn!("telegram bot token not configured, bot supervisor disabled");
            return BotStartStatus {
                started: false,
                reason: Some("no_token"),
            };
        }
        if self.started.swap(true, Ordering::SeqCst) {
            info!("bot supervisor already started");
            return BotStartStatus {
                started: false,
                reason: Some("already_started"),
            };
        }

        if !self.try_lock_with_takeover() {
            info!("bot lock exists, supervisor not started");
            return BotStartStatus {
                started: false,
                reason: Some("lock_exists"),
            };
        }

        self.stop_polling.store(false, Ordering::SeqCst);
        self.stop_watchdog.store(false, Ordering::SeqCst);
        Self::spawn_polling(&self);

        let watchdog = {
            let sup = self.clone();
            tokio::spawn(async move { sup.watchdog_worker().await })
        };
        *self.watchdog_handle.lock() = Some(watchdog);

        info!(state_dir = %self.state_dir.display(), "bot supervisor started");
        BotStartStatus {
            started: true,
            reason: None,
        }
    }

    /// Signal both workers to stop and wait up to 5 s for each.
    pub async fn stop(&self) {
        self.stop_watchdog.store(true, Ordering::SeqCst);
        self.stop_polling.store(true, Ordering::SeqCst);

        let watchdog = self.watchdog_handle.lock().take();
        let polling = self.polling_handle.lock().take();
        for handle in [watchdog, polling].into_iter().flatten() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        }

        self.started.store(false, Ordering::SeqCst);
        self.release_lock();
        info!("bot supervisor stopped");
    }

    fn spawn_polling(sup: &Arc<Self>) {
        let worker = sup.clone();
        let handle = tokio::spawn(async move { worker.polling_worker().await });
        *sup.polling_handle.lock() = Some(handle);
    }

    // -------------------------------------------------------------------------
    // Single-instance lock
    // -------------------------------------------------------------------------

    fn lock_path(&self) -> PathBuf {
        self.state_dir.join(".botlock")
    }

    /// Exclusive create-if-absent; the pid content is diagnostic only.
    pub fn acquire_lock(&self) -> bool {
        if std::fs::create_dir_all(&self.state_dir).is_err() {
            return false;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path())
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = write!(file, "{}", std::process::id());
                self.lock_held.store(true, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    /// Acquire the lock, removing it first when its owner's heartbeat is
    /// stale (crashed process left it behind).
    pub fn try_lock_with_takeover(&self) -> bool {
        if self.acquire_lock() {
            return true;
        }
        if BotState::load(&self.state_dir).heartbeat_stale(LOCK_STALE_SECS) {
            warn!("stale bot lock detected, taking over");
            let _ = std::fs::remove_file(self.lock_path());
            return self.acquire_lock();
        }
        false
    }

    /// Remove the lock file, but only if this process wrote it.
    pub fn release_lock(&self) {
        if !self.lock_held.swap(false, Ordering::SeqCst) {
            return;
        }
        let path = self.lock_path();
        if let Ok(content) = std::fs::read_to_string(&path) {
            if content.trim() == std::process::id().to_string() {
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Polling worker
    // -------------------------------------------------------------------------

    fn allowed_chat_id() -> Option<String> {
        std::env::var("TELEGRAM_CHAT_ID")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn resolved_chat_id(&self) -> Option<String> {
        Self::allowed_chat_id().or_else(|| BotState::load(&self.state_dir).chat_id)
    }

    fn save_chat_id(&self, chat_id: i64) {
        let chat_id = chat_id.to_string();
        if let Some(allowed) = Self::allowed_chat_id() {
            if chat_id != allowed {
                return;
            }
        }
        let mut state = BotState::load(&self.state_dir);
        state.chat_id = Some(chat_id);
        if let Err(e) = state.save(&self.state_dir) {
            warn!(error = %e, "failed to persist chat id");
        }
    }

    fn write_heartbeat(&self) {
        let mut state = BotState::load(&self.state_dir);
        state.heartbeat_ts = Some(unix_now());
        if state.chat_id.is_none() {
            state.chat_id = self.resolved_chat_id();
        }
        if let Err(e) = state.save(&self.state_dir) {
            warn!(error = %e, "failed to write bot heartbeat");
        }
    }

    /// Sleep `secs` in 1 s slices; returns true when `flag` was raised.
    async fn sleep_unless(flag: &AtomicBool, secs: u64) -> bool {
        for _ in 0..secs {
            if flag.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        flag.load(Ordering::SeqCst)
    }

    async fn polling_worker(self: Arc<Self>) {
        let Some(telegram) = self.telegram.clone() else {
            return;
        };
        info!("bot polling worker started");
        if let Err(e) = telegram.delete_webhook().await {
            warn!(error = %e, "deleteWebhook failed");
        }
        self.write_heartbeat();

        let mut offset: Option<i64> = None;
        while !self.stop_polling.load(Ordering::SeqCst) {
            let updates = match telegram.get_updates(offset).await {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "getUpdates failed, backing off");
                    if Self::sleep_unless(&self.stop_polling, POLL_ERROR_BACKOFF_SECS).await {
                        break;
                    }
                    continue;
                }
            };

            for update in updates {
                if update.update_id > 0 {
                    let next = update.update_id + 1;
                    offset = Some(offset.map_or(next, |o| o.max(next)));
                }
                self.handle_update(&telegram, update).await;
            }

            self.write_heartbeat();
            if Self::sleep_unless(&self.stop_polling, 1).await {
                break;
            }
        }
        info!("bot polling worker stopped");
    }

    async fn handle_update(&self, telegram: &TelegramClient, update: Update) {
        let allowed = Self::allowed_chat_id();

        if let Some(message) = update.message {
            let Some(chat_id) = message.chat.as_ref().map(|c| c.id) else {
                return;
            };
            if let Some(allowed) = &allowed {
                if chat_id.to_string() != *allowed {
                    return;
                }
            }
            self.save_chat_id(chat_id);

            let chat = chat_id.to_string();
            let text = message.text.unwrap_or_default();
            let trimmed = text.trim();
            if trimmed == "/start" {
                let _ = telegram
                    .send_message(Some(&chat), "ok", Some(menu_keyboard()))
                    .await;
            } else if trimmed.eq_ignore_ascii_case("/view")
                || trimmed.eq_ignore_ascii_case("view")
                || trimmed == "查看"
            {
                let status = self.compose_status();
                let sent = telegram
                    .send_message(Some(&chat), &status, Some(menu_keyboard()))
                    .await;
                info!(target: "alerts", text_cmd = "view", sent = sent.unwrap_or(false));
            }
        }

        if let Some(callback) = update.callback_query {
            let chat_id = callback
                .message
                .as_ref()
                .and_then(|m| m.chat.as_ref())
                .map(|c| c.id);
            let Some(chat_id) = chat_id else { return };
            if let Some(allowed) = &allowed {
                if chat_id.to_string() != *allowed {
                    return;
                }
            }
            self.save_chat_id(chat_id);

            if callback.data.as_deref() == Some("view_noop") {
                let status = self.compose_status();
                let sent = telegram
                    .send_message(Some(&chat_id.to_string()), &status, Some(menu_keyboard()))
                    .await
                    .unwrap_or(false);
                let _ = telegram
                    .answer_callback_query(&callback.id, Some(if sent { "sent" } else { "failed" }))
                    .await;
                info!(target: "alerts", callback = "view_noop", sent);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Watchdog
    // -------------------------------------------------------------------------

    async fn watchdog_worker(self: Arc<Self>) {
        info!(
            interval_secs = WATCHDOG_INTERVAL_SECS,
            stale_secs = HEARTBEAT_STALE_SECS,
            "bot watchdog started"
        );
        loop {
            if Self::sleep_unless(&self.stop_watchdog, WATCHDOG_INTERVAL_SECS).await {
                break;
            }

            let dead = self
                .polling_handle
                .lock()
                .as_ref()
                .map(|h| h.is_finished())
                .unwrap_or(true);
            if dead {
                warn!("polling worker dead, restarting");
                self.stop_polling.store(false, Ordering::SeqCst);
                Self::spawn_polling(&self);
                continue;
            }

            if BotState::load(&self.state_dir).heartbeat_stale(HEARTBEAT_STALE_SECS) {
                warn!("polling heartbeat stale, restarting worker");
                self.stop_polling.store(true, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_secs(RESTART_DELAY_SECS)).await;
                self.stop_polling.store(false, Ordering::SeqCst);
                Self::spawn_polling(&self);
            }
        }
        info!("bot watchdog stopped");
    }

    // -------------------------------------------------------------------------
    // Status composition
    // -------------------------------------------------------------------------

    /// Compose the status text for the view command from the freshest data
    /// available in-process.
    pub fn compose_status(&self) -> String {
        let Some(status) = self.snapshot.last_status() else {
            return format!("📊 {} 暂无检查数据，请稍后再试", now_sh());
        };
        let now_str = self
            .snapshot
            .last_check_time()
            .unwrap_or_else(|| status.event_time_sh.clone());
        let progress = self.snapshot.unwind_progress();

        // Unwind thresholds: live progress first, then the runtime settings
        // of the running loop, then this process's own config.
        let thresholds = progress
            .as_ref()
            .filter(|p| p.trigger_pct > Decimal::ZERO || p.recovery_pct > Decimal::ZERO)
            .map(|p| (p.trigger_pct, p.recovery_pct))
            .or_else(|| {
                RuntimeSettings::load(&self.state_dir, &self.env.to_string())
                    .filter(|rs| rs.unwind.enabled)
                    .map(|rs| (rs.unwind.trigger_pct, rs.unwind.recovery_pct))
            })
            .or_else(|| {
                self.cfg
                    .unwind
                    .enabled
                    .then(|| (self.cfg.unwind.trigger_pct, self.cfg.unwind.recovery_pct))
            });

        format_status(&now_str, &status, thresholds, progress.as_ref())
    }
}

impl std::fmt::Debug for BotSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotSupervisor")
            .field("state_dir", &self.state_dir)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

/// Margin-use display: "N/A" without equity, "0.0%" without margin.
fn margin_pct_display(eq: Decimal, mm: Decimal) -> String {
    if eq <= Decimal::ZERO {
        return "N/A".to_string();
    }
    if mm <= Decimal::ZERO {
        return "0.0%".to_string();
    }
    format!("{:.1}%", mm / eq * Decimal::ONE_HUNDRED)
}

fn avail_pct_display(eq: Decimal, avail: Decimal) -> String {
    if eq <= Decimal::ZERO {
        return "N/A".to_string();
    }
    format!("{:.1}%", avail / eq * Decimal::ONE_HUNDRED)
}

/// Render the status text. `thresholds` appends the unwind footer;
/// an in-progress `progress` injects a banner after the first line.
pub fn format_status(
    now_str: &str,
    status: &StatusSnapshot,
    thresholds: Option<(Decimal, Decimal)>,
    progress: Option<&UnwindProgress>,
) -> String {
    let mut text = format!(
        "📊 上次检查时间 @ {}\n━━━━━━━━━━━━━━━━━━\n触发转账阈值: ${} | 账户差额: ${}\n总余额: ${}\n━━━━━━━━━━━━━━━━━━\n账户A: {} 保证金使用率\n  余额=${} | 可用金额={}\n账户B: {} 保证金使用率\n  余额=${} | 可用金额={}",
        now_str,
        fmt_usd(status.trigger),
        fmt_usd(status.delta),
        fmt_usd(status.eq_a + status.eq_b),
        margin_pct_display(status.eq_a, status.mm_a),
        fmt_usd(status.eq_a),
        avail_pct_display(status.eq_a, status.avail_a),
        margin_pct_display(status.eq_b, status.mm_b),
        fmt_usd(status.eq_b),
        avail_pct_display(status.eq_b, status.avail_b),
    );

    if let Some((trigger_pct, recovery_pct)) = thresholds {
        text.push_str(&format!(
            "\n━━━━━━━━━━━━━━━━━━\n紧急减仓触发: ≥{trigger_pct:.0}% | 紧急减仓停止: <{recovery_pct:.0}%"
        ));
    }

    if let Some(progress) = progress.filter(|p| p.in_progress) {
        let banner = format!(
            "🛠 正在紧急减仓中（第 {} 轮） A保证金使用率={:.1}% | B保证金使用率={:.1}%",
            progress.iteration, progress.pct_a, progress.pct_b,
        );
        let mut lines: Vec<&str> = text.split('\n').collect();
        lines.insert(1, &banner);
        return lines.join("\n");
    }

    text
}
