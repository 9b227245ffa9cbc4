// =============================================================================
// Alert Sink — typed user-facing events with suppression & rate limiting
// =============================================================================
//
// Delivery policy:
//   rebalance_event (transfer or success) — send every 5th occurrence
//   rebalance_event noop                  — log only
//   availability_alert                    — per-account 120 s suppression
//   unwind_event (triggered/completed)    — always send
//   unwind_recovery                       — send once per recovery
//   unwind_order                          — send on failure only
//   warning                               — always send
//
// Counters and suppression timestamps survive restarts in
// `<state_dir>/alerts/state.json`.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state_files::{read_json, write_json_atomic};
use crate::telegram::{view_inline_keyboard, TelegramClient};
use crate::timeutil::{fmt_usd, unix_now};
use crate::types::{AccountSide, RebalanceAction, RebalanceEvent};
use crate::unwind::{UnwindFill, UnwindOrderAlert, UnwindRecoveryInfo, UnwindSummary, UnwindTrigger};

/// Availability alerts for the same account are suppressed inside this window.
pub const AVAILABILITY_SUPPRESS_SECS: f64 = 120.0;

/// Every Nth qualifying rebalance event is pushed to the operator.
const REBALANCE_SEND_EVERY: u64 = 5;

/// Recently dispatched alerts retained for diagnostics.
const MAX_RECENT_ALERTS: usize = 100;

/// Persisted suppression state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AlertState {
    #[serde(default)]
    rebalance_alert_counter: u64,
    /// Per-account unix timestamp of the last availability send.
    #[serde(default)]
    avail_alert_last_ts: HashMap<String, f64>,
}

/// Classification of a dispatched alert, for the in-memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    RebalanceEvent,
    Warning,
    Availability,
    UnwindEvent,
    UnwindRecovery,
    UnwindOrder,
}

/// One dispatched (or suppressed) alert.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub kind: AlertKind,
    pub sent: bool,
    pub payload: serde_json::Value,
}

/// Fields of a low-collateral alert.
#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityAlert {
    pub event_time_sh: String,
    pub equity: Decimal,
    pub available: Decimal,
    pub avail_pct: Decimal,
}

pub struct AlertSink {
    state_path: PathBuf,
    state_dir: PathBuf,
    telegram: Option<TelegramClient>,
    recent: Mutex<Vec<AlertRecord>>,
}

impl AlertSink {
    pub fn new(state_dir: impl Into<PathBuf>, telegram: Option<TelegramClient>) -> Self {
        let state_dir = state_dir.into();
        Self {
            state_path: state_dir.join("alerts").join("state.json"),
            state_dir,
            telegram,
            recent: Mutex::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // State & delivery plumbing
    // -------------------------------------------------------------------------

    fn read_state(&self) -> AlertState {
        read_json(&self.state_path).unwrap_or_default()
    }

    fn save_state(&self, state: &AlertState) {
        if let Err(e) = write_json_atomic(&self.state_path, state) {
            tracing::warn!(error = %e, "failed to persist alert state");
        }
    }

    /// Destination chat: env override first, then the id the bot learned.
    fn chat_id(&self) -> Option<String> {
        if let Ok(cid) = std::env::var("TELEGRAM_CHAT_ID") {
            let cid = cid.trim().to_string();
            if !cid.is_empty() {
                return Some(cid);
            }
        }
        crate::state_files::BotState::load(&self.state_dir).chat_id
    }

    async fn send(&self, text: String, reply_markup: Option<serde_json::Value>) -> bool {
        let Some(telegram) = &self.telegram else {
            return false;
        };
        let chat_id = self.chat_id();
        match telegram
            .send_message(chat_id.as_deref(), &text, reply_markup)
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                tracing::warn!(error = %e, "alert delivery failed");
                false
            }
        }
    }

    fn record(&self, kind: AlertKind, sent: bool, payload: serde_json::Value) {
        let mut recent = self.recent.lock();
        recent.push(AlertRecord {
            kind,
            sent,
            payload,
        });
        while recent.len() > MAX_RECENT_ALERTS {
            recent.remove(0);
        }
    }

    /// Recently dispatched alerts, newest last.
    pub fn recent(&self) -> Vec<AlertRecord> {
        self.recent.lock().clone()
    }

    // -------------------------------------------------------------------------
    // Dispatchers
    // -------------------------------------------------------------------------

    /// Noop events are log-only; transfer attempts bump the persisted counter
    /// and every 5th is pushed to the operator.
    pub async fn dispatch_rebalance_event(&self, event: &RebalanceEvent) {
        let payload = serde_json::to_value(event).unwrap_or_default();
        info!(target: "alerts", rebalance_event = %payload);

        if event.action == RebalanceAction::Noop {
            self.record(AlertKind::RebalanceEvent, false, payload);
            return;
        }

        let mut state = self.read_state();
        state.rebalance_alert_counter += 1;
        let due = state.rebalance_alert_counter % REBALANCE_SEND_EVERY == 0;
        self.save_state(&state);

        let mut sent = false;
        if due {
            let status = if event.success.unwrap_or(false) {
                "成功"
            } else {
                "失败"
            };
            let amount = event
                .transfer_usdt
                .map(|a| a.to_string())
                .unwrap_or_else(|| "0".to_string());
            let text = format!(
                "💰 再平衡已触发\n时间: {}\n状态: {}\n转账金额: ${}\n总余额: ${}\n账户A余额: ${}\n账户B余额: ${}",
                event.event_time_sh,
                status,
                amount,
                fmt_usd(event.total_equity),
                fmt_usd(event.trading_a.equity),
                fmt_usd(event.trading_b.equity),
            );
            sent = self.send(text, Some(view_inline_keyboard())).await;
        }
        self.record(AlertKind::RebalanceEvent, sent, payload);
    }

    /// Warnings always go out.
    pub async fn dispatch_warning(&self, payload: serde_json::Value) {
        info!(target: "alerts", warning = %payload);
        let text = format!("⚠️ 警告: API调用失败\n错误: {payload}");
        let sent = self.send(text, None).await;
        self.record(AlertKind::Warning, sent, payload);
    }

    /// Low-collateral alert with a per-account suppression window. Returns
    /// whether the alert was actually delivered.
    pub async fn dispatch_availability_alert(
        &self,
        account: AccountSide,
        alert: AvailabilityAlert,
    ) -> bool {
        let payload = serde_json::to_value(&alert).unwrap_or_default();
        let now = unix_now();
        let key = account.to_string();

        let state = self.read_state();
        let last = state.avail_alert_last_ts.get(&key).copied().unwrap_or(0.0);
        if now - last < AVAILABILITY_SUPPRESS_SECS {
            self.record(AlertKind::Availability, false, payload);
            return false;
        }

        let text = format!(
            "⚠️ Low Collateral [{}]\nTime: {}\nEquity: {}\nAvailable: {} ({:.4}%)",
            account, alert.event_time_sh, alert.equity, alert.available, alert.avail_pct,
        );
        let sent = self.send(text, None).await;
        if sent {
            let mut state = self.read_state();
            state.avail_alert_last_ts.insert(key, now);
            self.save_state(&state);
        }
        info!(target: "alerts", availability_alert = %payload, sent);
        self.record(AlertKind::Availability, sent, payload);
        sent
    }

    /// Unwind start — always sent immediately.
    pub async fn dispatch_unwind_triggered(&self, trigger: &UnwindTrigger) {
        let payload = serde_json::to_value(trigger).unwrap_or_default();
        info!(target: "alerts", unwind_event = %payload);

        let dry_tag = if trigger.dry_run { "[DRY RUN] " } else { "" };
        let mark = |hit: bool| if hit { "⚠️" } else { "✅" };
        let text = format!(
            "🚨 {}UNWIND TRIGGERED\n━━━━━━━━━━━━━━━━━━\n{} Account A: {:.1}% margin use\n{} Account B: {:.1}% margin use\n━━━━━━━━━━━━━━━━━━\nTrigger at: ≥{:.0}% margin use",
            dry_tag,
            mark(trigger.triggered_a),
            trigger.pct_a,
            mark(trigger.triggered_b),
            trigger.pct_b,
            trigger.trigger_pct,
        );
        let sent = self.send(text, None).await;
        self.record(AlertKind::UnwindEvent, sent, payload);
    }

    /// Unwind completion report — always sent immediately.
    pub async fn dispatch_unwind_completed(&self, summary: &UnwindSummary) {
        let payload = serde_json::to_value(summary).unwrap_or_default();
        info!(target: "alerts", unwind_event = %payload);

        let dry_tag = if summary.dry_run { "[DRY RUN] " } else { "" };
        let status = if summary.failed == 0 { "✅" } else { "⚠️" };
        let text = format!(
            "{} {}UNWIND COMPLETED\n━━━━━━━━━━━━━━━━━━\nOrders: {}✓ {}✗\n{}\n{}\n━━━━━━━━━━━━━━━━━━\nA: {:.1}% | B: {:.1}% margin use",
            status,
            dry_tag,
            summary.successful,
            summary.failed,
            format_token_totals(&summary.account_a, "A"),
            format_token_totals(&summary.account_b, "B"),
            summary.final_pct_a,
            summary.final_pct_b,
        );
        let sent = self.send(text, None).await;
        self.record(AlertKind::UnwindEvent, sent, payload);
    }

    /// Margin recovered — sent once per recovery.
    pub async fn dispatch_unwind_recovery(&self, recovery: &UnwindRecoveryInfo) {
        let payload = serde_json::to_value(recovery).unwrap_or_default();
        info!(target: "alerts", unwind_recovery = %payload);

        let text = format!(
            "✅ MARGIN RECOVERED\n━━━━━━━━━━━━━━━━━━\nAccount A: {:.1}% margin use\nAccount B: {:.1}% margin use\n━━━━━━━━━━━━━━━━━━\nRecovery: <{:.0}% after {} iter",
            recovery.pct_a, recovery.pct_b, recovery.recovery_pct, recovery.iteration,
        );
        let sent = self.send(text, None).await;
        self.record(AlertKind::UnwindRecovery, sent, payload);
    }

    /// Individual order outcome — successes are log-only, failures alert.
    pub async fn dispatch_unwind_order(&self, order: &UnwindOrderAlert) {
        let payload = serde_json::to_value(order).unwrap_or_default();
        info!(target: "alerts", unwind_order = %payload);

        let mut sent = false;
        if !order.success {
            let error: String = order
                .error
                .clone()
                .unwrap_or_else(|| "unknown".to_string())
                .chars()
                .take(80)
                .collect();
            let text = format!(
                "❌ UNWIND FAILED: {} {}\n{}",
                order.account, order.instrument, error
            );
            sent = self.send(text, None).await;
        }
        self.record(AlertKind::UnwindOrder, sent, payload);
    }
}

impl std::fmt::Debug for AlertSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertSink")
            .field("state_path", &self.state_path)
            .field("telegram", &self.telegram.is_some())
            .finish()
    }
}

/// Aggregate unwound fills per token: `"A: BTC 0.25 ($15,000), ETH 1.2 ($3,600)"`.
fn format_token_totals(fills: &[UnwindFill], label: &str) -> String {
    if fills.is_empty() {
        return format!("{label}: none");
    }
    let mut order = Vec::new();
    let mut totals: HashMap<String, (Decimal, Decimal)> = HashMap::new();
    for fill in fills {
        let token = fill
            .instrument
            .strip_suffix("_USDT_Perp")
            .unwrap_or(&fill.instrument)
            .to_string();
        let entry = totals.entry(token.clone()).or_insert_with(|| {
            order.push(token);
            (Decimal::ZERO, Decimal::ZERO)
        });
        entry.0 += fill.size.abs();
        entry.1 += fill.notional.abs();
    }
    let parts: Vec<String> = order
        .iter()
        .map(|token| {
            let (size, notional) = totals[token];
            format!("{token} {size} (${})", fmt_usd(notional))
        })
        .collect();
    format!("{label}: {}", parts.join(", "))
}
