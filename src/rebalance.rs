// =============================================================================
// Rebalance Engine — one-shot equity equalisation between the two accounts
// =============================================================================
//
// A pass: sweep funding wallets, refresh observations, raise low-collateral
// alerts, run the unwind check, guard against zero-equity API glitches, then
// if the equity gap exceeds the trigger move half the gap from the richer
// account to the poorer one through the three-hop chain.
//
// The transfer amount is min(|Δ|/2, source available, source equity − 2·mm),
// so a transfer never pushes the source toward liquidation and symmetry is
// non-increasing.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::alerts::{AlertSink, AvailabilityAlert};
use crate::config::AppConfig;
use crate::flow::TransferFlow;
use crate::flow::BalanceSweeper;
use crate::grvt::client::GrvtAccount;
use crate::snapshot::{SnapshotBus, StatusSnapshot};
use crate::timeutil::event_time_sh;
use crate::types::{
    AccountStats, Env, Observation, RebalanceAction, RebalanceEvent,
};
use crate::unwind::{UnwindEngine, UnwindOutcome};

/// Pause before re-reading a zero-equity observation.
const ZERO_EQUITY_RECHECK: Duration = Duration::from_secs(3);

/// Structured result of one pass.
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceOutcome {
    pub action: RebalanceAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_usdt: Option<Decimal>,
    pub eq_a: Decimal,
    pub eq_b: Decimal,
}

pub struct RebalanceEngine {
    cfg: AppConfig,
    env: Env,
    a: GrvtAccount,
    b: GrvtAccount,
    alerts: Arc<AlertSink>,
    snapshot: Arc<SnapshotBus>,
    unwind: UnwindEngine,
    zero_equity_recheck: Duration,
}

impl RebalanceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: AppConfig,
        env: Env,
        a: GrvtAccount,
        b: GrvtAccount,
        alerts: Arc<AlertSink>,
        snapshot: Arc<SnapshotBus>,
        unwind: UnwindEngine,
    ) -> Self {
        Self {
            cfg,
            env,
            a,
            b,
            alerts,
            snapshot,
            unwind,
            zero_equity_recheck: ZERO_EQUITY_RECHECK,
        }
    }

    #[cfg(test)]
    pub fn set_zero_equity_recheck(&mut self, d: Duration) {
        self.zero_equity_recheck = d;
    }

    fn chain_id(&self, account: &GrvtAccount) -> u64 {
        account.creds.chain_id.unwrap_or_else(|| self.env.chain_id())
    }

    async fn observe(&self) -> (Observation, Observation) {
        let obs_a = self
            .a
            .trading
            .sub_account_summary(self.a.trading_sub_id())
            .await;
        let obs_b = self
            .b
            .trading
            .sub_account_summary(self.b.trading_sub_id())
            .await;
        (obs_a, obs_b)
    }

    /// Run one full rebalance pass.
    pub async fn rebalance_once(&self, trigger: Decimal) -> RebalanceOutcome {
        let throttle_ms = self.cfg.rebalance_throttle_ms;

        // 1. Sweep stray funding balances back into trading; failures here
        //    are logged inside the sweeper and never block the pass.
        BalanceSweeper::sweep(
            &self.a,
            self.cfg.funding_sweep_threshold,
            self.chain_id(&self.a),
            throttle_ms,
        )
        .await;
        BalanceSweeper::sweep(
            &self.b,
            self.cfg.funding_sweep_threshold,
            self.chain_id(&self.b),
            throttle_ms,
        )
        .await;

        // 2. Fresh observations; the check time feeds the status view.
        let (mut obs_a, mut obs_b) = self.observe().await;
        let check_time = event_time_sh(obs_a.event_time_ns);
        self.snapshot.set_last_check_time(check_time.clone());

        let funding_a_pre = self
            .a
            .funding
            .funding_usdt_balance(&self.a.creds.currency)
            .await;
        let funding_b_pre = self
            .b
            .funding
            .funding_usdt_balance(&self.b.creds.currency)
            .await;

        // 3. Low-collateral alerts (skipped on zero equity: that is an API
        //    glitch, not a margin problem).
        let alert_pct = self.cfg.min_available_balance_alert_percentage;
        for (side, obs) in [(self.a.side, &obs_a), (self.b.side, &obs_b)] {
            if obs.total_equity > Decimal::ZERO && obs.available_pct() < alert_pct {
                self.alerts
                    .dispatch_availability_alert(
                        side,
                        AvailabilityAlert {
                            event_time_sh: event_time_sh(obs.event_time_ns),
                            equity: obs.total_equity,
                            available: obs.available_balance,
                            avail_pct: obs.available_pct(),
                        },
                    )
                    .await;
            }
        }

        // 4. Emergency unwind check; after a run the observations are stale.
        if self.cfg.unwind.enabled {
            let outcome = self
                .unwind
                .check_and_unwind(&self.a, &self.b, &obs_a, &obs_b, self.cfg.unwind.dry_run)
                .await;
            if matches!(outcome, UnwindOutcome::Completed(_)) {
                let refreshed = self.observe().await;
                obs_a = refreshed.0;
                obs_b = refreshed.1;
            }
        }

        // 5. Zero-equity guard: re-read once after a pause; a single dead
        //    account is a real concern, both dead is an API outage.
        if obs_a.total_equity == Decimal::ZERO || obs_b.total_equity == Decimal::ZERO {
            tokio::time::sleep(self.zero_equity_recheck).await;
            let (retry_a, retry_b) = self.observe().await;
            if retry_a.total_equity == Decimal::ZERO || retry_b.total_equity == Decimal::ZERO {
                warn!(
                    eq_a = %retry_a.total_equity,
                    eq_b = %retry_b.total_equity,
                    "rebalance skipped on zero equity"
                );
                let both_zero = retry_a.total_equity == Decimal::ZERO
                    && retry_b.total_equity == Decimal::ZERO;
                if !both_zero {
                    self.alerts
                        .dispatch_warning(serde_json::json!({
                            "rebalance_skipped": "zero_equity_detected",
                            "eq_a": retry_a.total_equity.to_string(),
                            "eq_b": retry_b.total_equity.to_string(),
                        }))
                        .await;
                }
                return RebalanceOutcome {
                    action: RebalanceAction::BlockedZeroEquity,
                    transfer_usdt: None,
                    eq_a: retry_a.total_equity,
                    eq_b: retry_b.total_equity,
                };
            }
            obs_a = retry_a;
            obs_b = retry_b;
        }

        // 6. Trigger gate.
        let delta = obs_a.total_equity - obs_b.total_equity;
        if delta.abs() <= trigger {
            let event = RebalanceEvent {
                event_time_sh: check_time.clone(),
                action: RebalanceAction::Noop,
                success: None,
                transfer_usdt: None,
                trigger,
                delta,
                total_equity: obs_a.total_equity + obs_b.total_equity,
                trading_a: AccountStats::from(&obs_a),
                trading_b: AccountStats::from(&obs_b),
                funding_a_pre: Some(funding_a_pre),
                funding_b_pre: Some(funding_b_pre),
                funding_a_post: None,
                funding_b_post: None,
                tx_ids: None,
            };
            info!(
                target: "rebalance_noop",
                event = %serde_json::to_value(&event).unwrap_or_default()
            );
            self.publish(trigger, &obs_a, &obs_b, event).await;
            return RebalanceOutcome {
                action: RebalanceAction::Noop,
                transfer_usdt: None,
                eq_a: obs_a.total_equity,
                eq_b: obs_b.total_equity,
            };
        }

        // 7. Source = the richer account.
        let (src, dst, src_obs) = if delta > Decimal::ZERO {
            (&self.a, &self.b, &obs_a)
        } else {
            (&self.b, &self.a, &obs_b)
        };

        // 8. Amount, bounded by availability and by keeping the source at
        //    twice its maintenance margin.
        let needed = delta.abs() / Decimal::TWO;
        let max_by_avail = src_obs.available_balance;
        let max_by_mm =
            src_obs.total_equity - src_obs.maintenance_margin * Decimal::TWO;
        if max_by_mm <= Decimal::ZERO {
            info!(side = %src.side, max_by_mm = %max_by_mm, "transfer blocked by maintenance margin");
            return RebalanceOutcome {
                action: RebalanceAction::BlockedMm,
                transfer_usdt: None,
                eq_a: obs_a.total_equity,
                eq_b: obs_b.total_equity,
            };
        }
        let transfer_amt = needed.min(max_by_avail).min(max_by_mm);
        if transfer_amt <= Decimal::ZERO {
            info!(side = %src.side, "transfer blocked by available balance");
            return RebalanceOutcome {
                action: RebalanceAction::BlockedAvail,
                transfer_usdt: None,
                eq_a: obs_a.total_equity,
                eq_b: obs_b.total_equity,
            };
        }

        // 9. Execute the chain and report post-state.
        let start_time_sh = event_time_sh(obs_a.event_time_ns);
        let receipts = match TransferFlow::execute(
            src,
            dst,
            transfer_amt,
            self.chain_id(src),
            throttle_ms,
        )
        .await
        {
            Ok(receipts) => Some(receipts),
            Err(e) => {
                warn!(error = %e, "transfer flow failed");
                self.alerts
                    .dispatch_warning(serde_json::json!({
                        "error": "transfer_flow_failed",
                        "hop": e.hop,
                        "detail": e.source.to_string(),
                    }))
                    .await;
                None
            }
        };

        let (post_a, post_b) = self.observe().await;
        let funding_a_post = self
            .a
            .funding
            .funding_usdt_balance(&self.a.creds.currency)
            .await;
        let funding_b_post = self
            .b
            .funding
            .funding_usdt_balance(&self.b.creds.currency)
            .await;

        let success = receipts.as_ref().map(|r| r.success()).unwrap_or(false);
        let action = if success {
            RebalanceAction::Executed
        } else {
            RebalanceAction::Failed
        };

        let event = RebalanceEvent {
            event_time_sh: start_time_sh,
            action,
            success: Some(success),
            transfer_usdt: Some(transfer_amt),
            trigger,
            delta,
            total_equity: post_a.total_equity + post_b.total_equity,
            trading_a: AccountStats::from(&post_a),
            trading_b: AccountStats::from(&post_b),
            funding_a_pre: Some(funding_a_pre),
            funding_b_pre: Some(funding_b_pre),
            funding_a_post: Some(funding_a_post),
            funding_b_post: Some(funding_b_post),
            tx_ids: receipts.as_ref().map(|r| r.tx_ids()),
        };
        info!(event = %serde_json::to_value(&event).unwrap_or_default(), "rebalance executed");
        self.publish(trigger, &post_a, &post_b, event).await;

        RebalanceOutcome {
            action,
            transfer_usdt: Some(transfer_amt),
            eq_a: post_a.total_equity,
            eq_b: post_b.total_equity,
        }
    }

    async fn publish(
        &self,
        trigger: Decimal,
        obs_a: &Observation,
        obs_b: &Observation,
        event: RebalanceEvent,
    ) {
        self.snapshot.publish_status(StatusSnapshot::from_observations(
            event.event_time_sh.clone(),
            trigger,
            obs_a,
            obs_b,
        ));
        self.snapshot.publish_event(event.clone());
        self.alerts.dispatch_rebalance_event(&event).await;
    }
}

impl std::fmt::Debug for RebalanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceEngine")
            .field("env", &self.env)
            .field("trigger", &self.cfg.trigger_value)
            .finish()
    }
}
