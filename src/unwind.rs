// =============================================================================
// Unwind Engine — emergency de-risking of the hedged pair
// =============================================================================
//
// Trigger: margin use (mm/eq·100) at or above triggerPct on either account.
// While triggered, each iteration refreshes observations, matches positions
// across the two accounts by instrument, and places reduce-only IOC market
// orders against both legs of each matched pair, sized so that margin use
// walks back under recoveryPct over a handful of iterations. Unwinding stops
// as soon as both accounts have recovered.
//
// Invariants:
//   - an order is never larger than the remaining absolute position size,
//   - sizes are rounded down to the instrument's size step and must reach
//     min_size, otherwise the pair is skipped for the iteration,
//   - both legs of a pair are reduced by the same size (the hedge stays
//     symmetric), A before B.
// =============================================================================

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alerts::AlertSink;
use crate::config::UnwindConfig;
use crate::grvt::client::{
    GrvtAccount, OrderLegWire, OrderMetadataWire, OrderPayload,
};
use crate::grvt::signing::{
    client_order_id, contract_size, parse_u256, sign_order, time_in_force, OrderLegMessage,
    OrderMessage,
};
use crate::snapshot::{SnapshotBus, UnwindProgress};
use crate::timeutil::unix_now;
use crate::types::{AccountSide, Env, Instrument, Observation, Position};

/// Fallback order-size step when an instrument reports none.
const DEFAULT_SIZE_STEP: Decimal = dec!(0.01);

/// The ratio formula spreads the excess over at most this many iterations.
const RATIO_TARGET_ITERATIONS: u32 = 5;

// =============================================================================
// Trigger / recovery / sizing math
// =============================================================================

/// Margin-use percentage, zero when equity is non-positive.
pub fn margin_pct(eq: Decimal, mm: Decimal) -> Decimal {
    if eq > Decimal::ZERO {
        mm / eq * Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    }
}

/// Unwinding starts when margin use reaches `trigger_pct`. Accounts with no
/// equity, no margin, or a nonsensical (≥100%) reading never trigger.
pub fn should_trigger(eq: Decimal, mm: Decimal, trigger_pct: Decimal) -> bool {
    if eq <= Decimal::ZERO || mm <= Decimal::ZERO {
        return false;
    }
    let pct = margin_pct(eq, mm);
    pct < Decimal::ONE_HUNDRED && pct >= trigger_pct
}

/// An account has recovered once margin use drops below `recovery_pct`
/// (an empty account counts as recovered).
pub fn is_recovered(eq: Decimal, mm: Decimal, recovery_pct: Decimal) -> bool {
    if eq <= Decimal::ZERO || mm <= Decimal::ZERO {
        return true;
    }
    margin_pct(eq, mm) < recovery_pct
}

/// Fraction of each position to reduce this iteration: the excess margin use
/// over the recovery threshold, spread across the target iteration count and
/// capped by the operator's `unwindPct`.
pub fn unwind_ratio(
    pct_a: Decimal,
    pct_b: Decimal,
    recovery_pct: Decimal,
    max_iterations: u32,
    unwind_pct: Decimal,
) -> Decimal {
    let mut target_iters = max_iterations.min(RATIO_TARGET_ITERATIONS);
    if target_iters == 0 {
        target_iters = RATIO_TARGET_ITERATIONS;
    }
    let pct_max = pct_a.max(pct_b);
    if pct_max <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let excess = pct_max - recovery_pct;
    let ratio = (excess / (pct_max * Decimal::from(target_iters)))
        .max(Decimal::ZERO)
        .min(Decimal::ONE);
    ratio.min(unwind_pct / Decimal::ONE_HUNDRED)
}

/// Round `raw` down to the instrument's size step and clamp into
/// `[min_size, current_abs]`. `None` means no order can be placed.
pub fn clamp_order_size(
    raw: Decimal,
    step: Decimal,
    min_size: Decimal,
    current_abs: Decimal,
) -> Option<Decimal> {
    let step = if step > Decimal::ZERO {
        step
    } else {
        DEFAULT_SIZE_STEP
    };
    let mut size = (raw / step).floor() * step;
    if size < min_size {
        size = min_size;
    }
    if size > current_abs {
        size = (current_abs / step).floor() * step;
    }
    if size <= Decimal::ZERO || size < min_size {
        return None;
    }
    Some(size)
}

// =============================================================================
// Pair selection
// =============================================================================

/// A hedged pair present on both accounts and large enough to act on.
#[derive(Debug, Clone)]
pub struct PairCandidate {
    pub instrument: String,
    pub pos_a: Position,
    pub pos_b: Position,
    pub score: Decimal,
}

/// An instrument held on only one side of the hedge.
#[derive(Debug, Clone, Serialize)]
pub struct UnmatchedPosition {
    pub instrument: String,
    pub has_a: bool,
    pub has_b: bool,
}

/// Match positions across the accounts by instrument. Pairs whose smaller leg
/// is below `min_notional` are ignored; single-sided instruments are reported
/// back for a hedge-mismatch warning. Candidates come back sorted by
/// `(|pnl_a|+|pnl_b|) / (|notional_a|+|notional_b|)` descending.
pub fn match_pairs(
    positions_a: &[Position],
    positions_b: &[Position],
    min_notional: Decimal,
) -> (Vec<PairCandidate>, Vec<UnmatchedPosition>) {
    let map_a: BTreeMap<&str, &Position> = positions_a
        .iter()
        .map(|p| (p.instrument.as_str(), p))
        .collect();
    let map_b: BTreeMap<&str, &Position> = positions_b
        .iter()
        .map(|p| (p.instrument.as_str(), p))
        .collect();

    let mut candidates = Vec::new();
    let mut unmatched = Vec::new();

    let all: BTreeMap<&str, ()> = map_a
        .keys()
        .chain(map_b.keys())
        .map(|k| (*k, ()))
        .collect();

    for instrument in all.keys() {
        match (map_a.get(instrument), map_b.get(instrument)) {
            (Some(pa), Some(pb)) => {
                let notional_a = pa.notional.abs();
                let notional_b = pb.notional.abs();
                if notional_a.min(notional_b) < min_notional {
                    continue;
                }
                let denom = notional_a + notional_b;
                let score = if denom > Decimal::ZERO {
                    (pa.unrealized_pnl.abs() + pb.unrealized_pnl.abs()) / denom
                } else {
                    Decimal::ZERO
                };
                candidates.push(PairCandidate {
                    instrument: instrument.to_string(),
                    pos_a: (*pa).clone(),
                    pos_b: (*pb).clone(),
                    score,
                });
            }
            (a, b) => unmatched.push(UnmatchedPosition {
                instrument: instrument.to_string(),
                has_a: a.is_some(),
                has_b: b.is_some(),
            }),
        }
    }

    candidates.sort_by(|x, y| y.score.cmp(&x.score));
    (candidates, unmatched)
}

// =============================================================================
// Report types
// =============================================================================

/// One reduce order the engine placed (or would have, in dry-run).
#[derive(Debug, Clone, Serialize)]
pub struct UnwindFill {
    pub instrument: String,
    pub size: Decimal,
    pub notional: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnwindOrderResult {
    pub account: AccountSide,
    pub iteration: u32,
    pub success: bool,
    pub dry_run: bool,
    pub fill: UnwindFill,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of the triggered alert.
#[derive(Debug, Clone, Serialize)]
pub struct UnwindTrigger {
    pub pct_a: Decimal,
    pub pct_b: Decimal,
    pub trigger_pct: Decimal,
    pub triggered_a: bool,
    pub triggered_b: bool,
    pub dry_run: bool,
}

/// Payload of the recovery alert.
#[derive(Debug, Clone, Serialize)]
pub struct UnwindRecoveryInfo {
    pub pct_a: Decimal,
    pub pct_b: Decimal,
    pub recovery_pct: Decimal,
    pub iteration: u32,
}

/// Payload of a per-order alert (sent only on failure).
#[derive(Debug, Clone, Serialize)]
pub struct UnwindOrderAlert {
    pub account: AccountSide,
    pub instrument: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final report of one unwind run.
#[derive(Debug, Clone, Serialize)]
pub struct UnwindSummary {
    pub action: &'static str,
    pub orders: u32,
    pub successful: u32,
    pub failed: u32,
    pub dry_run: bool,
    pub final_pct_a: Decimal,
    pub final_pct_b: Decimal,
    pub account_a: Vec<UnwindFill>,
    pub account_b: Vec<UnwindFill>,
}

/// What a `check_and_unwind` call did.
#[derive(Debug)]
pub enum UnwindOutcome {
    Disabled,
    NoTrigger,
    Completed(UnwindSummary),
}

// =============================================================================
// Engine
// =============================================================================

pub struct UnwindEngine {
    cfg: UnwindConfig,
    env: Env,
    alerts: Arc<AlertSink>,
    snapshot: Arc<SnapshotBus>,
    /// Observed between iterations only; an iteration always finishes.
    stop: Arc<AtomicBool>,
}

impl UnwindEngine {
    pub fn new(
        cfg: UnwindConfig,
        env: Env,
        alerts: Arc<AlertSink>,
        snapshot: Arc<SnapshotBus>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            env,
            alerts,
            snapshot,
            stop,
        }
    }

    /// Check the trigger condition and, when hit, iterate reduce-only orders
    /// until both accounts recover or the iteration cap is reached.
    pub async fn check_and_unwind(
        &self,
        a: &GrvtAccount,
        b: &GrvtAccount,
        obs_a: &Observation,
        obs_b: &Observation,
        dry_run: bool,
    ) -> UnwindOutcome {
        if !self.cfg.enabled {
            return UnwindOutcome::Disabled;
        }

        let trigger_pct = self.cfg.trigger_pct;
        let recovery_pct = self.cfg.recovery_pct;

        let pct_a = margin_pct(obs_a.total_equity, obs_a.maintenance_margin);
        let pct_b = margin_pct(obs_b.total_equity, obs_b.maintenance_margin);
        let triggered_a = should_trigger(obs_a.total_equity, obs_a.maintenance_margin, trigger_pct);
        let triggered_b = should_trigger(obs_b.total_equity, obs_b.maintenance_margin, trigger_pct);

        if !triggered_a && !triggered_b {
            return UnwindOutcome::NoTrigger;
        }

        info!(
            pct_a = %pct_a,
            pct_b = %pct_b,
            trigger_pct = %trigger_pct,
            triggered_a,
            triggered_b,
            dry_run,
            "unwind triggered"
        );
        self.alerts
            .dispatch_unwind_triggered(&UnwindTrigger {
                pct_a,
                pct_b,
                trigger_pct,
                triggered_a,
                triggered_b,
                dry_run,
            })
            .await;

        let mut results: Vec<UnwindOrderResult> = Vec::new();
        let mut warned_mismatch: HashSet<String> = HashSet::new();

        for iteration in 0..self.cfg.max_iterations {
            // Refresh state at the top of every iteration; the recovery
            // decision always uses current data.
            let obs_a = a.trading.sub_account_summary(a.trading_sub_id()).await;
            let obs_b = b.trading.sub_account_summary(b.trading_sub_id()).await;
            let positions_a = a.trading.positions(a.trading_sub_id()).await;
            let positions_b = b.trading.positions(b.trading_sub_id()).await;

            let pct_a = margin_pct(obs_a.total_equity, obs_a.maintenance_margin);
            let pct_b = margin_pct(obs_b.total_equity, obs_b.maintenance_margin);

            self.snapshot.publish_unwind_progress(UnwindProgress {
                in_progress: true,
                iteration: iteration + 1,
                pct_a,
                pct_b,
                trigger_pct,
                recovery_pct,
                updated_ts: unix_now(),
            });

            let recovered_a =
                is_recovered(obs_a.total_equity, obs_a.maintenance_margin, recovery_pct);
            let recovered_b =
                is_recovered(obs_b.total_equity, obs_b.maintenance_margin, recovery_pct);
            if recovered_a && recovered_b {
                info!(iteration, pct_a = %pct_a, pct_b = %pct_b, "unwind recovered");
                self.alerts
                    .dispatch_unwind_recovery(&UnwindRecoveryInfo {
                        pct_a,
                        pct_b,
                        recovery_pct,
                        iteration,
                    })
                    .await;
                break;
            }

            let ratio = unwind_ratio(
                pct_a,
                pct_b,
                recovery_pct,
                self.cfg.max_iterations,
                self.cfg.unwind_pct,
            );

            let (pairs, unmatched) =
                match_pairs(&positions_a, &positions_b, self.cfg.min_position_notional);

            let fresh_mismatches: Vec<UnmatchedPosition> = unmatched
                .into_iter()
                .filter(|u| warned_mismatch.insert(u.instrument.clone()))
                .collect();
            if !fresh_mismatches.is_empty() {
                warn!(count = fresh_mismatches.len(), "hedge mismatch detected");
                self.alerts
                    .dispatch_warning(serde_json::json!({
                        "error": "hedge_mismatch",
                        "unmatched_positions": fresh_mismatches,
                    }))
                    .await;
            }

            for pair in &pairs {
                let base_size = pair.pos_a.size.abs().min(pair.pos_b.size.abs());
                let raw = base_size * ratio;

                let inst = match a.trading.get_instrument(&pair.instrument).await {
                    Ok(inst) => inst,
                    Err(e) => {
                        warn!(instrument = %pair.instrument, error = %e, "instrument fetch failed, skipping pair");
                        continue;
                    }
                };

                // One size for both legs: the hedge must shrink symmetrically
                // and the smaller leg bounds what can be reduced.
                let Some(size) = clamp_order_size(raw, inst.tick_size, inst.min_size, base_size)
                else {
                    debug!(
                        instrument = %pair.instrument,
                        raw = %raw,
                        "unwind size below instrument minimum, skipping"
                    );
                    continue;
                };

                for (account, pos) in [(a, &pair.pos_a), (b, &pair.pos_b)] {
                    let result = self
                        .place_reduce_order(account, pos, size, &inst, dry_run, iteration)
                        .await;
                    if !dry_run && !result.success {
                        self.alerts
                            .dispatch_unwind_order(&UnwindOrderAlert {
                                account: result.account,
                                instrument: result.fill.instrument.clone(),
                                success: false,
                                error: result.error.clone(),
                            })
                            .await;
                    }
                    results.push(result);
                }
            }

            if self.stop.load(Ordering::SeqCst) {
                info!(iteration, "stop requested, ending unwind after this iteration");
                break;
            }

            if iteration + 1 < self.cfg.max_iterations
                && self.cfg.wait_seconds_between_iterations > 0
            {
                tokio::time::sleep(std::time::Duration::from_secs(
                    self.cfg.wait_seconds_between_iterations,
                ))
                .await;
            }
        }

        // Final report.
        let final_a = a.trading.sub_account_summary(a.trading_sub_id()).await;
        let final_b = b.trading.sub_account_summary(b.trading_sub_id()).await;
        self.snapshot.clear_unwind_progress();

        let successful = results.iter().filter(|r| r.success).count() as u32;
        let failed = results.len() as u32 - successful;
        let collect = |side: AccountSide| {
            results
                .iter()
                .filter(|r| r.account == side && r.success)
                .map(|r| r.fill.clone())
                .collect::<Vec<_>>()
        };
        let summary = UnwindSummary {
            action: "unwind_completed",
            orders: results.len() as u32,
            successful,
            failed,
            dry_run,
            final_pct_a: margin_pct(final_a.total_equity, final_a.maintenance_margin),
            final_pct_b: margin_pct(final_b.total_equity, final_b.maintenance_margin),
            account_a: collect(AccountSide::A),
            account_b: collect(AccountSide::B),
        };
        info!(summary = %serde_json::to_value(&summary).unwrap_or_default(), "unwind completed");
        self.alerts.dispatch_unwind_completed(&summary).await;

        UnwindOutcome::Completed(summary)
    }

    /// Place (or in dry-run, log) one reduce-only IOC market order shrinking
    /// `pos` by `size`.
    async fn place_reduce_order(
        &self,
        account: &GrvtAccount,
        pos: &Position,
        size: Decimal,
        inst: &Instrument,
        dry_run: bool,
        iteration: u32,
    ) -> UnwindOrderResult {
        // Shorts buy to reduce, longs sell.
        let is_buying = pos.size < Decimal::ZERO;
        let fill = UnwindFill {
            instrument: pos.instrument.clone(),
            size,
            notional: if pos.size.abs() > Decimal::ZERO {
                pos.notional.abs() * size / pos.size.abs()
            } else {
                Decimal::ZERO
            },
        };

        if dry_run {
            info!(
                side = %account.side,
                instrument = %pos.instrument,
                size = %size,
                is_buying,
                "dry-run unwind order"
            );
            return UnwindOrderResult {
                account: account.side,
                iteration,
                success: true,
                dry_run: true,
                fill,
                error: None,
            };
        }

        let placed = self.build_and_send(account, pos, size, inst, is_buying).await;
        match placed {
            Ok(_) => {
                info!(
                    side = %account.side,
                    instrument = %pos.instrument,
                    size = %size,
                    is_buying,
                    "unwind order placed"
                );
                UnwindOrderResult {
                    account: account.side,
                    iteration,
                    success: true,
                    dry_run: false,
                    fill,
                    error: None,
                }
            }
            Err(e) => {
                warn!(
                    side = %account.side,
                    instrument = %pos.instrument,
                    size = %size,
                    error = %e,
                    "unwind order failed"
                );
                UnwindOrderResult {
                    account: account.side,
                    iteration,
                    success: false,
                    dry_run: false,
                    fill,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn build_and_send(
        &self,
        account: &GrvtAccount,
        pos: &Position,
        size: Decimal,
        inst: &Instrument,
        is_buying: bool,
    ) -> Result<serde_json::Value, crate::grvt::client::ClientError> {
        let chain_id = account.creds.chain_id.unwrap_or_else(|| self.env.chain_id());
        let sub_id: u64 = account.trading_sub_id().parse().map_err(|_| {
            crate::grvt::client::ClientError::Validation(format!(
                "trading sub-account id is not numeric: {}",
                account.trading_sub_id()
            ))
        })?;

        let message = OrderMessage {
            sub_account_id: sub_id,
            is_market: true,
            time_in_force: time_in_force::IMMEDIATE_OR_CANCEL,
            post_only: false,
            reduce_only: true,
            legs: vec![OrderLegMessage {
                asset_id: parse_u256(&inst.instrument_hash)?,
                contract_size: contract_size(size, inst.base_decimals)?,
                limit_price: 0,
                is_buying_contract: is_buying,
            }],
        };
        let signature = sign_order(&account.creds.trading_secret, chain_id, &message)?;

        let payload = OrderPayload {
            sub_account_id: account.trading_sub_id().to_string(),
            is_market: true,
            time_in_force: "IMMEDIATE_OR_CANCEL".to_string(),
            post_only: false,
            reduce_only: true,
            legs: vec![OrderLegWire {
                instrument: pos.instrument.clone(),
                size: size.to_string(),
                limit_price: None,
                is_buying_asset: is_buying,
            }],
            signature,
            metadata: OrderMetadataWire {
                client_order_id: client_order_id().to_string(),
            },
        };

        account.trading.create_order(payload).await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertKind;
    use crate::testing::{instrument, mock_account, new_call_log, obs, position, temp_alert_sink, MockCall};

    fn engine(
        cfg: UnwindConfig,
        alerts: Arc<AlertSink>,
        snapshot: Arc<SnapshotBus>,
    ) -> UnwindEngine {
        UnwindEngine::new(
            cfg,
            Env::Test,
            alerts,
            snapshot,
            Arc::new(AtomicBool::new(false)),
        )
    }

    // ── Pure math ───────────────────────────────────────────────────────────

    #[test]
    fn trigger_matches_margin_pct_threshold() {
        let trigger = dec!(60);
        // pct == threshold triggers.
        assert!(should_trigger(dec!(1000), dec!(600), trigger));
        assert!(should_trigger(dec!(1000), dec!(650), trigger));
        assert!(!should_trigger(dec!(1000), dec!(599), trigger));
        // ≥100% margin use is a nonsense reading, never a trigger.
        assert!(!should_trigger(dec!(1000), dec!(1000), trigger));
        assert!(!should_trigger(dec!(1000), dec!(1500), trigger));
        // No equity / no margin never triggers.
        assert!(!should_trigger(dec!(0), dec!(10), trigger));
        assert!(!should_trigger(dec!(-5), dec!(10), trigger));
        assert!(!should_trigger(dec!(1000), dec!(0), trigger));
    }

    #[test]
    fn trigger_and_recovery_are_mutually_exclusive() {
        let trigger = dec!(60);
        let recovery = dec!(40);
        let cases = [
            (dec!(1000), dec!(650)),
            (dec!(1000), dec!(500)),
            (dec!(1000), dec!(399)),
            (dec!(1000), dec!(0)),
            (dec!(0), dec!(0)),
            (dec!(2500), dec!(1100)),
        ];
        for (eq, mm) in cases {
            let t = should_trigger(eq, mm, trigger);
            let r = is_recovered(eq, mm, recovery);
            assert!(!(t && r), "eq={eq} mm={mm} both triggered and recovered");
        }
        // Empty accounts count as recovered.
        assert!(is_recovered(dec!(0), dec!(0), recovery));
        assert!(is_recovered(dec!(1000), dec!(0), recovery));
        assert!(is_recovered(dec!(1000), dec!(399), recovery));
        assert!(!is_recovered(dec!(1000), dec!(400), recovery));
    }

    #[test]
    fn ratio_spreads_excess_and_honours_cap() {
        // pct_max 80, recovery 40 → excess 40 over 5 iterations of 80:
        // 40/(80·5) = 0.1, capped by unwindPct 10% → 0.1.
        assert_eq!(unwind_ratio(dec!(80), dec!(20), dec!(40), 999, dec!(10)), dec!(0.1));
        // Tighter operator cap wins.
        assert_eq!(unwind_ratio(dec!(80), dec!(20), dec!(40), 999, dec!(5)), dec!(0.05));
        // Below recovery: no reduction.
        assert_eq!(unwind_ratio(dec!(30), dec!(20), dec!(40), 999, dec!(10)), Decimal::ZERO);
        // Zero margin use: no reduction.
        assert_eq!(unwind_ratio(dec!(0), dec!(0), dec!(40), 999, dec!(10)), Decimal::ZERO);
        // max_iterations below the target shortens the spread.
        let r = unwind_ratio(dec!(65), dec!(20), dec!(40), 1, dec!(100));
        assert_eq!(r, dec!(25) / dec!(65));
    }

    #[test]
    fn order_size_clamping() {
        // Round down to step.
        assert_eq!(
            clamp_order_size(dec!(0.03846), dec!(0.001), dec!(0.001), dec!(0.5)),
            Some(dec!(0.038))
        );
        // Raised to min_size when the raw size is below it.
        assert_eq!(
            clamp_order_size(dec!(0.0004), dec!(0.001), dec!(0.01), dec!(0.5)),
            Some(dec!(0.01))
        );
        // Capped at the remaining position.
        assert_eq!(
            clamp_order_size(dec!(2), dec!(0.001), dec!(0.001), dec!(0.5355)),
            Some(dec!(0.535))
        );
        // min_size larger than the position: nothing to place.
        assert_eq!(
            clamp_order_size(dec!(0.01), dec!(0.001), dec!(1), dec!(0.5)),
            None
        );
        // Zero raw size: nothing to place.
        assert_eq!(
            clamp_order_size(dec!(0), dec!(0.001), dec!(0.001), dec!(0.5)),
            None
        );
        // Bad step falls back to the default.
        assert_eq!(
            clamp_order_size(dec!(0.25), dec!(0), dec!(0.01), dec!(1)),
            Some(dec!(0.25))
        );
    }

    #[test]
    fn pair_matching_scores_and_reports_mismatches() {
        let a = vec![
            position("BTC_USDT_Perp", dec!(0.5), dec!(15000), dec!(-300)),
            position("ETH_USDT_Perp", dec!(4), dec!(12000), dec!(-60)),
            position("SOL_USDT_Perp", dec!(100), dec!(50), dec!(5)),
            position("XRP_USDT_Perp", dec!(1000), dec!(500), dec!(1)),
        ];
        let b = vec![
            position("BTC_USDT_Perp", dec!(-0.5), dec!(15000), dec!(320)),
            position("ETH_USDT_Perp", dec!(-4), dec!(12000), dec!(55)),
            position("SOL_USDT_Perp", dec!(-100), dec!(50), dec!(-4)),
            position("DOGE_USDT_Perp", dec!(-5000), dec!(700), dec!(2)),
        ];

        let (pairs, unmatched) = match_pairs(&a, &b, dec!(100));

        // SOL is two-sided but below min notional; XRP/DOGE are one-sided.
        assert_eq!(pairs.len(), 2);
        // BTC score 620/30000 ≈ 0.0207 > ETH 115/24000 ≈ 0.0048.
        assert_eq!(pairs[0].instrument, "BTC_USDT_Perp");
        assert_eq!(pairs[1].instrument, "ETH_USDT_Perp");
        assert!(pairs[0].score > pairs[1].score);

        assert_eq!(unmatched.len(), 2);
        let doge = unmatched.iter().find(|u| u.instrument.starts_with("DOGE")).unwrap();
        assert!(!doge.has_a && doge.has_b);
        let xrp = unmatched.iter().find(|u| u.instrument.starts_with("XRP")).unwrap();
        assert!(xrp.has_a && !xrp.has_b);
    }

    // ── Engine scenarios ────────────────────────────────────────────────────

    fn stressed_cfg() -> UnwindConfig {
        UnwindConfig {
            enabled: true,
            dry_run: false,
            trigger_pct: dec!(60),
            recovery_pct: dec!(40),
            unwind_pct: dec!(10),
            max_iterations: 999,
            wait_seconds_between_iterations: 0,
            min_position_notional: dec!(100),
        }
    }

    #[tokio::test]
    async fn disabled_and_untriggered_do_nothing() {
        let log = new_call_log();
        let (a, _at, _af) = mock_account(AccountSide::A, &log);
        let (b, _bt, _bf) = mock_account(AccountSide::B, &log);
        let (alerts, dir) = temp_alert_sink("unwind-notrigger");
        let snapshot = Arc::new(SnapshotBus::new());

        let mut cfg = stressed_cfg();
        cfg.enabled = false;
        let eng = engine(cfg, alerts.clone(), snapshot.clone());
        let calm_a = obs(dec!(1000), dec!(100), dec!(800));
        let calm_b = obs(dec!(1000), dec!(120), dec!(700));
        assert!(matches!(
            eng.check_and_unwind(&a, &b, &calm_a, &calm_b, false).await,
            UnwindOutcome::Disabled
        ));

        let eng = engine(stressed_cfg(), alerts.clone(), snapshot.clone());
        assert!(matches!(
            eng.check_and_unwind(&a, &b, &calm_a, &calm_b, false).await,
            UnwindOutcome::NoTrigger
        ));
        assert!(log.lock().is_empty());
        assert!(alerts.recent().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn triggered_pair_unwinds_and_recovers() {
        let log = new_call_log();
        let (a, a_trading, _af) = mock_account(AccountSide::A, &log);
        let (b, b_trading, _bf) = mock_account(AccountSide::B, &log);
        let (alerts, dir) = temp_alert_sink("unwind-recover");
        let snapshot = Arc::new(SnapshotBus::new());

        // Iteration 1 sees A still stressed (65%), iteration 2 sees it
        // recovered (35%). B stays calm throughout.
        a_trading.push_observation(obs(dec!(1000), dec!(650), dec!(100)));
        a_trading.push_observation(obs(dec!(1000), dec!(350), dec!(400)));
        b_trading.push_observation(obs(dec!(1000), dec!(200), dec!(600)));

        a_trading.set_positions(vec![position("BTC_USDT_Perp", dec!(0.5), dec!(15000), dec!(-50))]);
        b_trading.set_positions(vec![position("BTC_USDT_Perp", dec!(-0.5), dec!(15000), dec!(60))]);
        a_trading.insert_instrument(instrument("BTC_USDT_Perp", 3, dec!(0.001), dec!(0.001)));

        let eng = engine(stressed_cfg(), alerts.clone(), snapshot.clone());
        let stressed = obs(dec!(1000), dec!(650), dec!(100));
        let calm = obs(dec!(1000), dec!(200), dec!(600));
        let outcome = eng.check_and_unwind(&a, &b, &stressed, &calm, false).await;

        let UnwindOutcome::Completed(summary) = outcome else {
            panic!("expected a completed unwind");
        };
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.account_a.len(), 1);
        assert_eq!(summary.account_b.len(), 1);
        assert_eq!(summary.final_pct_a, dec!(35));

        // ratio = 25/(65·5) ≈ 0.0769 → 0.5·0.0769 = 0.03846 → step 0.001
        // floors to 0.038 on both legs.
        assert_eq!(summary.account_a[0].size, dec!(0.038));
        assert_eq!(summary.account_b[0].size, dec!(0.038));

        // A sells (long), B buys back (short); both reduce-only IOC market.
        let orders: Vec<_> = log
            .lock()
            .iter()
            .filter_map(|(label, call)| match call {
                MockCall::Order(o) => Some((label.clone(), o.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].0, "A.trading");
        assert!(!orders[0].1.legs[0].is_buying_asset);
        assert_eq!(orders[1].0, "B.trading");
        assert!(orders[1].1.legs[0].is_buying_asset);
        for (_, order) in &orders {
            assert!(order.reduce_only);
            assert!(order.is_market);
            assert_eq!(order.time_in_force, "IMMEDIATE_OR_CANCEL");
            assert!(order.legs[0].limit_price.is_none());
        }

        // Alerts: triggered, recovery, completed.
        let kinds: Vec<AlertKind> = alerts.recent().iter().map(|r| r.kind).collect();
        assert!(kinds.contains(&AlertKind::UnwindEvent));
        assert!(kinds.contains(&AlertKind::UnwindRecovery));

        // Progress was published and cleared.
        let progress = snapshot.unwind_progress().unwrap();
        assert!(!progress.in_progress);
        assert_eq!(progress.trigger_pct, dec!(60));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unmatched_positions_warn_once_and_place_nothing() {
        let log = new_call_log();
        let (a, a_trading, _af) = mock_account(AccountSide::A, &log);
        let (b, b_trading, _bf) = mock_account(AccountSide::B, &log);
        let (alerts, dir) = temp_alert_sink("unwind-mismatch");
        let snapshot = Arc::new(SnapshotBus::new());

        // Stressed forever; the run ends on the iteration cap.
        a_trading.push_observation(obs(dec!(1000), dec!(650), dec!(100)));
        b_trading.push_observation(obs(dec!(1000), dec!(200), dec!(600)));
        a_trading.set_positions(vec![position("BTC_USDT_Perp", dec!(0.5), dec!(15000), dec!(-50))]);
        b_trading.set_positions(vec![position("ETH_USDT_Perp", dec!(-4), dec!(12000), dec!(55))]);

        let mut cfg = stressed_cfg();
        cfg.max_iterations = 3;
        let eng = engine(cfg, alerts.clone(), snapshot.clone());
        let stressed = obs(dec!(1000), dec!(650), dec!(100));
        let calm = obs(dec!(1000), dec!(200), dec!(600));
        let outcome = eng.check_and_unwind(&a, &b, &stressed, &calm, false).await;

        let UnwindOutcome::Completed(summary) = outcome else {
            panic!("expected a completed unwind");
        };
        assert_eq!(summary.orders, 0);

        // Exactly one hedge-mismatch warning despite three iterations.
        let warnings: Vec<_> = alerts
            .recent()
            .iter()
            .filter(|r| r.kind == AlertKind::Warning)
            .cloned()
            .collect();
        assert_eq!(warnings.len(), 1);
        let unmatched = warnings[0].payload["unmatched_positions"]
            .as_array()
            .unwrap();
        assert_eq!(unmatched.len(), 2);
        let btc = unmatched
            .iter()
            .find(|u| u["instrument"] == "BTC_USDT_Perp")
            .unwrap();
        assert_eq!(btc["has_a"], true);
        assert_eq!(btc["has_b"], false);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failed_order_raises_order_alert() {
        let log = new_call_log();
        let (a, a_trading, _af) = mock_account(AccountSide::A, &log);
        let (b, b_trading, _bf) = mock_account(AccountSide::B, &log);
        let (alerts, dir) = temp_alert_sink("unwind-orderfail");
        let snapshot = Arc::new(SnapshotBus::new());

        a_trading.push_observation(obs(dec!(1000), dec!(650), dec!(100)));
        a_trading.push_observation(obs(dec!(1000), dec!(350), dec!(400)));
        b_trading.push_observation(obs(dec!(1000), dec!(200), dec!(600)));
        a_trading.set_positions(vec![position("BTC_USDT_Perp", dec!(0.5), dec!(15000), dec!(-50))]);
        b_trading.set_positions(vec![position("BTC_USDT_Perp", dec!(-0.5), dec!(15000), dec!(60))]);
        a_trading.insert_instrument(instrument("BTC_USDT_Perp", 3, dec!(0.001), dec!(0.001)));
        a_trading.push_order_result(Err(crate::grvt::client::ClientError::Business {
            code: 3001,
            status: 400,
            message: "margin check failed".into(),
        }));

        let eng = engine(stressed_cfg(), alerts.clone(), snapshot.clone());
        let stressed = obs(dec!(1000), dec!(650), dec!(100));
        let calm = obs(dec!(1000), dec!(200), dec!(600));
        let UnwindOutcome::Completed(summary) =
            eng.check_and_unwind(&a, &b, &stressed, &calm, false).await
        else {
            panic!("expected a completed unwind");
        };

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.successful, 1);
        let order_alerts: Vec<_> = alerts
            .recent()
            .iter()
            .filter(|r| r.kind == AlertKind::UnwindOrder)
            .cloned()
            .collect();
        assert_eq!(order_alerts.len(), 1);
        assert_eq!(order_alerts[0].payload["account"], "A");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn dry_run_places_no_orders_but_reports_success() {
        let log = new_call_log();
        let (a, a_trading, _af) = mock_account(AccountSide::A, &log);
        let (b, b_trading, _bf) = mock_account(AccountSide::B, &log);
        let (alerts, dir) = temp_alert_sink("unwind-dry");
        let snapshot = Arc::new(SnapshotBus::new());

        a_trading.push_observation(obs(dec!(1000), dec!(650), dec!(100)));
        a_trading.push_observation(obs(dec!(1000), dec!(350), dec!(400)));
        b_trading.push_observation(obs(dec!(1000), dec!(200), dec!(600)));
        a_trading.set_positions(vec![position("BTC_USDT_Perp", dec!(0.5), dec!(15000), dec!(-50))]);
        b_trading.set_positions(vec![position("BTC_USDT_Perp", dec!(-0.5), dec!(15000), dec!(60))]);
        a_trading.insert_instrument(instrument("BTC_USDT_Perp", 3, dec!(0.001), dec!(0.001)));

        let eng = engine(stressed_cfg(), alerts.clone(), snapshot.clone());
        let stressed = obs(dec!(1000), dec!(650), dec!(100));
        let calm = obs(dec!(1000), dec!(200), dec!(600));
        let UnwindOutcome::Completed(summary) =
            eng.check_and_unwind(&a, &b, &stressed, &calm, true).await
        else {
            panic!("expected a completed unwind");
        };

        assert!(summary.dry_run);
        assert_eq!(summary.successful, 2);
        let placed = log
            .lock()
            .iter()
            .filter(|(_, call)| matches!(call, MockCall::Order(_)))
            .count();
        assert_eq!(placed, 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
