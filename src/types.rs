// =============================================================================
// Shared types used across the hedged-pair control plane
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which GRVT deployment the process talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    Prod,
    Test,
}

impl Default for Env {
    fn default() -> Self {
        Self::Prod
    }
}

impl Env {
    /// Resolve from the `GRVT_ENV` environment variable (default: prod).
    pub fn from_env() -> Self {
        match std::env::var("GRVT_ENV")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "test" => Self::Test,
            _ => Self::Prod,
        }
    }

    /// Chain id used in every EIP-712 domain.
    pub fn chain_id(&self) -> u64 {
        match self {
            Self::Prod => 325,
            Self::Test => 326,
        }
    }

    /// Base URL of the trading API (order placement, account summaries).
    pub fn trading_base(&self) -> &'static str {
        match self {
            Self::Prod => "https://trades.grvt.io",
            Self::Test => "https://trades.testnet.grvt.io",
        }
    }

    /// Base URL of the edge API (auth, funding summaries, transfers).
    pub fn edge_base(&self) -> &'static str {
        match self {
            Self::Prod => "https://edge.grvt.io",
            Self::Test => "https://edge.testnet.grvt.io",
        }
    }
}

impl std::fmt::Display for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prod => write!(f, "prod"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Label for one side of the hedged pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountSide {
    A,
    B,
}

impl std::fmt::Display for AccountSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// One refresh of a trading sub-account: equity, maintenance margin, and the
/// balance that may be moved out. All values are exact decimals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Observation {
    pub total_equity: Decimal,
    pub maintenance_margin: Decimal,
    pub available_balance: Decimal,
    /// Venue event time in nanoseconds, when present in the response.
    #[serde(default)]
    pub event_time_ns: Option<i64>,
}

impl Observation {
    /// `available / equity · 100`, or zero when equity is non-positive.
    pub fn available_pct(&self) -> Decimal {
        if self.total_equity > Decimal::ZERO {
            self.available_balance / self.total_equity * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        }
    }

    /// Margin usage `mm / equity · 100`, or zero when equity is non-positive.
    pub fn margin_pct(&self) -> Decimal {
        if self.total_equity > Decimal::ZERO {
            self.maintenance_margin / self.total_equity * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        }
    }
}

/// A perpetual position on one sub-account. `size` is signed
/// (positive = long, negative = short); `notional` is absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    #[serde(default)]
    pub size: Decimal,
    #[serde(default)]
    pub notional: Decimal,
    #[serde(default)]
    pub unrealized_pnl: Decimal,
}

/// Instrument metadata needed to size and sign orders. Fetched on demand and
/// cached by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub instrument: String,
    /// uint256 hash used as the EIP-712 asset id, hex or decimal encoded.
    pub instrument_hash: String,
    #[serde(default)]
    pub base_decimals: u32,
    #[serde(default)]
    pub min_size: Decimal,
    #[serde(default)]
    pub tick_size: Decimal,
}

/// Outcome classification of one rebalance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceAction {
    Noop,
    Executed,
    Failed,
    BlockedMm,
    BlockedAvail,
    BlockedZeroEquity,
}

impl std::fmt::Display for RebalanceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Noop => "noop",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::BlockedMm => "blocked_mm",
            Self::BlockedAvail => "blocked_avail",
            Self::BlockedZeroEquity => "blocked_zero_equity",
        };
        write!(f, "{s}")
    }
}

/// Per-account stats attached to a rebalance event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountStats {
    pub equity: Decimal,
    pub mm: Decimal,
    pub available: Decimal,
    pub avail_pct: Decimal,
}

impl From<&Observation> for AccountStats {
    fn from(obs: &Observation) -> Self {
        Self {
            equity: obs.total_equity,
            mm: obs.maintenance_margin,
            available: obs.available_balance,
            avail_pct: obs.available_pct(),
        }
    }
}

/// Transaction ids of the three transfer hops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferTxIds {
    pub internal: Option<String>,
    pub funding_to_funding: Option<String>,
    pub deposit: Option<String>,
}

/// One fully-formed rebalance report, published to the snapshot bus and the
/// alert sink after every pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceEvent {
    /// Wall-clock event time rendered in Asia/Shanghai.
    pub event_time_sh: String,
    pub action: RebalanceAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_usdt: Option<Decimal>,
    pub trigger: Decimal,
    pub delta: Decimal,
    pub total_equity: Decimal,
    pub trading_a: AccountStats,
    pub trading_b: AccountStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_a_pre: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_b_pre: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_a_post: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_b_post: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_ids: Option<TransferTxIds>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn env_resolves_bases_and_chain_ids() {
        assert_eq!(Env::Prod.chain_id(), 325);
        assert_eq!(Env::Test.chain_id(), 326);
        assert_eq!(Env::Prod.trading_base(), "https://trades.grvt.io");
        assert_eq!(Env::Test.trading_base(), "https://trades.testnet.grvt.io");
        assert_eq!(Env::Test.edge_base(), "https://edge.testnet.grvt.io");
    }

    #[test]
    fn observation_percentages() {
        let obs = Observation {
            total_equity: dec!(10000),
            maintenance_margin: dec!(2500),
            available_balance: dec!(4000),
            event_time_ns: None,
        };
        assert_eq!(obs.margin_pct(), dec!(25));
        assert_eq!(obs.available_pct(), dec!(40));

        let zero = Observation::default();
        assert_eq!(zero.margin_pct(), Decimal::ZERO);
        assert_eq!(zero.available_pct(), Decimal::ZERO);
    }

    #[test]
    fn action_serialises_snake_case() {
        let json = serde_json::to_string(&RebalanceAction::BlockedZeroEquity).unwrap();
        assert_eq!(json, "\"blocked_zero_equity\"");
        assert_eq!(RebalanceAction::BlockedMm.to_string(), "blocked_mm");
    }

    #[test]
    fn position_deserialises_string_decimals() {
        let json = r#"{
            "instrument": "BTC_USDT_Perp",
            "size": "-0.25",
            "notional": "15000.5",
            "unrealized_pnl": "-12.75"
        }"#;
        let p: Position = serde_json::from_str(json).unwrap();
        assert_eq!(p.size, dec!(-0.25));
        assert_eq!(p.notional, dec!(15000.5));
        assert_eq!(p.unrealized_pnl, dec!(-12.75));
    }
}
