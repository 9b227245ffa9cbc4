// =============================================================================
// Configuration — engine settings and account credentials
// =============================================================================
//
// Settings load from a JSON file resolved per environment
// (`config/<env>/config.json`, falling back to `config.json`), account
// credentials from `account_1_config.json` / `account_2_config.json` in the
// same directory with `ACC1_*` / `ACC2_*` environment overrides on top.
//
// Every field carries a serde default so that adding new fields never breaks
// loading an older config file. Key names are fixed by the wire/state-file
// contracts and therefore camelCase.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Env;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_trigger_value() -> Decimal {
    dec!(2000)
}

fn default_interval_sec() -> u64 {
    15
}

fn default_sweep_threshold() -> Decimal {
    dec!(0.1)
}

fn default_min_avail_pct() -> Decimal {
    dec!(20)
}

fn default_unwind_trigger_pct() -> Decimal {
    dec!(60)
}

fn default_unwind_recovery_pct() -> Decimal {
    dec!(40)
}

fn default_unwind_pct() -> Decimal {
    dec!(10)
}

fn default_max_iterations() -> u32 {
    999
}

fn default_wait_seconds() -> u64 {
    5
}

fn default_min_position_notional() -> Decimal {
    dec!(100)
}

fn default_true() -> bool {
    true
}

fn default_currency() -> String {
    "USDT".to_string()
}

// =============================================================================
// UnwindConfig
// =============================================================================

/// Emergency-unwind thresholds and pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnwindConfig {
    #[serde(default)]
    pub enabled: bool,

    /// When true, unwind iterations log intended orders without placing them.
    #[serde(default = "default_true", rename = "dryRun")]
    pub dry_run: bool,

    /// Margin-use percentage at which unwinding starts.
    #[serde(default = "default_unwind_trigger_pct", rename = "triggerPct")]
    pub trigger_pct: Decimal,

    /// Margin-use percentage below which an account counts as recovered.
    #[serde(default = "default_unwind_recovery_pct", rename = "recoveryPct")]
    pub recovery_pct: Decimal,

    /// Operator cap on the per-iteration unwind ratio, in percent.
    #[serde(default = "default_unwind_pct", rename = "unwindPct")]
    pub unwind_pct: Decimal,

    #[serde(default = "default_max_iterations", rename = "maxIterations")]
    pub max_iterations: u32,

    #[serde(
        default = "default_wait_seconds",
        rename = "waitSecondsBetweenIterations"
    )]
    pub wait_seconds_between_iterations: u64,

    /// Pairs whose smaller leg is below this notional are left alone.
    #[serde(default = "default_min_position_notional", rename = "minPositionNotional")]
    pub min_position_notional: Decimal,
}

impl Default for UnwindConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: true,
            trigger_pct: default_unwind_trigger_pct(),
            recovery_pct: default_unwind_recovery_pct(),
            unwind_pct: default_unwind_pct(),
            max_iterations: default_max_iterations(),
            wait_seconds_between_iterations: default_wait_seconds(),
            min_position_notional: default_min_position_notional(),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Equity gap (USDT) above which a rebalance transfer is triggered.
    #[serde(default = "default_trigger_value", rename = "triggerValue")]
    pub trigger_value: Decimal,

    /// Seconds between rebalance passes.
    #[serde(default = "default_interval_sec", rename = "rebalanceIntervalSec")]
    pub rebalance_interval_sec: u64,

    /// Courtesy pause between transfer hops, milliseconds.
    #[serde(default, rename = "rebalanceThrottleMs")]
    pub rebalance_throttle_ms: u64,

    /// Funding balances above this are swept back into trading each pass.
    #[serde(default = "default_sweep_threshold", rename = "fundingSweepThreshold")]
    pub funding_sweep_threshold: Decimal,

    /// Available-balance percentage below which a low-collateral alert fires.
    #[serde(
        default = "default_min_avail_pct",
        rename = "minAvailableBalanceAlertPercentage"
    )]
    pub min_available_balance_alert_percentage: Decimal,

    #[serde(default)]
    pub unwind: UnwindConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            trigger_value: default_trigger_value(),
            rebalance_interval_sec: default_interval_sec(),
            rebalance_throttle_ms: 0,
            funding_sweep_threshold: default_sweep_threshold(),
            min_available_balance_alert_percentage: default_min_avail_pct(),
            unwind: UnwindConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        info!(
            path = %path.display(),
            trigger = %config.trigger_value,
            interval_sec = config.rebalance_interval_sec,
            unwind_enabled = config.unwind.enabled,
            "config loaded"
        );
        Ok(config)
    }
}

// =============================================================================
// AccountCreds
// =============================================================================

/// Credentials and addressing for one account (funding wallet + trading
/// sub-account). Immutable after load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountCreds {
    #[serde(default)]
    pub account_id: String,

    /// Blockchain-style address of the funding wallet.
    #[serde(default)]
    pub funding_account_address: String,

    /// 64-bit id of the trading sub-account, as a string on the wire.
    #[serde(default)]
    pub trading_account_id: String,

    #[serde(default, rename = "fundingAccountKey")]
    pub funding_key: String,
    #[serde(default, rename = "fundingAccountSecret")]
    pub funding_secret: String,

    #[serde(default, rename = "tradingAccountKey")]
    pub trading_key: String,
    #[serde(default, rename = "tradingAccountSecret")]
    pub trading_secret: String,

    #[serde(default)]
    pub chain_id: Option<u64>,

    #[serde(default = "default_currency")]
    pub currency: String,
}

impl AccountCreds {
    /// API key for trading endpoints; falls back to the funding key when no
    /// dedicated trading key was configured.
    pub fn trading_api_key(&self) -> &str {
        if self.trading_key.is_empty() {
            &self.funding_key
        } else {
            &self.trading_key
        }
    }

    /// Fail fast when the fields required for signing and addressing are
    /// missing.
    pub fn validate(&self, label: &str) -> Result<()> {
        let mut missing = Vec::new();
        if self.funding_account_address.is_empty() {
            missing.push("funding_account_address");
        }
        if self.trading_account_id.is_empty() {
            missing.push("trading_account_id");
        }
        if self.funding_key.is_empty() {
            missing.push("fundingAccountKey");
        }
        if self.funding_secret.is_empty() {
            missing.push("fundingAccountSecret");
        }
        if self.trading_secret.is_empty() {
            missing.push("tradingAccountSecret");
        }
        if !missing.is_empty() {
            anyhow::bail!("account {label}: missing credentials: {}", missing.join(", "));
        }
        Ok(())
    }
}

// =============================================================================
// Loading & environment resolution
// =============================================================================

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Overlay account fields from `<PREFIX>_*` environment variables, e.g.
/// `ACC1_TRADING_ACCOUNT_SECRET`.
fn apply_account_env_overrides(mut creds: AccountCreds, prefix: &str) -> AccountCreds {
    if let Some(v) = env_str(&format!("{prefix}_ACCOUNT_ID")) {
        creds.account_id = v;
    }
    if let Some(v) = env_str(&format!("{prefix}_FUNDING_ACCOUNT_ADDRESS")) {
        creds.funding_account_address = v;
    }
    if let Some(v) = env_str(&format!("{prefix}_TRADING_ACCOUNT_ID")) {
        creds.trading_account_id = v;
    }
    if let Some(v) = env_str(&format!("{prefix}_CHAIN_ID")) {
        creds.chain_id = v.parse().ok();
    }
    if let Some(v) = env_str(&format!("{prefix}_CURRENCY")) {
        creds.currency = v;
    }
    if let Some(v) = env_str(&format!("{prefix}_FUNDING_ACCOUNT_KEY")) {
        creds.funding_key = v;
    }
    if let Some(v) = env_str(&format!("{prefix}_FUNDING_ACCOUNT_SECRET")) {
        creds.funding_secret = v;
    }
    if let Some(v) = env_str(&format!("{prefix}_TRADING_ACCOUNT_KEY")) {
        creds.trading_key = v;
    }
    if let Some(v) = env_str(&format!("{prefix}_TRADING_ACCOUNT_SECRET")) {
        creds.trading_secret = v;
    }
    creds
}

fn load_json_optional<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => T::default(),
    }
}

/// Filesystem layout for config and state, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ConfigRepository {
    env: Env,
    config_dir: PathBuf,
    state_dir: PathBuf,
}

impl ConfigRepository {
    pub fn new() -> Self {
        let env = Env::from_env();
        let env_dir = PathBuf::from("config").join(env.to_string());
        let config_dir = if env_dir.is_dir() {
            env_dir
        } else {
            PathBuf::from(".")
        };
        let state_dir = env_str("GRVT_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("bot"));
        Self {
            env,
            config_dir,
            state_dir,
        }
    }

    pub fn env(&self) -> Env {
        self.env
    }

    /// State directory holding the bot lock, heartbeat, runtime settings and
    /// alert suppression files.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn base(&self) -> AppConfig {
        let path = self.config_dir.join("config.json");
        if path.exists() {
            AppConfig::load(&path).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                AppConfig::default()
            })
        } else {
            AppConfig::default()
        }
    }

    /// Credentials for accounts A and B, env overrides applied.
    pub fn accounts(&self) -> (AccountCreds, AccountCreds) {
        let a: AccountCreds = load_json_optional(&self.config_dir.join("account_1_config.json"));
        let b: AccountCreds = load_json_optional(&self.config_dir.join("account_2_config.json"));
        (
            apply_account_env_overrides(a, "ACC1"),
            apply_account_env_overrides(b, "ACC2"),
        )
    }
}

impl Default for ConfigRepository {
    fn default() -> Self {
        Self::new()
    }
}
