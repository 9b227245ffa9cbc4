// =============================================================================
// Persistent state files — runtime settings and bot state
// =============================================================================
//
// Everything under the state directory (default `bot/`) is small JSON written
// with an atomic tmp + rename so a crash mid-write never corrupts state:
//
//   runtime.json — settings of the currently running loop (stale after 6 h)
//   state.json   — bot chat id + polling heartbeat
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::UnwindConfig;
use crate::timeutil::unix_now;

/// Runtime settings are ignored once older than this.
pub const RUNTIME_MAX_AGE_SECS: f64 = 6.0 * 60.0 * 60.0;

/// Serialise `value` to `path` via a temporary sibling file and rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(value).context("failed to serialise state")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &content)
        .with_context(|| format!("failed to write tmp state to {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename tmp state to {}", path.display()))?;
    Ok(())
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

// =============================================================================
// Runtime settings
// =============================================================================

/// Unwind thresholds mirrored into the runtime settings file for display.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeUnwind {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "triggerPct")]
    pub trigger_pct: Decimal,
    #[serde(default, rename = "recoveryPct")]
    pub recovery_pct: Decimal,
}

impl From<&UnwindConfig> for RuntimeUnwind {
    fn from(cfg: &UnwindConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            trigger_pct: cfg.trigger_pct,
            recovery_pct: cfg.recovery_pct,
        }
    }
}

/// What the control loop is currently running with. Written on every start
/// and stop; read by the bot supervisor to label its status output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub running: bool,
    #[serde(default, rename = "triggerValue")]
    pub trigger_value: Decimal,
    #[serde(default)]
    pub unwind: RuntimeUnwind,
    /// Unix seconds at write time.
    #[serde(default)]
    pub ts: f64,
}

impl RuntimeSettings {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join("runtime.json")
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        write_json_atomic(&Self::path(state_dir), self)
    }

    /// Load settings, discarding stale files and files written by a different
    /// environment.
    pub fn load(state_dir: &Path, env: &str) -> Option<Self> {
        let settings: Self = read_json(&Self::path(state_dir))?;
        if unix_now() - settings.ts > RUNTIME_MAX_AGE_SECS {
            return None;
        }
        if !settings.env.is_empty() && settings.env != env {
            return None;
        }
        Some(settings)
    }
}

// =============================================================================
// Bot state
// =============================================================================

/// Chat id + heartbeat written by the polling worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotState {
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub heartbeat_ts: Option<f64>,
}

impl BotState {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join("state.json")
    }

    pub fn load(state_dir: &Path) -> Self {
        read_json(&Self::path(state_dir)).unwrap_or_default()
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        write_json_atomic(&Self::path(state_dir), self)
    }

    /// Age of the heartbeat in seconds; `None` when never written.
    pub fn heartbeat_age(&self) -> Option<f64> {
        self.heartbeat_ts.map(|ts| unix_now() - ts)
    }

    /// True when the heartbeat is missing or older than `max_age` seconds.
    pub fn heartbeat_stale(&self, max_age: f64) -> bool {
        self.heartbeat_age().map_or(true, |age| age > max_age)
    }
}
