// =============================================================================
// Snapshot Bus — in-process view of the latest loop observations
// =============================================================================
//
// Single-writer/multi-reader store feeding the Telegram status command. The
// rebalance engine writes after every pass; the unwind engine writes each
// iteration; the bot supervisor only reads. One mutex guards the whole
// record; writers copy in, readers copy out, so a reader never sees a torn
// update.
// =============================================================================

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Observation, RebalanceEvent};

/// Latest per-account figures the status view is composed from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub event_time_sh: String,
    pub trigger: Decimal,
    pub delta: Decimal,
    pub eq_a: Decimal,
    pub eq_b: Decimal,
    pub mm_a: Decimal,
    pub mm_b: Decimal,
    pub avail_a: Decimal,
    pub avail_b: Decimal,
}

impl StatusSnapshot {
    pub fn from_observations(
        event_time_sh: String,
        trigger: Decimal,
        obs_a: &Observation,
        obs_b: &Observation,
    ) -> Self {
        Self {
            event_time_sh,
            trigger,
            delta: obs_a.total_equity - obs_b.total_equity,
            eq_a: obs_a.total_equity,
            eq_b: obs_b.total_equity,
            mm_a: obs_a.maintenance_margin,
            mm_b: obs_b.maintenance_margin,
            avail_a: obs_a.available_balance,
            avail_b: obs_b.available_balance,
        }
    }
}

/// Live unwind progress, one entry per iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnwindProgress {
    pub in_progress: bool,
    pub iteration: u32,
    pub pct_a: Decimal,
    pub pct_b: Decimal,
    pub trigger_pct: Decimal,
    pub recovery_pct: Decimal,
    /// Unix seconds of the last update.
    pub updated_ts: f64,
}

#[derive(Debug, Default)]
struct Inner {
    last_check_time: Option<String>,
    last_status: Option<StatusSnapshot>,
    last_event: Option<RebalanceEvent>,
    unwind: Option<UnwindProgress>,
}

/// The shared bus. Wrap in `Arc` and hand to every worker.
#[derive(Debug, Default)]
pub struct SnapshotBus {
    inner: Mutex<Inner>,
}

impl SnapshotBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_last_check_time(&self, t: String) {
        self.inner.lock().last_check_time = Some(t);
    }

    pub fn last_check_time(&self) -> Option<String> {
        self.inner.lock().last_check_time.clone()
    }

    pub fn publish_status(&self, status: StatusSnapshot) {
        self.inner.lock().last_status = Some(status);
    }

    pub fn last_status(&self) -> Option<StatusSnapshot> {
        self.inner.lock().last_status.clone()
    }

    pub fn publish_event(&self, event: RebalanceEvent) {
        self.inner.lock().last_event = Some(event);
    }

    pub fn last_event(&self) -> Option<RebalanceEvent> {
        self.inner.lock().last_event.clone()
    }

    pub fn publish_unwind_progress(&self, progress: UnwindProgress) {
        self.inner.lock().unwind = Some(progress);
    }

    pub fn unwind_progress(&self) -> Option<UnwindProgress> {
        self.inner.lock().unwind.clone()
    }

    /// Mark any published unwind run as finished.
    pub fn clear_unwind_progress(&self) {
        if let Some(progress) = self.inner.lock().unwind.as_mut() {
            progress.in_progress = false;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn obs(eq: Decimal, mm: Decimal, avail: Decimal) -> Observation {
        Observation {
            total_equity: eq,
            maintenance_margin: mm,
            available_balance: avail,
            event_time_ns: None,
        }
    }

    #[test]
    fn readers_get_copies() {
        let bus = SnapshotBus::new();
        assert!(bus.last_status().is_none());

        let status = StatusSnapshot::from_observations(
            "2024-01-01 08:00:00".into(),
            dec!(2000),
            &obs(dec!(12000), dec!(100), dec!(11000)),
            &obs(dec!(8000), dec!(100), dec!(7500)),
        );
        bus.publish_status(status);

        let mut read = bus.last_status().unwrap();
        assert_eq!(read.delta, dec!(4000));
        // Mutating the copy must not affect the bus.
        read.delta = dec!(0);
        assert_eq!(bus.last_status().unwrap().delta, dec!(4000));
    }

    #[test]
    fn last_check_time_overwrites() {
        let bus = SnapshotBus::new();
        bus.set_last_check_time("a".into());
        bus.set_last_check_time("b".into());
        assert_eq!(bus.last_check_time().as_deref(), Some("b"));
    }

    #[test]
    fn unwind_progress_clears_in_place() {
        let bus = SnapshotBus::new();
        bus.publish_unwind_progress(UnwindProgress {
            in_progress: true,
            iteration: 3,
            pct_a: dec!(65),
            pct_b: dec!(20),
            trigger_pct: dec!(60),
            recovery_pct: dec!(40),
            updated_ts: 1.0,
        });
        assert!(bus.unwind_progress().unwrap().in_progress);

        bus.clear_unwind_progress();
        let p = bus.unwind_progress().unwrap();
        assert!(!p.in_progress);
        assert_eq!(p.iteration, 3);
    }
}
