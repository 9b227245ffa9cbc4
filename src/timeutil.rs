// =============================================================================
// Time & display helpers
// =============================================================================
//
// User-facing event times are rendered in Asia/Shanghai (fixed UTC+8, the
// zone has no DST). Internal pacing uses monotonic clocks elsewhere; this
// module only deals with wall-clock presentation.
// =============================================================================

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Seconds east of UTC for Asia/Shanghai.
const SHANGHAI_OFFSET_SECS: i32 = 8 * 3600;

fn shanghai() -> FixedOffset {
    FixedOffset::east_opt(SHANGHAI_OFFSET_SECS).expect("valid fixed offset")
}

/// Format a venue event time (nanoseconds since epoch) as a Shanghai
/// wall-clock string. Falls back to "now" when the timestamp is absent or
/// out of range.
pub fn event_time_sh(event_time_ns: Option<i64>) -> String {
    let dt: DateTime<FixedOffset> = event_time_ns
        .map(|ns| shanghai().timestamp_nanos(ns))
        .unwrap_or_else(|| Utc::now().with_timezone(&shanghai()));
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Current Shanghai wall-clock string.
pub fn now_sh() -> String {
    Utc::now()
        .with_timezone(&shanghai())
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Unix time in seconds as a float, for heartbeat/suppression files.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Render a dollar amount with thousands separators and no cents,
/// e.g. `1234567.89` → `"1,234,568"`.
pub fn fmt_usd(amount: Decimal) -> String {
    let rounded = amount.round().to_i128().unwrap_or(0);
    let negative = rounded < 0;
    let digits = rounded.unsigned_abs().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if negative {
        format!("-{grouped}")
    } else {
        grouped
    }
}
