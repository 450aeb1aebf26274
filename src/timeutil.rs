//! Monotonic time helpers anchored to application start
//!
//! **App Start Relative Time Pattern**:
//! - Uses monotonic time anchored to application start
//! - Unaffected by system clock changes (NTP, manual adjustments)
//! - Safe to store in AtomicU64 for lock-free access
//!
//! The whole runtime stamps messages and measures loop pacing with these
//! nanoseconds, so timestamps from different threads are directly comparable.

use std::sync::OnceLock;
use std::time::Instant;

use time::OffsetDateTime;

/// Global anchor point for monotonic time
/// Set once on first access, never changes
static APP_START: OnceLock<Instant> = OnceLock::new();

/// Get monotonic time as nanoseconds since app start
///
/// This is guaranteed to be:
/// - Monotonic (always increases)
/// - Unaffected by system clock changes
/// - Safe to store in AtomicU64
pub fn nanos_since_boot() -> u64 {
    let start = APP_START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

/// Get monotonic time as fractional milliseconds since app start
pub fn millis_since_boot() -> f64 {
    nanos_since_boot() as f64 / 1_000_000.0
}

/// Check whether a wall-clock reading looks sane.
///
/// A host that boots without a battery-backed clock reports a date in the
/// distant past; anything before 2021 is treated as invalid.
pub fn wall_time_valid(dt: &OffsetDateTime) -> bool {
    dt.year() >= 2021
}
