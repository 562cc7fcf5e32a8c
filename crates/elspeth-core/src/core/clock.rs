// elspeth-core/src/core/clock.rs
// ============================================================================
// Module: ELSPETH Clock
// Description: Wall-clock and monotonic time abstraction.
// Purpose: Keep ambient time reads behind one seam for determinism in tests.
// Dependencies: time
// ============================================================================

//! ## Overview
//! The engine never reads ambient time directly; everything flows through a
//! [`Clock`]. Durations are always measured with the monotonic clock, and
//! audit timestamps are always UTC. [`ManualClock`] makes timestamp-sensitive
//! behavior (checkpoint ordering, latency accounting) testable without
//! sleeping.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Mutex;
use std::time::Instant;

use time::Duration;
use time::OffsetDateTime;
use time::UtcOffset;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

// ============================================================================
// SECTION: Clock Trait
// ============================================================================

/// Source of wall-clock timestamps.
///
/// Monotonic measurements use [`std::time::Instant`] directly at call sites;
/// only wall-clock reads go through this trait because only they end up in
/// durable audit rows.
pub trait Clock: Send + Sync {
    /// Returns the current instant in UTC.
    fn now(&self) -> OffsetDateTime;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Deterministic clock for tests; advances only when told to.
#[derive(Debug)]
pub struct ManualClock {
    /// Current simulated time, advanced explicitly.
    current: Mutex<OffsetDateTime>,
}

impl ManualClock {
    /// Creates a manual clock starting at the given instant.
    #[must_use]
    pub const fn starting_at(start: OffsetDateTime) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Advances the clock by a duration.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.current.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.current.lock().map_or(OffsetDateTime::UNIX_EPOCH, |guard| *guard)
    }
}

// ============================================================================
// SECTION: Timestamp Formatting
// ============================================================================

/// Formats a UTC timestamp in RFC 3339 for storage.
///
/// Sub-second precision is always six digits so stored timestamps sort
/// lexicographically in chronological order.
#[must_use]
pub fn format_utc(instant: OffsetDateTime) -> String {
    instant
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .unwrap_or_else(|_| instant.unix_timestamp().to_string())
}

/// Parses a stored RFC 3339 timestamp.
///
/// # Errors
///
/// Returns the parse error text when the stored value is not RFC 3339.
pub fn parse_utc(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| err.to_string())
}

/// Measures elapsed milliseconds from a monotonic start point.
#[must_use]
pub fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1_000.0
}
