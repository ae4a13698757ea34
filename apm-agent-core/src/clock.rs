//! Per-trace clock.
//!
//! Reading the wall clock for every timestamp lets spans of one transaction drift apart
//! when the system clock is adjusted. A trace captures the wall clock once and advances it
//! with a monotonic clock afterwards; children inherit the offset of their parent.
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn monotonic_nanos() -> i64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(Instant::now);
    i64::try_from(anchor.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

/// Current wall clock time in microseconds since the Unix epoch.
pub fn epoch_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Converts a configured duration to microseconds, saturating on overflow.
pub(crate) fn duration_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

/// Offset between the monotonic clock and the epoch, captured once per trace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EpochTickClock {
    nanotime_offset_to_epoch: i64,
}

impl EpochTickClock {
    /// Captures the current wall clock.
    pub fn init(&mut self) {
        self.init_at(epoch_micros());
    }

    /// Initializes the clock so that it reads `epoch_micros` now.
    pub fn init_at(&mut self, epoch_micros: i64) {
        self.nanotime_offset_to_epoch = epoch_micros.saturating_mul(1_000) - monotonic_nanos();
    }

    /// Inherits the offset of another clock.
    pub fn init_from(&mut self, other: &EpochTickClock) {
        self.nanotime_offset_to_epoch = other.nanotime_offset_to_epoch;
    }

    /// Restores a serialized offset.
    pub(crate) fn init_with_offset(&mut self, offset: i64) {
        self.nanotime_offset_to_epoch = offset;
    }

    pub(crate) fn offset(&self) -> i64 {
        self.nanotime_offset_to_epoch
    }

    /// Returns `true` once the clock has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.nanotime_offset_to_epoch != 0
    }

    /// Current time in epoch microseconds according to this clock.
    pub fn epoch_micros(&self) -> i64 {
        (monotonic_nanos() + self.nanotime_offset_to_epoch) / 1_000
    }

    /// Returns the clock to its uninitialized state.
    pub fn reset(&mut self) {
        self.nanotime_offset_to_epoch = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_at_fixed_time() {
        let mut clock = EpochTickClock::default();
        assert!(!clock.is_initialized());
        clock.init_at(1_000_000);
        assert!(clock.is_initialized());
        let now = clock.epoch_micros();
        assert!((1_000_000..1_000_000 + 60_000_000).contains(&now));
    }

    #[test]
    fn children_inherit_offset() {
        let mut parent = EpochTickClock::default();
        parent.init();
        let mut child = EpochTickClock::default();
        child.init_from(&parent);
        assert_eq!(child, parent);

        child.reset();
        assert!(!child.is_initialized());
    }

    #[test]
    fn close_to_wall_clock() {
        let mut clock = EpochTickClock::default();
        clock.init();
        assert!((clock.epoch_micros() - epoch_micros()).abs() < 1_000_000);
    }
}
