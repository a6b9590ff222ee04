//! Monotonic last-sync clock.
//!
//! The last sync timestamp only moves forward, even when the wall clock
//! steps backwards.

/// Tracks the highest sync timestamp seen (epoch millis, 0 = never).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncClock {
    last: u64,
}

impl SyncClock {
    /// A clock that has never synced.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a persisted timestamp.
    pub fn with_timestamp(timestamp: u64) -> Self {
        Self { last: timestamp }
    }

    /// Last recorded timestamp, 0 if never synced.
    pub fn last(&self) -> u64 {
        self.last
    }

    /// Whether any sync has been recorded.
    pub fn has_synced(&self) -> bool {
        self.last > 0
    }

    /// Record a sync at `timestamp`.
    ///
    /// Returns true if the clock moved; an older or equal value is ignored.
    pub fn advance(&mut self, timestamp: u64) -> bool {
        if timestamp > self.last {
            self.last = timestamp;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clock_has_never_synced() {
        let clock = SyncClock::new();
        assert_eq!(clock.last(), 0);
        assert!(!clock.has_synced());
    }

    #[test]
    fn advance_moves_forward() {
        let mut clock = SyncClock::new();
        assert!(clock.advance(100));
        assert_eq!(clock.last(), 100);
        assert!(clock.has_synced());
    }

    #[test]
    fn never_regresses() {
        let mut clock = SyncClock::with_timestamp(500);
        assert!(!clock.advance(400));
        assert!(!clock.advance(500));
        assert_eq!(clock.last(), 500);
        assert!(clock.advance(501));
        assert_eq!(clock.last(), 501);
    }
}
