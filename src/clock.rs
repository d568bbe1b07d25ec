use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time.
///
/// Loops that make time-based eviction or bucketing decisions take a
/// `TimeSource` instead of calling `SystemTime::now()` directly, so tests
/// can drive the clock forward without sleeping.
pub trait TimeSource: Send + Sync {
    /// Returns the current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A manually advanced clock.
#[derive(Debug)]
pub struct ManualTimeSource {
    now: parking_lot::Mutex<SystemTime>,
}

impl ManualTimeSource {
    /// Creates a manual clock starting at `start`.
    pub fn new(start: SystemTime) -> Arc<Self> {
        Arc::new(Self {
            now: parking_lot::Mutex::new(start),
        })
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now += delta;
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, at: SystemTime) {
        *self.now.lock() = at;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

/// Builds a periodic ticker that skips missed ticks instead of bursting
/// to catch up, so a stalled loop resumes on the wall clock.
pub fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch times.
pub fn unix_millis(ts: SystemTime) -> i64 {
    ts.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Reconstructs a `SystemTime` from Unix-epoch milliseconds.
pub fn from_unix_millis(ms: i64) -> SystemTime {
    if ms <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    }
}

/// Floors `ts` to a multiple of `interval` from the Unix epoch.
pub fn floor_to_interval(ts: SystemTime, interval: Duration) -> SystemTime {
    let interval_ms = interval.as_millis().max(1) as i64;
    let ms = unix_millis(ts);
    from_unix_millis(ms - ms.rem_euclid(interval_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time_source_advances() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = ManualTimeSource::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(301));
        assert_eq!(clock.now(), start + Duration::from_secs(301));
    }

    #[test]
    fn test_floor_to_interval() {
        let ts = UNIX_EPOCH + Duration::from_millis(12_345);
        let floored = floor_to_interval(ts, Duration::from_secs(2));
        assert_eq!(floored, UNIX_EPOCH + Duration::from_secs(12));

        // Already on a boundary.
        let ts = UNIX_EPOCH + Duration::from_secs(10);
        assert_eq!(floor_to_interval(ts, Duration::from_secs(5)), ts);
    }

    #[test]
    fn test_unix_millis_round_trip() {
        let ts = UNIX_EPOCH + Duration::from_millis(987_654_321);
        assert_eq!(from_unix_millis(unix_millis(ts)), ts);
    }

    #[test]
    fn test_unix_millis_pre_epoch_saturates() {
        let ts = UNIX_EPOCH - Duration::from_secs(10);
        assert_eq!(unix_millis(ts), 0);
    }
}
