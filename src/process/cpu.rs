use std::collections::{HashMap, HashSet};

/// Derives per-process CPU percentages from cumulative CPU time.
///
/// A process's CPU percent over an interval is the CPU-time delta divided
/// by the interval times the logical core count. The first observation for
/// a pid has no previous sample and reports zero.
#[derive(Debug)]
pub struct CpuDeltaTracker {
    cores: u32,
    prev_ms: HashMap<u32, u64>,
}

impl CpuDeltaTracker {
    pub fn new(logical_cores: u32) -> Self {
        Self {
            cores: logical_cores.max(1),
            prev_ms: HashMap::new(),
        }
    }

    /// Records `cpu_time_ms` for `pid` and returns the CPU percent over
    /// the elapsed interval, clamped to zero on counter regression.
    pub fn percent(&mut self, pid: u32, cpu_time_ms: u64, interval_secs: f64) -> f64 {
        let prev = self.prev_ms.insert(pid, cpu_time_ms);

        match prev {
            None => 0.0,
            Some(prev_ms) => {
                let delta_ms = cpu_time_ms.saturating_sub(prev_ms) as f64;
                let budget_ms = interval_secs.max(f64::EPSILON) * 1000.0 * f64::from(self.cores);
                (delta_ms / budget_ms * 100.0).max(0.0)
            }
        }
    }

    /// Drops state for pids no longer in the active set.
    pub fn retain(&mut self, live: &HashSet<u32>) {
        self.prev_ms.retain(|pid, _| live.contains(pid));
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.prev_ms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_is_zero() {
        let mut tracker = CpuDeltaTracker::new(4);
        assert_eq!(tracker.percent(1, 5_000, 1.0), 0.0);
    }

    #[test]
    fn test_delta_over_interval_and_cores() {
        let mut tracker = CpuDeltaTracker::new(4);
        tracker.percent(1, 1_000, 1.0);

        // 500ms of CPU over 1s on 4 cores = 12.5%.
        let pct = tracker.percent(1, 1_500, 1.0);
        assert!((pct - 12.5).abs() < 1e-9, "pct={pct}");

        // 2000ms over 2s on 4 cores = 25%.
        let pct = tracker.percent(1, 3_500, 2.0);
        assert!((pct - 25.0).abs() < 1e-9, "pct={pct}");
    }

    #[test]
    fn test_regression_clamps_to_zero() {
        let mut tracker = CpuDeltaTracker::new(2);
        tracker.percent(1, 10_000, 1.0);
        assert_eq!(tracker.percent(1, 4_000, 1.0), 0.0);
    }

    #[test]
    fn test_retain_trims_departed_pids() {
        let mut tracker = CpuDeltaTracker::new(2);
        tracker.percent(1, 100, 1.0);
        tracker.percent(2, 100, 1.0);
        assert_eq!(tracker.tracked(), 2);

        let live: HashSet<u32> = [2].into_iter().collect();
        tracker.retain(&live);
        assert_eq!(tracker.tracked(), 1);

        // Pid 1 starts over from zero after being trimmed.
        assert_eq!(tracker.percent(1, 200, 1.0), 0.0);
    }

    #[test]
    fn test_zero_cores_treated_as_one() {
        let mut tracker = CpuDeltaTracker::new(0);
        tracker.percent(1, 0, 1.0);
        let pct = tracker.percent(1, 1_000, 1.0);
        assert!((pct - 100.0).abs() < 1e-9, "pct={pct}");
    }
}
