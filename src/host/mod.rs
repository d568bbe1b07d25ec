pub mod catalog;
pub mod facts;

use std::time::SystemTime;

use tracing::{debug, warn};

use crate::store::SystemSample;

use self::catalog::{
    Counter, CounterCatalog, CAT_NETWORK_INTERFACE, CAT_PHYSICAL_DISK, CAT_PROCESSOR,
    CTR_BYTES_RECV_PER_SEC, CTR_BYTES_SENT_PER_SEC, CTR_READS_PER_SEC, CTR_READ_BYTES_PER_SEC,
    CTR_TOTAL_PERCENT, CTR_WRITES_PER_SEC, CTR_WRITE_BYTES_PER_SEC,
};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Memory figures from the host info source.
pub struct HostInfo {
    sys: sysinfo::System,
}

impl HostInfo {
    pub fn new() -> Self {
        Self {
            sys: sysinfo::System::new(),
        }
    }

    /// Refreshes and returns (memory in use MB, memory available MB).
    /// Returns `None` when the platform reports no memory at all.
    pub fn memory_mb(&mut self) -> Option<(f64, f64)> {
        self.sys.refresh_memory();

        let total = self.sys.total_memory();
        if total == 0 {
            return None;
        }

        let used = self.sys.used_memory() as f64 / BYTES_PER_MB;
        let available = self.sys.available_memory() as f64 / BYTES_PER_MB;
        Some((used, available))
    }
}

impl Default for HostInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture toggles for the counter reader.
#[derive(Debug, Clone, Copy)]
pub struct CounterToggles {
    pub disk: bool,
    pub network: bool,
}

/// Reads host and OS counters without letting a single failing source
/// abort a tick.
///
/// Counters are opened once and primed with one discard read so the first
/// real read reports a rate rather than a cumulative total. The network
/// interface set is enumerated once here; interfaces appearing later in
/// the run are not captured.
pub struct CounterReader {
    cpu_total: Option<Box<dyn Counter>>,
    disk_reads: Option<Box<dyn Counter>>,
    disk_writes: Option<Box<dyn Counter>>,
    disk_read_bytes: Option<Box<dyn Counter>>,
    disk_write_bytes: Option<Box<dyn Counter>>,
    net_sent: Vec<Box<dyn Counter>>,
    net_recv: Vec<Box<dyn Counter>>,
    host_info: HostInfo,
    closed: bool,
}

impl CounterReader {
    /// Opens and primes the fixed counter set. Individual open failures
    /// are logged and leave that counter unavailable; construction itself
    /// never fails.
    pub fn new(toggles: CounterToggles, catalog: &dyn CounterCatalog) -> Self {
        let open = |category: &str, counter: &str, instance: Option<&str>| {
            match catalog.open(category, counter, instance) {
                Ok(mut c) => {
                    // Priming read; the value is meaningless by contract.
                    if let Err(e) = c.read(1.0) {
                        debug!(category, counter, error = %e, "priming read failed");
                    }
                    Some(c)
                }
                Err(e) => {
                    warn!(category, counter, error = %e, "counter unavailable");
                    None
                }
            }
        };

        let cpu_total = open(CAT_PROCESSOR, CTR_TOTAL_PERCENT, None);

        let (disk_reads, disk_writes, disk_read_bytes, disk_write_bytes) = if toggles.disk {
            (
                open(CAT_PHYSICAL_DISK, CTR_READS_PER_SEC, None),
                open(CAT_PHYSICAL_DISK, CTR_WRITES_PER_SEC, None),
                open(CAT_PHYSICAL_DISK, CTR_READ_BYTES_PER_SEC, None),
                open(CAT_PHYSICAL_DISK, CTR_WRITE_BYTES_PER_SEC, None),
            )
        } else {
            (None, None, None, None)
        };

        let mut net_sent = Vec::new();
        let mut net_recv = Vec::new();
        if toggles.network {
            match catalog.instances(CAT_NETWORK_INTERFACE) {
                Ok(interfaces) => {
                    for iface in &interfaces {
                        if let Some(c) =
                            open(CAT_NETWORK_INTERFACE, CTR_BYTES_SENT_PER_SEC, Some(iface))
                        {
                            net_sent.push(c);
                        }
                        if let Some(c) =
                            open(CAT_NETWORK_INTERFACE, CTR_BYTES_RECV_PER_SEC, Some(iface))
                        {
                            net_recv.push(c);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "network interface enumeration failed");
                }
            }
        }

        Self {
            cpu_total,
            disk_reads,
            disk_writes,
            disk_read_bytes,
            disk_write_bytes,
            net_sent,
            net_recv,
            host_info: HostInfo::new(),
            closed: false,
        }
    }

    /// Reads every open counter into a system sample at `timestamp`.
    /// Per-counter failures yield absent fields and never propagate.
    pub fn snapshot(&mut self, timestamp: SystemTime, interval_secs: f64) -> SystemSample {
        let mut sample = SystemSample::at(timestamp);

        if self.closed {
            return sample;
        }

        sample.cpu_total_percent = read_opt(&mut self.cpu_total, interval_secs, "cpu_total");
        sample.disk_reads_per_sec = read_opt(&mut self.disk_reads, interval_secs, "disk_reads");
        sample.disk_writes_per_sec = read_opt(&mut self.disk_writes, interval_secs, "disk_writes");
        sample.disk_read_bytes_per_sec =
            read_opt(&mut self.disk_read_bytes, interval_secs, "disk_read_bytes");
        sample.disk_write_bytes_per_sec =
            read_opt(&mut self.disk_write_bytes, interval_secs, "disk_write_bytes");

        sample.net_bytes_sent_per_sec = sum_counters(&mut self.net_sent, interval_secs, "net_sent");
        sample.net_bytes_recv_per_sec = sum_counters(&mut self.net_recv, interval_secs, "net_recv");

        if let Some((used, available)) = self.host_info.memory_mb() {
            sample.memory_used_mb = Some(used);
            sample.memory_available_mb = Some(available);
        }

        sample
    }

    /// Releases all counter resources. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cpu_total = None;
        self.disk_reads = None;
        self.disk_writes = None;
        self.disk_read_bytes = None;
        self.disk_write_bytes = None;
        self.net_sent.clear();
        self.net_recv.clear();
    }

    /// True when no disk counter is open (disabled or all opens failed).
    pub fn has_disk_counters(&self) -> bool {
        self.disk_reads.is_some()
            || self.disk_writes.is_some()
            || self.disk_read_bytes.is_some()
            || self.disk_write_bytes.is_some()
    }

    /// Number of open per-interface network counters.
    pub fn network_counter_count(&self) -> usize {
        self.net_sent.len() + self.net_recv.len()
    }
}

fn read_opt(slot: &mut Option<Box<dyn Counter>>, interval_secs: f64, what: &str) -> Option<f64> {
    let counter = slot.as_mut()?;
    match counter.read(interval_secs) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(counter = what, error = %e, "counter read failed");
            None
        }
    }
}

/// Sums a set of per-instance counters; instances whose read fails are
/// left out. Absent only when no counter is open at all.
fn sum_counters(
    counters: &mut [Box<dyn Counter>],
    interval_secs: f64,
    what: &str,
) -> Option<f64> {
    if counters.is_empty() {
        return None;
    }

    let mut sum = 0.0;
    for counter in counters.iter_mut() {
        match counter.read(interval_secs) {
            Ok(v) => sum += v,
            Err(e) => {
                debug!(counter = what, error = %e, "instance read failed");
            }
        }
    }

    Some(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::catalog::StaticCatalog;
    use std::time::UNIX_EPOCH;

    fn toggles(disk: bool, network: bool) -> CounterToggles {
        CounterToggles { disk, network }
    }

    fn full_catalog() -> StaticCatalog {
        StaticCatalog::new()
            .with_counter(CAT_PROCESSOR, CTR_TOTAL_PERCENT, None, vec![0.0, 25.0, 50.0])
            .with_counter(CAT_PHYSICAL_DISK, CTR_READS_PER_SEC, None, vec![0.0, 10.0])
            .with_counter(CAT_PHYSICAL_DISK, CTR_WRITES_PER_SEC, None, vec![0.0, 20.0])
            .with_counter(
                CAT_PHYSICAL_DISK,
                CTR_READ_BYTES_PER_SEC,
                None,
                vec![0.0, 4096.0],
            )
            .with_counter(
                CAT_PHYSICAL_DISK,
                CTR_WRITE_BYTES_PER_SEC,
                None,
                vec![0.0, 8192.0],
            )
            .with_instances(
                CAT_NETWORK_INTERFACE,
                vec!["eth0".to_string(), "eth1".to_string()],
            )
            .with_counter(
                CAT_NETWORK_INTERFACE,
                CTR_BYTES_SENT_PER_SEC,
                Some("eth0"),
                vec![0.0, 100.0],
            )
            .with_counter(
                CAT_NETWORK_INTERFACE,
                CTR_BYTES_SENT_PER_SEC,
                Some("eth1"),
                vec![0.0, 11.0],
            )
            .with_counter(
                CAT_NETWORK_INTERFACE,
                CTR_BYTES_RECV_PER_SEC,
                Some("eth0"),
                vec![0.0, 200.0],
            )
            .with_counter(
                CAT_NETWORK_INTERFACE,
                CTR_BYTES_RECV_PER_SEC,
                Some("eth1"),
                vec![0.0, 22.0],
            )
    }

    #[test]
    fn test_snapshot_sums_network_interfaces() {
        let catalog = full_catalog();
        let mut reader = CounterReader::new(toggles(true, true), &catalog);

        // The priming read consumed index 0 of every scripted counter.
        let sample = reader.snapshot(UNIX_EPOCH, 1.0);
        assert_eq!(sample.cpu_total_percent, Some(25.0));
        assert_eq!(sample.disk_reads_per_sec, Some(10.0));
        assert_eq!(sample.net_bytes_sent_per_sec, Some(111.0));
        assert_eq!(sample.net_bytes_recv_per_sec, Some(222.0));
    }

    #[test]
    fn test_disk_disabled_opens_no_disk_counters() {
        let catalog = full_catalog();
        let reader = CounterReader::new(toggles(false, false), &catalog);

        assert!(!reader.has_disk_counters());
        assert_eq!(reader.network_counter_count(), 0);
    }

    #[test]
    fn test_network_disabled_skips_enumeration() {
        // No instance list registered: enumeration would fail loudly, so a
        // reader with network disabled must never ask for it.
        let catalog = StaticCatalog::new().with_counter(
            CAT_PROCESSOR,
            CTR_TOTAL_PERCENT,
            None,
            vec![0.0],
        );
        let reader = CounterReader::new(toggles(false, false), &catalog);
        assert_eq!(reader.network_counter_count(), 0);
    }

    #[test]
    fn test_failing_cpu_counter_leaves_field_absent() {
        let catalog = full_catalog().with_failing_counter(CAT_PROCESSOR, CTR_TOTAL_PERCENT);
        let mut reader = CounterReader::new(toggles(true, false), &catalog);

        let sample = reader.snapshot(UNIX_EPOCH, 1.0);
        assert_eq!(sample.cpu_total_percent, None);
        assert_eq!(sample.disk_reads_per_sec, Some(10.0));
        assert_eq!(sample.disk_writes_per_sec, Some(20.0));
    }

    #[test]
    fn test_close_is_idempotent_and_stops_reads() {
        let catalog = full_catalog();
        let mut reader = CounterReader::new(toggles(true, false), &catalog);

        reader.close();
        reader.close();

        let sample = reader.snapshot(UNIX_EPOCH, 1.0);
        assert_eq!(sample.cpu_total_percent, None);
        assert_eq!(sample.disk_reads_per_sec, None);
    }
}
