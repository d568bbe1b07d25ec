use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use sysinfo::Networks;

// Counter category and name constants. The catalog addresses every counter
// by (category, counter, instance), mirroring how the OS catalog names them.
pub const CAT_PROCESSOR: &str = "processor";
pub const CTR_TOTAL_PERCENT: &str = "total_percent";

pub const CAT_PHYSICAL_DISK: &str = "physical_disk";
pub const CTR_READS_PER_SEC: &str = "reads_per_sec";
pub const CTR_WRITES_PER_SEC: &str = "writes_per_sec";
pub const CTR_READ_BYTES_PER_SEC: &str = "read_bytes_per_sec";
pub const CTR_WRITE_BYTES_PER_SEC: &str = "write_bytes_per_sec";

pub const CAT_NETWORK_INTERFACE: &str = "network_interface";
pub const CTR_BYTES_SENT_PER_SEC: &str = "bytes_sent_per_sec";
pub const CTR_BYTES_RECV_PER_SEC: &str = "bytes_recv_per_sec";

pub const CAT_MANAGED_MEMORY: &str = "managed_memory";
pub const CTR_PROCESS_ID: &str = "process_id";
pub const CTR_HEAP_BYTES_ALL: &str = "heap_bytes_all";
pub const CTR_GEN0_COLLECTIONS_PER_SEC: &str = "gen0_collections_per_sec";
pub const CTR_GEN1_COLLECTIONS_PER_SEC: &str = "gen1_collections_per_sec";
pub const CTR_GEN2_COLLECTIONS_PER_SEC: &str = "gen2_collections_per_sec";
pub const CTR_GC_TIME_PERCENT: &str = "gc_time_percent";

pub const CAT_MANAGED_EXCEPTIONS: &str = "managed_exceptions";
pub const CTR_EXCEPTIONS_PER_SEC: &str = "exceptions_per_sec";

pub const CAT_MANAGED_THREADS: &str = "managed_threads";
pub const CTR_LOGICAL_THREADS: &str = "logical_threads";

/// A stateful rate counter.
///
/// Counters compute a rate relative to their previous read, so the first
/// read after opening is a priming read whose value the caller discards.
pub trait Counter: Send {
    /// Reads the counter, given the seconds elapsed since the last read.
    fn read(&mut self, interval_secs: f64) -> Result<f64>;
}

/// Factory for counters and counter instances.
pub trait CounterCatalog: Send + Sync {
    /// Opens a counter by (category, counter, instance).
    fn open(
        &self,
        category: &str,
        counter: &str,
        instance: Option<&str>,
    ) -> Result<Box<dyn Counter>>;

    /// Enumerates the instances of a multi-instance category.
    fn instances(&self, category: &str) -> Result<Vec<String>>;
}

/// The host-backed catalog: CPU and memory through `sysinfo`, disk
/// throughput through `/proc/diskstats`, network byte rates through the
/// interface totals.
#[derive(Debug, Default)]
pub struct SystemCatalog;

impl SystemCatalog {
    pub fn new() -> Self {
        Self
    }
}

impl CounterCatalog for SystemCatalog {
    fn open(
        &self,
        category: &str,
        counter: &str,
        instance: Option<&str>,
    ) -> Result<Box<dyn Counter>> {
        match (category, counter) {
            (CAT_PROCESSOR, CTR_TOTAL_PERCENT) => Ok(Box::new(CpuTotalCounter::new())),

            (CAT_PHYSICAL_DISK, CTR_READS_PER_SEC) => {
                Ok(Box::new(DiskRateCounter::new(DiskField::Reads)))
            }
            (CAT_PHYSICAL_DISK, CTR_WRITES_PER_SEC) => {
                Ok(Box::new(DiskRateCounter::new(DiskField::Writes)))
            }
            (CAT_PHYSICAL_DISK, CTR_READ_BYTES_PER_SEC) => {
                Ok(Box::new(DiskRateCounter::new(DiskField::ReadBytes)))
            }
            (CAT_PHYSICAL_DISK, CTR_WRITE_BYTES_PER_SEC) => {
                Ok(Box::new(DiskRateCounter::new(DiskField::WriteBytes)))
            }

            (CAT_NETWORK_INTERFACE, CTR_BYTES_SENT_PER_SEC) => {
                let iface = instance.context("network counter requires an instance")?;
                Ok(Box::new(NetRateCounter::new(iface, NetDirection::Sent)))
            }
            (CAT_NETWORK_INTERFACE, CTR_BYTES_RECV_PER_SEC) => {
                let iface = instance.context("network counter requires an instance")?;
                Ok(Box::new(NetRateCounter::new(iface, NetDirection::Received)))
            }

            _ => bail!("counter {category}/{counter} is not available on this host"),
        }
    }

    fn instances(&self, category: &str) -> Result<Vec<String>> {
        match category {
            CAT_NETWORK_INTERFACE => {
                let networks = Networks::new_with_refreshed_list();
                Ok(networks.list().keys().cloned().collect())
            }
            _ => bail!("category {category} has no enumerable instances on this host"),
        }
    }
}

/// Total CPU utilization across all logical cores.
struct CpuTotalCounter {
    sys: sysinfo::System,
}

impl CpuTotalCounter {
    fn new() -> Self {
        Self {
            sys: sysinfo::System::new(),
        }
    }
}

impl Counter for CpuTotalCounter {
    fn read(&mut self, _interval_secs: f64) -> Result<f64> {
        // Utilization is computed against the previous refresh, which is
        // exactly the priming contract: the first read is meaningless.
        self.sys.refresh_cpu_usage();
        Ok(f64::from(self.sys.global_cpu_usage()))
    }
}

#[derive(Debug, Clone, Copy)]
enum DiskField {
    Reads,
    Writes,
    ReadBytes,
    WriteBytes,
}

/// Whole-host disk throughput from `/proc/diskstats` deltas.
struct DiskRateCounter {
    field: DiskField,
    prev_total: Option<u64>,
}

impl DiskRateCounter {
    fn new(field: DiskField) -> Self {
        Self {
            field,
            prev_total: None,
        }
    }
}

impl Counter for DiskRateCounter {
    fn read(&mut self, interval_secs: f64) -> Result<f64> {
        let raw = std::fs::read_to_string("/proc/diskstats").context("reading /proc/diskstats")?;
        let totals = parse_diskstats(&raw);

        let total = match self.field {
            DiskField::Reads => totals.reads,
            DiskField::Writes => totals.writes,
            DiskField::ReadBytes => totals.read_bytes,
            DiskField::WriteBytes => totals.write_bytes,
        };

        let delta = match self.prev_total {
            Some(prev) => total.saturating_sub(prev),
            None => 0,
        };
        self.prev_total = Some(total);

        Ok(delta as f64 / interval_secs.max(f64::EPSILON))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct DiskTotals {
    reads: u64,
    writes: u64,
    read_bytes: u64,
    write_bytes: u64,
}

const SECTOR_SIZE: u64 = 512;

/// Sums whole-device rows of a `/proc/diskstats` dump.
///
/// Virtual devices (loop, ram, device-mapper, md) are skipped, and a row
/// whose name extends an already-kept device name is treated as a
/// partition of that device so its I/O is not double counted.
fn parse_diskstats(raw: &str) -> DiskTotals {
    let mut totals = DiskTotals::default();
    let mut kept: Vec<String> = Vec::new();

    for line in raw.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }

        let name = fields[2];
        if ["loop", "ram", "zram", "dm-", "md", "sr", "fd"]
            .iter()
            .any(|p| name.starts_with(p))
        {
            continue;
        }

        if kept.iter().any(|base| name.starts_with(base.as_str())) {
            continue; // Partition of a device already counted.
        }
        kept.push(name.to_string());

        let parse = |idx: usize| fields[idx].parse::<u64>().unwrap_or(0);
        totals.reads += parse(3);
        totals.read_bytes += parse(5) * SECTOR_SIZE;
        totals.writes += parse(7);
        totals.write_bytes += parse(9) * SECTOR_SIZE;
    }

    totals
}

#[derive(Debug, Clone, Copy)]
enum NetDirection {
    Sent,
    Received,
}

/// Byte rate of one network interface, from interface total deltas.
struct NetRateCounter {
    iface: String,
    direction: NetDirection,
    networks: Networks,
    prev_total: Option<u64>,
}

impl NetRateCounter {
    fn new(iface: &str, direction: NetDirection) -> Self {
        Self {
            iface: iface.to_string(),
            direction,
            networks: Networks::new_with_refreshed_list(),
            prev_total: None,
        }
    }
}

impl Counter for NetRateCounter {
    fn read(&mut self, interval_secs: f64) -> Result<f64> {
        self.networks.refresh(false);

        let data = self
            .networks
            .list()
            .get(&self.iface)
            .with_context(|| format!("network interface {} not present", self.iface))?;

        let total = match self.direction {
            NetDirection::Sent => data.total_transmitted(),
            NetDirection::Received => data.total_received(),
        };

        let delta = match self.prev_total {
            Some(prev) => total.saturating_sub(prev),
            None => 0,
        };
        self.prev_total = Some(total);

        Ok(delta as f64 / interval_secs.max(f64::EPSILON))
    }
}

/// A catalog serving canned counters, for composing readers in tests.
#[derive(Default)]
pub struct StaticCatalog {
    counters: parking_lot::Mutex<HashMap<String, Vec<f64>>>,
    failing: parking_lot::Mutex<std::collections::HashSet<String>>,
    instance_lists: parking_lot::Mutex<HashMap<String, Vec<String>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(category: &str, counter: &str, instance: Option<&str>) -> String {
        match instance {
            Some(inst) => format!("{category}/{counter}/{inst}"),
            None => format!("{category}/{counter}"),
        }
    }

    /// Registers a counter that yields `values` in order, repeating the
    /// last value once exhausted.
    pub fn with_counter(
        self,
        category: &str,
        counter: &str,
        instance: Option<&str>,
        values: Vec<f64>,
    ) -> Self {
        self.counters
            .lock()
            .insert(Self::key(category, counter, instance), values);
        self
    }

    /// Registers a counter whose every read fails.
    pub fn with_failing_counter(self, category: &str, counter: &str) -> Self {
        self.failing.lock().insert(Self::key(category, counter, None));
        self
    }

    /// Registers the instance list of a category.
    pub fn with_instances(self, category: &str, instances: Vec<String>) -> Self {
        self.instance_lists
            .lock()
            .insert(category.to_string(), instances);
        self
    }
}

struct ScriptedCounter {
    values: Vec<f64>,
    next: usize,
}

impl Counter for ScriptedCounter {
    fn read(&mut self, _interval_secs: f64) -> Result<f64> {
        let value = self
            .values
            .get(self.next)
            .or_else(|| self.values.last())
            .copied()
            .unwrap_or(0.0);
        self.next += 1;
        Ok(value)
    }
}

struct FailingCounter {
    name: String,
}

impl Counter for FailingCounter {
    fn read(&mut self, _interval_secs: f64) -> Result<f64> {
        bail!("counter {} read failed", self.name)
    }
}

impl CounterCatalog for StaticCatalog {
    fn open(
        &self,
        category: &str,
        counter: &str,
        instance: Option<&str>,
    ) -> Result<Box<dyn Counter>> {
        let key = Self::key(category, counter, instance);

        if self.failing.lock().contains(&Self::key(category, counter, None)) {
            return Ok(Box::new(FailingCounter { name: key }));
        }

        let counters = self.counters.lock();
        let values = counters
            .get(&key)
            .with_context(|| format!("counter {key} not registered"))?
            .clone();

        Ok(Box::new(ScriptedCounter { values, next: 0 }))
    }

    fn instances(&self, category: &str) -> Result<Vec<String>> {
        self.instance_lists
            .lock()
            .get(category)
            .cloned()
            .with_context(|| format!("category {category} not registered"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISKSTATS: &str = "\
   8       0 sda 100 0 2048 50 200 0 4096 80 0 120 130 0 0 0 0 0 0
   8       1 sda1 90 0 1800 45 180 0 3600 70 0 110 115 0 0 0 0 0 0
 259       0 nvme0n1 1000 0 80000 500 2000 0 160000 800 0 900 1300 0 0 0 0 0 0
 259       1 nvme0n1p1 900 0 70000 450 1800 0 150000 700 0 800 1150 0 0 0 0 0 0
   7       0 loop0 5000 0 9999 1 0 0 0 0 0 0 0 0 0 0 0 0 0
";

    #[test]
    fn test_parse_diskstats_skips_partitions_and_virtual_devices() {
        let totals = parse_diskstats(DISKSTATS);
        // Only sda and nvme0n1 count; sda1, nvme0n1p1 and loop0 are skipped.
        assert_eq!(totals.reads, 1100);
        assert_eq!(totals.writes, 2200);
        assert_eq!(totals.read_bytes, (2048 + 80000) * SECTOR_SIZE);
        assert_eq!(totals.write_bytes, (4096 + 160000) * SECTOR_SIZE);
    }

    #[test]
    fn test_parse_diskstats_empty_input() {
        assert_eq!(parse_diskstats(""), DiskTotals::default());
    }

    #[test]
    fn test_scripted_counter_repeats_last_value() {
        let catalog = StaticCatalog::new().with_counter(
            CAT_PROCESSOR,
            CTR_TOTAL_PERCENT,
            None,
            vec![0.0, 40.0],
        );
        let mut counter = catalog
            .open(CAT_PROCESSOR, CTR_TOTAL_PERCENT, None)
            .expect("counter opens");

        assert_eq!(counter.read(1.0).expect("read"), 0.0);
        assert_eq!(counter.read(1.0).expect("read"), 40.0);
        assert_eq!(counter.read(1.0).expect("read"), 40.0);
    }

    #[test]
    fn test_failing_counter_fails_every_read() {
        let catalog = StaticCatalog::new().with_failing_counter(CAT_PROCESSOR, CTR_TOTAL_PERCENT);
        let mut counter = catalog
            .open(CAT_PROCESSOR, CTR_TOTAL_PERCENT, None)
            .expect("open succeeds even for failing counters");

        assert!(counter.read(1.0).is_err());
        assert!(counter.read(1.0).is_err());
    }

    #[test]
    fn test_unknown_counter_fails_to_open() {
        let catalog = SystemCatalog::new();
        assert!(catalog.open("no_such_category", "nope", None).is_err());
    }
}
