use std::fmt::Write as _;

use sha2::{Digest, Sha256};
use sysinfo::{Disks, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Host facts recorded once on the run record.
#[derive(Debug, Clone)]
pub struct HostFacts {
    pub host_id: String,
    pub machine_name: String,
    pub os_version: String,
    pub logical_cores: u32,
    pub cpu_model: String,
    pub total_memory_mb: f64,
    pub system_drive_type: Option<String>,
    pub system_drive_free_gb: Option<f64>,
    pub uptime_secs: u64,
}

/// Collects host facts. Every field degrades to a neutral value when its
/// source is unavailable; collection itself never fails.
pub fn collect() -> HostFacts {
    let mut sys = System::new();
    sys.refresh_cpu_list(sysinfo::CpuRefreshKind::nothing());
    sys.refresh_memory();

    let machine_name = System::host_name().unwrap_or_default();
    let os_version = System::long_os_version()
        .or_else(System::os_version)
        .unwrap_or_default();

    let cpu_model = sys
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .unwrap_or_default();

    let (system_drive_type, system_drive_free_gb) = system_drive();

    HostFacts {
        host_id: build_host_id(&machine_name, &os_version),
        machine_name,
        os_version,
        logical_cores: sys.cpus().len() as u32,
        cpu_model,
        total_memory_mb: sys.total_memory() as f64 / BYTES_PER_MB,
        system_drive_type,
        system_drive_free_gb,
        uptime_secs: System::uptime(),
    }
}

/// Type and free space of the drive backing the root mount.
fn system_drive() -> (Option<String>, Option<f64>) {
    let disks = Disks::new_with_refreshed_list();

    let root = disks
        .list()
        .iter()
        .find(|d| {
            let mount = d.mount_point();
            mount == std::path::Path::new("/") || mount == std::path::Path::new("C:\\")
        })
        .or_else(|| disks.list().first());

    match root {
        Some(disk) => (
            Some(disk.kind().to_string().to_lowercase()),
            Some(disk.available_space() as f64 / BYTES_PER_GB),
        ),
        None => (None, None),
    }
}

/// Derives a stable host identifier from the machine identity, preferring
/// the OS machine id when readable.
fn build_host_id(machine_name: &str, os_version: &str) -> String {
    let machine_id = std::fs::read_to_string("/etc/machine-id")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(machine_id.as_bytes());
    hasher.update(machine_name.as_bytes());
    hasher.update(os_version.as_bytes());

    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
