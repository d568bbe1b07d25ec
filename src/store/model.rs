use std::time::SystemTime;

/// Host facts and run metadata captured when a run is opened.
///
/// Everything here is immutable once inserted; only the end time and
/// duration are set later, exactly once, on orderly shutdown.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub started_at: SystemTime,
    pub host_id: String,
    pub machine_name: String,
    pub os_version: String,
    pub logical_cores: u32,
    pub cpu_model: String,
    pub total_memory_mb: f64,
    pub system_drive_type: Option<String>,
    pub system_drive_free_gb: Option<f64>,
    pub uptime_secs: u64,
    pub scenario: Option<String>,
    pub notes: Option<String>,
    pub workload_kind: Option<String>,
    pub workload_size_mb: Option<f64>,
    pub workload_notes: Option<String>,
    pub config_snapshot: String,
    pub tool_version: String,
}

/// A run as read back from the store.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub started_at: SystemTime,
    pub ended_at: Option<SystemTime>,
    pub duration_secs: Option<f64>,
    pub scenario: Option<String>,
    pub tool_version: String,
}

/// One tick of the master clock. Any field may be absent when its source
/// was unavailable or the read failed.
#[derive(Debug, Clone)]
pub struct SystemSample {
    pub timestamp: SystemTime,
    pub cpu_total_percent: Option<f64>,
    pub memory_used_mb: Option<f64>,
    pub memory_available_mb: Option<f64>,
    pub disk_reads_per_sec: Option<f64>,
    pub disk_writes_per_sec: Option<f64>,
    pub disk_read_bytes_per_sec: Option<f64>,
    pub disk_write_bytes_per_sec: Option<f64>,
    pub net_bytes_sent_per_sec: Option<f64>,
    pub net_bytes_recv_per_sec: Option<f64>,
}

impl Default for SystemSample {
    fn default() -> Self {
        Self {
            timestamp: SystemTime::UNIX_EPOCH,
            cpu_total_percent: None,
            memory_used_mb: None,
            memory_available_mb: None,
            disk_reads_per_sec: None,
            disk_writes_per_sec: None,
            disk_read_bytes_per_sec: None,
            disk_write_bytes_per_sec: None,
            net_bytes_sent_per_sec: None,
            net_bytes_recv_per_sec: None,
        }
    }
}

impl SystemSample {
    pub fn at(timestamp: SystemTime) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }
}

/// Per-name aggregate across all live instances of a monitored executable
/// at one tick. Child of a system sample.
#[derive(Debug, Clone)]
pub struct ProcessSample {
    pub process_name: String,
    pub cpu_percent: f64,
    pub working_set_mb: f64,
    pub private_bytes_mb: f64,
    pub thread_count: u32,
    pub handle_count: u32,
}

/// Which managed runtime produced a runtime sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Core,
    Framework,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Core => "core",
            RuntimeKind::Framework => "framework",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "core" => Some(RuntimeKind::Core),
            "framework" => Some(RuntimeKind::Framework),
            _ => None,
        }
    }
}

/// Aggregated managed-runtime counters for one monitored app process.
#[derive(Debug, Clone)]
pub struct RuntimeSample {
    pub timestamp: SystemTime,
    pub app: String,
    pub process_name: String,
    pub kind: RuntimeKind,
    pub heap_mb: Option<f64>,
    pub alloc_mb_per_sec: Option<f64>,
    pub gen0_per_sec: Option<f64>,
    pub gen1_per_sec: Option<f64>,
    pub gen2_per_sec: Option<f64>,
    pub gc_time_percent: Option<f64>,
    pub exceptions_per_sec: Option<f64>,
    pub thread_count: Option<f64>,
    pub pool_thread_count: Option<f64>,
    pub pool_queue_length: Option<f64>,
}

/// One time bucket of completed HTTP requests for an (app, endpoint) pair.
#[derive(Debug, Clone)]
pub struct HttpSample {
    pub bucket_start: SystemTime,
    pub app: String,
    pub process_name: String,
    pub endpoint: String,
    pub request_count: u32,
    pub success_count: u32,
    pub client_error_count: u32,
    pub server_error_count: u32,
    pub other_status_count: u32,
    pub total_duration_ms: f64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// One polling interval of the relational DMV sampler.
#[derive(Debug, Clone)]
pub struct DmvSample {
    pub timestamp: SystemTime,
    pub active_requests: i64,
    pub blocked_requests: i64,
    pub user_connections: i64,
    pub running_sessions: i64,
    pub top_wait_type: Option<String>,
    pub top_wait_ms: i64,
    pub total_wait_ms: i64,
    pub read_stall_ms_per_read: f64,
    pub write_stall_ms_per_write: f64,
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
}

/// Database inventory captured once at run open.
#[derive(Debug, Clone)]
pub struct DbSnapshot {
    pub timestamp: SystemTime,
    pub database_name: String,
    pub size_mb: f64,
    pub object_count: i64,
}

/// What produced a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    ProcessStart,
    ProcessExit,
    Tool,
    User,
}

impl MarkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerKind::ProcessStart => "process_start",
            MarkerKind::ProcessExit => "process_exit",
            MarkerKind::Tool => "tool",
            MarkerKind::User => "user",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "process_start" => Some(MarkerKind::ProcessStart),
            "process_exit" => Some(MarkerKind::ProcessExit),
            "tool" => Some(MarkerKind::Tool),
            "user" => Some(MarkerKind::User),
            _ => None,
        }
    }
}

/// Marker severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerLevel {
    Info,
    Warning,
    Error,
}

impl MarkerLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerLevel::Info => "info",
            MarkerLevel::Warning => "warning",
            MarkerLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "info" => Some(MarkerLevel::Info),
            "warning" => Some(MarkerLevel::Warning),
            "error" => Some(MarkerLevel::Error),
            _ => None,
        }
    }
}

/// A tagged, time-stamped string event attached to a run.
#[derive(Debug, Clone)]
pub struct Marker {
    pub timestamp: SystemTime,
    pub kind: MarkerKind,
    pub level: MarkerLevel,
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_kind_round_trip() {
        for kind in [RuntimeKind::Core, RuntimeKind::Framework] {
            assert_eq!(RuntimeKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(RuntimeKind::from_str("jvm"), None);
    }

    #[test]
    fn test_marker_kind_round_trip() {
        for kind in [
            MarkerKind::ProcessStart,
            MarkerKind::ProcessExit,
            MarkerKind::Tool,
            MarkerKind::User,
        ] {
            assert_eq!(MarkerKind::from_str(kind.as_str()), Some(kind));
        }
    }
}
