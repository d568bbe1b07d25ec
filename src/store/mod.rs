pub mod model;

use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::clock::{from_unix_millis, unix_millis};

pub use model::{
    DbSnapshot, DmvSample, HttpSample, Marker, MarkerKind, MarkerLevel, NewRun, ProcessSample,
    RunRow, RuntimeKind, RuntimeSample, SystemSample,
};

/// Append-only store for capture runs, backed by SQLite in WAL mode.
///
/// All write operations are thread-safe; concurrent writers from the
/// sampling loops are expected and serialize on the connection mutex.
pub struct Store {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at_ms        INTEGER NOT NULL,
    ended_at_ms          INTEGER,
    duration_secs        REAL,
    host_id              TEXT NOT NULL,
    machine_name         TEXT NOT NULL,
    os_version           TEXT NOT NULL,
    logical_cores        INTEGER NOT NULL,
    cpu_model            TEXT NOT NULL,
    total_memory_mb      REAL NOT NULL,
    system_drive_type    TEXT,
    system_drive_free_gb REAL,
    uptime_secs          INTEGER NOT NULL,
    scenario             TEXT,
    notes                TEXT,
    workload_kind        TEXT,
    workload_size_mb     REAL,
    workload_notes       TEXT,
    config_snapshot      TEXT NOT NULL,
    tool_version         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS system_samples (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id                  INTEGER NOT NULL REFERENCES runs(id),
    timestamp_ms            INTEGER NOT NULL,
    cpu_total_percent       REAL,
    memory_used_mb          REAL,
    memory_available_mb     REAL,
    disk_reads_per_sec      REAL,
    disk_writes_per_sec     REAL,
    disk_read_bytes_per_sec REAL,
    disk_write_bytes_per_sec REAL,
    net_bytes_sent_per_sec  REAL,
    net_bytes_recv_per_sec  REAL
);
CREATE INDEX IF NOT EXISTS idx_system_samples_run ON system_samples(run_id, timestamp_ms);

CREATE TABLE IF NOT EXISTS process_samples (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    system_sample_id INTEGER NOT NULL REFERENCES system_samples(id),
    process_name     TEXT NOT NULL,
    cpu_percent      REAL NOT NULL,
    working_set_mb   REAL NOT NULL,
    private_bytes_mb REAL NOT NULL,
    thread_count     INTEGER NOT NULL,
    handle_count     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_process_samples_parent ON process_samples(system_sample_id);

CREATE TABLE IF NOT EXISTS runtime_samples (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id             INTEGER NOT NULL REFERENCES runs(id),
    timestamp_ms       INTEGER NOT NULL,
    app                TEXT NOT NULL,
    process_name       TEXT NOT NULL,
    runtime_kind       TEXT NOT NULL,
    heap_mb            REAL,
    alloc_mb_per_sec   REAL,
    gen0_per_sec       REAL,
    gen1_per_sec       REAL,
    gen2_per_sec       REAL,
    gc_time_percent    REAL,
    exceptions_per_sec REAL,
    thread_count       REAL,
    pool_thread_count  REAL,
    pool_queue_length  REAL
);
CREATE INDEX IF NOT EXISTS idx_runtime_samples_run ON runtime_samples(run_id, timestamp_ms);

CREATE TABLE IF NOT EXISTS http_samples (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id             INTEGER NOT NULL REFERENCES runs(id),
    bucket_start_ms    INTEGER NOT NULL,
    app                TEXT NOT NULL,
    process_name       TEXT NOT NULL,
    endpoint           TEXT NOT NULL,
    request_count      INTEGER NOT NULL,
    success_count      INTEGER NOT NULL,
    client_error_count INTEGER NOT NULL,
    server_error_count INTEGER NOT NULL,
    other_status_count INTEGER NOT NULL,
    total_duration_ms  REAL NOT NULL,
    avg_duration_ms    REAL NOT NULL,
    min_duration_ms    REAL NOT NULL,
    max_duration_ms    REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_http_samples_run ON http_samples(run_id, bucket_start_ms);

CREATE TABLE IF NOT EXISTS dmv_samples (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id                  INTEGER NOT NULL REFERENCES runs(id),
    timestamp_ms            INTEGER NOT NULL,
    active_requests         INTEGER NOT NULL,
    blocked_requests        INTEGER NOT NULL,
    user_connections        INTEGER NOT NULL,
    running_sessions        INTEGER NOT NULL,
    top_wait_type           TEXT,
    top_wait_ms             INTEGER NOT NULL,
    total_wait_ms           INTEGER NOT NULL,
    read_stall_ms_per_read  REAL NOT NULL,
    write_stall_ms_per_write REAL NOT NULL,
    read_bytes_per_sec      REAL NOT NULL,
    write_bytes_per_sec     REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS db_snapshots (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id        INTEGER NOT NULL REFERENCES runs(id),
    timestamp_ms  INTEGER NOT NULL,
    database_name TEXT NOT NULL,
    size_mb       REAL NOT NULL,
    object_count  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS markers (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id       INTEGER NOT NULL REFERENCES runs(id),
    timestamp_ms INTEGER NOT NULL,
    kind         TEXT NOT NULL,
    level        TEXT NOT NULL,
    label        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_markers_run ON markers(run_id, timestamp_ms);
"#;

impl Store {
    /// Opens (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating store directory {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening store {}", path.display()))?;

        Self::init(conn)
    }

    /// Opens a throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("opening in-memory store")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting synchronous mode")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("setting busy timeout")?;

        conn.execute_batch(SCHEMA).context("creating schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a new run and returns its identifier.
    pub fn insert_run(&self, run: &NewRun) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO runs (
                started_at_ms, host_id, machine_name, os_version, logical_cores,
                cpu_model, total_memory_mb, system_drive_type, system_drive_free_gb,
                uptime_secs, scenario, notes, workload_kind, workload_size_mb,
                workload_notes, config_snapshot, tool_version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                unix_millis(run.started_at),
                run.host_id,
                run.machine_name,
                run.os_version,
                run.logical_cores,
                run.cpu_model,
                run.total_memory_mb,
                run.system_drive_type,
                run.system_drive_free_gb,
                run.uptime_secs,
                run.scenario,
                run.notes,
                run.workload_kind,
                run.workload_size_mb,
                run.workload_notes,
                run.config_snapshot,
                run.tool_version,
            ],
        )
        .context("inserting run")?;

        Ok(conn.last_insert_rowid())
    }

    /// Sets the run's end timestamp and duration. Intended to be called
    /// exactly once, on orderly shutdown.
    pub fn finish_run(&self, run_id: i64, ended_at: SystemTime, duration: Duration) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET ended_at_ms = ?1, duration_secs = ?2 WHERE id = ?3",
            params![unix_millis(ended_at), duration.as_secs_f64(), run_id],
        )
        .context("updating run end record")?;

        Ok(())
    }

    /// Inserts one system sample and returns its identifier.
    pub fn insert_system_sample(&self, run_id: i64, sample: &SystemSample) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO system_samples (
                run_id, timestamp_ms, cpu_total_percent, memory_used_mb,
                memory_available_mb, disk_reads_per_sec, disk_writes_per_sec,
                disk_read_bytes_per_sec, disk_write_bytes_per_sec,
                net_bytes_sent_per_sec, net_bytes_recv_per_sec
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run_id,
                unix_millis(sample.timestamp),
                sample.cpu_total_percent,
                sample.memory_used_mb,
                sample.memory_available_mb,
                sample.disk_reads_per_sec,
                sample.disk_writes_per_sec,
                sample.disk_read_bytes_per_sec,
                sample.disk_write_bytes_per_sec,
                sample.net_bytes_sent_per_sec,
                sample.net_bytes_recv_per_sec,
            ],
        )
        .context("inserting system sample")?;

        Ok(conn.last_insert_rowid())
    }

    /// Inserts the process samples belonging to one system sample.
    pub fn insert_process_samples(
        &self,
        system_sample_id: i64,
        samples: &[ProcessSample],
    ) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting transaction")?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO process_samples (
                        system_sample_id, process_name, cpu_percent, working_set_mb,
                        private_bytes_mb, thread_count, handle_count
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .context("preparing process sample insert")?;

            for s in samples {
                stmt.execute(params![
                    system_sample_id,
                    s.process_name,
                    s.cpu_percent,
                    s.working_set_mb,
                    s.private_bytes_mb,
                    s.thread_count,
                    s.handle_count,
                ])
                .context("inserting process sample")?;
            }
        }
        tx.commit().context("committing process samples")?;

        Ok(())
    }

    /// Inserts a batch of managed-runtime samples.
    pub fn insert_runtime_samples(&self, run_id: i64, samples: &[RuntimeSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting transaction")?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO runtime_samples (
                        run_id, timestamp_ms, app, process_name, runtime_kind, heap_mb,
                        alloc_mb_per_sec, gen0_per_sec, gen1_per_sec, gen2_per_sec,
                        gc_time_percent, exceptions_per_sec, thread_count,
                        pool_thread_count, pool_queue_length
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                )
                .context("preparing runtime sample insert")?;

            for s in samples {
                stmt.execute(params![
                    run_id,
                    unix_millis(s.timestamp),
                    s.app,
                    s.process_name,
                    s.kind.as_str(),
                    s.heap_mb,
                    s.alloc_mb_per_sec,
                    s.gen0_per_sec,
                    s.gen1_per_sec,
                    s.gen2_per_sec,
                    s.gc_time_percent,
                    s.exceptions_per_sec,
                    s.thread_count,
                    s.pool_thread_count,
                    s.pool_queue_length,
                ])
                .context("inserting runtime sample")?;
            }
        }
        tx.commit().context("committing runtime samples")?;

        Ok(())
    }

    /// Inserts a batch of HTTP bucket samples.
    pub fn insert_http_samples(&self, run_id: i64, samples: &[HttpSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("starting transaction")?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO http_samples (
                        run_id, bucket_start_ms, app, process_name, endpoint,
                        request_count, success_count, client_error_count,
                        server_error_count, other_status_count, total_duration_ms,
                        avg_duration_ms, min_duration_ms, max_duration_ms
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )
                .context("preparing http sample insert")?;

            for s in samples {
                stmt.execute(params![
                    run_id,
                    unix_millis(s.bucket_start),
                    s.app,
                    s.process_name,
                    s.endpoint,
                    s.request_count,
                    s.success_count,
                    s.client_error_count,
                    s.server_error_count,
                    s.other_status_count,
                    s.total_duration_ms,
                    s.avg_duration_ms,
                    s.min_duration_ms,
                    s.max_duration_ms,
                ])
                .context("inserting http sample")?;
            }
        }
        tx.commit().context("committing http samples")?;

        Ok(())
    }

    /// Inserts one DMV sample.
    pub fn insert_dmv_sample(&self, run_id: i64, sample: &DmvSample) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO dmv_samples (
                run_id, timestamp_ms, active_requests, blocked_requests,
                user_connections, running_sessions, top_wait_type, top_wait_ms,
                total_wait_ms, read_stall_ms_per_read, write_stall_ms_per_write,
                read_bytes_per_sec, write_bytes_per_sec
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run_id,
                unix_millis(sample.timestamp),
                sample.active_requests,
                sample.blocked_requests,
                sample.user_connections,
                sample.running_sessions,
                sample.top_wait_type,
                sample.top_wait_ms,
                sample.total_wait_ms,
                sample.read_stall_ms_per_read,
                sample.write_stall_ms_per_write,
                sample.read_bytes_per_sec,
                sample.write_bytes_per_sec,
            ],
        )
        .context("inserting dmv sample")?;

        Ok(())
    }

    /// Inserts one database inventory snapshot.
    pub fn insert_db_snapshot(&self, run_id: i64, snapshot: &DbSnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO db_snapshots (run_id, timestamp_ms, database_name, size_mb, object_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                unix_millis(snapshot.timestamp),
                snapshot.database_name,
                snapshot.size_mb,
                snapshot.object_count,
            ],
        )
        .context("inserting db snapshot")?;

        Ok(())
    }

    /// Inserts one marker.
    pub fn insert_marker(&self, run_id: i64, marker: &Marker) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO markers (run_id, timestamp_ms, kind, level, label)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                unix_millis(marker.timestamp),
                marker.kind.as_str(),
                marker.level.as_str(),
                marker.label,
            ],
        )
        .context("inserting marker")?;

        Ok(())
    }

    // --- Read side, consumed by downstream reporting ---

    /// Reads one run record back.
    pub fn run(&self, run_id: i64) -> Result<Option<RunRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, started_at_ms, ended_at_ms, duration_secs, scenario, tool_version
             FROM runs WHERE id = ?1",
            params![run_id],
            |row| {
                Ok(RunRow {
                    id: row.get(0)?,
                    started_at: from_unix_millis(row.get(1)?),
                    ended_at: row.get::<_, Option<i64>>(2)?.map(from_unix_millis),
                    duration_secs: row.get(3)?,
                    scenario: row.get(4)?,
                    tool_version: row.get(5)?,
                })
            },
        )
        .optional()
        .context("reading run")
    }

    /// Timestamps of every system sample in a run, in insertion order.
    pub fn system_sample_times(&self, run_id: i64) -> Result<Vec<SystemTime>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT timestamp_ms FROM system_samples WHERE run_id = ?1 ORDER BY id")
            .context("preparing system sample query")?;

        let times = stmt
            .query_map(params![run_id], |row| row.get::<_, i64>(0))
            .context("querying system samples")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("reading system samples")?;

        Ok(times.into_iter().map(from_unix_millis).collect())
    }

    /// System samples for a run, in insertion order, as (id, sample) pairs.
    pub fn system_samples(&self, run_id: i64) -> Result<Vec<(i64, SystemSample)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp_ms, cpu_total_percent, memory_used_mb,
                        memory_available_mb, disk_reads_per_sec, disk_writes_per_sec,
                        disk_read_bytes_per_sec, disk_write_bytes_per_sec,
                        net_bytes_sent_per_sec, net_bytes_recv_per_sec
                 FROM system_samples WHERE run_id = ?1 ORDER BY id",
            )
            .context("preparing system sample query")?;

        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    SystemSample {
                        timestamp: from_unix_millis(row.get(1)?),
                        cpu_total_percent: row.get(2)?,
                        memory_used_mb: row.get(3)?,
                        memory_available_mb: row.get(4)?,
                        disk_reads_per_sec: row.get(5)?,
                        disk_writes_per_sec: row.get(6)?,
                        disk_read_bytes_per_sec: row.get(7)?,
                        disk_write_bytes_per_sec: row.get(8)?,
                        net_bytes_sent_per_sec: row.get(9)?,
                        net_bytes_recv_per_sec: row.get(10)?,
                    },
                ))
            })
            .context("querying system samples")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("reading system samples")?;

        Ok(rows)
    }

    /// Process samples belonging to one system sample.
    pub fn process_samples(&self, system_sample_id: i64) -> Result<Vec<ProcessSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT process_name, cpu_percent, working_set_mb, private_bytes_mb,
                        thread_count, handle_count
                 FROM process_samples WHERE system_sample_id = ?1 ORDER BY id",
            )
            .context("preparing process sample query")?;

        let rows = stmt
            .query_map(params![system_sample_id], |row| {
                Ok(ProcessSample {
                    process_name: row.get(0)?,
                    cpu_percent: row.get(1)?,
                    working_set_mb: row.get(2)?,
                    private_bytes_mb: row.get(3)?,
                    thread_count: row.get(4)?,
                    handle_count: row.get(5)?,
                })
            })
            .context("querying process samples")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("reading process samples")?;

        Ok(rows)
    }

    /// All markers for a run, in insertion order.
    pub fn markers(&self, run_id: i64) -> Result<Vec<Marker>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT timestamp_ms, kind, level, label
                 FROM markers WHERE run_id = ?1 ORDER BY id",
            )
            .context("preparing marker query")?;

        let rows = stmt
            .query_map(params![run_id], |row| {
                let kind: String = row.get(1)?;
                let level: String = row.get(2)?;
                Ok(Marker {
                    timestamp: from_unix_millis(row.get(0)?),
                    kind: MarkerKind::from_str(&kind).unwrap_or(MarkerKind::Tool),
                    level: MarkerLevel::from_str(&level).unwrap_or(MarkerLevel::Info),
                    label: row.get(3)?,
                })
            })
            .context("querying markers")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("reading markers")?;

        Ok(rows)
    }

    /// All HTTP bucket samples for a run, in insertion order.
    pub fn http_samples(&self, run_id: i64) -> Result<Vec<HttpSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT bucket_start_ms, app, process_name, endpoint, request_count,
                        success_count, client_error_count, server_error_count,
                        other_status_count, total_duration_ms, avg_duration_ms,
                        min_duration_ms, max_duration_ms
                 FROM http_samples WHERE run_id = ?1 ORDER BY id",
            )
            .context("preparing http sample query")?;

        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(HttpSample {
                    bucket_start: from_unix_millis(row.get(0)?),
                    app: row.get(1)?,
                    process_name: row.get(2)?,
                    endpoint: row.get(3)?,
                    request_count: row.get(4)?,
                    success_count: row.get(5)?,
                    client_error_count: row.get(6)?,
                    server_error_count: row.get(7)?,
                    other_status_count: row.get(8)?,
                    total_duration_ms: row.get(9)?,
                    avg_duration_ms: row.get(10)?,
                    min_duration_ms: row.get(11)?,
                    max_duration_ms: row.get(12)?,
                })
            })
            .context("querying http samples")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("reading http samples")?;

        Ok(rows)
    }

    /// All managed-runtime samples for a run, in insertion order.
    pub fn runtime_samples(&self, run_id: i64) -> Result<Vec<RuntimeSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT timestamp_ms, app, process_name, runtime_kind, heap_mb,
                        alloc_mb_per_sec, gen0_per_sec, gen1_per_sec, gen2_per_sec,
                        gc_time_percent, exceptions_per_sec, thread_count,
                        pool_thread_count, pool_queue_length
                 FROM runtime_samples WHERE run_id = ?1 ORDER BY id",
            )
            .context("preparing runtime sample query")?;

        let rows = stmt
            .query_map(params![run_id], |row| {
                let kind: String = row.get(3)?;
                Ok(RuntimeSample {
                    timestamp: from_unix_millis(row.get(0)?),
                    app: row.get(1)?,
                    process_name: row.get(2)?,
                    kind: RuntimeKind::from_str(&kind).unwrap_or(RuntimeKind::Core),
                    heap_mb: row.get(4)?,
                    alloc_mb_per_sec: row.get(5)?,
                    gen0_per_sec: row.get(6)?,
                    gen1_per_sec: row.get(7)?,
                    gen2_per_sec: row.get(8)?,
                    gc_time_percent: row.get(9)?,
                    exceptions_per_sec: row.get(10)?,
                    thread_count: row.get(11)?,
                    pool_thread_count: row.get(12)?,
                    pool_queue_length: row.get(13)?,
                })
            })
            .context("querying runtime samples")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("reading runtime samples")?;

        Ok(rows)
    }

    /// All DMV samples for a run, in insertion order.
    pub fn dmv_samples(&self, run_id: i64) -> Result<Vec<DmvSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT timestamp_ms, active_requests, blocked_requests, user_connections,
                        running_sessions, top_wait_type, top_wait_ms, total_wait_ms,
                        read_stall_ms_per_read, write_stall_ms_per_write,
                        read_bytes_per_sec, write_bytes_per_sec
                 FROM dmv_samples WHERE run_id = ?1 ORDER BY id",
            )
            .context("preparing dmv sample query")?;

        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(DmvSample {
                    timestamp: from_unix_millis(row.get(0)?),
                    active_requests: row.get(1)?,
                    blocked_requests: row.get(2)?,
                    user_connections: row.get(3)?,
                    running_sessions: row.get(4)?,
                    top_wait_type: row.get(5)?,
                    top_wait_ms: row.get(6)?,
                    total_wait_ms: row.get(7)?,
                    read_stall_ms_per_read: row.get(8)?,
                    write_stall_ms_per_write: row.get(9)?,
                    read_bytes_per_sec: row.get(10)?,
                    write_bytes_per_sec: row.get(11)?,
                })
            })
            .context("querying dmv samples")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("reading dmv samples")?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn sample_run() -> NewRun {
        NewRun {
            started_at: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            host_id: "abc123".to_string(),
            machine_name: "bench-01".to_string(),
            os_version: "linux 6.8".to_string(),
            logical_cores: 16,
            cpu_model: "TestCPU 3000".to_string(),
            total_memory_mb: 65536.0,
            system_drive_type: Some("ssd".to_string()),
            system_drive_free_gb: Some(420.5),
            uptime_secs: 86_400,
            scenario: Some("baseline".to_string()),
            notes: None,
            workload_kind: Some("oltp".to_string()),
            workload_size_mb: Some(1024.0),
            workload_notes: None,
            config_snapshot: "sample_interval: 1s\n".to_string(),
            tool_version: "0.4.1".to_string(),
        }
    }

    #[test]
    fn test_insert_and_finish_run() {
        let store = Store::open_in_memory().expect("store opens");
        let run_id = store.insert_run(&sample_run()).expect("insert run");
        assert!(run_id > 0);

        let ended = UNIX_EPOCH + Duration::from_secs(1_700_000_060);
        store
            .finish_run(run_id, ended, Duration::from_secs(60))
            .expect("finish run");

        let row = store.run(run_id).expect("read run").expect("run exists");
        assert_eq!(row.ended_at, Some(ended));
        assert_eq!(row.duration_secs, Some(60.0));
        assert_eq!(row.scenario.as_deref(), Some("baseline"));
    }

    #[test]
    fn test_system_sample_optionals_survive() {
        let store = Store::open_in_memory().expect("store opens");
        let run_id = store.insert_run(&sample_run()).expect("insert run");

        let ts = UNIX_EPOCH + Duration::from_secs(1_700_000_001);
        let sample = SystemSample {
            timestamp: ts,
            cpu_total_percent: None,
            memory_used_mb: Some(1234.5),
            disk_reads_per_sec: Some(99.0),
            ..SystemSample::at(ts)
        };

        let id = store
            .insert_system_sample(run_id, &sample)
            .expect("insert sample");
        assert!(id > 0);

        let rows = store.system_samples(run_id).expect("read samples");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.cpu_total_percent, None);
        assert_eq!(rows[0].1.memory_used_mb, Some(1234.5));
        assert_eq!(rows[0].1.disk_reads_per_sec, Some(99.0));
    }

    #[test]
    fn test_process_samples_attach_to_parent() {
        let store = Store::open_in_memory().expect("store opens");
        let run_id = store.insert_run(&sample_run()).expect("insert run");

        let ts = UNIX_EPOCH + Duration::from_secs(1_700_000_001);
        let parent = store
            .insert_system_sample(run_id, &SystemSample::at(ts))
            .expect("insert sample");

        store
            .insert_process_samples(
                parent,
                &[ProcessSample {
                    process_name: "worker".to_string(),
                    cpu_percent: 12.5,
                    working_set_mb: 256.0,
                    private_bytes_mb: 200.0,
                    thread_count: 8,
                    handle_count: 120,
                }],
            )
            .expect("insert process samples");

        let rows = store.process_samples(parent).expect("read process samples");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].process_name, "worker");
        assert_eq!(rows[0].cpu_percent, 12.5);
    }

    #[test]
    fn test_marker_round_trip() {
        let store = Store::open_in_memory().expect("store opens");
        let run_id = store.insert_run(&sample_run()).expect("insert run");

        let ts = UNIX_EPOCH + Duration::from_secs(1_700_000_002);
        store
            .insert_marker(
                run_id,
                &Marker {
                    timestamp: ts,
                    kind: MarkerKind::ProcessStart,
                    level: MarkerLevel::Info,
                    label: "Process worker (PID 42) started.".to_string(),
                },
            )
            .expect("insert marker");

        let markers = store.markers(run_id).expect("read markers");
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].kind, MarkerKind::ProcessStart);
        assert_eq!(markers[0].label, "Process worker (PID 42) started.");
    }

    #[test]
    fn test_empty_batches_are_noops() {
        let store = Store::open_in_memory().expect("store opens");
        let run_id = store.insert_run(&sample_run()).expect("insert run");

        store
            .insert_process_samples(1, &[])
            .expect("empty process batch");
        store
            .insert_http_samples(run_id, &[])
            .expect("empty http batch");
        store
            .insert_runtime_samples(run_id, &[])
            .expect("empty runtime batch");
    }
}
