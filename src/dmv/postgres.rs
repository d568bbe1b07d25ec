use anyhow::{Context, Result};
use postgres::{Client, NoTls};

use crate::clock::SystemTimeSource;
use crate::clock::TimeSource;
use crate::store::DbSnapshot;

use super::{DmvClient, DmvReading};

const PAGE_BYTES: i64 = 8_192;

/// Diagnostic client for a PostgreSQL instance. Each poll opens a
/// short-lived session, reads the statistics views once, and disconnects.
pub struct PostgresDmvClient {
    connection_string: String,
}

impl PostgresDmvClient {
    pub fn new(connection_string: &str) -> Self {
        Self {
            connection_string: connection_string.to_string(),
        }
    }

    fn connect(&self) -> Result<Client> {
        Client::connect(&self.connection_string, NoTls).context("connecting to instance")
    }
}

/// Session scalars from `pg_stat_activity`, one query for all four counts.
const ACTIVITY_QUERY: &str = "\
SELECT
    count(*) FILTER (WHERE state = 'active')                                    AS active_requests,
    count(*) FILTER (WHERE wait_event_type = 'Lock')                            AS blocked_requests,
    count(*) FILTER (WHERE backend_type = 'client backend')                     AS user_connections,
    count(*) FILTER (WHERE state = 'active' AND backend_type = 'client backend') AS running_sessions
FROM pg_stat_activity";

/// Dominant wait event across sessions, with waiting time approximated
/// from the state-change timestamps of the currently waiting sessions.
const WAIT_QUERY: &str = "\
SELECT
    wait_event_type,
    (sum(extract(epoch FROM clock_timestamp() - state_change)) * 1000)::bigint AS wait_ms
FROM pg_stat_activity
WHERE wait_event_type IS NOT NULL
  AND backend_type = 'client backend'
GROUP BY wait_event_type
ORDER BY wait_ms DESC";

/// Cumulative I/O counters: block reads and their timing from the per-
/// database statistics, writes and their timing from the background
/// writer.
const IO_QUERY: &str = "\
SELECT
    coalesce(sum(blks_read), 0)::bigint      AS reads,
    coalesce(sum(blk_read_time), 0)::bigint  AS read_stall_ms,
    coalesce(sum(blk_write_time), 0)::bigint AS write_stall_ms
FROM pg_stat_database";

const BGWRITER_QUERY: &str = "\
SELECT
    (buffers_checkpoint + buffers_clean + buffers_backend)::bigint AS writes
FROM pg_stat_bgwriter";

const SNAPSHOT_QUERY: &str = "\
SELECT
    current_database()::text                           AS database_name,
    pg_database_size(current_database())::bigint       AS size_bytes,
    (SELECT count(*) FROM information_schema.tables
     WHERE table_schema NOT IN ('pg_catalog', 'information_schema'))::bigint AS object_count";

impl DmvClient for PostgresDmvClient {
    fn sample(&mut self) -> Result<DmvReading> {
        let mut client = self.connect()?;
        let mut reading = DmvReading::default();

        let row = client
            .query_one(ACTIVITY_QUERY, &[])
            .context("querying session activity")?;
        reading.active_requests = row.get("active_requests");
        reading.blocked_requests = row.get("blocked_requests");
        reading.user_connections = row.get("user_connections");
        reading.running_sessions = row.get("running_sessions");

        let waits = client
            .query(WAIT_QUERY, &[])
            .context("querying wait events")?;
        for (i, row) in waits.iter().enumerate() {
            let wait_ms: i64 = row.get("wait_ms");
            if i == 0 {
                reading.top_wait_type = Some(row.get("wait_event_type"));
                reading.top_wait_ms = wait_ms;
            }
            reading.total_wait_ms += wait_ms;
        }

        let row = client
            .query_one(IO_QUERY, &[])
            .context("querying io statistics")?;
        reading.reads = row.get("reads");
        reading.read_stall_ms = row.get("read_stall_ms");
        reading.write_stall_ms = row.get("write_stall_ms");
        reading.read_bytes = reading.reads * PAGE_BYTES;

        let row = client
            .query_one(BGWRITER_QUERY, &[])
            .context("querying writer statistics")?;
        reading.writes = row.get("writes");
        reading.write_bytes = reading.writes * PAGE_BYTES;

        Ok(reading)
    }

    fn db_snapshot(&mut self) -> Result<DbSnapshot> {
        let mut client = self.connect()?;

        let row = client
            .query_one(SNAPSHOT_QUERY, &[])
            .context("querying database inventory")?;

        let size_bytes: i64 = row.get("size_bytes");

        Ok(DbSnapshot {
            timestamp: SystemTimeSource.now(),
            database_name: row.get("database_name"),
            size_mb: size_bytes as f64 / (1024.0 * 1024.0),
            object_count: row.get("object_count"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failure_surfaces_as_error() {
        let mut client = PostgresDmvClient::new("host=127.0.0.1 port=1 user=nobody connect_timeout=1");
        assert!(client.sample().is_err());
        assert!(client.db_snapshot().is_err());
    }
}
