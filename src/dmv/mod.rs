pub mod postgres;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::clock::{ticker, TimeSource};
use crate::store::{DbSnapshot, DmvSample, Store};

/// One raw reading of the instance's diagnostic views: scalar snapshots
/// plus the cumulative I/O counters the rates are derived from.
#[derive(Debug, Clone, Default)]
pub struct DmvReading {
    pub active_requests: i64,
    pub blocked_requests: i64,
    pub user_connections: i64,
    pub running_sessions: i64,
    pub top_wait_type: Option<String>,
    pub top_wait_ms: i64,
    pub total_wait_ms: i64,

    // Cumulative since instance start.
    pub reads: i64,
    pub read_stall_ms: i64,
    pub read_bytes: i64,
    pub writes: i64,
    pub write_stall_ms: i64,
    pub write_bytes: i64,
}

/// A relational instance's diagnostic surface.
pub trait DmvClient: Send {
    /// Opens a short-lived session and reads the diagnostic views once.
    fn sample(&mut self) -> Result<DmvReading>;

    /// Reads the database inventory, for the run-open snapshot.
    fn db_snapshot(&mut self) -> Result<DbSnapshot>;
}

/// Cumulative counters carried between ticks.
#[derive(Debug, Clone, Copy, Default)]
struct CumulativeIo {
    reads: i64,
    read_stall_ms: i64,
    read_bytes: i64,
    writes: i64,
    write_stall_ms: i64,
    write_bytes: i64,
}

/// Derives per-interval rates from consecutive cumulative readings.
///
/// On the first tick the previous cumulative values are zero, so the first
/// rate row may be unusually large; that is accepted. Negative deltas
/// (instance restart) clamp to zero.
#[derive(Debug, Default)]
pub struct DmvRateState {
    prev: Option<(SystemTime, CumulativeIo)>,
}

/// Non-negative delta; a counter regression reads as zero.
fn delta(curr: i64, prev: i64) -> i64 {
    (curr - prev).max(0)
}

impl DmvRateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one reading into a sample, advancing the carried state.
    pub fn derive(&mut self, now: SystemTime, reading: &DmvReading) -> DmvSample {
        let (prev_at, prev) = self
            .prev
            .unwrap_or((now - Duration::from_secs(1), CumulativeIo::default()));

        let dt_secs = now
            .duration_since(prev_at)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64()
            .max(1.0);

        let d_reads = delta(reading.reads, prev.reads);
        let d_read_stall = delta(reading.read_stall_ms, prev.read_stall_ms);
        let d_read_bytes = delta(reading.read_bytes, prev.read_bytes);
        let d_writes = delta(reading.writes, prev.writes);
        let d_write_stall = delta(reading.write_stall_ms, prev.write_stall_ms);
        let d_write_bytes = delta(reading.write_bytes, prev.write_bytes);

        self.prev = Some((
            now,
            CumulativeIo {
                reads: reading.reads,
                read_stall_ms: reading.read_stall_ms,
                read_bytes: reading.read_bytes,
                writes: reading.writes,
                write_stall_ms: reading.write_stall_ms,
                write_bytes: reading.write_bytes,
            },
        ));

        DmvSample {
            timestamp: now,
            active_requests: reading.active_requests,
            blocked_requests: reading.blocked_requests,
            user_connections: reading.user_connections,
            running_sessions: reading.running_sessions,
            top_wait_type: reading.top_wait_type.clone(),
            top_wait_ms: reading.top_wait_ms,
            total_wait_ms: reading.total_wait_ms,
            read_stall_ms_per_read: ratio(d_read_stall, d_reads),
            write_stall_ms_per_write: ratio(d_write_stall, d_writes),
            read_bytes_per_sec: d_read_bytes as f64 / dt_secs,
            write_bytes_per_sec: d_write_bytes as f64 / dt_secs,
        }
    }
}

/// Stall-per-operation ratio; zero when no operations happened.
fn ratio(stall_ms: i64, ops: i64) -> f64 {
    if ops == 0 {
        0.0
    } else {
        stall_ms as f64 / ops as f64
    }
}

/// Polls the relational instance at a fixed interval and emits one sample
/// per successful poll. Query failures skip the tick; the loop never
/// terminates the run.
pub struct DmvSampler {
    store: Arc<Store>,
    run_id: i64,
    interval: Duration,
    time: Arc<dyn TimeSource>,
    cancel: CancellationToken,
}

impl DmvSampler {
    pub fn new(
        store: Arc<Store>,
        run_id: i64,
        interval: Duration,
        time: Arc<dyn TimeSource>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            run_id,
            interval,
            time,
            cancel,
        }
    }

    /// Spawns the polling loop, taking ownership of the client. Each poll
    /// runs on the blocking pool since the client's session is synchronous.
    pub fn start(self, client: Box<dyn DmvClient>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = ticker(self.interval);
            let mut rates = DmvRateState::new();
            let mut client = Some(client);

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tick.tick() => {
                        let Some(mut owned) = client.take() else { return };

                        let (owned, result) = match tokio::task::spawn_blocking(move || {
                            let result = owned.sample();
                            (owned, result)
                        })
                        .await
                        {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!(error = %e, "dmv poll task failed");
                                return;
                            }
                        };
                        client = Some(owned);

                        match result {
                            Ok(reading) => {
                                let sample = rates.derive(self.time.now(), &reading);
                                if let Err(e) = self.store.insert_dmv_sample(self.run_id, &sample) {
                                    error!(error = %e, "dmv sample write failed");
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "dmv query failed, skipping tick");
                            }
                        }
                    }
                }
            }
        })
    }
}
