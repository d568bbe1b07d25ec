use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{ticker, SystemTimeSource, TimeSource};
use crate::config::Config;
use crate::dmv::postgres::PostgresDmvClient;
use crate::dmv::{DmvClient, DmvSampler};
use crate::host::catalog::{CounterCatalog, SystemCatalog};
use crate::host::facts;
use crate::host::{CounterReader, CounterToggles};
use crate::http::RequestMonitor;
use crate::process::cpu::CpuDeltaTracker;
use crate::process::{ProcessHandle, ProcessSource, ProcessTracker, SysinfoProcessSource};
use crate::runtime::channel::{ChannelFactory, SocketChannelFactory};
use crate::runtime::classic::ClassicRuntimeSampler;
use crate::runtime::RuntimeSessionManager;
use crate::store::{NewRun, ProcessSample, Store};

/// Version recorded on every run.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long component disposal waits for a loop before moving on.
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// The engine's seams onto the host, injectable for tests.
pub struct EngineDeps {
    pub process_source: Arc<dyn ProcessSource>,
    pub catalog: Arc<dyn CounterCatalog>,
    pub channel_factory: Arc<dyn ChannelFactory>,
    pub time: Arc<dyn TimeSource>,
    /// Client polled by the DMV sampler.
    pub dmv_client: Option<Box<dyn DmvClient>>,
    /// Client used for the run-open database inventory snapshot.
    pub db_client: Option<Box<dyn DmvClient>>,
}

impl EngineDeps {
    /// Production wiring from the configuration.
    pub fn production(cfg: &Config) -> Self {
        let dmv = &cfg.deep_monitoring.dmv;
        let dmv_client: Option<Box<dyn DmvClient>> = match (&dmv.connection_string, dmv.enabled) {
            (Some(conn), true) => Some(Box::new(PostgresDmvClient::new(conn))),
            _ => None,
        };

        let db_client: Option<Box<dyn DmvClient>> = cfg
            .db_connection_string
            .as_ref()
            .filter(|_| cfg.enable_db_counters)
            .map(|conn| Box::new(PostgresDmvClient::new(conn)) as Box<dyn DmvClient>);

        Self {
            process_source: Arc::new(SysinfoProcessSource::new()),
            catalog: Arc::new(SystemCatalog::new()),
            channel_factory: Arc::new(SocketChannelFactory::new(
                cfg.deep_monitoring.diagnostic_socket_dir.clone(),
            )),
            time: Arc::new(SystemTimeSource),
            dmv_client,
            db_client,
        }
    }
}

/// Owns one run: the store records, the master tick and the composition of
/// every sampler under one cancellation scope.
pub struct Engine {
    cfg: Config,
    store: Arc<Store>,
    deps: EngineDeps,
    cancel: CancellationToken,
    run_id: Option<i64>,
    started_at: Option<SystemTime>,
    tracker: Option<Arc<ProcessTracker>>,
    http: Option<Arc<RequestMonitor>>,
    tick_task: Option<JoinHandle<()>>,
    classic_task: Option<JoinHandle<()>>,
    dmv_task: Option<JoinHandle<()>>,
    fatal: Arc<Mutex<Option<anyhow::Error>>>,
    finished: bool,
}

impl Engine {
    pub fn new(cfg: Config, store: Arc<Store>, deps: EngineDeps) -> Self {
        Self {
            cfg,
            store,
            deps,
            cancel: CancellationToken::new(),
            run_id: None,
            started_at: None,
            tracker: None,
            http: None,
            tick_task: None,
            classic_task: None,
            dmv_task: None,
            fatal: Arc::new(Mutex::new(None)),
            finished: false,
        }
    }

    /// Token cancelled on user interrupt, fatal error, or shutdown.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The open run's identifier.
    pub fn run_id(&self) -> Option<i64> {
        self.run_id
    }

    /// Opens the run and starts every component and loop.
    pub async fn start(&mut self) -> Result<()> {
        let started_at = self.deps.time.now();

        // 1. Open the run with host facts.
        let host = facts::collect();
        let run = NewRun {
            started_at,
            host_id: host.host_id,
            machine_name: host.machine_name,
            os_version: host.os_version,
            logical_cores: host.logical_cores,
            cpu_model: host.cpu_model,
            total_memory_mb: host.total_memory_mb,
            system_drive_type: host.system_drive_type,
            system_drive_free_gb: host.system_drive_free_gb,
            uptime_secs: host.uptime_secs,
            scenario: self.cfg.scenario.clone(),
            notes: self.cfg.notes.clone(),
            workload_kind: self.cfg.workload.kind.clone(),
            workload_size_mb: self.cfg.workload.size_mb,
            workload_notes: self.cfg.workload.notes.clone(),
            config_snapshot: self.cfg.snapshot(),
            tool_version: TOOL_VERSION.to_string(),
        };

        let run_id = self.store.insert_run(&run).context("opening run")?;
        self.run_id = Some(run_id);
        self.started_at = Some(started_at);
        info!(run_id, scenario = ?self.cfg.scenario, "run opened");

        // 2. Database inventory snapshot, best effort.
        if let Some(mut client) = self.deps.db_client.take() {
            let store = Arc::clone(&self.store);
            let snapshot = tokio::task::spawn_blocking(move || client.db_snapshot())
                .await
                .context("db snapshot task")?;

            match snapshot {
                Ok(snapshot) => {
                    if let Err(e) = store.insert_db_snapshot(run_id, &snapshot) {
                        warn!(error = %e, "db snapshot write failed");
                    }
                }
                Err(e) => warn!(error = %e, "db snapshot failed"),
            }
        }

        // 3. Lifecycle tracker over the monitored-name union.
        let monitored = self.cfg.monitored_names();
        let tracker = ProcessTracker::new(
            &monitored,
            Arc::clone(&self.deps.process_source),
            Arc::clone(&self.store),
            run_id,
            Arc::clone(&self.deps.time),
            self.cancel.child_token(),
        );

        // 4. Diagnostic consumers subscribe before the tracker seeds, then
        // sweep existing processes themselves.
        let runtime = RuntimeSessionManager::new(
            &self.cfg.deep_monitoring.core_apps,
            Arc::clone(&self.deps.channel_factory),
            Arc::clone(&self.store),
            run_id,
            self.cfg.sample_interval,
            Arc::clone(&self.deps.time),
            self.cancel.child_token(),
        );
        runtime.listen(tracker.subscribe());

        let http = RequestMonitor::new(
            &self.cfg.deep_monitoring.core_apps,
            Arc::clone(&self.deps.channel_factory),
            Arc::clone(&self.store),
            run_id,
            Arc::clone(&self.deps.time),
            self.cancel.child_token(),
        );
        http.listen(tracker.subscribe());

        tracker.start().context("starting process tracker")?;

        runtime.attach_existing(self.deps.process_source.as_ref());
        http.attach_existing(self.deps.process_source.as_ref());
        http.start();

        let classic = ClassicRuntimeSampler::new(
            &self.cfg.deep_monitoring.classic_apps,
            Arc::clone(&self.deps.catalog),
            Arc::clone(&self.deps.process_source),
            Arc::clone(&self.store),
            run_id,
            self.cfg.sample_interval,
            Arc::clone(&self.deps.time),
            self.cancel.child_token(),
        );
        self.classic_task = classic.start();

        // 5. DMV sampler, only when enabled and connectable.
        if let Some(client) = self.deps.dmv_client.take() {
            let sampler = DmvSampler::new(
                Arc::clone(&self.store),
                run_id,
                self.cfg.deep_monitoring.dmv.sample_interval,
                Arc::clone(&self.deps.time),
                self.cancel.child_token(),
            );
            self.dmv_task = Some(sampler.start(client));
            info!(
                interval = ?self.cfg.deep_monitoring.dmv.sample_interval,
                "dmv sampler started",
            );
        }

        // 6. Master tick.
        let tick_loop = TickLoop {
            store: Arc::clone(&self.store),
            tracker: Arc::clone(&tracker),
            catalog: Arc::clone(&self.deps.catalog),
            time: Arc::clone(&self.deps.time),
            cancel: self.cancel.clone(),
            fatal: Arc::clone(&self.fatal),
            run_id,
            interval: self.cfg.sample_interval,
            toggles: CounterToggles {
                disk: self.cfg.enable_disk_metrics,
                network: self.cfg.enable_network_metrics,
            },
            logical_cores: host.logical_cores,
            sample_processes: !monitored.is_empty(),
        };
        self.tick_task = Some(tokio::spawn(tick_loop.run()));

        self.tracker = Some(tracker);
        self.http = Some(http);

        info!(interval = ?self.cfg.sample_interval, "capture started");

        Ok(())
    }

    /// Stops every loop, flushes pending aggregates and closes the run's
    /// end record. Safe to call more than once, and safe on an engine that
    /// never started.
    pub async fn stop(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        self.cancel.cancel();

        for task in [
            self.tick_task.take(),
            self.classic_task.take(),
            self.dmv_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            if tokio::time::timeout(DISPOSE_TIMEOUT, task).await.is_err() {
                warn!("sampling loop did not stop in time");
            }
        }

        // The request monitor flushes one final time before the end record
        // is written, so cancellation loses no pending aggregate.
        if let Some(http) = &self.http {
            http.shutdown().await;
        }

        // Close the end record even after a fatal error; the fatal error
        // still wins over a failing close.
        let mut closed = Ok(());
        if let (Some(run_id), Some(started_at)) = (self.run_id, self.started_at) {
            let ended_at = self.deps.time.now();
            let duration = ended_at
                .duration_since(started_at)
                .unwrap_or(Duration::ZERO);

            closed = self
                .store
                .finish_run(run_id, ended_at, duration)
                .context("closing run end record");

            if closed.is_ok() {
                info!(run_id, ?duration, "run closed");
            }
        }

        if let Some(fatal) = self.fatal.lock().take() {
            return Err(fatal);
        }

        closed
    }
}

/// The master sampling loop: one system sample per tick, with its process
/// sample children.
struct TickLoop {
    store: Arc<Store>,
    tracker: Arc<ProcessTracker>,
    catalog: Arc<dyn CounterCatalog>,
    time: Arc<dyn TimeSource>,
    cancel: CancellationToken,
    fatal: Arc<Mutex<Option<anyhow::Error>>>,
    run_id: i64,
    interval: Duration,
    toggles: CounterToggles,
    logical_cores: u32,
    sample_processes: bool,
}

impl TickLoop {
    async fn run(self) {
        let mut reader = CounterReader::new(self.toggles, self.catalog.as_ref());
        let mut cpu = CpuDeltaTracker::new(self.logical_cores);
        let mut tick = ticker(self.interval);
        let interval_secs = self.interval.as_secs_f64();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    reader.close();
                    return;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.one_tick(&mut reader, &mut cpu, interval_secs) {
                        // Only store failures escape a tick; they end the run.
                        error!(error = %e, "store write failed, ending run");
                        *self.fatal.lock() = Some(e);
                        self.cancel.cancel();
                        reader.close();
                        return;
                    }
                }
            }
        }
    }

    fn one_tick(
        &self,
        reader: &mut CounterReader,
        cpu: &mut CpuDeltaTracker,
        interval_secs: f64,
    ) -> Result<()> {
        let sample = reader.snapshot(self.time.now(), interval_secs);
        let sample_id = self
            .store
            .insert_system_sample(self.run_id, &sample)
            .context("writing system sample")?;

        if !self.sample_processes {
            return Ok(());
        }

        let snapshot = self.tracker.active_snapshot();
        cpu.retain(&self.tracker.active_pids());

        let rows = build_process_rows(&snapshot, cpu, interval_secs);
        self.store
            .insert_process_samples(sample_id, &rows)
            .context("writing process samples")?;

        debug!(
            sample_id,
            processes = rows.len(),
            "tick written",
        );

        // Handles returned by the snapshot are released here.
        drop(snapshot);

        Ok(())
    }
}

/// Groups a process snapshot by name and aggregates each group. Processes
/// whose reads fail are left out of their aggregate.
fn build_process_rows(
    snapshot: &[(String, Box<dyn ProcessHandle>)],
    cpu: &mut CpuDeltaTracker,
    interval_secs: f64,
) -> Vec<ProcessSample> {
    let mut by_name: HashMap<&str, ProcessSample> = HashMap::new();

    for (name, handle) in snapshot {
        let Some(cpu_time_ms) = handle.cpu_time_ms() else {
            continue;
        };

        let percent = cpu.percent(handle.pid(), cpu_time_ms, interval_secs);

        let row = by_name
            .entry(name.as_str())
            .or_insert_with(|| ProcessSample {
                process_name: name.clone(),
                cpu_percent: 0.0,
                working_set_mb: 0.0,
                private_bytes_mb: 0.0,
                thread_count: 0,
                handle_count: 0,
            });

        row.cpu_percent += percent;
        row.working_set_mb += handle.working_set_mb().unwrap_or(0.0);
        row.private_bytes_mb += handle.private_bytes_mb().unwrap_or(0.0);
        row.thread_count += handle.thread_count().unwrap_or(0);
        row.handle_count += handle.handle_count().unwrap_or(0);
    }

    by_name.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubHandle {
        pid: u32,
        cpu_time_ms: Option<u64>,
        working_set_mb: f64,
    }

    impl ProcessHandle for StubHandle {
        fn pid(&self) -> u32 {
            self.pid
        }
        fn cpu_time_ms(&self) -> Option<u64> {
            self.cpu_time_ms
        }
        fn working_set_mb(&self) -> Option<f64> {
            Some(self.working_set_mb)
        }
        fn private_bytes_mb(&self) -> Option<f64> {
            Some(1.0)
        }
        fn thread_count(&self) -> Option<u32> {
            Some(4)
        }
        fn handle_count(&self) -> Option<u32> {
            Some(10)
        }
    }

    fn handle(pid: u32, cpu_time_ms: Option<u64>, ws: f64) -> Box<dyn ProcessHandle> {
        Box::new(StubHandle {
            pid,
            cpu_time_ms,
            working_set_mb: ws,
        })
    }

    #[test]
    fn test_rows_aggregate_instances_by_name() {
        let mut cpu = CpuDeltaTracker::new(1);
        // Seed prior CPU state so the percentages are non-zero.
        cpu.percent(1, 0, 1.0);
        cpu.percent(2, 0, 1.0);

        let snapshot = vec![
            ("worker".to_string(), handle(1, Some(250), 100.0)),
            ("worker".to_string(), handle(2, Some(500), 50.0)),
            ("api".to_string(), handle(3, Some(9_999), 10.0)),
        ];

        let mut rows = build_process_rows(&snapshot, &mut cpu, 1.0);
        rows.sort_by(|a, b| a.process_name.cmp(&b.process_name));

        assert_eq!(rows.len(), 2);

        let api = &rows[0];
        assert_eq!(api.process_name, "api");
        // First observation for pid 3.
        assert_eq!(api.cpu_percent, 0.0);

        let worker = &rows[1];
        assert_eq!(worker.process_name, "worker");
        assert!((worker.cpu_percent - 75.0).abs() < 1e-9);
        assert_eq!(worker.working_set_mb, 150.0);
        assert_eq!(worker.thread_count, 8);
    }

    #[test]
    fn test_failed_cpu_read_leaves_process_out() {
        let mut cpu = CpuDeltaTracker::new(1);
        let snapshot = vec![
            ("worker".to_string(), handle(1, None, 100.0)),
            ("worker".to_string(), handle(2, Some(100), 50.0)),
        ];

        let rows = build_process_rows(&snapshot, &mut cpu, 1.0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].working_set_mb, 50.0);
    }

    #[test]
    fn test_empty_snapshot_yields_no_rows() {
        let mut cpu = CpuDeltaTracker::new(1);
        assert!(build_process_rows(&[], &mut cpu, 1.0).is_empty());
    }
}
