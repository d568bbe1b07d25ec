use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::{ticker, TimeSource};
use crate::config::ManagedAppConfig;
use crate::host::catalog::{
    Counter, CounterCatalog, CAT_MANAGED_EXCEPTIONS, CAT_MANAGED_MEMORY, CAT_MANAGED_THREADS,
    CTR_EXCEPTIONS_PER_SEC, CTR_GC_TIME_PERCENT, CTR_GEN0_COLLECTIONS_PER_SEC,
    CTR_GEN1_COLLECTIONS_PER_SEC, CTR_GEN2_COLLECTIONS_PER_SEC, CTR_HEAP_BYTES_ALL,
    CTR_LOGICAL_THREADS, CTR_PROCESS_ID,
};
use crate::process::{normalize_name, ProcessSource};
use crate::store::{RuntimeKind, RuntimeSample, Store};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Open counters for one classic-runtime process.
struct InstanceCounters {
    heap_bytes: Box<dyn Counter>,
    gen0: Box<dyn Counter>,
    gen1: Box<dyn Counter>,
    gen2: Box<dyn Counter>,
    gc_time: Box<dyn Counter>,
    exceptions: Box<dyn Counter>,
    threads: Box<dyn Counter>,
}

/// Samples classic-runtime processes through the OS counter catalog.
///
/// Runtimes without a diagnostic channel expose per-instance counters
/// instead; a polling loop at the master tick resolves each pid to its
/// catalog instance (cached), reads a fixed counter set and normalises the
/// readings into the shared runtime-sample schema.
pub struct ClassicRuntimeSampler {
    apps: Vec<ManagedAppConfig>,
    catalog: Arc<dyn CounterCatalog>,
    source: Arc<dyn ProcessSource>,
    store: Arc<Store>,
    run_id: i64,
    tick: Duration,
    time: Arc<dyn TimeSource>,
    cancel: CancellationToken,
    instances: Mutex<HashMap<u32, String>>,
    counters: Mutex<HashMap<u32, InstanceCounters>>,
}

impl ClassicRuntimeSampler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        apps: &[ManagedAppConfig],
        catalog: Arc<dyn CounterCatalog>,
        source: Arc<dyn ProcessSource>,
        store: Arc<Store>,
        run_id: i64,
        tick: Duration,
        time: Arc<dyn TimeSource>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            apps: apps.iter().filter(|a| a.enabled).cloned().collect(),
            catalog,
            source,
            store,
            run_id,
            tick,
            time,
            cancel,
            instances: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        })
    }

    /// Spawns the polling loop. A sampler with no enabled apps is inert.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.apps.is_empty() {
            return None;
        }

        let sampler = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut tick = ticker(sampler.tick);

            loop {
                tokio::select! {
                    _ = sampler.cancel.cancelled() => return,
                    _ = tick.tick() => sampler.poll(),
                }
            }
        }))
    }

    /// One polling pass: re-enumerate matching processes, sample each, and
    /// drop cached state for pids that are gone.
    fn poll(&self) {
        let current = match self.source.enumerate() {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "process enumeration failed");
                return;
            }
        };

        let mut live: HashMap<u32, ()> = HashMap::new();
        let mut samples = Vec::new();

        for app in &self.apps {
            let wanted = normalize_name(&app.process_name);

            for ident in current
                .iter()
                .filter(|p| normalize_name(&p.name) == wanted)
            {
                live.insert(ident.pid, ());
                if let Some(sample) = self.sample_pid(app, ident.pid) {
                    samples.push(sample);
                }
            }
        }

        self.instances.lock().retain(|pid, _| live.contains_key(pid));
        self.counters.lock().retain(|pid, _| live.contains_key(pid));

        if let Err(e) = self.store.insert_runtime_samples(self.run_id, &samples) {
            error!(error = %e, "classic runtime sample write failed");
        }
    }

    /// Samples one pid, resolving and opening its counters on first sight.
    /// Any failure invalidates the cached state and yields no sample.
    fn sample_pid(&self, app: &ManagedAppConfig, pid: u32) -> Option<RuntimeSample> {
        {
            let mut counters = self.counters.lock();

            if !counters.contains_key(&pid) {
                match self.open_counters(pid) {
                    Ok(opened) => {
                        counters.insert(pid, opened);
                    }
                    Err(e) => {
                        debug!(pid, app = %app.name, error = %e, "classic counter resolution failed");
                        return None;
                    }
                }
            }
        }

        let interval = self.tick.as_secs_f64();
        let mut counters = self.counters.lock();
        let entry = counters.get_mut(&pid)?;

        match Self::read_all(entry, interval) {
            Ok(reading) => Some(RuntimeSample {
                timestamp: self.time.now(),
                app: app.name.clone(),
                process_name: app.process_name.clone(),
                kind: RuntimeKind::Framework,
                heap_mb: Some(reading.heap_bytes / BYTES_PER_MB),
                alloc_mb_per_sec: None,
                gen0_per_sec: Some(reading.gen0),
                gen1_per_sec: Some(reading.gen1),
                gen2_per_sec: Some(reading.gen2),
                gc_time_percent: Some(reading.gc_time),
                exceptions_per_sec: Some(reading.exceptions),
                thread_count: Some(reading.threads),
                pool_thread_count: None,
                pool_queue_length: None,
            }),
            Err(e) => {
                // A stale instance reads as errors from here on; drop the
                // cached state so the next pass re-resolves.
                debug!(pid, error = %e, "classic counter read failed");
                counters.remove(&pid);
                self.instances.lock().remove(&pid);
                None
            }
        }
    }

    /// Resolves the catalog instance whose process-id counter matches
    /// `pid`, then opens and primes the fixed counter set against it.
    fn open_counters(&self, pid: u32) -> Result<InstanceCounters> {
        let instance = match self.instances.lock().get(&pid) {
            Some(cached) => cached.clone(),
            None => {
                let resolved = self.resolve_instance(pid)?;
                self.instances.lock().insert(pid, resolved.clone());
                resolved
            }
        };

        let open = |category: &str, counter: &str| -> Result<Box<dyn Counter>> {
            let mut c = self
                .catalog
                .open(category, counter, Some(&instance))
                .with_context(|| format!("opening {category}/{counter} for {instance}"))?;
            let _ = c.read(1.0); // Priming read.
            Ok(c)
        };

        Ok(InstanceCounters {
            heap_bytes: open(CAT_MANAGED_MEMORY, CTR_HEAP_BYTES_ALL)?,
            gen0: open(CAT_MANAGED_MEMORY, CTR_GEN0_COLLECTIONS_PER_SEC)?,
            gen1: open(CAT_MANAGED_MEMORY, CTR_GEN1_COLLECTIONS_PER_SEC)?,
            gen2: open(CAT_MANAGED_MEMORY, CTR_GEN2_COLLECTIONS_PER_SEC)?,
            gc_time: open(CAT_MANAGED_MEMORY, CTR_GC_TIME_PERCENT)?,
            exceptions: open(CAT_MANAGED_EXCEPTIONS, CTR_EXCEPTIONS_PER_SEC)?,
            threads: open(CAT_MANAGED_THREADS, CTR_LOGICAL_THREADS)?,
        })
    }

    fn resolve_instance(&self, pid: u32) -> Result<String> {
        let instances = self
            .catalog
            .instances(CAT_MANAGED_MEMORY)
            .context("enumerating managed memory instances")?;

        for instance in instances {
            let Ok(mut id_counter) =
                self.catalog
                    .open(CAT_MANAGED_MEMORY, CTR_PROCESS_ID, Some(&instance))
            else {
                continue;
            };

            match id_counter.read(1.0) {
                Ok(value) if value as u32 == pid => return Ok(instance),
                _ => continue,
            }
        }

        bail!("no catalog instance for pid {pid}")
    }

    fn read_all(entry: &mut InstanceCounters, interval: f64) -> Result<ClassicReading> {
        Ok(ClassicReading {
            heap_bytes: entry.heap_bytes.read(interval)?,
            gen0: entry.gen0.read(interval)?,
            gen1: entry.gen1.read(interval)?,
            gen2: entry.gen2.read(interval)?,
            gc_time: entry.gc_time.read(interval)?,
            exceptions: entry.exceptions.read(interval)?,
            threads: entry.threads.read(interval)?,
        })
    }

    /// Number of pids with open counters.
    pub fn tracked_count(&self) -> usize {
        self.counters.lock().len()
    }
}

struct ClassicReading {
    heap_bytes: f64,
    gen0: f64,
    gen1: f64,
    gen2: f64,
    gc_time: f64,
    exceptions: f64,
    threads: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemTimeSource;
    use crate::host::catalog::StaticCatalog;
    use crate::process::{ProcessHandle, ProcessIdent};
    use std::time::UNIX_EPOCH;
    use tokio::sync::{mpsc, oneshot};

    struct ListSource {
        processes: Vec<ProcessIdent>,
    }

    impl ProcessSource for ListSource {
        fn enumerate(&self) -> Result<Vec<ProcessIdent>> {
            Ok(self.processes.clone())
        }
        fn open(&self, _pid: u32) -> Result<Box<dyn ProcessHandle>> {
            bail!("not used")
        }
        fn is_alive(&self, pid: u32) -> bool {
            self.processes.iter().any(|p| p.pid == pid)
        }
        fn exit_code(&self, _pid: u32) -> Option<i32> {
            None
        }
        fn subscribe_starts(
            &self,
            _cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<ProcessIdent>> {
            bail!("not used")
        }
        fn watch_exit(
            &self,
            _pid: u32,
            _cancel: CancellationToken,
        ) -> oneshot::Receiver<Option<i32>> {
            let (_tx, rx) = oneshot::channel();
            rx
        }
    }

    fn legacy_app() -> ManagedAppConfig {
        ManagedAppConfig {
            name: "Legacy".to_string(),
            process_name: "legacy-svc".to_string(),
            enabled: true,
            http_monitoring: None,
        }
    }

    fn catalog_for(pid: u32, instance: &str) -> StaticCatalog {
        StaticCatalog::new()
            .with_instances(CAT_MANAGED_MEMORY, vec![instance.to_string()])
            .with_counter(
                CAT_MANAGED_MEMORY,
                CTR_PROCESS_ID,
                Some(instance),
                vec![f64::from(pid)],
            )
            .with_counter(
                CAT_MANAGED_MEMORY,
                CTR_HEAP_BYTES_ALL,
                Some(instance),
                vec![0.0, 128.0 * BYTES_PER_MB],
            )
            .with_counter(
                CAT_MANAGED_MEMORY,
                CTR_GEN0_COLLECTIONS_PER_SEC,
                Some(instance),
                vec![0.0, 6.0],
            )
            .with_counter(
                CAT_MANAGED_MEMORY,
                CTR_GEN1_COLLECTIONS_PER_SEC,
                Some(instance),
                vec![0.0, 2.0],
            )
            .with_counter(
                CAT_MANAGED_MEMORY,
                CTR_GEN2_COLLECTIONS_PER_SEC,
                Some(instance),
                vec![0.0, 1.0],
            )
            .with_counter(
                CAT_MANAGED_MEMORY,
                CTR_GC_TIME_PERCENT,
                Some(instance),
                vec![0.0, 4.5],
            )
            .with_counter(
                CAT_MANAGED_EXCEPTIONS,
                CTR_EXCEPTIONS_PER_SEC,
                Some(instance),
                vec![0.0, 3.0],
            )
            .with_counter(
                CAT_MANAGED_THREADS,
                CTR_LOGICAL_THREADS,
                Some(instance),
                vec![0.0, 24.0],
            )
    }

    fn test_store() -> (Arc<Store>, i64) {
        let store = Arc::new(Store::open_in_memory().expect("store opens"));
        let run_id = store
            .insert_run(&crate::store::NewRun {
                started_at: UNIX_EPOCH,
                host_id: "t".into(),
                machine_name: "t".into(),
                os_version: "t".into(),
                logical_cores: 1,
                cpu_model: "t".into(),
                total_memory_mb: 1.0,
                system_drive_type: None,
                system_drive_free_gb: None,
                uptime_secs: 0,
                scenario: None,
                notes: None,
                workload_kind: None,
                workload_size_mb: None,
                workload_notes: None,
                config_snapshot: String::new(),
                tool_version: "test".into(),
            })
            .expect("insert run");
        (store, run_id)
    }

    fn sampler_with(
        catalog: StaticCatalog,
        processes: Vec<ProcessIdent>,
    ) -> (Arc<ClassicRuntimeSampler>, Arc<Store>, i64) {
        let (store, run_id) = test_store();
        let sampler = ClassicRuntimeSampler::new(
            &[legacy_app()],
            Arc::new(catalog),
            Arc::new(ListSource { processes }),
            Arc::clone(&store),
            run_id,
            Duration::from_secs(1),
            Arc::new(SystemTimeSource),
            CancellationToken::new(),
        );
        (sampler, store, run_id)
    }

    #[test]
    fn test_poll_resolves_instance_and_emits_framework_sample() {
        let (sampler, store, run_id) = sampler_with(
            catalog_for(42, "legacy-svc#1"),
            vec![ProcessIdent {
                pid: 42,
                name: "legacy-svc".to_string(),
            }],
        );

        // First poll opens and primes; its readings are the priming zeros.
        sampler.poll();
        sampler.poll();

        let samples = store.runtime_samples(run_id).expect("samples");
        assert_eq!(samples.len(), 2);

        let second = &samples[1];
        assert_eq!(second.kind, RuntimeKind::Framework);
        assert_eq!(second.heap_mb, Some(128.0));
        assert_eq!(second.gen0_per_sec, Some(6.0));
        assert_eq!(second.gc_time_percent, Some(4.5));
        assert_eq!(second.exceptions_per_sec, Some(3.0));
        assert_eq!(second.thread_count, Some(24.0));
        assert_eq!(second.alloc_mb_per_sec, None);
    }

    #[test]
    fn test_unresolvable_pid_yields_no_sample() {
        // Catalog knows an instance for pid 7, but the running pid is 42.
        let (sampler, store, run_id) = sampler_with(
            catalog_for(7, "legacy-svc#1"),
            vec![ProcessIdent {
                pid: 42,
                name: "legacy-svc".to_string(),
            }],
        );

        sampler.poll();
        assert!(store.runtime_samples(run_id).expect("samples").is_empty());
        assert_eq!(sampler.tracked_count(), 0);
    }

    #[test]
    fn test_departed_pid_state_is_dropped() {
        let (sampler, _store, _run_id) = sampler_with(
            catalog_for(42, "legacy-svc#1"),
            vec![ProcessIdent {
                pid: 42,
                name: "legacy-svc".to_string(),
            }],
        );

        sampler.poll();
        assert_eq!(sampler.tracked_count(), 1);

        // Swap in an empty process table and poll again.
        let empty = ClassicRuntimeSampler {
            apps: sampler.apps.clone(),
            catalog: Arc::clone(&sampler.catalog),
            source: Arc::new(ListSource {
                processes: Vec::new(),
            }),
            store: Arc::clone(&sampler.store),
            run_id: sampler.run_id,
            tick: sampler.tick,
            time: Arc::clone(&sampler.time),
            cancel: CancellationToken::new(),
            instances: Mutex::new(sampler.instances.lock().clone()),
            counters: Mutex::new(std::mem::take(&mut *sampler.counters.lock())),
        };

        empty.poll();
        assert_eq!(empty.tracked_count(), 0);
    }

    #[test]
    fn test_non_matching_processes_are_ignored() {
        let (sampler, store, run_id) = sampler_with(
            catalog_for(42, "legacy-svc#1"),
            vec![ProcessIdent {
                pid: 42,
                name: "unrelated".to_string(),
            }],
        );

        sampler.poll();
        assert!(store.runtime_samples(run_id).expect("samples").is_empty());
    }
}
