pub mod channel;
pub mod classic;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::TimeSource;
use crate::config::ManagedAppConfig;
use crate::process::{normalize_name, ProcessIdent, ProcessSource};
use crate::store::{RuntimeKind, RuntimeSample, Store};

use self::channel::{ChannelFactory, DiagnosticChannel, DiagnosticEvent, ProviderSpec};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Counter-batch event name published by the runtime-counters provider.
const COUNTERS_EVENT: &str = "EventCounters";

// Counter names within a batch.
const CTR_HEAP_SIZE: &str = "gc-heap-size";
const CTR_ALLOC_RATE: &str = "alloc-rate";
const CTR_GEN0_COUNT: &str = "gen-0-gc-count";
const CTR_GEN1_COUNT: &str = "gen-1-gc-count";
const CTR_GEN2_COUNT: &str = "gen-2-gc-count";
const CTR_TIME_IN_GC: &str = "time-in-gc";
const CTR_EXCEPTION_COUNT: &str = "exception-count";
const CTR_THREAD_COUNT: &str = "thread-count";
const CTR_POOL_THREAD_COUNT: &str = "threadpool-thread-count";
const CTR_POOL_QUEUE_LENGTH: &str = "threadpool-queue-length";

/// Latest value per counter name within one session.
#[derive(Debug, Default)]
struct CounterScratch {
    latest: HashMap<String, f64>,
}

impl CounterScratch {
    /// Folds one counter event into the scratch: rate gauges carry a mean,
    /// cumulative counters carry an increment.
    fn apply(&mut self, event: &DiagnosticEvent) {
        let Some(name) = event.field_str("name").map(str::to_string) else {
            return;
        };

        let value = event
            .field_f64("mean")
            .or_else(|| event.field_f64("increment"));

        if let Some(value) = value {
            self.latest.insert(name, value);
        }
    }

    fn get(&self, name: &str) -> Option<f64> {
        self.latest.get(name).copied()
    }

    /// Converts the scratch into a runtime sample, normalising byte values
    /// to MB and per-interval increments to per-second rates.
    fn to_sample(
        &self,
        timestamp: SystemTime,
        app: &str,
        process_name: &str,
        tick_secs: f64,
    ) -> RuntimeSample {
        let tick_secs = tick_secs.max(f64::EPSILON);
        let per_sec = |v: f64| v / tick_secs;

        RuntimeSample {
            timestamp,
            app: app.to_string(),
            process_name: process_name.to_string(),
            kind: RuntimeKind::Core,
            heap_mb: self.get(CTR_HEAP_SIZE).map(|v| v / BYTES_PER_MB),
            alloc_mb_per_sec: self.get(CTR_ALLOC_RATE).map(|v| per_sec(v / BYTES_PER_MB)),
            gen0_per_sec: self.get(CTR_GEN0_COUNT).map(per_sec),
            gen1_per_sec: self.get(CTR_GEN1_COUNT).map(per_sec),
            gen2_per_sec: self.get(CTR_GEN2_COUNT).map(per_sec),
            gc_time_percent: self.get(CTR_TIME_IN_GC),
            exceptions_per_sec: self.get(CTR_EXCEPTION_COUNT).map(per_sec),
            thread_count: self.get(CTR_THREAD_COUNT),
            pool_thread_count: self.get(CTR_POOL_THREAD_COUNT),
            pool_queue_length: self.get(CTR_POOL_QUEUE_LENGTH),
        }
    }

    fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

/// Maintains at most one diagnostic session per pid across the configured
/// managed apps, consuming counter events and emitting aggregated runtime
/// samples.
pub struct RuntimeSessionManager {
    apps: Vec<ManagedAppConfig>,
    sessions: DashMap<u32, ()>,
    factory: Arc<dyn ChannelFactory>,
    store: Arc<Store>,
    run_id: i64,
    tick: Duration,
    time: Arc<dyn TimeSource>,
    cancel: CancellationToken,
}

impl RuntimeSessionManager {
    /// Builds a manager over the enabled app entries only.
    pub fn new(
        apps: &[ManagedAppConfig],
        factory: Arc<dyn ChannelFactory>,
        store: Arc<Store>,
        run_id: i64,
        tick: Duration,
        time: Arc<dyn TimeSource>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            apps: apps.iter().filter(|a| a.enabled).cloned().collect(),
            sessions: DashMap::new(),
            factory,
            store,
            run_id,
            tick,
            time,
            cancel,
        })
    }

    /// Attaches to every currently running process matching a configured
    /// app.
    pub fn attach_existing(self: &Arc<Self>, source: &dyn ProcessSource) {
        let current = match source.enumerate() {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "process enumeration for attach failed");
                return;
            }
        };

        for ident in current {
            self.notify_started(ident.pid, &ident.name);
        }
    }

    /// Reacts to a process-start notification: attaches when the name
    /// matches a configured app.
    pub fn notify_started(self: &Arc<Self>, pid: u32, name: &str) {
        let normalized = normalize_name(name);

        let app = self
            .apps
            .iter()
            .find(|a| normalize_name(&a.process_name) == normalized)
            .cloned();

        if let Some(app) = app {
            self.attach(app, pid);
        }
    }

    /// Consumes arrival events from the lifecycle tracker.
    pub fn listen(self: &Arc<Self>, mut arrivals: broadcast::Receiver<ProcessIdent>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    event = arrivals.recv() => {
                        match event {
                            Ok(ident) => manager.notify_started(ident.pid, &ident.name),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(missed = n, "arrival stream lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn attach(self: &Arc<Self>, app: ManagedAppConfig, pid: u32) {
        // Atomic reserve-or-skip: the entry guarantees at most one session
        // per pid across the seeded and event-driven attach paths.
        match self.sessions.entry(pid) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let providers = [ProviderSpec::runtime_counters(self.tick.as_secs_f64())];
        let channel = match self.factory.open(pid, &providers) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(pid, app = %app.name, error = %e, "runtime diagnostic attach failed");
                self.sessions.remove(&pid);
                return;
            }
        };

        debug!(pid, app = %app.name, "runtime diagnostic session opened");

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_session(&app, pid, channel).await;
            manager.sessions.remove(&pid);
            debug!(pid, "runtime diagnostic session closed");
        });
    }

    /// Drives one session until cancellation or channel end, emitting a
    /// sample whenever fresh counters arrive and the emission interval has
    /// elapsed.
    async fn run_session(&self, app: &ManagedAppConfig, pid: u32, mut channel: DiagnosticChannel) {
        // Counter batches land once per tick; the small allowance keeps a
        // slightly-early batch from slipping a whole interval.
        let emit_after = self.tick.saturating_sub(Duration::from_millis(200));

        let mut scratch = CounterScratch::default();
        let mut last_emit = self.time.now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = channel.recv() => {
                    let Some(event) = event else { break };

                    if !event.name.eq_ignore_ascii_case(COUNTERS_EVENT) {
                        continue;
                    }

                    scratch.apply(&event);

                    let now = self.time.now();
                    let elapsed = now
                        .duration_since(last_emit)
                        .unwrap_or(Duration::ZERO);

                    if elapsed >= emit_after && !scratch.is_empty() {
                        let sample = scratch.to_sample(
                            now,
                            &app.name,
                            &app.process_name,
                            self.tick.as_secs_f64(),
                        );

                        if let Err(e) = self.store.insert_runtime_samples(self.run_id, &[sample]) {
                            error!(pid, error = %e, "runtime sample write failed");
                        }

                        last_emit = now;
                    }
                }
            }
        }

        channel.close();
    }
}
