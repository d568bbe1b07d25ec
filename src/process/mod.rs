pub mod cpu;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::TimeSource;
use crate::store::{Marker, MarkerKind, MarkerLevel, Store};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// How often the portable start/exit watchers rescan the process table.
const WATCH_INTERVAL: Duration = Duration::from_millis(200);

/// A process observed by the OS facility.
#[derive(Debug, Clone)]
pub struct ProcessIdent {
    pub pid: u32,
    pub name: String,
}

/// An open handle onto one process. Values are captured when the handle is
/// opened; callers open a fresh handle per tick and drop it after use.
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;
    /// Cumulative CPU time in milliseconds.
    fn cpu_time_ms(&self) -> Option<u64>;
    fn working_set_mb(&self) -> Option<f64>;
    fn private_bytes_mb(&self) -> Option<f64>;
    fn thread_count(&self) -> Option<u32>;
    fn handle_count(&self) -> Option<u32>;
}

/// The OS process facility: enumeration, handles, and start/exit
/// notification streams.
pub trait ProcessSource: Send + Sync {
    /// Lists currently running processes.
    fn enumerate(&self) -> Result<Vec<ProcessIdent>>;

    /// Opens a handle by pid. Fails when the process no longer exists.
    fn open(&self, pid: u32) -> Result<Box<dyn ProcessHandle>>;

    /// Whether the pid currently exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Best-effort exit code for a process that has already exited.
    fn exit_code(&self, pid: u32) -> Option<i32>;

    /// Subscribes to a stream of process-start events. May fail, commonly
    /// for lack of privilege; the caller then operates on seeding only.
    fn subscribe_starts(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<ProcessIdent>>;

    /// Delivers one exit notification (with best-effort exit code) for the
    /// given pid.
    fn watch_exit(&self, pid: u32, cancel: CancellationToken) -> oneshot::Receiver<Option<i32>>;
}

/// Normalizes an executable name for matching: lowercased, with the file
/// extension stripped.
pub fn normalize_name(name: &str) -> String {
    let lower = name.to_lowercase();
    Path::new(&lower)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or(lower)
}

// --- sysinfo-backed production source ---

/// Process facility backed by `sysinfo` and procfs.
#[derive(Debug, Default)]
pub struct SysinfoProcessSource;

impl SysinfoProcessSource {
    pub fn new() -> Self {
        Self
    }
}

struct SysinfoHandle {
    pid: u32,
    cpu_time_ms: Option<u64>,
    working_set_mb: Option<f64>,
    private_bytes_mb: Option<f64>,
    thread_count: Option<u32>,
    handle_count: Option<u32>,
}

impl ProcessHandle for SysinfoHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn cpu_time_ms(&self) -> Option<u64> {
        self.cpu_time_ms
    }

    fn working_set_mb(&self) -> Option<f64> {
        self.working_set_mb
    }

    fn private_bytes_mb(&self) -> Option<f64> {
        self.private_bytes_mb
    }

    fn thread_count(&self) -> Option<u32> {
        self.thread_count
    }

    fn handle_count(&self) -> Option<u32> {
        self.handle_count
    }
}

/// Counts open file descriptors of a process, where the platform exposes
/// them.
fn read_fd_count(pid: u32) -> Option<u32> {
    let dir = format!("/proc/{pid}/fd");
    let entries = std::fs::read_dir(dir).ok()?;
    Some(entries.count() as u32)
}

impl ProcessSource for SysinfoProcessSource {
    fn enumerate(&self) -> Result<Vec<ProcessIdent>> {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut idents = Vec::with_capacity(64);
        for (pid, process) in sys.processes() {
            if process.thread_kind().is_some() {
                continue; // Threads are not processes.
            }

            idents.push(ProcessIdent {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
            });
        }

        Ok(idents)
    }

    fn open(&self, pid: u32) -> Result<Box<dyn ProcessHandle>> {
        let mut sys = System::new();
        let target = sysinfo::Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

        let Some(process) = sys.process(target) else {
            bail!("no such process: {pid}");
        };

        Ok(Box::new(SysinfoHandle {
            pid,
            cpu_time_ms: Some(process.accumulated_cpu_time()),
            working_set_mb: Some(process.memory() as f64 / BYTES_PER_MB),
            private_bytes_mb: Some(process.virtual_memory() as f64 / BYTES_PER_MB),
            thread_count: process.tasks().map(|tasks| tasks.len() as u32),
            handle_count: read_fd_count(pid),
        }))
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut sys = System::new();
        let target = sysinfo::Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        sys.process(target).is_some()
    }

    fn exit_code(&self, _pid: u32) -> Option<i32> {
        // Exit codes of processes we did not spawn are not readable here.
        None
    }

    fn subscribe_starts(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<ProcessIdent>> {
        let (tx, rx) = mpsc::channel(64);

        let mut known: HashSet<u32> = self
            .enumerate()
            .context("seeding start-event baseline")?
            .into_iter()
            .map(|p| p.pid)
            .collect();

        tokio::spawn(async move {
            let mut ticker = crate::clock::ticker(WATCH_INTERVAL);
            let source = SysinfoProcessSource::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let Ok(current) = source.enumerate() else {
                            continue;
                        };

                        let mut seen = HashSet::with_capacity(current.len());
                        for ident in current {
                            seen.insert(ident.pid);
                            if known.insert(ident.pid) && tx.send(ident).await.is_err() {
                                return;
                            }
                        }
                        known.retain(|pid| seen.contains(pid));
                    }
                }
            }
        });

        Ok(rx)
    }

    fn watch_exit(&self, pid: u32, cancel: CancellationToken) -> oneshot::Receiver<Option<i32>> {
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut ticker = crate::clock::ticker(WATCH_INTERVAL);
            let source = SysinfoProcessSource::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if !source.is_alive(pid) {
                            let _ = tx.send(source.exit_code(pid));
                            return;
                        }
                    }
                }
            }
        });

        rx
    }
}

// --- Lifecycle tracker ---

struct ActiveProcess {
    name: String,
    // The handle acquired at arrival anchors the process for the tracker's
    // lifetime; per-tick reads go through fresh handles.
    #[allow(dead_code)]
    handle: Box<dyn ProcessHandle>,
}

struct TrackerState {
    active: HashMap<u32, ActiveProcess>,
}

/// Maintains the set of live pids whose executable name is monitored,
/// announces arrivals and departures, and emits lifecycle markers.
pub struct ProcessTracker {
    monitored: HashSet<String>,
    source: Arc<dyn ProcessSource>,
    store: Arc<Store>,
    run_id: i64,
    time: Arc<dyn TimeSource>,
    state: Mutex<TrackerState>,
    arrivals: broadcast::Sender<ProcessIdent>,
    cancel: CancellationToken,
}

impl ProcessTracker {
    pub fn new(
        monitored_names: &[String],
        source: Arc<dyn ProcessSource>,
        store: Arc<Store>,
        run_id: i64,
        time: Arc<dyn TimeSource>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (arrivals, _) = broadcast::channel(256);

        Arc::new(Self {
            monitored: monitored_names.iter().map(|n| normalize_name(n)).collect(),
            source,
            store,
            run_id,
            time,
            state: Mutex::new(TrackerState {
                active: HashMap::new(),
            }),
            arrivals,
            cancel,
        })
    }

    /// Subscribes to arrival events. Must be called before `start` to
    /// observe seeded arrivals.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessIdent> {
        self.arrivals.subscribe()
    }

    /// Subscribes to the start-event stream, then seeds from the current
    /// process table. Subscription failure logs one warning and degrades
    /// to seeding-only operation.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        match self.source.subscribe_starts(self.cancel.child_token()) {
            Ok(mut rx) => {
                let tracker = Arc::clone(self);
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = tracker.cancel.cancelled() => return,
                            event = rx.recv() => {
                                let Some(ident) = event else { return };
                                if tracker.is_monitored(&ident.name) {
                                    tracker.handle_arrival(ident);
                                }
                            }
                        }
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "process start events unavailable, tracking seeded processes only");
            }
        }

        // Seed synchronously so the first tick already sees the targets.
        let current = self.source.enumerate().context("enumerating processes")?;
        for ident in current {
            if self.is_monitored(&ident.name) {
                self.handle_arrival(ident);
            }
        }

        Ok(())
    }

    fn is_monitored(&self, name: &str) -> bool {
        !self.monitored.is_empty() && self.monitored.contains(&normalize_name(name))
    }

    /// Admits a pid into the active set, emits its start marker, and wires
    /// the exit notification. Checks for the spawn/exit race before
    /// releasing the lock so a process that died in between still gets a
    /// matched exit marker and never reaches a process sample.
    fn handle_arrival(self: &Arc<Self>, ident: ProcessIdent) {
        let pid = ident.pid;
        let name = normalize_name(&ident.name);

        let mut state = self.state.lock();
        if state.active.contains_key(&pid) {
            return;
        }

        let handle = match self.source.open(pid) {
            Ok(h) => h,
            Err(e) => {
                debug!(pid, error = %e, "process vanished before its handle opened");
                return;
            }
        };

        state.active.insert(
            pid,
            ActiveProcess {
                name: name.clone(),
                handle,
            },
        );

        let exit_rx = self.source.watch_exit(pid, self.cancel.child_token());
        {
            let tracker = Arc::clone(self);
            tokio::spawn(async move {
                if let Ok(code) = exit_rx.await {
                    tracker.handle_exit(pid, code);
                }
            });
        }

        self.write_marker(
            MarkerKind::ProcessStart,
            MarkerLevel::Info,
            format!("Process {name} (PID {pid}) started."),
        );

        // Still under the lock: the process may have exited between spawn
        // and the wiring above.
        if !self.source.is_alive(pid) {
            state.active.remove(&pid);
            let code = self.source.exit_code(pid);
            self.write_marker(
                MarkerKind::ProcessExit,
                MarkerLevel::Info,
                exit_label(&name, pid, code),
            );
            return;
        }

        drop(state);

        let _ = self.arrivals.send(ProcessIdent { pid, name });
    }

    fn handle_exit(&self, pid: u32, code: Option<i32>) {
        let mut state = self.state.lock();
        let Some(process) = state.active.remove(&pid) else {
            return;
        };

        self.write_marker(
            MarkerKind::ProcessExit,
            MarkerLevel::Info,
            exit_label(&process.name, pid, code),
        );
    }

    /// Point-in-time copy of the active set with a fresh handle per pid.
    /// Pids whose handle no longer opens are removed and skipped. Returned
    /// handles are owned by the caller.
    pub fn active_snapshot(&self) -> Vec<(String, Box<dyn ProcessHandle>)> {
        let entries: Vec<(u32, String)> = {
            let state = self.state.lock();
            state
                .active
                .iter()
                .map(|(pid, p)| (*pid, p.name.clone()))
                .collect()
        };

        let mut snapshot = Vec::with_capacity(entries.len());
        for (pid, name) in entries {
            match self.source.open(pid) {
                Ok(handle) => snapshot.push((name, handle)),
                Err(e) => {
                    debug!(pid, error = %e, "dropping dead pid from active set");
                    self.state.lock().active.remove(&pid);
                }
            }
        }

        snapshot
    }

    /// The currently active pid set.
    pub fn active_pids(&self) -> HashSet<u32> {
        self.state.lock().active.keys().copied().collect()
    }

    fn write_marker(&self, kind: MarkerKind, level: MarkerLevel, label: String) {
        let marker = Marker {
            timestamp: self.time.now(),
            kind,
            level,
            label,
        };

        if let Err(e) = self.store.insert_marker(self.run_id, &marker) {
            error!(error = %e, "marker write failed");
        }
    }
}

fn exit_label(name: &str, pid: u32, code: Option<i32>) -> String {
    match code {
        Some(code) => format!("Process {name} (PID {pid}) exited with code {code}."),
        None => format!("Process {name} (PID {pid}) exited."),
    }
}
