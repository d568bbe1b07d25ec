pub mod bucket;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::{ticker, TimeSource};
use crate::config::{HttpMonitoringConfig, ManagedAppConfig};
use crate::process::{normalize_name, ProcessIdent, ProcessSource};
use crate::store::{Marker, MarkerKind, MarkerLevel, Store};

use self::bucket::{CompletedRequest, RequestAggregator};

use crate::runtime::channel::{ChannelFactory, DiagnosticChannel, DiagnosticEvent, ProviderSpec};

/// Active requests older than this are evicted by the flush-tick sweep,
/// bounding memory when stop events go missing.
const ORPHAN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// An in-flight request: observed by its start event, not yet by a
/// stop/failed event.
#[derive(Debug, Clone)]
struct ActiveRequest {
    started_at: SystemTime,
    #[allow(dead_code)]
    method: Option<String>,
    host: Option<String>,
    path: Option<String>,
}

type ActiveMap = Arc<DashMap<String, ActiveRequest>>;

/// Reconstructs completed HTTP requests from per-process request event
/// streams and feeds the time-bucketed aggregator.
pub struct RequestMonitor {
    apps: Vec<(ManagedAppConfig, HttpMonitoringConfig)>,
    sessions: DashMap<u32, ()>,
    active: DashMap<u32, ActiveMap>,
    aggregator: RequestAggregator,
    factory: Arc<dyn ChannelFactory>,
    store: Arc<Store>,
    run_id: i64,
    time: Arc<dyn TimeSource>,
    cancel: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl RequestMonitor {
    /// Builds a monitor over apps with request monitoring enabled.
    pub fn new(
        apps: &[ManagedAppConfig],
        factory: Arc<dyn ChannelFactory>,
        store: Arc<Store>,
        run_id: i64,
        time: Arc<dyn TimeSource>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let apps: Vec<(ManagedAppConfig, HttpMonitoringConfig)> = apps
            .iter()
            .filter(|a| a.enabled)
            .filter_map(|a| {
                a.http_monitoring
                    .as_ref()
                    .filter(|h| h.enabled)
                    .map(|h| (a.clone(), h.clone()))
            })
            .collect();

        Arc::new(Self {
            apps,
            sessions: DashMap::new(),
            active: DashMap::new(),
            aggregator: RequestAggregator::new(),
            factory,
            store,
            run_id,
            time,
            cancel,
            flush_task: Mutex::new(None),
        })
    }

    /// Whether any app has request monitoring enabled.
    pub fn is_enabled(&self) -> bool {
        !self.apps.is_empty()
    }

    /// Flush cadence: once per second, or slower when every bucket is
    /// wider than that.
    fn flush_interval(&self) -> Duration {
        let min_bucket = self
            .apps
            .iter()
            .map(|(_, http)| http.bucket_interval)
            .min()
            .unwrap_or(Duration::from_secs(1));

        min_bucket.max(Duration::from_secs(1))
    }

    /// Spawns the flush loop. On cancellation it performs one final flush
    /// and clears the active-request maps, so no pending aggregate is
    /// silently lost.
    pub fn start(self: &Arc<Self>) {
        if !self.is_enabled() {
            return;
        }

        let monitor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut tick = ticker(monitor.flush_interval());

            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => {
                        monitor.flush_once();
                        monitor.active.clear();
                        return;
                    }
                    _ = tick.tick() => {
                        monitor.flush_once();
                        monitor.sweep_orphans();
                    }
                }
            }
        });

        *self.flush_task.lock() = Some(task);
    }

    /// Awaits the flush loop's final flush, bounded so a wedged store
    /// cannot stall shutdown.
    pub async fn shutdown(&self) {
        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .is_err()
            {
                warn!("request monitor flush task did not finish in time");
            }
        }
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

    /// Reacts to a process-start notification.
    pub fn notify_started(self: &Arc<Self>, pid: u32, name: &str) {
        let normalized = normalize_name(name);

        let matched = self
            .apps
            .iter()
            .find(|(app, _)| normalize_name(&app.process_name) == normalized)
            .cloned();

        if let Some((app, http)) = matched {
            self.attach(app, http, pid);
        }
    }

    /// Consumes arrival events from the lifecycle tracker.
    pub fn listen(self: &Arc<Self>, mut arrivals: broadcast::Receiver<ProcessIdent>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => return,
                    event = arrivals.recv() => {
                        match event {
                            Ok(ident) => monitor.notify_started(ident.pid, &ident.name),
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

    fn attach(self: &Arc<Self>, app: ManagedAppConfig, http: HttpMonitoringConfig, pid: u32) {
        match self.sessions.entry(pid) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let providers = [ProviderSpec::http_events()];
        let channel = match self.factory.open(pid, &providers) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(pid, app = %app.name, error = %e, "http event attach failed");
                self.write_tool_marker(format!(
                    "HTTP monitoring attach failed for {} (PID {pid}): {e}",
                    app.name,
                ));
                self.sessions.remove(&pid);
                return;
            }
        };

        debug!(pid, app = %app.name, "http event session opened");

        self.active.insert(pid, Arc::new(DashMap::new()));

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.run_session(&app, &http, pid, channel).await;
            monitor.sessions.remove(&pid);
            monitor.active.remove(&pid);
            debug!(pid, "http event session closed");
        });
    }

    async fn run_session(
        &self,
        app: &ManagedAppConfig,
        http: &HttpMonitoringConfig,
        pid: u32,
        mut channel: DiagnosticChannel,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = channel.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(app, http, pid, &event);
                }
            }
        }

        channel.close();
    }

    /// Classifies one request-scoped event by name suffix and updates the
    /// per-process active map or the aggregator. Undecodable events are
    /// dropped at debug level.
    fn handle_event(
        &self,
        app: &ManagedAppConfig,
        http: &HttpMonitoringConfig,
        pid: u32,
        event: &DiagnosticEvent,
    ) {
        let name = event.name.to_lowercase();

        if name.ends_with("start") {
            self.handle_start(pid, event);
        } else if name.ends_with("stop") || name.ends_with("failed") {
            self.handle_finish(app, http, pid, event);
        }
    }

    fn handle_start(&self, pid: u32, event: &DiagnosticEvent) {
        let Some(correlation_id) = event.field_str("ActivityId").map(str::to_string) else {
            debug!(pid, event = %event.name, "request start without correlation id dropped");
            return;
        };

        let Some(active) = self.active.get(&pid).map(|m| Arc::clone(&m)) else {
            return;
        };

        // Overwriting a duplicate start is acceptable.
        active.insert(
            correlation_id,
            ActiveRequest {
                started_at: self.time.now(),
                method: event.field_str("Method").map(str::to_string),
                host: event.field_str("Host").map(str::to_string),
                path: event.field_str("Path").map(str::to_string),
            },
        );
    }

    fn handle_finish(
        &self,
        app: &ManagedAppConfig,
        http: &HttpMonitoringConfig,
        pid: u32,
        event: &DiagnosticEvent,
    ) {
        let Some(correlation_id) = event.field_str("ActivityId") else {
            debug!(pid, event = %event.name, "request finish without correlation id dropped");
            return;
        };

        let Some(active) = self.active.get(&pid).map(|m| Arc::clone(&m)) else {
            return;
        };

        // A finish without a matching start is ignored.
        let Some((_, started)) = active.remove(correlation_id) else {
            return;
        };

        let now = self.time.now();
        let status = event
            .field_f64("StatusCode")
            .and_then(|s| u16::try_from(s as i64).ok());

        let duration_ms = event.field_f64("Duration").unwrap_or_else(|| {
            now.duration_since(started.started_at)
                .unwrap_or(Duration::ZERO)
                .as_secs_f64()
                * 1000.0
        });

        self.aggregator.record(
            &app.name,
            &app.process_name,
            http.endpoint_grouping,
            http.bucket_interval,
            &CompletedRequest {
                completed_at: now,
                host: started.host,
                path: started.path,
                status,
                duration_ms,
            },
        );
    }

    /// Writes all pending buckets to the store, leaving the bucket map
    /// empty.
    pub fn flush_once(&self) {
        let rows = self.aggregator.drain();
        if rows.is_empty() {
            return;
        }

        if let Err(e) = self.store.insert_http_samples(self.run_id, &rows) {
            error!(error = %e, "http sample write failed");
        }
    }

    /// Evicts active requests older than the orphan timeout. Returns the
    /// number evicted.
    pub fn sweep_orphans(&self) -> usize {
        let now = self.time.now();
        let mut evicted = 0usize;

        for entry in self.active.iter() {
            let map = entry.value();
            let before = map.len();
            map.retain(|_, request| {
                now.duration_since(request.started_at)
                    .map(|age| age <= ORPHAN_TIMEOUT)
                    .unwrap_or(true)
            });
            evicted += before - map.len();
        }

        if evicted > 0 {
            debug!(evicted, "evicted orphaned http requests");
        }

        evicted
    }

    /// Total in-flight requests across all sessions.
    pub fn active_request_count(&self) -> usize {
        self.active.iter().map(|entry| entry.value().len()).sum()
    }

    /// Number of open (unflushed) buckets.
    pub fn bucket_count(&self) -> usize {
        self.aggregator.bucket_count()
    }

    fn write_tool_marker(&self, label: String) {
        let marker = Marker {
            timestamp: self.time.now(),
            kind: MarkerKind::Tool,
            level: MarkerLevel::Error,
            label,
        };

        if let Err(e) = self.store.insert_marker(self.run_id, &marker) {
            error!(error = %e, "tool marker write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use crate::config::EndpointGrouping;
    use anyhow::Result;
    use serde_json::json;
    use std::time::UNIX_EPOCH;
    use tokio::sync::mpsc;

    struct NoFactory;

    impl ChannelFactory for NoFactory {
        fn open(&self, _pid: u32, _providers: &[ProviderSpec]) -> Result<DiagnosticChannel> {
            anyhow::bail!("attach refused")
        }
    }

    struct QueueFactory {
        channels: Mutex<Vec<DiagnosticChannel>>,
    }

    impl ChannelFactory for QueueFactory {
        fn open(&self, _pid: u32, _providers: &[ProviderSpec]) -> Result<DiagnosticChannel> {
            self.channels
                .lock()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("attach refused"))
        }
    }

    fn http_app(bucket_secs: u64, grouping: EndpointGrouping) -> ManagedAppConfig {
        ManagedAppConfig {
            name: "Api".to_string(),
            process_name: "api-host".to_string(),
            enabled: true,
            http_monitoring: Some(HttpMonitoringConfig {
                enabled: true,
                endpoint_grouping: grouping,
                bucket_interval: Duration::from_secs(bucket_secs),
            }),
        }
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

    fn monitor_with(
        app: ManagedAppConfig,
        factory: Arc<dyn ChannelFactory>,
        time: Arc<dyn TimeSource>,
    ) -> (Arc<RequestMonitor>, Arc<Store>, i64) {
        let (store, run_id) = test_store();
        let monitor = RequestMonitor::new(
            &[app],
            factory,
            Arc::clone(&store),
            run_id,
            time,
            CancellationToken::new(),
        );
        (monitor, store, run_id)
    }

    fn start_event(cid: &str, host: &str, path: &str) -> DiagnosticEvent {
        DiagnosticEvent::from_json(json!({
            "name": "RequestStart",
            "payload": {"ActivityId": cid, "Method": "GET", "host": host, "path": path},
        }))
        .expect("decodes")
    }

    fn stop_event(cid: &str, status: Option<u16>, duration_ms: Option<f64>) -> DiagnosticEvent {
        let mut payload = serde_json::Map::new();
        payload.insert("ActivityId".to_string(), json!(cid));
        if let Some(status) = status {
            payload.insert("StatusCode".to_string(), json!(status));
        }
        if let Some(d) = duration_ms {
            payload.insert("Duration".to_string(), json!(d));
        }

        DiagnosticEvent::from_json(json!({"name": "RequestStop", "payload": payload}))
            .expect("decodes")
    }

    fn failed_event(cid: &str) -> DiagnosticEvent {
        DiagnosticEvent::from_json(json!({
            "name": "RequestFailed",
            "payload": {"ActivityId": cid},
        }))
        .expect("decodes")
    }

    fn wire_session(monitor: &Arc<RequestMonitor>, pid: u32) -> (ManagedAppConfig, HttpMonitoringConfig) {
        monitor.active.insert(pid, Arc::new(DashMap::new()));
        let (app, http) = monitor.apps[0].clone();
        (app, http)
    }

    #[test]
    fn test_flush_interval_has_one_second_floor() {
        let time: Arc<dyn TimeSource> = Arc::new(crate::clock::SystemTimeSource);
        let (monitor, _, _) = monitor_with(
            http_app(5, EndpointGrouping::HostOnly),
            Arc::new(NoFactory),
            Arc::clone(&time),
        );
        assert_eq!(monitor.flush_interval(), Duration::from_secs(5));

        let mut app = http_app(5, EndpointGrouping::HostOnly);
        if let Some(http) = app.http_monitoring.as_mut() {
            http.bucket_interval = Duration::from_millis(200);
        }
        let (monitor, _, _) = monitor_with(app, Arc::new(NoFactory), time);
        assert_eq!(monitor.flush_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_attach_failure_writes_error_tool_marker() {
        let (monitor, store, run_id) = monitor_with(
            http_app(5, EndpointGrouping::HostOnly),
            Arc::new(NoFactory),
            Arc::new(crate::clock::SystemTimeSource),
        );

        monitor.notify_started(42, "api-host");

        let markers = store.markers(run_id).expect("markers");
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].kind, MarkerKind::Tool);
        assert_eq!(markers[0].level, MarkerLevel::Error);
        assert!(markers[0].label.contains("PID 42"));
        assert_eq!(monitor.sessions.len(), 0);
    }

    #[test]
    fn test_start_stop_pairs_into_bucket() {
        let time = ManualTimeSource::new(UNIX_EPOCH + Duration::from_secs(100));
        let (monitor, _store, _run_id) = monitor_with(
            http_app(2, EndpointGrouping::HostOnly),
            Arc::new(NoFactory),
            Arc::clone(&time) as _,
        );

        let (app, http) = wire_session(&monitor, 42);

        monitor.handle_event(&app, &http, 42, &start_event("r1", "A", "/x"));
        assert_eq!(monitor.active_request_count(), 1);

        monitor.handle_event(&app, &http, 42, &stop_event("r1", Some(200), Some(50.0)));
        assert_eq!(monitor.active_request_count(), 0);
        assert_eq!(monitor.bucket_count(), 1);
    }

    #[test]
    fn test_stop_without_start_is_ignored() {
        let time = ManualTimeSource::new(UNIX_EPOCH + Duration::from_secs(100));
        let (monitor, _store, _run_id) = monitor_with(
            http_app(2, EndpointGrouping::HostOnly),
            Arc::new(NoFactory),
            Arc::clone(&time) as _,
        );

        let (app, http) = wire_session(&monitor, 42);
        monitor.handle_event(&app, &http, 42, &stop_event("ghost", Some(200), None));

        assert_eq!(monitor.bucket_count(), 0);
    }

    #[test]
    fn test_duration_computed_from_start_when_absent() {
        let time = ManualTimeSource::new(UNIX_EPOCH + Duration::from_secs(100));
        let (monitor, store, run_id) = monitor_with(
            http_app(2, EndpointGrouping::HostOnly),
            Arc::new(NoFactory),
            Arc::clone(&time) as _,
        );

        let (app, http) = wire_session(&monitor, 42);

        monitor.handle_event(&app, &http, 42, &start_event("r1", "a", "/x"));
        time.advance(Duration::from_millis(500));
        monitor.handle_event(&app, &http, 42, &failed_event("r1"));

        monitor.flush_once();
        let rows = store.http_samples(run_id).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].other_status_count, 1);
        assert!((rows[0].total_duration_ms - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_duplicate_start_overwrites() {
        let time = ManualTimeSource::new(UNIX_EPOCH + Duration::from_secs(100));
        let (monitor, _store, _run_id) = monitor_with(
            http_app(2, EndpointGrouping::HostOnly),
            Arc::new(NoFactory),
            Arc::clone(&time) as _,
        );

        let (app, http) = wire_session(&monitor, 42);
        monitor.handle_event(&app, &http, 42, &start_event("r1", "a", "/x"));
        monitor.handle_event(&app, &http, 42, &start_event("r1", "b", "/y"));

        assert_eq!(monitor.active_request_count(), 1);
    }

    #[test]
    fn test_orphan_sweep_evicts_only_stale_requests() {
        let time = ManualTimeSource::new(UNIX_EPOCH + Duration::from_secs(1_000));
        let (monitor, store, run_id) = monitor_with(
            http_app(2, EndpointGrouping::HostOnly),
            Arc::new(NoFactory),
            Arc::clone(&time) as _,
        );

        let (app, http) = wire_session(&monitor, 42);

        monitor.handle_event(&app, &http, 42, &start_event("old", "a", "/x"));
        time.advance(ORPHAN_TIMEOUT + Duration::from_secs(1));
        monitor.handle_event(&app, &http, 42, &start_event("fresh", "a", "/x"));

        let evicted = monitor.sweep_orphans();
        assert_eq!(evicted, 1);
        assert_eq!(monitor.active_request_count(), 1);

        // The evicted request never produced a bucket record.
        monitor.flush_once();
        assert!(store.http_samples(run_id).expect("rows").is_empty());
    }

    #[tokio::test]
    async fn test_session_end_clears_active_map() {
        let time = ManualTimeSource::new(UNIX_EPOCH + Duration::from_secs(100));

        let (tx, rx) = mpsc::channel(8);
        let channel = DiagnosticChannel::new(rx, CancellationToken::new());
        let factory = Arc::new(QueueFactory {
            channels: Mutex::new(vec![channel]),
        });

        let (monitor, _store, _run_id) = monitor_with(
            http_app(2, EndpointGrouping::HostOnly),
            factory,
            Arc::clone(&time) as _,
        );

        monitor.notify_started(42, "api-host");
        assert_eq!(monitor.sessions.len(), 1);

        tx.send(start_event("r1", "a", "/x")).await.expect("send");
        drop(tx);

        // Let the session task drain and close.
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if monitor.sessions.is_empty() {
                break;
            }
        }

        assert!(monitor.sessions.is_empty());
        assert_eq!(monitor.active_request_count(), 0);
    }
}
