use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::clock::floor_to_interval;
use crate::config::EndpointGrouping;
use crate::store::HttpSample;

/// A reconstructed request handed to the aggregator.
#[derive(Debug, Clone)]
pub struct CompletedRequest {
    pub completed_at: SystemTime,
    pub host: Option<String>,
    pub path: Option<String>,
    pub status: Option<u16>,
    pub duration_ms: f64,
}

/// Endpoint key used when the host is absent from the request events.
pub const UNKNOWN_HOST: &str = "(unknown)";

/// Derives the endpoint group for a request.
pub fn endpoint_group(
    grouping: EndpointGrouping,
    host: Option<&str>,
    path: Option<&str>,
) -> String {
    let host = match host {
        Some(h) if !h.is_empty() => h.to_lowercase(),
        _ => UNKNOWN_HOST.to_string(),
    };

    match grouping {
        EndpointGrouping::HostOnly => host,
        EndpointGrouping::HostAndFirstPathSegment => {
            let segment = first_path_segment(path.unwrap_or_default()).to_lowercase();
            format!("{host}:{segment}")
        }
    }
}

/// The text before the first `/` after any leading `/`.
fn first_path_segment(path: &str) -> &str {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    trimmed.split('/').next().unwrap_or_default()
}

/// Aggregation key: one row per (bucket start, app, process, endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub bucket_start: SystemTime,
    pub app: String,
    pub process_name: String,
    pub endpoint: String,
}

/// Rolling statistics for one bucket.
#[derive(Debug, Default, Clone)]
pub struct BucketStats {
    pub request_count: u32,
    pub success_count: u32,
    pub client_error_count: u32,
    pub server_error_count: u32,
    pub other_status_count: u32,
    pub duration_count: u32,
    pub total_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
}

impl BucketStats {
    fn record(&mut self, status: Option<u16>, duration_ms: f64) {
        self.request_count += 1;

        // Informational and redirect responses land in "other", as does an
        // absent status.
        match status {
            Some(s) if (200..300).contains(&s) => self.success_count += 1,
            Some(s) if (400..500).contains(&s) => self.client_error_count += 1,
            Some(s) if (500..600).contains(&s) => self.server_error_count += 1,
            _ => self.other_status_count += 1,
        }

        if self.duration_count == 0 {
            self.min_duration_ms = duration_ms;
            self.max_duration_ms = duration_ms;
        } else {
            self.min_duration_ms = self.min_duration_ms.min(duration_ms);
            self.max_duration_ms = self.max_duration_ms.max(duration_ms);
        }
        self.duration_count += 1;
        self.total_duration_ms += duration_ms;
    }
}

/// Time-bucketed per-endpoint aggregation shared by all request sessions.
///
/// One mutex guards the bucket map; the flush path swaps the map with an
/// empty one so writers are blocked only for the swap.
#[derive(Default)]
pub struct RequestAggregator {
    buckets: Mutex<HashMap<BucketKey, BucketStats>>,
}

impl RequestAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one completed request into its bucket.
    pub fn record(
        &self,
        app: &str,
        process_name: &str,
        grouping: EndpointGrouping,
        bucket_interval: Duration,
        request: &CompletedRequest,
    ) {
        let key = BucketKey {
            bucket_start: floor_to_interval(request.completed_at, bucket_interval),
            app: app.to_string(),
            process_name: process_name.to_string(),
            endpoint: endpoint_group(grouping, request.host.as_deref(), request.path.as_deref()),
        };

        let mut buckets = self.buckets.lock();
        buckets
            .entry(key)
            .or_default()
            .record(request.status, request.duration_ms);
    }

    /// Atomically takes all pending buckets, leaving the map empty, and
    /// renders them as store rows.
    pub fn drain(&self) -> Vec<HttpSample> {
        let drained = {
            let mut buckets = self.buckets.lock();
            std::mem::take(&mut *buckets)
        };

        drained
            .into_iter()
            .map(|(key, stats)| {
                let avg = if stats.duration_count > 0 {
                    stats.total_duration_ms / f64::from(stats.duration_count)
                } else {
                    0.0
                };

                HttpSample {
                    bucket_start: key.bucket_start,
                    app: key.app,
                    process_name: key.process_name,
                    endpoint: key.endpoint,
                    request_count: stats.request_count,
                    success_count: stats.success_count,
                    client_error_count: stats.client_error_count,
                    server_error_count: stats.server_error_count,
                    other_status_count: stats.other_status_count,
                    total_duration_ms: stats.total_duration_ms,
                    avg_duration_ms: avg,
                    min_duration_ms: stats.min_duration_ms,
                    max_duration_ms: stats.max_duration_ms,
                }
            })
            .collect()
    }

    /// Number of open buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}
