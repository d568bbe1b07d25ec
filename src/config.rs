use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for a capture run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path of the SQLite store the run is written to.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Master sampling interval. Default: 1s.
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,

    /// Executable names to monitor as plain process samples.
    #[serde(default)]
    pub process_names: Vec<String>,

    /// Capture disk throughput counters. Default: true.
    #[serde(default = "default_true")]
    pub enable_disk_metrics: bool,

    /// Capture per-interface network byte counters. Default: false.
    #[serde(default)]
    pub enable_network_metrics: bool,

    /// Connection string for ad-hoc SQL capture features.
    #[serde(default)]
    pub sql_connection_string: Option<String>,

    /// Capture a database inventory snapshot at run open. Default: false.
    #[serde(default)]
    pub enable_db_counters: bool,

    /// Connection string used for the database inventory snapshot.
    #[serde(default)]
    pub db_connection_string: Option<String>,

    /// Scenario label recorded on the run.
    #[serde(default)]
    pub scenario: Option<String>,

    /// Free-form notes recorded on the run.
    #[serde(default)]
    pub notes: Option<String>,

    /// Workload descriptor recorded on the run.
    #[serde(default)]
    pub workload: WorkloadConfig,

    /// Optional capture duration; the run ends when it elapses or on
    /// interrupt, whichever comes first.
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,

    /// Per-process diagnostic capture configuration.
    #[serde(default)]
    pub deep_monitoring: DeepMonitoringConfig,
}

/// Workload descriptor recorded on the run record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Workload type label (e.g. "oltp", "batch").
    #[serde(default)]
    pub kind: Option<String>,

    /// Estimated workload size in MB.
    #[serde(default)]
    pub size_mb: Option<f64>,

    /// Free-form workload notes.
    #[serde(default)]
    pub notes: Option<String>,
}

/// Diagnostic capture configuration for managed applications and the
/// relational instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeepMonitoringConfig {
    /// Managed applications exposing a diagnostic event channel.
    #[serde(default)]
    pub core_apps: Vec<ManagedAppConfig>,

    /// Managed applications sampled through the OS counter catalog.
    #[serde(default)]
    pub classic_apps: Vec<ManagedAppConfig>,

    /// Relational DMV sampling configuration.
    #[serde(default)]
    pub dmv: DmvConfig,

    /// Directory scanned for per-process diagnostic endpoints.
    /// Defaults to the system temp directory.
    #[serde(default)]
    pub diagnostic_socket_dir: Option<PathBuf>,
}

/// One monitored managed application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedAppConfig {
    /// Display label recorded on emitted samples.
    pub name: String,

    /// Executable name matched against running processes.
    pub process_name: String,

    /// Whether diagnostic capture is active for this app. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP request monitoring (core apps only).
    #[serde(default)]
    pub http_monitoring: Option<HttpMonitoringConfig>,
}

/// HTTP request reconstruction configuration for one app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpMonitoringConfig {
    /// Enable request reconstruction for this app.
    #[serde(default)]
    pub enabled: bool,

    /// How completed requests are grouped into endpoints.
    #[serde(default)]
    pub endpoint_grouping: EndpointGrouping,

    /// Width of the aggregation bucket. Default: 5s.
    #[serde(default = "default_bucket_interval", with = "humantime_serde")]
    pub bucket_interval: Duration,
}

/// Endpoint aggregation key derivation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointGrouping {
    /// Group by lowercased host only.
    #[default]
    HostOnly,
    /// Group by lowercased host plus the first path segment.
    HostAndFirstPathSegment,
}

/// Relational DMV sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmvConfig {
    /// Enable the DMV sampler.
    #[serde(default)]
    pub enabled: bool,

    /// Polling interval. Default: 5s.
    #[serde(default = "default_dmv_interval", with = "humantime_serde")]
    pub sample_interval: Duration,

    /// Connection string for the monitored instance.
    #[serde(default)]
    pub connection_string: Option<String>,
}

/// Command-line values layered over the file configuration.
///
/// Scalars win when set, lists replace the baseline only when non-empty,
/// boolean toggles OR together, and a non-positive DMV interval falls back
/// to the baseline.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub database_path: Option<PathBuf>,
    pub sample_interval: Option<Duration>,
    pub process_names: Vec<String>,
    pub enable_disk_metrics: bool,
    pub enable_network_metrics: bool,
    pub enable_db_counters: bool,
    pub sql_connection_string: Option<String>,
    pub db_connection_string: Option<String>,
    pub scenario: Option<String>,
    pub notes: Option<String>,
    pub duration: Option<Duration>,
    pub dmv_sample_interval: Option<Duration>,
    pub dmv_connection_string: Option<String>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("perfcap.db")
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_bucket_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_dmv_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database_path: default_database_path(),
            sample_interval: default_sample_interval(),
            process_names: Vec::new(),
            enable_disk_metrics: true,
            enable_network_metrics: false,
            sql_connection_string: None,
            enable_db_counters: false,
            db_connection_string: None,
            scenario: None,
            notes: None,
            workload: WorkloadConfig::default(),
            duration: None,
            deep_monitoring: DeepMonitoringConfig::default(),
        }
    }
}

impl Default for HttpMonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint_grouping: EndpointGrouping::default(),
            bucket_interval: default_bucket_interval(),
        }
    }
}

impl Default for DmvConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_interval: default_dmv_interval(),
            connection_string: None,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            bail!("database_path is required");
        }

        if self.sample_interval.is_zero() {
            bail!("sample_interval must be positive");
        }

        if self.deep_monitoring.dmv.sample_interval.is_zero() {
            bail!("deep_monitoring.dmv.sample_interval must be positive");
        }

        for app in self
            .deep_monitoring
            .core_apps
            .iter()
            .chain(&self.deep_monitoring.classic_apps)
        {
            if app.process_name.is_empty() {
                bail!("managed app {:?} has an empty process_name", app.name);
            }

            if let Some(http) = &app.http_monitoring {
                if http.enabled && http.bucket_interval.is_zero() {
                    bail!(
                        "http bucket_interval for app {:?} must be positive",
                        app.name,
                    );
                }
            }
        }

        Ok(())
    }

    /// Layer command-line overrides on top of this configuration.
    pub fn apply_overrides(&mut self, over: &ConfigOverrides) {
        if let Some(path) = &over.database_path {
            self.database_path = path.clone();
        }

        if let Some(interval) = over.sample_interval {
            if !interval.is_zero() {
                self.sample_interval = interval;
            }
        }

        // A non-empty override list replaces the baseline entirely.
        if !over.process_names.is_empty() {
            self.process_names = over.process_names.clone();
        }

        // Boolean toggles OR together, so a flag can enable but never
        // silently disable what the file asked for.
        self.enable_disk_metrics |= over.enable_disk_metrics;
        self.enable_network_metrics |= over.enable_network_metrics;
        self.enable_db_counters |= over.enable_db_counters;

        if over.sql_connection_string.is_some() {
            self.sql_connection_string = over.sql_connection_string.clone();
        }
        if over.db_connection_string.is_some() {
            self.db_connection_string = over.db_connection_string.clone();
        }
        if over.scenario.is_some() {
            self.scenario = over.scenario.clone();
        }
        if over.notes.is_some() {
            self.notes = over.notes.clone();
        }
        if over.duration.is_some() {
            self.duration = over.duration;
        }

        // A non-positive override keeps the baseline interval.
        if let Some(interval) = over.dmv_sample_interval {
            if !interval.is_zero() {
                self.deep_monitoring.dmv.sample_interval = interval;
            }
        }

        if over.dmv_connection_string.is_some() {
            self.deep_monitoring.dmv.connection_string = over.dmv_connection_string.clone();
            self.deep_monitoring.dmv.enabled = true;
        }
    }

    /// The set of executable names for which process samples are emitted:
    /// plain names plus the process names of every configured managed app,
    /// whether or not diagnostic capture is enabled for it.
    pub fn monitored_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.process_names.clone();

        for app in self
            .deep_monitoring
            .core_apps
            .iter()
            .chain(&self.deep_monitoring.classic_apps)
        {
            names.push(app.process_name.clone());
        }

        names
    }

    /// Serialized snapshot of the effective configuration, recorded on the
    /// run record.
    pub fn snapshot(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }
}
