use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Well-known provider names.
pub const PROVIDER_RUNTIME_COUNTERS: &str = "System.Runtime";
pub const PROVIDER_HTTP_EVENTS: &str = "Microsoft.AspNetCore.Hosting";

/// One provider requested when opening a channel.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderSpec {
    pub name: String,
    pub verbosity: u8,
    pub keywords: u64,
    pub arguments: Vec<(String, String)>,
}

impl ProviderSpec {
    /// The runtime-counters provider, publishing counter batches at the
    /// given interval.
    pub fn runtime_counters(interval_secs: f64) -> Self {
        Self {
            name: PROVIDER_RUNTIME_COUNTERS.to_string(),
            verbosity: 4,
            keywords: u64::MAX,
            arguments: vec![(
                "EventCounterIntervalSec".to_string(),
                format!("{interval_secs}"),
            )],
        }
    }

    /// The networking/HTTP request events provider.
    pub fn http_events() -> Self {
        Self {
            name: PROVIDER_HTTP_EVENTS.to_string(),
            verbosity: 4,
            keywords: u64::MAX,
            arguments: Vec::new(),
        }
    }
}

/// One decoded event from a diagnostic channel: a name, a keyed payload,
/// and a numeric-indexed fallback for payloads published positionally.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticEvent {
    pub name: String,
    pub payload: serde_json::Map<String, Value>,
    pub indexed: Vec<Value>,
}

impl DiagnosticEvent {
    /// Looks up a payload field, accepting either capitalization of the key.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key).or_else(|| {
            self.payload
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }

    /// String form of a payload field.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }

    /// Numeric form of a payload field, accepting integers, floats and
    /// numeric strings.
    pub fn field_f64(&self, key: &str) -> Option<f64> {
        match self.field(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Positional fallback accessor.
    pub fn indexed(&self, i: usize) -> Option<&Value> {
        self.indexed.get(i)
    }

    /// Decodes one wire value: `{"name": ..., "payload": {...}}` where the
    /// payload may also be an array (positional form).
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            bail!("event is not an object");
        };

        let name = obj
            .remove("name")
            .and_then(|v| v.as_str().map(str::to_string))
            .context("event has no name")?;

        let mut event = DiagnosticEvent {
            name,
            ..Default::default()
        };

        match obj.remove("payload") {
            Some(Value::Object(map)) => event.payload = map,
            Some(Value::Array(items)) => event.indexed = items,
            Some(_) | None => {}
        }

        Ok(event)
    }
}

/// An open diagnostic channel: a stream of decoded events plus a close
/// handle. Closing (or cancellation) tears down the transport.
pub struct DiagnosticChannel {
    events: mpsc::Receiver<DiagnosticEvent>,
    closer: CancellationToken,
}

impl DiagnosticChannel {
    /// Assembles a channel from an event receiver and its close token.
    pub fn new(events: mpsc::Receiver<DiagnosticEvent>, closer: CancellationToken) -> Self {
        Self { events, closer }
    }

    /// Receives the next event; `None` when the channel has ended.
    pub async fn recv(&mut self) -> Option<DiagnosticEvent> {
        self.events.recv().await
    }

    /// Closes the channel and releases the transport.
    pub fn close(&self) {
        self.closer.cancel();
    }
}

impl Drop for DiagnosticChannel {
    fn drop(&mut self) {
        self.closer.cancel();
    }
}

/// Opens diagnostic channels to managed processes.
pub trait ChannelFactory: Send + Sync {
    /// Opens a channel to `pid` with the given provider list. Fails when
    /// the process exposes no endpoint or refuses the session.
    fn open(&self, pid: u32, providers: &[ProviderSpec]) -> Result<DiagnosticChannel>;
}

/// Production factory: connects to the per-process diagnostic endpoint, a
/// Unix-domain socket named after the pid, and speaks newline-delimited
/// JSON. The first line written is the session request carrying the
/// provider list; every line read back is one event.
pub struct SocketChannelFactory {
    socket_dir: PathBuf,
}

impl SocketChannelFactory {
    pub fn new(socket_dir: Option<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.unwrap_or_else(std::env::temp_dir),
        }
    }

    /// Locates the endpoint for a pid: any file in the socket directory
    /// whose name starts with `diag-<pid>-` or equals `diag-<pid>.sock`.
    fn endpoint_for(&self, pid: u32) -> Result<PathBuf> {
        let exact = self.socket_dir.join(format!("diag-{pid}.sock"));
        if exact.exists() {
            return Ok(exact);
        }

        let prefix = format!("diag-{pid}-");
        let entries = std::fs::read_dir(&self.socket_dir)
            .with_context(|| format!("reading {}", self.socket_dir.display()))?;

        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                return Ok(entry.path());
            }
        }

        bail!("no diagnostic endpoint for pid {pid}");
    }
}

#[cfg(unix)]
impl ChannelFactory for SocketChannelFactory {
    fn open(&self, pid: u32, providers: &[ProviderSpec]) -> Result<DiagnosticChannel> {
        let path = self.endpoint_for(pid)?;

        let stream = std::os::unix::net::UnixStream::connect(&path)
            .with_context(|| format!("connecting to {}", path.display()))?;
        stream
            .set_nonblocking(true)
            .context("setting endpoint non-blocking")?;

        let stream = tokio::net::UnixStream::from_std(stream)
            .context("registering endpoint with the runtime")?;

        let request = serde_json::json!({
            "command": "collect",
            "providers": providers,
        });

        let (tx, rx) = mpsc::channel(1024);
        let closer = CancellationToken::new();
        let reader_cancel = closer.clone();

        tokio::spawn(async move {
            let mut stream = stream;
            let mut request_line = request.to_string();
            request_line.push('\n');

            if let Err(e) = stream.write_all(request_line.as_bytes()).await {
                debug!(pid, error = %e, "session request write failed");
                return;
            }

            let mut lines = BufReader::new(stream).lines();

            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    line = lines.next_line() => {
                        let line = match line {
                            Ok(Some(line)) => line,
                            Ok(None) => return,
                            Err(e) => {
                                debug!(pid, error = %e, "diagnostic stream read failed");
                                return;
                            }
                        };

                        if line.is_empty() {
                            continue;
                        }

                        let event = match serde_json::from_str::<Value>(&line)
                            .map_err(anyhow::Error::from)
                            .and_then(DiagnosticEvent::from_json)
                        {
                            Ok(event) => event,
                            Err(e) => {
                                debug!(pid, error = %e, "undecodable diagnostic event dropped");
                                continue;
                            }
                        };

                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(DiagnosticChannel::new(rx, closer))
    }
}

#[cfg(not(unix))]
impl ChannelFactory for SocketChannelFactory {
    fn open(&self, pid: u32, _providers: &[ProviderSpec]) -> Result<DiagnosticChannel> {
        bail!("diagnostic endpoints are not supported on this platform (pid {pid})")
    }
}
