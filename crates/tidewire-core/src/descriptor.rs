//! Per-endpoint configuration.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::settings::SettingsError;

/// Upper bound on the default worker count.
const MAX_DEFAULT_IO_THREADS: usize = 32;

/// Configuration for one endpoint server.
///
/// Built once at registration and owned by one endpoint server. Every field
/// has a default so partial JSON deserializes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointDescriptor {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `20000`, `0` for auto-assign).
    pub port: u16,
    /// Upgrade path (default `"/"`).
    pub path: String,
    /// Worker threads; `<= 0` selects `min(cpus + 1, 32)`.
    pub io_threads: i32,
    /// Maximum live connections; `0` is unlimited.
    pub max_connections: usize,
    /// Heartbeat interval in milliseconds. Stored and reported only.
    pub heartbeat_interval_ms: u64,
    /// Maximum aggregated message size in bytes.
    pub max_payload_bytes: usize,
    /// Reader idle threshold in seconds; `0` disables.
    pub reader_idle_secs: u64,
    /// Writer idle threshold in seconds; `0` disables.
    pub writer_idle_secs: u64,
    /// Read-or-write idle threshold in seconds; `0` disables.
    pub all_idle_secs: u64,
    /// Subprotocols the endpoint accepts, in preference order.
    pub subprotocols: Vec<String>,
}

impl Default for EndpointDescriptor {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 20000,
            path: "/".into(),
            io_threads: -1,
            max_connections: 0,
            heartbeat_interval_ms: 30_000,
            max_payload_bytes: 8192,
            reader_idle_secs: 0,
            writer_idle_secs: 0,
            all_idle_secs: 60,
            subprotocols: Vec::new(),
        }
    }
}

impl EndpointDescriptor {
    /// Descriptor for `host:port` with every other field at its default.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Number of worker threads the server should run.
    pub fn worker_threads(&self) -> usize {
        if let Some(n) = usize::try_from(self.io_threads).ok().filter(|n| *n > 0) {
            return n;
        }
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        (cpus + 1).min(MAX_DEFAULT_IO_THREADS)
    }

    /// `host:port` as configured.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the configured host and port to a socket address.
    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("{} resolved to no addresses", self.bind_address()),
                )
            })
    }

    /// Reader idle threshold, if enabled.
    pub fn reader_idle(&self) -> Option<Duration> {
        secs(self.reader_idle_secs)
    }

    /// Writer idle threshold, if enabled.
    pub fn writer_idle(&self) -> Option<Duration> {
        secs(self.writer_idle_secs)
    }

    /// Combined idle threshold, if enabled.
    pub fn all_idle(&self) -> Option<Duration> {
        secs(self.all_idle_secs)
    }

    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Reject values no server can run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "path '{}' must start with '/'",
                self.path
            )));
        }
        if self.max_payload_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "max_payload_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}
