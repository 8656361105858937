//! Endpoint settings loading with deep merge and environment overrides.
//!
//! File layout:
//!
//! ```json
//! {
//!   "defaults": { "host": "127.0.0.1", "max_payload_bytes": 65536 },
//!   "endpoints": {
//!     "chat": { "port": 9000, "path": "/chat" },
//!     "feed": { "port": 9001, "all_idle_secs": 0 }
//!   }
//! }
//! ```
//!
//! Each named endpoint resolves as:
//! 1. Compiled [`EndpointDescriptor::default()`]
//! 2. Deep-merged with the file's `defaults` block
//! 3. Deep-merged with the endpoint's own block
//! 4. Environment overrides `TIDEWIRE_<NAME>_<FIELD>` (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::descriptor::EndpointDescriptor;

/// Errors that can occur when loading or parsing settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid (e.g., out of range).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Resolved descriptors for every endpoint named in a settings file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointSettings {
    endpoints: BTreeMap<String, EndpointDescriptor>,
}

impl EndpointSettings {
    /// Load settings from a file with env var overrides.
    ///
    /// A missing file yields no endpoints. Invalid JSON or an invalid
    /// resolved descriptor is an error.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(?path, "settings file not found, no endpoints configured");
            return Ok(Self::default());
        }
        debug!(?path, "loading endpoint settings");
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content, |key| std::env::var(key).ok())
    }

    /// Parse settings from a JSON document, reading overrides via `lookup`.
    pub fn from_json_str(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let root: Value = serde_json::from_str(content)?;
        let builtin = serde_json::to_value(EndpointDescriptor::default())?;
        let shared = match root.get("defaults") {
            Some(defaults) => deep_merge(builtin, defaults.clone()),
            None => builtin,
        };

        let mut endpoints = BTreeMap::new();
        if let Some(Value::Object(entries)) = root.get("endpoints") {
            for (name, entry) in entries {
                let merged = deep_merge(shared.clone(), entry.clone());
                let mut descriptor: EndpointDescriptor = serde_json::from_value(merged)?;
                apply_overrides(name, &mut descriptor, &lookup);
                descriptor.validate()?;
                let _ = endpoints.insert(name.clone(), descriptor);
            }
        }
        Ok(Self { endpoints })
    }

    /// Descriptor for a named endpoint.
    pub fn descriptor(&self, name: &str) -> Option<&EndpointDescriptor> {
        self.endpoints.get(name)
    }

    /// Names of all configured endpoints (sorted).
    pub fn names(&self) -> Vec<&str> {
        self.endpoints.keys().map(String::as_str).collect()
    }

    /// Number of configured endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether no endpoints are configured.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Environment variable prefix for a named endpoint (`TIDEWIRE_<NAME>_`).
pub fn env_prefix(name: &str) -> String {
    let upper: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("TIDEWIRE_{upper}_")
}

/// Apply overrides for one endpoint, reading values through `lookup`.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_overrides(
    name: &str,
    descriptor: &mut EndpointDescriptor,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let prefix = env_prefix(name);
    let read = |field: &str| {
        let key = format!("{prefix}{field}");
        lookup(&key)
            .filter(|v| !v.is_empty())
            .map(|v| (key, v))
    };

    if let Some((_, v)) = read("HOST") {
        descriptor.host = v;
    }
    if let Some((key, v)) = read("PORT") {
        if let Some(port) = checked(&key, &v, parse_u16_range(&v, 0, u16::MAX)) {
            descriptor.port = port;
        }
    }
    if let Some((key, v)) = read("PATH") {
        if let Some(path) = checked(&key, &v, v.starts_with('/').then(|| v.clone())) {
            descriptor.path = path;
        }
    }
    if let Some((key, v)) = read("IO_THREADS") {
        if let Some(n) = checked(&key, &v, parse_i32_range(&v, -1, 1024)) {
            descriptor.io_threads = n;
        }
    }
    if let Some((key, v)) = read("MAX_CONNECTIONS") {
        if let Some(n) = checked(&key, &v, parse_usize_range(&v, 0, 1_000_000)) {
            descriptor.max_connections = n;
        }
    }
    if let Some((key, v)) = read("MAX_PAYLOAD_BYTES") {
        if let Some(n) = checked(&key, &v, parse_usize_range(&v, 1, 1_073_741_824)) {
            descriptor.max_payload_bytes = n;
        }
    }
    if let Some((key, v)) = read("READER_IDLE_SECS") {
        if let Some(n) = checked(&key, &v, parse_u64_range(&v, 0, 86_400)) {
            descriptor.reader_idle_secs = n;
        }
    }
    if let Some((key, v)) = read("WRITER_IDLE_SECS") {
        if let Some(n) = checked(&key, &v, parse_u64_range(&v, 0, 86_400)) {
            descriptor.writer_idle_secs = n;
        }
    }
    if let Some((key, v)) = read("ALL_IDLE_SECS") {
        if let Some(n) = checked(&key, &v, parse_u64_range(&v, 0, 86_400)) {
            descriptor.all_idle_secs = n;
        }
    }
}

fn checked<T>(key: &str, value: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        warn!(key, value, "invalid endpoint override, ignoring");
    }
    parsed
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as an `i32` within a range.
pub fn parse_i32_range(val: &str, min: i32, max: i32) -> Option<i32> {
    let n: i32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
