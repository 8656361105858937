//! Error hierarchy for endpoint registration and connection dispatch.
//!
//! - [`RegistrationError`]: fatal at startup, the endpoint never opens
//! - [`AdmissionRejected`]: connection refused by the connection ceiling
//! - [`DispatchError`]: argument resolution or callback failure, isolated
//! - [`CallbackError`]: what handler callbacks return
//! - [`ArgumentError`]: typed argument access inside a callback failed
//! - [`ProviderError`]: handler instance creation or event conversion failed
//! - [`TransportFault`]: transport-level error handed to `Error` callbacks

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

use crate::binding::Lifecycle;

/// Failure while binding an endpoint type or registering its address.
///
/// Any variant aborts startup for the affected endpoint only.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Two unrelated methods carry the same lifecycle marker.
    #[error("endpoint '{endpoint}': duplicate {lifecycle} annotation on method '{method}'")]
    DuplicateAnnotation {
        /// Endpoint type name.
        endpoint: String,
        /// The duplicated marker.
        lifecycle: Lifecycle,
        /// The method that collided with the already-bound one.
        method: String,
    },

    /// A tagged method is not publicly invocable.
    #[error("endpoint '{endpoint}': lifecycle method '{method}' is not public")]
    NotPublic {
        /// Endpoint type name.
        endpoint: String,
        /// Offending method.
        method: String,
    },

    /// No resolver in the chain supports a declared parameter.
    #[error(
        "endpoint '{endpoint}': no argument resolver for parameter '{parameter}' (#{index}) of method '{method}'"
    )]
    UnresolvedParameter {
        /// Endpoint type name.
        endpoint: String,
        /// Method declaring the parameter.
        method: String,
        /// Parameter name.
        parameter: String,
        /// Zero-based parameter position.
        index: usize,
    },

    /// Another endpoint is already registered on the same address.
    #[error("address {address} is already bound by endpoint '{existing}'")]
    DuplicateAddress {
        /// The contested address.
        address: SocketAddr,
        /// Endpoint that registered the address first.
        existing: String,
    },

    /// The configured host/port does not resolve to a socket address.
    #[error("invalid endpoint address '{address}': {source}")]
    InvalidAddress {
        /// `host:port` as configured.
        address: String,
        /// Resolution failure.
        #[source]
        source: std::io::Error,
    },
}

/// A new connection was refused because the endpoint is at its ceiling.
#[derive(Debug, Clone, Error)]
#[error("connection from {remote} rejected: {live} live connections, max {max}")]
pub struct AdmissionRejected {
    /// Remote peer address.
    pub remote: SocketAddr,
    /// Live connection count at the time of the attempt.
    pub live: usize,
    /// Configured ceiling.
    pub max: usize,
}

/// Typed access to a resolved argument failed inside a callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    /// No argument at this position.
    #[error("no argument at position {index}")]
    OutOfRange {
        /// Requested position.
        index: usize,
    },
    /// The argument at this position holds a different kind of value.
    #[error("argument {index} is {found}, expected {expected}")]
    Mismatch {
        /// Requested position.
        index: usize,
        /// Kind the callback asked for.
        expected: &'static str,
        /// Kind actually present.
        found: &'static str,
    },
    /// A converted argument was already taken or holds another type.
    #[error("converted argument {index} is not a {expected}")]
    Conversion {
        /// Requested position.
        index: usize,
        /// Requested Rust type name.
        expected: &'static str,
    },
}

/// Error returned by a handler callback.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CallbackError {
    /// Create a callback error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error.
    pub fn from_error(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<ArgumentError> for CallbackError {
    fn from(err: ArgumentError) -> Self {
        Self::from_error(err)
    }
}

/// Result type returned by handler callbacks.
pub type CallbackResult = Result<(), CallbackError>;

/// Handler instance creation or event conversion failed.
#[derive(Debug, Clone, Error)]
#[error("instance provider: {message}")]
pub struct ProviderError {
    /// Human-readable message.
    pub message: String,
}

impl ProviderError {
    /// Create a provider error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure while resolving arguments for, or invoking, a bound callback.
///
/// Dispatch errors are logged and counted by the manager. They never change
/// connection state and never reach other connections.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The connection has no handler instance attached.
    #[error("no handler instance attached to connection")]
    MissingInstance,
    /// The connection has no session handle attached.
    #[error("no session attached to connection")]
    MissingSession,
    /// The event payload does not carry what the resolver extracts.
    #[error("parameter '{parameter}' expects a {expected} payload")]
    PayloadMismatch {
        /// Parameter name.
        parameter: String,
        /// Payload kind the resolver needs.
        expected: &'static str,
    },
    /// Converting an idle event to the declared parameter type failed.
    #[error("event conversion failed: {0}")]
    EventConversion(#[source] ProviderError),
    /// The callback returned an error.
    #[error("callback failed: {0}")]
    Callback(#[from] CallbackError),
    /// The callback panicked.
    #[error("callback panicked: {0}")]
    Panicked(String),
}

/// Classification of a transport fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Malformed frames or protocol violations.
    Protocol,
    /// A message exceeded the configured payload ceiling.
    Capacity,
    /// Socket-level I/O failure.
    Io,
    /// Anything else.
    Other,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Protocol => "protocol",
            Self::Capacity => "capacity",
            Self::Io => "io",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Transport-level error delivered to `Error` callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} fault: {message}")]
pub struct TransportFault {
    /// Fault classification.
    pub kind: FaultKind,
    /// Human-readable description from the transport.
    pub message: String,
}

impl TransportFault {
    /// Create a transport fault.
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
