//! Events a transport delivers to the connection lifecycle manager.

use std::fmt;

use bytes::Bytes;
use http::HeaderMap;

use crate::errors::TransportFault;

/// Which idle threshold elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleKind {
    /// Nothing was read for the reader threshold.
    ReaderIdle,
    /// Nothing was written for the writer threshold.
    WriterIdle,
    /// Nothing was read or written for the combined threshold.
    AllIdle,
}

impl fmt::Display for IdleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReaderIdle => "reader-idle",
            Self::WriterIdle => "writer-idle",
            Self::AllIdle => "all-idle",
        };
        f.write_str(s)
    }
}

/// Idle notification raised by the transport's idle timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleEvent {
    /// Which threshold elapsed.
    pub kind: IdleKind,
}

impl IdleEvent {
    /// Create an idle event.
    pub fn new(kind: IdleKind) -> Self {
        Self { kind }
    }
}

/// What the transport learned from a completed upgrade handshake.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Upgrade request headers.
    pub headers: HeaderMap,
    /// Request path the client upgraded on (query included).
    pub path: String,
    /// Negotiated subprotocol, if any.
    pub subprotocol: Option<String>,
}

impl Handshake {
    /// Handshake on `path` with no headers and no subprotocol.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            headers: HeaderMap::new(),
            path: path.into(),
            subprotocol: None,
        }
    }
}

/// One event in a connection's totally ordered event stream.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Upgrade completed.
    HandshakeComplete(Handshake),
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
    /// An idle threshold elapsed.
    Idle(IdleEvent),
    /// Transport-level error.
    Fault(TransportFault),
    /// The connection closed.
    Disconnect,
}

impl TransportEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HandshakeComplete(_) => "handshake_complete",
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Idle(_) => "idle",
            Self::Fault(_) => "fault",
            Self::Disconnect => "disconnect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FaultKind;

    #[test]
    fn idle_kind_display() {
        assert_eq!(IdleKind::ReaderIdle.to_string(), "reader-idle");
        assert_eq!(IdleKind::WriterIdle.to_string(), "writer-idle");
        assert_eq!(IdleKind::AllIdle.to_string(), "all-idle");
    }

    #[test]
    fn handshake_new_is_bare() {
        let hs = Handshake::new("/chat");
        assert_eq!(hs.path, "/chat");
        assert!(hs.headers.is_empty());
        assert!(hs.subprotocol.is_none());
    }

    #[test]
    fn event_names() {
        assert_eq!(TransportEvent::Text("x".into()).name(), "text");
        assert_eq!(
            TransportEvent::Fault(TransportFault::new(FaultKind::Io, "reset")).name(),
            "fault"
        );
        assert_eq!(TransportEvent::Disconnect.name(), "disconnect");
    }
}
