//! Per-connection state and the session handle given to callbacks.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::ProviderError;
use crate::ids::{ConnectionId, SessionId};

/// Connection lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted by the transport, not yet admitted.
    Connecting = 0,
    /// Admitted, upgrade handshake not yet complete.
    HandshakePending = 1,
    /// Handshake complete; frames are dispatched.
    Open = 2,
    /// Close callback in progress.
    Closing = 3,
    /// Terminal.
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::HandshakePending,
            2 => Self::Open,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::HandshakePending => "handshake_pending",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Frame queued for the transport's write half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

type Attributes = DashMap<String, Arc<dyn Any + Send + Sync>>;

/// Handle through which callbacks talk back to their peer.
///
/// Cheap to clone. Sends never block: when the outbound queue is full or
/// the connection is gone the frame is dropped and counted.
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    connection_id: ConnectionId,
    remote: SocketAddr,
    outbound: mpsc::Sender<OutboundFrame>,
    close: CancellationToken,
    dropped: Arc<AtomicU64>,
    attributes: Arc<Attributes>,
}

impl Session {
    /// Session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// ID of the owning connection.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn send(&self, frame: OutboundFrame) -> bool {
        if self.outbound.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Queue a text frame. Returns `false` if it was dropped.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(OutboundFrame::Text(text.into()))
    }

    /// Queue a binary frame. Returns `false` if it was dropped.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.send(OutboundFrame::Binary(data.into()))
    }

    /// Serialize `value` and queue it as a text frame.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send_text(json),
            Err(_) => false,
        }
    }

    /// Frames dropped so far.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the transport to close the connection.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Whether the connection has not been asked to close yet.
    pub fn is_open(&self) -> bool {
        !self.close.is_cancelled() && !self.outbound.is_closed()
    }

    /// Store a per-connection attribute, replacing any previous value.
    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        let _ = self.attributes.insert(key.into(), Arc::new(value));
    }

    /// Read an attribute if present and of type `T`.
    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.attributes.get(key).map(|v| Arc::clone(v.value()))?;
        value.downcast::<T>().ok()
    }

    /// Remove an attribute. Returns whether it existed.
    pub fn remove_attribute(&self, key: &str) -> bool {
        self.attributes.remove(key).is_some()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// One accepted transport connection.
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    created_at: Instant,
    last_activity_ms: AtomicU64,
    state: AtomicU8,
    close: CancellationToken,
    outbound: mpsc::Sender<OutboundFrame>,
    dropped: Arc<AtomicU64>,
    attributes: Arc<Attributes>,
    session: OnceLock<Session>,
    instance: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Connection {
    /// New connection in `Connecting`.
    ///
    /// `outbound` feeds the transport's write half; cancelling `close`
    /// asks the transport to tear the connection down.
    pub fn new(
        remote: SocketAddr,
        outbound: mpsc::Sender<OutboundFrame>,
        close: CancellationToken,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            remote,
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            close,
            outbound,
            dropped: Arc::new(AtomicU64::new(0)),
            attributes: Arc::new(DashMap::new()),
            session: OnceLock::new(),
            instance: Mutex::new(None),
        }
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Stamp activity now. Written only by the task driving this connection.
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.store(elapsed, Ordering::Release);
    }

    /// Time since the last [`touch`](Self::touch) (or since accept).
    pub fn since_last_activity(&self) -> Duration {
        let stamped = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        self.age().saturating_sub(stamped)
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move forward to `to`. Returns the previous state, or `None` if the
    /// connection is already at or past `to`.
    pub fn advance(&self, to: ConnectionState) -> Option<ConnectionState> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < to as u8).then_some(to as u8)
            })
            .ok()
            .map(ConnectionState::from_u8)
    }

    /// Ask the transport to close this connection.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Whether a close has been requested.
    pub fn is_close_requested(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Token the transport waits on for close requests.
    pub fn close_token(&self) -> &CancellationToken {
        &self.close
    }

    /// Frames dropped because the outbound queue was full or closed.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Session handle, once the handshake has completed.
    pub fn session(&self) -> Option<&Session> {
        self.session.get()
    }

    /// Attach the session handle, creating it on first call.
    pub fn attach_session(&self) -> &Session {
        self.session.get_or_init(|| Session {
            id: SessionId::new(),
            connection_id: self.id.clone(),
            remote: self.remote,
            outbound: self.outbound.clone(),
            close: self.close.clone(),
            dropped: Arc::clone(&self.dropped),
            attributes: Arc::clone(&self.attributes),
        })
    }

    /// Handler instance attached to this connection, if of type `H`.
    pub fn instance<H: Send + Sync + 'static>(&self) -> Option<Arc<H>> {
        let erased = self.instance.lock().clone()?;
        erased.downcast::<H>().ok()
    }

    /// Attached instance, or the result of `create` attached now.
    ///
    /// `create` runs at most once per connection.
    pub fn instance_or_try_create<H, F>(&self, create: F) -> Result<Arc<H>, ProviderError>
    where
        H: Send + Sync + 'static,
        F: FnOnce() -> Result<Arc<H>, ProviderError>,
    {
        let mut slot = self.instance.lock();
        if let Some(existing) = slot.as_ref() {
            return Arc::clone(existing)
                .downcast::<H>()
                .map_err(|_| ProviderError::new("attached instance has a different type"));
        }
        let created = create()?;
        let erased: Arc<dyn Any + Send + Sync> = created.clone();
        *slot = Some(erased);
        Ok(created)
    }

    /// Drop the attached handler instance.
    pub fn release_instance(&self) {
        *self.instance.lock() = None;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
