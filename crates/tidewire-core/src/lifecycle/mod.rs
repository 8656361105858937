//! Connection lifecycle manager.
//!
//! Drives each connection through
//! `Connecting → HandshakePending → Open → Closing → Closed` and dispatches
//! transport events to the bound callbacks. Events for one connection are
//! expected one at a time, in arrival order; different connections are
//! handled concurrently.
//!
//! Every callback failure (error return, argument resolution failure, or
//! panic) is logged and counted. It never changes the connection's state
//! and never reaches another connection.

mod registry;
mod sweep;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub use registry::ConnectionRegistry;

use self::sweep::SweepTask;
use crate::binding::{Lifecycle, MethodBinding};
use crate::connection::{Connection, ConnectionState};
use crate::errors::{AdmissionRejected, DispatchError, TransportFault};
use crate::events::{Handshake, IdleEvent, TransportEvent};
use crate::metrics::{
    WS_ADMISSION_REJECTED_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL, WS_DISPATCH_ERRORS_TOTAL,
    WS_HANDSHAKE_TIMEOUTS_TOTAL,
};
use crate::provider::InstanceProvider;
use crate::resolver::EventPayload;

/// A connection still awaiting its handshake this long after its last
/// activity is force-closed by the sweep.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Period of the background handshake sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Owns the connection registry of one endpoint and dispatches its events.
pub struct ConnectionManager<H> {
    endpoint: String,
    binding: Arc<MethodBinding<H>>,
    provider: Arc<dyn InstanceProvider<H>>,
    registry: ConnectionRegistry,
    max_connections: usize,
    sweep: Mutex<Option<SweepTask>>,
}

impl<H: Send + Sync + 'static> ConnectionManager<H> {
    /// Manager for one endpoint. `max_connections == 0` means unlimited.
    pub fn new(
        binding: Arc<MethodBinding<H>>,
        provider: Arc<dyn InstanceProvider<H>>,
        max_connections: usize,
    ) -> Self {
        Self {
            endpoint: binding.endpoint().to_owned(),
            binding,
            provider,
            registry: ConnectionRegistry::new(),
            max_connections,
            sweep: Mutex::new(None),
        }
    }

    /// Endpoint type name.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The callback table.
    pub fn binding(&self) -> &Arc<MethodBinding<H>> {
        &self.binding
    }

    /// The connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Live connection count.
    pub fn live_connections(&self) -> usize {
        self.registry.len()
    }

    /// Connections still awaiting their handshake.
    pub fn pending_handshakes(&self) -> usize {
        self.registry.pending_len()
    }

    /// Route one transport event.
    pub fn dispatch(&self, conn: &Arc<Connection>, event: TransportEvent) {
        match event {
            TransportEvent::HandshakeComplete(handshake) => self.handshake_complete(conn, &handshake),
            TransportEvent::Text(text) => self.text(conn, &text),
            TransportEvent::Binary(data) => self.binary(conn, &data),
            TransportEvent::Idle(idle) => self.idle(conn, idle),
            TransportEvent::Fault(fault) => self.fault(conn, fault),
            TransportEvent::Disconnect => self.disconnect(conn),
        }
    }

    /// Admit a newly accepted connection.
    ///
    /// On rejection the connection is marked closed and asked to close; it
    /// never enters the registry and no callback fires for it.
    pub fn accept(&self, conn: &Arc<Connection>) -> Result<(), AdmissionRejected> {
        match self.registry.admit(conn, self.max_connections) {
            Ok(live) => {
                conn.touch();
                let _ = conn.advance(ConnectionState::HandshakePending);
                counter!(WS_CONNECTIONS_TOTAL, "endpoint" => self.endpoint.clone()).increment(1);
                self.record_live(live);
                debug!(
                    endpoint = %self.endpoint,
                    connection_id = %conn.id(),
                    remote = %conn.remote_addr(),
                    live,
                    "connection admitted"
                );
                Ok(())
            }
            Err(rejected) => {
                let _ = conn.advance(ConnectionState::Closed);
                conn.close();
                counter!(WS_ADMISSION_REJECTED_TOTAL, "endpoint" => self.endpoint.clone())
                    .increment(1);
                warn!(
                    endpoint = %self.endpoint,
                    remote = %rejected.remote,
                    live = rejected.live,
                    max = rejected.max,
                    "connection rejected at capacity"
                );
                Err(rejected)
            }
        }
    }

    /// The upgrade completed: attach the handler instance and session, move
    /// to `Open`, and run the Open callback.
    pub fn handshake_complete(&self, conn: &Connection, handshake: &Handshake) {
        if conn.state() != ConnectionState::HandshakePending || conn.is_close_requested() {
            debug!(
                endpoint = %self.endpoint,
                connection_id = %conn.id(),
                state = %conn.state(),
                "handshake completion ignored"
            );
            return;
        }
        if !self.registry.clear_pending(conn) {
            debug!(
                endpoint = %self.endpoint,
                connection_id = %conn.id(),
                "handshake completed after the sweep claimed the connection"
            );
            return;
        }
        conn.touch();

        let instance = match conn.instance_or_try_create(|| self.provider.create()) {
            Ok(instance) => instance,
            Err(err) => {
                error!(
                    endpoint = %self.endpoint,
                    connection_id = %conn.id(),
                    remote = %conn.remote_addr(),
                    error = %err,
                    "handler instance unavailable, closing connection"
                );
                self.count_failure(Lifecycle::Open);
                conn.close();
                return;
            }
        };
        let _ = conn.attach_session();
        if conn.advance(ConnectionState::Open).is_none() {
            return;
        }
        self.invoke(conn, &instance, Lifecycle::Open, &EventPayload::Handshake(handshake));
    }

    /// A text frame arrived.
    pub fn text(&self, conn: &Connection, text: &str) {
        conn.touch();
        self.dispatch_open(conn, Lifecycle::Message, &EventPayload::Text(text));
    }

    /// A binary frame arrived.
    pub fn binary(&self, conn: &Connection, data: &Bytes) {
        conn.touch();
        self.dispatch_open(conn, Lifecycle::Binary, &EventPayload::Binary(data));
    }

    /// An idle threshold elapsed. Ignored before the handshake completes.
    pub fn idle(&self, conn: &Connection, event: IdleEvent) {
        self.dispatch_open(conn, Lifecycle::Event, &EventPayload::Idle(event));
    }

    /// A transport fault occurred. Ignored before the handshake completes.
    ///
    /// Does not change state; the transport follows up with a disconnect.
    pub fn fault(&self, conn: &Connection, fault: TransportFault) {
        if conn.state() != ConnectionState::Open {
            debug!(
                endpoint = %self.endpoint,
                connection_id = %conn.id(),
                error = %fault,
                "fault before handshake dropped"
            );
            return;
        }
        let fault = Arc::new(fault);
        self.dispatch_open(conn, Lifecycle::Error, &EventPayload::Fault(&fault));
    }

    /// The connection closed. Idempotent.
    ///
    /// Removes the connection from the registry and, if its handshake had
    /// completed, runs the Close callback exactly once.
    pub fn disconnect(&self, conn: &Connection) {
        if self.registry.remove(conn) {
            counter!(WS_DISCONNECTIONS_TOTAL, "endpoint" => self.endpoint.clone()).increment(1);
            histogram!(WS_CONNECTION_DURATION_SECONDS, "endpoint" => self.endpoint.clone())
                .record(conn.age().as_secs_f64());
            self.record_live(self.registry.len());
        }

        let Some(previous) = conn.advance(ConnectionState::Closing) else {
            return;
        };
        if previous == ConnectionState::Open {
            if let Some(instance) = conn.instance::<H>() {
                self.invoke(conn, &instance, Lifecycle::Close, &EventPayload::None);
            }
        }
        let _ = conn.advance(ConnectionState::Closed);
        conn.close();
        conn.release_instance();
        debug!(
            endpoint = %self.endpoint,
            connection_id = %conn.id(),
            remote = %conn.remote_addr(),
            "connection closed"
        );
    }

    /// Force-close every pending connection whose last activity is older
    /// than [`HANDSHAKE_TIMEOUT`]. Returns how many were closed.
    pub fn sweep(&self) -> usize {
        let mut closed = 0;
        for conn in self.registry.pending() {
            if conn.since_last_activity() <= HANDSHAKE_TIMEOUT {
                continue;
            }
            if !self.registry.clear_pending(&conn) {
                continue;
            }
            conn.close();
            closed += 1;
            counter!(WS_HANDSHAKE_TIMEOUTS_TOTAL, "endpoint" => self.endpoint.clone())
                .increment(1);
            warn!(
                endpoint = %self.endpoint,
                connection_id = %conn.id(),
                remote = %conn.remote_addr(),
                waited_ms = u64::try_from(conn.since_last_activity().as_millis()).unwrap_or(u64::MAX),
                "handshake timed out"
            );
        }
        closed
    }

    /// Start the background sweep on `handle`. No-op if already running.
    ///
    /// The task holds only a weak reference and stops on its own once the
    /// manager is dropped.
    pub fn start_sweep(self: &Arc<Self>, handle: &Handle) {
        let mut slot = self.sweep.lock();
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let task = handle.spawn(sweep::run_sweep(
            Arc::downgrade(self),
            SWEEP_INTERVAL,
            cancel.clone(),
        ));
        *slot = Some(SweepTask {
            cancel,
            handle: task,
        });
    }

    /// Stop the background sweep, if running.
    pub fn stop_sweep(&self) {
        if let Some(task) = self.sweep.lock().take() {
            task.cancel.cancel();
            task.handle.abort();
        }
    }

    /// Whether the background sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweep.lock().is_some()
    }

    /// Ask every registered connection to close. Returns how many.
    pub fn close_all(&self) -> usize {
        let conns = self.registry.snapshot();
        for conn in &conns {
            conn.close();
        }
        conns.len()
    }

    /// Drop every registry entry without running callbacks.
    pub fn clear(&self) -> usize {
        let cleared = self.registry.clear().len();
        self.record_live(0);
        cleared
    }

    fn dispatch_open(&self, conn: &Connection, lifecycle: Lifecycle, payload: &EventPayload<'_>) {
        if !self.binding.is_bound(lifecycle) || conn.state() != ConnectionState::Open {
            return;
        }
        match conn.instance::<H>() {
            Some(instance) => self.invoke(conn, &instance, lifecycle, payload),
            None => self.report(conn, lifecycle, &DispatchError::MissingInstance),
        }
    }

    fn invoke(&self, conn: &Connection, instance: &H, lifecycle: Lifecycle, payload: &EventPayload<'_>) {
        let Some(callback) = self.binding.callback(lifecycle) else {
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback.invoke(instance, conn, payload)))
            .unwrap_or_else(|panic| Err(DispatchError::Panicked(panic_message(panic.as_ref()))));
        if let Err(err) = outcome {
            self.report(conn, lifecycle, &err);
        }
    }

    fn report(&self, conn: &Connection, lifecycle: Lifecycle, err: &DispatchError) {
        error!(
            endpoint = %self.endpoint,
            connection_id = %conn.id(),
            remote = %conn.remote_addr(),
            lifecycle = %lifecycle,
            error = %err,
            "lifecycle callback failed"
        );
        self.count_failure(lifecycle);
    }

    fn count_failure(&self, lifecycle: Lifecycle) {
        counter!(
            WS_DISPATCH_ERRORS_TOTAL,
            "endpoint" => self.endpoint.clone(),
            "lifecycle" => lifecycle.as_str()
        )
        .increment(1);
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_live(&self, live: usize) {
        gauge!(WS_CONNECTIONS_ACTIVE, "endpoint" => self.endpoint.clone()).set(live as f64);
    }
}

impl<H> Drop for ConnectionManager<H> {
    fn drop(&mut self) {
        if let Some(task) = self.sweep.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use http::HeaderValue;
    use tokio::sync::mpsc;
    use tokio::time;
    use tracing::Level;

    use crate::binding::{EndpointClass, MethodDecl, ParamDecl};
    use crate::connection::OutboundFrame;
    use crate::errors::{CallbackError, FaultKind, ProviderError};
    use crate::events::IdleKind;
    use crate::logging::capture_logs;
    use crate::resolver::{Arguments, ResolverChain};

    #[derive(Default)]
    struct Recorder {
        opens: AtomicUsize,
        users: Mutex<Vec<String>>,
        messages: Mutex<Vec<String>>,
        binaries: AtomicUsize,
        events: Mutex<Vec<IdleKind>>,
        closes: AtomicUsize,
        errors: Mutex<Vec<String>>,
    }

    fn recorder_class() -> EndpointClass<Recorder> {
        EndpointClass::new("Recorder")
            .method(
                MethodDecl::new("on_open", |p: &Recorder, args: &mut Arguments| {
                    let _ = args.session(0)?;
                    if let Some(user) = args.headers(1)?.get("x-user") {
                        p.users
                            .lock()
                            .push(user.to_str().unwrap_or_default().to_owned());
                    }
                    let _ = p.opens.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on(Lifecycle::Open)
                .param(ParamDecl::session("session"))
                .param(ParamDecl::headers("headers")),
            )
            .method(
                MethodDecl::new("on_message", |p: &Recorder, args: &mut Arguments| {
                    let text = args.text(1)?;
                    match text {
                        "fail" => return Err(CallbackError::new("rejected message")),
                        "panic" => panic!("handler blew up"),
                        "echo" => {
                            let _ = args.session(0)?.send_text("echo");
                        }
                        _ => {}
                    }
                    p.messages.lock().push(text.to_owned());
                    Ok(())
                })
                .on(Lifecycle::Message)
                .param(ParamDecl::session("session"))
                .param(ParamDecl::text("message")),
            )
            .method(
                MethodDecl::new("on_binary", |p: &Recorder, args: &mut Arguments| {
                    let _ = p.binaries.fetch_add(args.bytes(0)?.len(), Ordering::SeqCst);
                    Ok(())
                })
                .on(Lifecycle::Binary)
                .param(ParamDecl::bytes("data")),
            )
            .method(
                MethodDecl::new("on_event", |p: &Recorder, args: &mut Arguments| {
                    p.events.lock().push(args.event(0)?.kind);
                    Ok(())
                })
                .on(Lifecycle::Event)
                .param(ParamDecl::event("event")),
            )
            .method(
                MethodDecl::new("on_close", |p: &Recorder, _: &mut Arguments| {
                    let _ = p.closes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on(Lifecycle::Close),
            )
            .method(
                MethodDecl::new("on_error", |p: &Recorder, args: &mut Arguments| {
                    p.errors.lock().push(args.error(0)?.message.clone());
                    Ok(())
                })
                .on(Lifecycle::Error)
                .param(ParamDecl::error("cause")),
            )
    }

    struct Harness {
        manager: Arc<ConnectionManager<Recorder>>,
        recorder: Arc<Recorder>,
        created: Arc<AtomicUsize>,
    }

    fn harness_with(class: &EndpointClass<Recorder>, max: usize, fail_create: bool) -> Harness {
        let recorder = Arc::new(Recorder::default());
        let created = Arc::new(AtomicUsize::new(0));
        let (p, c) = (Arc::clone(&recorder), Arc::clone(&created));
        let provider = move || -> Result<Arc<Recorder>, ProviderError> {
            if fail_create {
                return Err(ProviderError::new("container unavailable"));
            }
            let _ = c.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&p))
        };
        let binding = MethodBinding::resolve(class, &ResolverChain::standard(None)).unwrap();
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(binding),
            Arc::new(provider),
            max,
        ));
        Harness {
            manager,
            recorder,
            created,
        }
    }

    fn harness(max: usize) -> Harness {
        harness_with(&recorder_class(), max, false)
    }

    fn connect(port: u16) -> (Arc<Connection>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(8);
        let conn = Connection::new(
            ([127, 0, 0, 1], port).into(),
            tx,
            CancellationToken::new(),
        );
        (Arc::new(conn), rx)
    }

    fn open(h: &Harness, port: u16) -> (Arc<Connection>, mpsc::Receiver<OutboundFrame>) {
        let (conn, rx) = connect(port);
        h.manager.accept(&conn).unwrap();
        h.manager.handshake_complete(&conn, &Handshake::new("/"));
        (conn, rx)
    }

    #[test]
    fn accept_moves_to_pending() {
        let h = harness(0);
        let (conn, _rx) = connect(1);
        h.manager.accept(&conn).unwrap();
        assert_eq!(conn.state(), ConnectionState::HandshakePending);
        assert_eq!(h.manager.live_connections(), 1);
        assert_eq!(h.manager.pending_handshakes(), 1);
        assert_eq!(h.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handshake_opens_and_invokes_open() {
        let h = harness(0);
        let (conn, _rx) = connect(1);
        h.manager.accept(&conn).unwrap();
        let mut hs = Handshake::new("/chat");
        let _ = hs.headers.insert("x-user", HeaderValue::from_static("ada"));
        h.manager.handshake_complete(&conn, &hs);

        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(h.manager.pending_handshakes(), 0);
        assert!(conn.session().is_some());
        assert_eq!(h.recorder.opens.load(Ordering::SeqCst), 1);
        assert_eq!(*h.recorder.users.lock(), vec!["ada".to_owned()]);
    }

    #[test]
    fn third_accept_rejected_at_ceiling_of_two() {
        let h = harness(2);
        let (a, _ra) = connect(1);
        let (b, _rb) = connect(2);
        let (c, _rc) = connect(3);
        assert!(h.manager.accept(&a).is_ok());
        assert!(h.manager.accept(&b).is_ok());
        let rejected = h.manager.accept(&c).unwrap_err();
        assert_eq!(rejected.max, 2);
        assert_eq!(h.manager.live_connections(), 2);
        assert_eq!(c.state(), ConnectionState::Closed);
        assert!(c.is_close_requested());

        h.manager.handshake_complete(&c, &Handshake::new("/"));
        h.manager.text(&c, "ignored");
        h.manager.disconnect(&c);
        assert_eq!(h.recorder.opens.load(Ordering::SeqCst), 0);
        assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 0);
        assert_eq!(h.created.load(Ordering::SeqCst), 0);
        assert_eq!(h.manager.live_connections(), 2);
    }

    #[test]
    fn slot_frees_after_disconnect() {
        let h = harness(1);
        let (a, _ra) = open(&h, 1);
        let (b, _rb) = connect(2);
        assert!(h.manager.accept(&b).is_err());
        h.manager.disconnect(&a);
        let (c, _rc) = connect(3);
        assert!(h.manager.accept(&c).is_ok());
    }

    #[test]
    fn instance_created_once_per_connection() {
        let h = harness(0);
        let (conn, _rx) = open(&h, 1);
        for i in 0..5 {
            h.manager.text(&conn, &format!("m{i}"));
        }
        h.manager.handshake_complete(&conn, &Handshake::new("/"));
        h.manager.binary(&conn, &Bytes::from_static(b"abc"));
        assert_eq!(h.created.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorder.opens.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorder.messages.lock().len(), 5);
        assert_eq!(h.recorder.binaries.load(Ordering::SeqCst), 3);

        let (_other, _rx2) = open(&h, 2);
        assert_eq!(h.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn frames_before_open_are_dropped() {
        let h = harness(0);
        let (conn, _rx) = connect(1);
        h.manager.accept(&conn).unwrap();
        h.manager.text(&conn, "early");
        h.manager.binary(&conn, &Bytes::from_static(b"x"));
        assert!(h.recorder.messages.lock().is_empty());
        assert_eq!(h.recorder.binaries.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn idle_close_error_never_fire_before_handshake() {
        let h = harness(0);
        let (conn, _rx) = connect(1);
        h.manager.accept(&conn).unwrap();
        h.manager.idle(&conn, IdleEvent::new(IdleKind::AllIdle));
        h.manager.fault(&conn, TransportFault::new(FaultKind::Io, "reset"));
        h.manager.disconnect(&conn);
        assert!(h.recorder.events.lock().is_empty());
        assert!(h.recorder.errors.lock().is_empty());
        assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(h.manager.live_connections(), 0);
    }

    #[test]
    fn idle_and_fault_reach_callbacks_after_open() {
        let h = harness(0);
        let (conn, _rx) = open(&h, 1);
        h.manager.idle(&conn, IdleEvent::new(IdleKind::AllIdle));
        h.manager.fault(&conn, TransportFault::new(FaultKind::Protocol, "bad frame"));
        assert_eq!(*h.recorder.events.lock(), vec![IdleKind::AllIdle]);
        assert_eq!(*h.recorder.errors.lock(), vec!["bad frame".to_owned()]);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[test]
    fn close_fires_exactly_once() {
        let h = harness(0);
        let (conn, _rx) = open(&h, 1);
        h.manager.disconnect(&conn);
        h.manager.disconnect(&conn);
        h.manager.dispatch(&conn, TransportEvent::Disconnect);
        assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.instance::<Recorder>().is_none());
        h.manager.text(&conn, "after close");
        assert!(h.recorder.messages.lock().is_empty());
    }

    #[test]
    fn callback_error_is_isolated() {
        let (logs, _guard) = capture_logs();
        let h = harness(0);
        let (conn, _rx) = open(&h, 1);
        let (other, _rx2) = open(&h, 2);
        h.manager.text(&conn, "fail");
        assert_eq!(conn.state(), ConnectionState::Open);
        h.manager.text(&conn, "next");
        h.manager.text(&other, "other");
        assert_eq!(
            *h.recorder.messages.lock(),
            vec!["next".to_owned(), "other".to_owned()]
        );

        let failures: Vec<_> = logs
            .events()
            .into_iter()
            .filter(|e| e.level == Level::ERROR && e.message.contains("lifecycle callback failed"))
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].field("lifecycle"), Some("OnMessage"));
        assert!(failures[0].field("error").unwrap().contains("rejected message"));
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let (logs, _guard) = capture_logs();
        let h = harness(0);
        let (conn, _rx) = open(&h, 1);
        h.manager.text(&conn, "panic");
        assert_eq!(conn.state(), ConnectionState::Open);
        h.manager.text(&conn, "after");
        assert_eq!(*h.recorder.messages.lock(), vec!["after".to_owned()]);
        assert!(logs.events().iter().any(|e| e
            .field("error")
            .is_some_and(|v| v.contains("handler blew up"))));
    }

    #[tokio::test]
    async fn session_reaches_outbound_queue() {
        let h = harness(0);
        let (conn, mut rx) = open(&h, 1);
        h.manager.text(&conn, "echo");
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Text("echo".into()));
    }

    #[test]
    fn provider_failure_closes_without_open() {
        let (logs, _guard) = capture_logs();
        let h = harness_with(&recorder_class(), 0, true);
        let (conn, _rx) = connect(1);
        h.manager.accept(&conn).unwrap();
        h.manager.handshake_complete(&conn, &Handshake::new("/"));
        assert_ne!(conn.state(), ConnectionState::Open);
        assert!(conn.is_close_requested());
        assert_eq!(h.recorder.opens.load(Ordering::SeqCst), 0);
        assert!(logs.has_event(Level::ERROR, "handler instance unavailable"));

        h.manager.disconnect(&conn);
        assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 0);
        assert_eq!(h.manager.live_connections(), 0);
    }

    #[test]
    fn unbound_lifecycle_drops_events() {
        let class = EndpointClass::new("OpenOnly").method(
            MethodDecl::new("on_open", |p: &Recorder, _: &mut Arguments| {
                let _ = p.opens.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on(Lifecycle::Open),
        );
        let (logs, _guard) = capture_logs();
        let h = harness_with(&class, 0, false);
        let (conn, _rx) = open(&h, 1);
        h.manager.text(&conn, "nobody listens");
        h.manager.idle(&conn, IdleEvent::new(IdleKind::ReaderIdle));
        h.manager.disconnect(&conn);
        assert_eq!(h.recorder.opens.load(Ordering::SeqCst), 1);
        assert_eq!(logs.count_at_level(Level::ERROR), 0);
    }

    #[test]
    fn dispatch_routes_events() {
        let h = harness(0);
        let (conn, _rx) = connect(1);
        h.manager.accept(&conn).unwrap();
        h.manager
            .dispatch(&conn, TransportEvent::HandshakeComplete(Handshake::new("/")));
        h.manager.dispatch(&conn, TransportEvent::Text("hi".into()));
        h.manager
            .dispatch(&conn, TransportEvent::Binary(Bytes::from_static(b"1234")));
        h.manager
            .dispatch(&conn, TransportEvent::Idle(IdleEvent::new(IdleKind::WriterIdle)));
        h.manager.dispatch(
            &conn,
            TransportEvent::Fault(TransportFault::new(FaultKind::Capacity, "too big")),
        );
        h.manager.dispatch(&conn, TransportEvent::Disconnect);
        assert_eq!(h.recorder.opens.load(Ordering::SeqCst), 1);
        assert_eq!(*h.recorder.messages.lock(), vec!["hi".to_owned()]);
        assert_eq!(h.recorder.binaries.load(Ordering::SeqCst), 4);
        assert_eq!(*h.recorder.events.lock(), vec![IdleKind::WriterIdle]);
        assert_eq!(*h.recorder.errors.lock(), vec!["too big".to_owned()]);
        assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_closes_stale_handshakes_only() {
        let h = harness(0);
        let (stale, _r1) = connect(1);
        let (opened, _r2) = connect(2);
        h.manager.accept(&stale).unwrap();
        h.manager.accept(&opened).unwrap();
        h.manager.handshake_complete(&opened, &Handshake::new("/"));

        time::advance(Duration::from_secs(30)).await;
        assert_eq!(h.manager.sweep(), 0);
        assert!(!stale.is_close_requested());

        time::advance(Duration::from_millis(1)).await;
        assert_eq!(h.manager.sweep(), 1);
        assert!(stale.is_close_requested());
        assert!(!opened.is_close_requested());
        assert_eq!(h.manager.pending_handshakes(), 0);
        assert_eq!(h.manager.sweep(), 0);

        h.manager.handshake_complete(&stale, &Handshake::new("/"));
        h.manager.disconnect(&stale);
        assert_eq!(h.recorder.opens.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handshake_loses_to_claimed_sweep() {
        let h = harness(0);
        let (conn, _rx) = connect(1);
        h.manager.accept(&conn).unwrap();

        // Claimed by the sweep, close not yet requested.
        assert!(h.manager.registry().clear_pending(&conn));
        assert!(!conn.is_close_requested());

        h.manager.handshake_complete(&conn, &Handshake::new("/"));
        assert_ne!(conn.state(), ConnectionState::Open);
        assert_eq!(h.recorder.opens.load(Ordering::SeqCst), 0);
        assert_eq!(h.created.load(Ordering::SeqCst), 0);

        h.manager.disconnect(&conn);
        assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_on_period() {
        let h = harness(0);
        h.manager.start_sweep(&Handle::current());
        h.manager.start_sweep(&Handle::current());
        assert!(h.manager.is_sweeping());
        let (conn, _rx) = connect(1);
        h.manager.accept(&conn).unwrap();

        time::sleep(Duration::from_secs(35)).await;
        assert!(!conn.is_close_requested());
        time::sleep(Duration::from_secs(6)).await;
        assert!(conn.is_close_requested());

        h.manager.stop_sweep();
        assert!(!h.manager.is_sweeping());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_ends_when_manager_dropped() {
        let h = harness(0);
        h.manager.start_sweep(&Handle::current());
        let weak = Arc::downgrade(&h.manager);
        drop(h);
        time::sleep(Duration::from_secs(11)).await;
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn close_all_requests_close_and_clear_empties() {
        let h = harness(0);
        let (a, _ra) = open(&h, 1);
        let (b, _rb) = connect(2);
        h.manager.accept(&b).unwrap();
        assert_eq!(h.manager.close_all(), 2);
        assert!(a.is_close_requested());
        assert!(b.is_close_requested());
        assert_eq!(h.manager.clear(), 2);
        assert_eq!(h.manager.live_connections(), 0);

        h.manager.disconnect(&a);
        assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejection_is_reported() {
        let (logs, _guard) = capture_logs();
        let h = harness(1);
        let (_a, _ra) = open(&h, 1);
        let (b, _rb) = connect(2);
        assert_matches!(h.manager.accept(&b), Err(AdmissionRejected { live: 1, .. }));
        assert!(logs.has_event(Level::WARN, "rejected at capacity"));
    }
}
