//! `EndpointServer`: one bound address, its acceptor, and its worker pool.
//!
//! Each server runs on a dedicated multi-thread runtime sized by the
//! descriptor's worker count. One acceptor task feeds accepted sockets to
//! per-connection tasks; the lifecycle manager's handshake sweep runs on the
//! same runtime and is stopped when the server closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tidewire_core::metrics::WS_ACCEPT_ERRORS_TOTAL;
use tidewire_core::{
    ConnectionManager, EndpointClass, EndpointDescriptor, InstanceProvider, MethodBinding,
    ResolverChain,
};
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::{self, TransportConfig};

/// Pending-accept backlog of the listening socket.
const LISTEN_BACKLOG: u32 = 1024;

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

struct Running {
    runtime: Runtime,
    coordinator: ShutdownCoordinator,
    local_addr: SocketAddr,
}

/// A WebSocket server for one endpoint type on one address.
pub struct EndpointServer<H> {
    descriptor: EndpointDescriptor,
    manager: Arc<ConnectionManager<H>>,
    transport: Arc<TransportConfig>,
    running: Mutex<Option<Running>>,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl<H: Send + Sync + 'static> EndpointServer<H> {
    /// Bind `class` and build an unopened server for `descriptor`.
    ///
    /// Fails if the descriptor is invalid or the endpoint type does not bind.
    pub fn new(
        class: &EndpointClass<H>,
        descriptor: EndpointDescriptor,
        provider: Arc<dyn InstanceProvider<H>>,
    ) -> Result<Self> {
        descriptor.validate()?;
        let chain = ResolverChain::standard(provider.event_converter());
        let binding = Arc::new(MethodBinding::resolve(class, &chain)?);
        let manager = Arc::new(ConnectionManager::new(
            binding,
            provider,
            descriptor.max_connections,
        ));
        Ok(Self {
            transport: Arc::new(TransportConfig::from_descriptor(&descriptor)),
            descriptor,
            manager,
            running: Mutex::new(None),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Endpoint type name.
    pub fn name(&self) -> &str {
        self.manager.endpoint()
    }

    /// The server's configuration.
    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    /// The connection lifecycle manager.
    pub fn manager(&self) -> &Arc<ConnectionManager<H>> {
        &self.manager
    }

    /// Address actually bound, once open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Whether the server is accepting connections.
    pub fn is_open(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Whether shutdown has begun.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Whether shutdown has finished.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Start the worker pool, bind the listener, and begin accepting.
    ///
    /// Returns the bound address (useful with port `0`).
    pub fn open(&self) -> Result<SocketAddr> {
        if self.is_closing() {
            return Err(ServerError::Closed(self.name().to_owned()));
        }
        let mut slot = self.running.lock();
        if slot.is_some() {
            return Err(ServerError::AlreadyOpen(self.name().to_owned()));
        }

        let workers = self.descriptor.worker_threads();
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name(format!("tidewire-{}", self.name()))
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;

        let listener = match self.bind(&runtime) {
            Ok(listener) => listener,
            Err(err) => {
                runtime.shutdown_background();
                return Err(err);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                runtime.shutdown_background();
                return Err(self.bind_error(source));
            }
        };

        let coordinator = ShutdownCoordinator::new();
        self.manager.start_sweep(runtime.handle());
        let _ = coordinator.tracker().spawn_on(
            accept_loop(
                listener,
                Arc::clone(&self.manager),
                Arc::clone(&self.transport),
                coordinator.clone(),
            ),
            runtime.handle(),
        );

        info!(
            endpoint = %self.name(),
            address = %local_addr,
            path = %self.descriptor.path,
            workers,
            max_connections = self.descriptor.max_connections,
            max_payload_bytes = self.descriptor.max_payload_bytes,
            heartbeat_ms = self.descriptor.heartbeat_interval_ms,
            "endpoint server open"
        );

        *slot = Some(Running {
            runtime,
            coordinator,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop accepting, close every connection, and wait up to `grace` for
    /// their tasks (and Close callbacks) to finish before releasing the
    /// worker pool. Idempotent.
    ///
    /// Returns `false` if some connection tasks were still running when the
    /// grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let Some(running) = self.begin_close() else {
            return true;
        };
        self.manager.stop_sweep();
        let closing = self.manager.close_all();
        debug!(endpoint = %self.name(), connections = closing, "closing connections");

        let drained = running.coordinator.graceful_shutdown(Some(grace)).await;
        self.finish_close(running);
        drained
    }

    /// Close immediately without waiting for connection tasks. Idempotent.
    ///
    /// Close callbacks of connections still open at this point may not run.
    pub fn close(&self) {
        let Some(running) = self.begin_close() else {
            return;
        };
        self.manager.stop_sweep();
        running.coordinator.shutdown();
        let _ = self.manager.close_all();
        self.finish_close(running);
    }

    fn begin_close(&self) -> Option<Running> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return None;
        }
        let running = self.running.lock().take();
        if running.is_none() {
            self.closed.store(true, Ordering::Release);
        }
        running
    }

    fn finish_close(&self, running: Running) {
        let cleared = self.manager.clear();
        running.runtime.shutdown_background();
        self.closed.store(true, Ordering::Release);
        info!(
            endpoint = %self.name(),
            address = %running.local_addr,
            cleared,
            "endpoint server closed"
        );
    }

    fn bind(&self, runtime: &Runtime) -> Result<TcpListener> {
        let addr = self
            .descriptor
            .socket_addr()
            .map_err(|source| self.bind_error(source))?;
        let _guard = runtime.enter();
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|source| self.bind_error(source))?;
        socket
            .set_reuseaddr(true)
            .map_err(|source| self.bind_error(source))?;
        socket.bind(addr).map_err(|source| self.bind_error(source))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|source| self.bind_error(source))
    }

    fn bind_error(&self, source: std::io::Error) -> ServerError {
        ServerError::Bind {
            address: self.descriptor.bind_address(),
            source,
        }
    }
}

impl<H> Drop for EndpointServer<H> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.coordinator.shutdown();
            running.runtime.shutdown_background();
        }
    }
}

impl<H: Send + Sync + 'static> std::fmt::Debug for EndpointServer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointServer")
            .field("endpoint", &self.manager.endpoint())
            .field("address", &self.descriptor.bind_address())
            .field("closing", &self.closing.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

async fn accept_loop<H: Send + Sync + 'static>(
    listener: TcpListener,
    manager: Arc<ConnectionManager<H>>,
    config: Arc<TransportConfig>,
    coordinator: ShutdownCoordinator,
) {
    let shutdown = coordinator.token();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let _ = coordinator.tracker().spawn(transport::serve_connection(
                        stream,
                        remote,
                        Arc::clone(&manager),
                        Arc::clone(&config),
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    counter!(WS_ACCEPT_ERRORS_TOTAL, "endpoint" => manager.endpoint().to_owned())
                        .increment(1);
                    warn!(endpoint = %manager.endpoint(), error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }
    debug!(endpoint = %manager.endpoint(), "acceptor stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
