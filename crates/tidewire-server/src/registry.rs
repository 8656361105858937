//! Endpoint registry: declared endpoint types + descriptors → servers.
//!
//! Every registration binds the endpoint type and reserves its address up
//! front, so a bad declaration or a duplicate `host:port` fails before any
//! server opens.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tidewire_core::settings::EndpointSettings;
use tidewire_core::{EndpointClass, EndpointDescriptor, InstanceProvider, RegistrationError};
use tracing::{error, info};

use crate::error::Result;
use crate::server::EndpointServer;

/// Type-erased view of a running or runnable endpoint server.
#[async_trait]
pub trait ManagedEndpoint: Send + Sync {
    /// Endpoint type name.
    fn name(&self) -> &str;
    /// Configuration of the server.
    fn descriptor(&self) -> &EndpointDescriptor;
    /// Bind and start accepting.
    fn open(&self) -> Result<SocketAddr>;
    /// Bound address, once open.
    fn local_addr(&self) -> Option<SocketAddr>;
    /// Live connection count.
    fn live_connections(&self) -> usize;
    /// Graceful shutdown; `false` if the grace period ran out.
    async fn shutdown(&self, grace: Duration) -> bool;
    /// Immediate close.
    fn close(&self);
}

#[async_trait]
impl<H: Send + Sync + 'static> ManagedEndpoint for EndpointServer<H> {
    fn name(&self) -> &str {
        EndpointServer::name(self)
    }

    fn descriptor(&self) -> &EndpointDescriptor {
        EndpointServer::descriptor(self)
    }

    fn open(&self) -> Result<SocketAddr> {
        EndpointServer::open(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        EndpointServer::local_addr(self)
    }

    fn live_connections(&self) -> usize {
        self.manager().live_connections()
    }

    async fn shutdown(&self, grace: Duration) -> bool {
        EndpointServer::shutdown(self, grace).await
    }

    fn close(&self) {
        EndpointServer::close(self);
    }
}

/// All endpoint servers of one process.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: Vec<Box<dyn ManagedEndpoint>>,
    addresses: HashMap<SocketAddr, String>,
}

impl EndpointRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `class` and register a server for it on `descriptor`'s address.
    ///
    /// Fails without registering anything if the address does not resolve,
    /// is already claimed by another endpoint, or the type does not bind.
    /// Port `0` never collides.
    pub fn register<H: Send + Sync + 'static>(
        &mut self,
        class: &EndpointClass<H>,
        descriptor: EndpointDescriptor,
        provider: Arc<dyn InstanceProvider<H>>,
    ) -> Result<()> {
        let address = descriptor
            .socket_addr()
            .map_err(|source| RegistrationError::InvalidAddress {
                address: descriptor.bind_address(),
                source,
            })?;
        if address.port() != 0 {
            if let Some(existing) = self.addresses.get(&address) {
                return Err(RegistrationError::DuplicateAddress {
                    address,
                    existing: existing.clone(),
                }
                .into());
            }
        }

        let server = EndpointServer::new(class, descriptor, provider)?;
        if address.port() != 0 {
            let _ = self.addresses.insert(address, server.name().to_owned());
        }
        info!(endpoint = %server.name(), %address, "endpoint registered");
        self.endpoints.push(Box::new(server));
        Ok(())
    }

    /// Register `class` using the descriptor named `name` in `settings`.
    ///
    /// An endpoint missing from the settings uses the default descriptor.
    pub fn register_from_settings<H: Send + Sync + 'static>(
        &mut self,
        settings: &EndpointSettings,
        name: &str,
        class: &EndpointClass<H>,
        provider: Arc<dyn InstanceProvider<H>>,
    ) -> Result<()> {
        let descriptor = settings.descriptor(name).cloned().unwrap_or_default();
        self.register(class, descriptor, provider)
    }

    /// Open every registered server.
    ///
    /// A failure is logged and reported in its entry; the other servers
    /// still open.
    pub fn open_all(&self) -> Vec<(String, Result<SocketAddr>)> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                let result = endpoint.open();
                if let Err(err) = &result {
                    error!(endpoint = %endpoint.name(), error = %err, "endpoint failed to open");
                }
                (endpoint.name().to_owned(), result)
            })
            .collect()
    }

    /// Gracefully shut down every server concurrently.
    ///
    /// Returns `true` if all of them drained within `grace`.
    pub async fn shutdown_all(&self, grace: Duration) -> bool {
        join_all(self.endpoints.iter().map(|e| e.shutdown(grace)))
            .await
            .into_iter()
            .all(|drained| drained)
    }

    /// Close every server immediately.
    pub fn close_all(&self) {
        for endpoint in &self.endpoints {
            endpoint.close();
        }
    }

    /// Registered servers, in registration order.
    pub fn endpoints(&self) -> &[Box<dyn ManagedEndpoint>] {
        &self.endpoints
    }

    /// Registered endpoint names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.name()).collect()
    }

    /// First server registered under `name`.
    pub fn get(&self, name: &str) -> Option<&dyn ManagedEndpoint> {
        self.endpoints
            .iter()
            .find(|e| e.name() == name)
            .map(|e| &**e)
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.names())
            .field("addresses", &self.addresses)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
