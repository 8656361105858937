//! # tidewire-server
//!
//! WebSocket endpoint servers on `tokio` + `tokio-tungstenite`.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `server` | `EndpointServer`: listener, acceptor, worker pool, shutdown |
//! | `registry` | `EndpointRegistry`: duplicate-address checks, open/close all |
//! | `shutdown` | Cancellation token + task tracker coordination |
//! | `error` | `ServerError` |
//! | `transport` | Per-connection upgrade and frame loop (internal) |
//! | `idle` | Reader / writer / all idle timers (internal) |
//!
//! ## Connection pipeline
//!
//! idle timers → payload-bounded message aggregation → upgrade on the
//! configured path → `ConnectionManager`.

#![deny(unsafe_code)]

mod idle;
mod transport;

pub mod error;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use error::{Result, ServerError};
pub use registry::{EndpointRegistry, ManagedEndpoint};
pub use server::EndpointServer;
pub use shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, ShutdownCoordinator};
pub use transport::OUTBOUND_CAPACITY;
