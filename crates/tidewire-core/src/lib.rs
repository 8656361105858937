//! # tidewire-core
//!
//! Endpoint binding and connection-lifecycle dispatch engine.
//!
//! Application code declares an endpoint type as a set of methods, some of
//! them tagged with a [`Lifecycle`] marker. At registration the
//! [`MethodBinding`] resolver turns that declaration into an immutable
//! callback table with a fixed argument plan per callback. At runtime the
//! [`ConnectionManager`] drives each connection through its state machine and
//! dispatches transport events to the bound callbacks.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `descriptor` | Per-endpoint configuration (`EndpointDescriptor`) |
//! | `settings` | JSON settings file loading, deep merge, env overrides |
//! | `ids` | Branded connection / session IDs |
//! | `errors` | Registration, dispatch, provider, and transport error types |
//! | `binding` | Endpoint declarations and the method binding resolver |
//! | `resolver` | Argument resolver chain and resolved argument values |
//! | `events` | Transport-facing events (handshake, idle, fault) |
//! | `connection` | Connection state, attributes, and the session handle |
//! | `lifecycle` | Connection lifecycle manager, registry, handshake sweep |
//! | `provider` | Handler instance provider and event conversion seams |
//! | `logging` | `tracing` subscriber setup and log capture for tests |
//! | `metrics` | Metric names |
//!
//! ## Data Flow
//!
//! transport event → `ConnectionManager` → `MethodBinding` callback →
//! `ResolverChain` plan → handler instance.

#![deny(unsafe_code)]

pub mod binding;
pub mod connection;
pub mod descriptor;
pub mod errors;
pub mod events;
pub mod ids;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod provider;
pub mod resolver;
pub mod settings;

pub use binding::{
    BoundCallback, EndpointClass, Lifecycle, MethodBinding, MethodDecl, ParamDecl, ParamMarker,
    ParamType, ParameterDescriptor, Visibility,
};
pub use connection::{Connection, ConnectionState, OutboundFrame, Session};
pub use descriptor::EndpointDescriptor;
pub use errors::{
    AdmissionRejected, ArgumentError, CallbackError, CallbackResult, DispatchError, FaultKind,
    ProviderError, RegistrationError, TransportFault,
};
pub use events::{Handshake, IdleEvent, IdleKind, TransportEvent};
pub use ids::{ConnectionId, SessionId};
pub use lifecycle::{ConnectionManager, ConnectionRegistry, HANDSHAKE_TIMEOUT, SWEEP_INTERVAL};
pub use provider::{EventConverter, InstanceProvider};
pub use resolver::{Argument, ArgumentResolver, Arguments, EventPayload, ResolverChain};
