//! Argument resolver chain and resolved argument values.
//!
//! Each bound callback parameter is assigned one [`ArgumentResolver`] at
//! registration time: the first in the [`ResolverChain`] whose `supports`
//! accepts it. At dispatch the resolver extracts the value from the
//! connection and the current [`EventPayload`].
//!
//! | Resolver | Parameter | Lifecycle | Value |
//! |----------|-----------|-----------|-------|
//! | `session` | `Session` | any | the connection's session handle |
//! | `headers` | `Headers` | `Open` | upgrade request headers |
//! | `path` | `Text` + `Path` marker | `Open` | upgrade request path |
//! | `subprotocol` | `OptionalText` + `Subprotocol` marker | `Open` | negotiated subprotocol |
//! | `text` | `Text` | `Message` | frame text |
//! | `binary` | `Bytes` | `Binary` | frame bytes |
//! | `event` | `Event` or converter-supported `Custom` | `Event` | idle event / converted value |
//! | `error` | `Error` | `Error` | transport fault |

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;

use crate::binding::{Lifecycle, ParamMarker, ParamType, ParameterDescriptor};
use crate::connection::{Connection, Session};
use crate::errors::{ArgumentError, DispatchError, TransportFault};
use crate::events::{Handshake, IdleEvent};
use crate::provider::EventConverter;

/// One resolved argument value.
pub enum Argument {
    /// Session handle.
    Session(Session),
    /// Upgrade request headers.
    Headers(HeaderMap),
    /// Text (frame payload or request path).
    Text(String),
    /// Text that may be absent (negotiated subprotocol).
    OptionalText(Option<String>),
    /// Frame bytes.
    Binary(Bytes),
    /// Idle event.
    Event(IdleEvent),
    /// Value produced by an event converter; taken at most once.
    Converted(Option<Box<dyn Any + Send>>),
    /// Transport fault.
    Error(Arc<TransportFault>),
}

impl Argument {
    /// Kind label used in mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Session(_) => "session",
            Self::Headers(_) => "headers",
            Self::Text(_) => "text",
            Self::OptionalText(_) => "optional text",
            Self::Binary(_) => "binary",
            Self::Event(_) => "event",
            Self::Converted(_) => "converted",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Debug for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(s) => f.debug_tuple("Session").field(&s.id()).finish(),
            Self::Headers(h) => f.debug_tuple("Headers").field(h).finish(),
            Self::Text(t) => f.debug_tuple("Text").field(t).finish(),
            Self::OptionalText(t) => f.debug_tuple("OptionalText").field(t).finish(),
            Self::Binary(b) => f.debug_tuple("Binary").field(&b.len()).finish(),
            Self::Event(e) => f.debug_tuple("Event").field(e).finish(),
            Self::Converted(v) => f.debug_tuple("Converted").field(&v.is_some()).finish(),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// Resolved arguments handed to a callback, in declaration order.
#[derive(Debug, Default)]
pub struct Arguments {
    values: Vec<Argument>,
}

macro_rules! accessor {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $ret:ty, $label:literal, |$v:ident| $map:expr) => {
        $(#[$doc])*
        pub fn $name(&self, index: usize) -> Result<$ret, ArgumentError> {
            match self.get(index)? {
                Argument::$variant($v) => Ok($map),
                other => Err(ArgumentError::Mismatch {
                    index,
                    expected: $label,
                    found: other.kind(),
                }),
            }
        }
    };
}

impl Arguments {
    /// Wrap resolved values.
    pub fn new(values: Vec<Argument>) -> Self {
        Self { values }
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw argument at `index`.
    pub fn get(&self, index: usize) -> Result<&Argument, ArgumentError> {
        self.values
            .get(index)
            .ok_or(ArgumentError::OutOfRange { index })
    }

    accessor!(
        /// Session handle at `index`.
        session, Session, &Session, "session", |s| s
    );
    accessor!(
        /// Header map at `index`.
        headers, Headers, &HeaderMap, "headers", |h| h
    );
    accessor!(
        /// Text at `index`.
        text, Text, &str, "text", |t| t.as_str()
    );
    accessor!(
        /// Optional text at `index`.
        optional_text, OptionalText, Option<&str>, "optional text", |t| t.as_deref()
    );
    accessor!(
        /// Bytes at `index`.
        bytes, Binary, &Bytes, "binary", |b| b
    );
    accessor!(
        /// Idle event at `index`.
        event, Event, IdleEvent, "event", |e| *e
    );
    accessor!(
        /// Transport fault at `index`.
        error, Error, &TransportFault, "error", |e| e.as_ref()
    );

    /// Take the converted value at `index` as `T`.
    ///
    /// The value is moved out; a second take fails.
    pub fn take_converted<T: Any>(&mut self, index: usize) -> Result<T, ArgumentError> {
        let conversion = ArgumentError::Conversion {
            index,
            expected: type_name::<T>(),
        };
        match self.values.get_mut(index) {
            None => Err(ArgumentError::OutOfRange { index }),
            Some(Argument::Converted(slot)) => {
                let boxed = slot.take().ok_or_else(|| conversion.clone())?;
                match boxed.downcast::<T>() {
                    Ok(value) => Ok(*value),
                    Err(original) => {
                        *slot = Some(original);
                        Err(conversion)
                    }
                }
            }
            Some(other) => Err(ArgumentError::Mismatch {
                index,
                expected: "converted",
                found: other.kind(),
            }),
        }
    }
}

/// What the current event carries, borrowed for the duration of dispatch.
#[derive(Debug, Clone, Copy)]
pub enum EventPayload<'a> {
    /// Nothing (close).
    None,
    /// Completed handshake (open).
    Handshake(&'a Handshake),
    /// Text frame.
    Text(&'a str),
    /// Binary frame.
    Binary(&'a Bytes),
    /// Idle event.
    Idle(IdleEvent),
    /// Transport fault.
    Fault(&'a Arc<TransportFault>),
}

/// Extracts one callback argument from a connection and event payload.
pub trait ArgumentResolver: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether this resolver can produce `parameter`.
    fn supports(&self, parameter: &ParameterDescriptor) -> bool;

    /// Produce the argument for `parameter`.
    fn resolve(
        &self,
        parameter: &ParameterDescriptor,
        connection: &Connection,
        payload: &EventPayload<'_>,
    ) -> Result<Argument, DispatchError>;
}

fn mismatch(parameter: &ParameterDescriptor, expected: &'static str) -> DispatchError {
    DispatchError::PayloadMismatch {
        parameter: parameter.name.clone(),
        expected,
    }
}

struct SessionResolver;

impl ArgumentResolver for SessionResolver {
    fn name(&self) -> &'static str {
        "session"
    }

    fn supports(&self, parameter: &ParameterDescriptor) -> bool {
        parameter.ty == ParamType::Session
    }

    fn resolve(
        &self,
        _parameter: &ParameterDescriptor,
        connection: &Connection,
        _payload: &EventPayload<'_>,
    ) -> Result<Argument, DispatchError> {
        connection
            .session()
            .cloned()
            .map(Argument::Session)
            .ok_or(DispatchError::MissingSession)
    }
}

struct HeaderResolver;

impl ArgumentResolver for HeaderResolver {
    fn name(&self) -> &'static str {
        "headers"
    }

    fn supports(&self, parameter: &ParameterDescriptor) -> bool {
        parameter.ty == ParamType::Headers && parameter.lifecycle == Lifecycle::Open
    }

    fn resolve(
        &self,
        parameter: &ParameterDescriptor,
        _connection: &Connection,
        payload: &EventPayload<'_>,
    ) -> Result<Argument, DispatchError> {
        match payload {
            EventPayload::Handshake(hs) => Ok(Argument::Headers(hs.headers.clone())),
            _ => Err(mismatch(parameter, "handshake")),
        }
    }
}

struct PathResolver;

impl ArgumentResolver for PathResolver {
    fn name(&self) -> &'static str {
        "path"
    }

    fn supports(&self, parameter: &ParameterDescriptor) -> bool {
        parameter.marker == Some(ParamMarker::Path)
            && parameter.ty == ParamType::Text
            && parameter.lifecycle == Lifecycle::Open
    }

    fn resolve(
        &self,
        parameter: &ParameterDescriptor,
        _connection: &Connection,
        payload: &EventPayload<'_>,
    ) -> Result<Argument, DispatchError> {
        match payload {
            EventPayload::Handshake(hs) => Ok(Argument::Text(hs.path.clone())),
            _ => Err(mismatch(parameter, "handshake")),
        }
    }
}

struct SubprotocolResolver;

impl ArgumentResolver for SubprotocolResolver {
    fn name(&self) -> &'static str {
        "subprotocol"
    }

    fn supports(&self, parameter: &ParameterDescriptor) -> bool {
        parameter.marker == Some(ParamMarker::Subprotocol)
            && parameter.ty == ParamType::OptionalText
            && parameter.lifecycle == Lifecycle::Open
    }

    fn resolve(
        &self,
        parameter: &ParameterDescriptor,
        _connection: &Connection,
        payload: &EventPayload<'_>,
    ) -> Result<Argument, DispatchError> {
        match payload {
            EventPayload::Handshake(hs) => Ok(Argument::OptionalText(hs.subprotocol.clone())),
            _ => Err(mismatch(parameter, "handshake")),
        }
    }
}

struct TextResolver;

impl ArgumentResolver for TextResolver {
    fn name(&self) -> &'static str {
        "text"
    }

    fn supports(&self, parameter: &ParameterDescriptor) -> bool {
        parameter.ty == ParamType::Text && parameter.lifecycle == Lifecycle::Message
    }

    fn resolve(
        &self,
        parameter: &ParameterDescriptor,
        _connection: &Connection,
        payload: &EventPayload<'_>,
    ) -> Result<Argument, DispatchError> {
        match payload {
            EventPayload::Text(text) => Ok(Argument::Text((*text).to_owned())),
            _ => Err(mismatch(parameter, "text")),
        }
    }
}

struct BinaryResolver;

impl ArgumentResolver for BinaryResolver {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn supports(&self, parameter: &ParameterDescriptor) -> bool {
        parameter.ty == ParamType::Bytes && parameter.lifecycle == Lifecycle::Binary
    }

    fn resolve(
        &self,
        parameter: &ParameterDescriptor,
        _connection: &Connection,
        payload: &EventPayload<'_>,
    ) -> Result<Argument, DispatchError> {
        match payload {
            EventPayload::Binary(data) => Ok(Argument::Binary(Bytes::clone(data))),
            _ => Err(mismatch(parameter, "binary")),
        }
    }
}

struct EventResolver {
    converter: Option<Arc<dyn EventConverter>>,
}

impl ArgumentResolver for EventResolver {
    fn name(&self) -> &'static str {
        "event"
    }

    fn supports(&self, parameter: &ParameterDescriptor) -> bool {
        if parameter.lifecycle != Lifecycle::Event {
            return false;
        }
        match &parameter.ty {
            ParamType::Event => true,
            ParamType::Custom(type_name) => self
                .converter
                .as_ref()
                .is_some_and(|c| c.supports(type_name)),
            _ => false,
        }
    }

    fn resolve(
        &self,
        parameter: &ParameterDescriptor,
        _connection: &Connection,
        payload: &EventPayload<'_>,
    ) -> Result<Argument, DispatchError> {
        let EventPayload::Idle(event) = payload else {
            return Err(mismatch(parameter, "idle event"));
        };
        match (&parameter.ty, &self.converter) {
            (ParamType::Custom(type_name), Some(converter)) => converter
                .convert(type_name, *event)
                .map(|value| Argument::Converted(Some(value)))
                .map_err(DispatchError::EventConversion),
            _ => Ok(Argument::Event(*event)),
        }
    }
}

struct ErrorResolver;

impl ArgumentResolver for ErrorResolver {
    fn name(&self) -> &'static str {
        "error"
    }

    fn supports(&self, parameter: &ParameterDescriptor) -> bool {
        parameter.ty == ParamType::Error && parameter.lifecycle == Lifecycle::Error
    }

    fn resolve(
        &self,
        parameter: &ParameterDescriptor,
        _connection: &Connection,
        payload: &EventPayload<'_>,
    ) -> Result<Argument, DispatchError> {
        match payload {
            EventPayload::Fault(fault) => Ok(Argument::Error(Arc::clone(fault))),
            _ => Err(mismatch(parameter, "fault")),
        }
    }
}

/// Ordered list of resolvers; the first that supports a parameter wins.
#[derive(Clone)]
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn ArgumentResolver>>,
}

impl ResolverChain {
    /// Empty chain.
    pub fn empty() -> Self {
        Self {
            resolvers: Vec::new(),
        }
    }

    /// The standard chain: session, headers, path, subprotocol, text,
    /// binary, event, error.
    pub fn standard(converter: Option<Arc<dyn EventConverter>>) -> Self {
        Self {
            resolvers: vec![
                Arc::new(SessionResolver),
                Arc::new(HeaderResolver),
                Arc::new(PathResolver),
                Arc::new(SubprotocolResolver),
                Arc::new(TextResolver),
                Arc::new(BinaryResolver),
                Arc::new(EventResolver { converter }),
                Arc::new(ErrorResolver),
            ],
        }
    }

    /// Append a resolver after the existing ones.
    #[must_use]
    pub fn with(mut self, resolver: Arc<dyn ArgumentResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// First resolver supporting `parameter`.
    pub fn find(&self, parameter: &ParameterDescriptor) -> Option<Arc<dyn ArgumentResolver>> {
        self.resolvers
            .iter()
            .find(|r| r.supports(parameter))
            .map(Arc::clone)
    }

    /// Resolver names, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }
}

impl fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
