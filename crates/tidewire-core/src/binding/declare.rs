//! Declarative description of an endpoint type.

use std::fmt;
use std::sync::Arc;

use crate::errors::CallbackResult;
use crate::resolver::Arguments;

/// Lifecycle marker a method can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Handshake completed.
    Open,
    /// Text frame received.
    Message,
    /// Binary frame received.
    Binary,
    /// Idle (or other generic) event raised.
    Event,
    /// Connection closed after a completed handshake.
    Close,
    /// Transport fault after a completed handshake.
    Error,
}

impl Lifecycle {
    /// Every marker, in binding-table order.
    pub const ALL: [Self; 6] = [
        Self::Open,
        Self::Message,
        Self::Binary,
        Self::Event,
        Self::Close,
        Self::Error,
    ];

    /// Slot index in the binding table.
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Open => 0,
            Self::Message => 1,
            Self::Binary => 2,
            Self::Event => 3,
            Self::Close => 4,
            Self::Error => 5,
        }
    }

    /// Short label for logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Message => "message",
            Self::Binary => "binary",
            Self::Event => "event",
            Self::Close => "close",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "OnOpen",
            Self::Message => "OnMessage",
            Self::Binary => "OnBinary",
            Self::Event => "OnEvent",
            Self::Close => "OnClose",
            Self::Error => "OnError",
        };
        f.write_str(s)
    }
}

/// Whether the dispatcher may invoke a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    /// Invocable by the dispatcher.
    #[default]
    Public,
    /// Internal to the handler; tagging it is a registration error.
    Private,
}

/// Declared type of a callback parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// The connection's session handle.
    Session,
    /// Upgrade request headers.
    Headers,
    /// UTF-8 text.
    Text,
    /// Text that may be absent.
    OptionalText,
    /// Raw bytes.
    Bytes,
    /// The idle event itself.
    Event,
    /// The transport fault.
    Error,
    /// An application type, produced by an event converter.
    Custom(String),
}

/// Parameter-level marker that selects a resolver independent of type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamMarker {
    /// The request path of the upgrade.
    Path,
    /// The negotiated subprotocol.
    Subprotocol,
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDecl {
    name: String,
    ty: ParamType,
    marker: Option<ParamMarker>,
}

impl ParamDecl {
    /// Parameter with a name and declared type.
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            marker: None,
        }
    }

    /// Attach a parameter marker.
    #[must_use]
    pub fn marked(mut self, marker: ParamMarker) -> Self {
        self.marker = Some(marker);
        self
    }

    /// Session handle parameter.
    pub fn session(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Session)
    }

    /// Header map parameter.
    pub fn headers(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Headers)
    }

    /// Text parameter marked as the request path.
    pub fn path(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Text).marked(ParamMarker::Path)
    }

    /// Optional text parameter marked as the negotiated subprotocol.
    pub fn subprotocol(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::OptionalText).marked(ParamMarker::Subprotocol)
    }

    /// Text parameter.
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Text)
    }

    /// Raw bytes parameter.
    pub fn bytes(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Bytes)
    }

    /// Idle event parameter.
    pub fn event(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Event)
    }

    /// Transport fault parameter.
    pub fn error(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Error)
    }

    /// Application-typed parameter.
    pub fn custom(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Custom(type_name.into()))
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type.
    pub fn ty(&self) -> &ParamType {
        &self.ty
    }

    /// Marker, if any.
    pub fn marker(&self) -> Option<ParamMarker> {
        self.marker
    }
}

/// What a resolver sees when deciding whether it supports a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDescriptor {
    /// Declaring method name.
    pub method: String,
    /// Marker of the declaring method.
    pub lifecycle: Lifecycle,
    /// Zero-based position.
    pub index: usize,
    /// Parameter name.
    pub name: String,
    /// Declared type.
    pub ty: ParamType,
    /// Parameter marker, if any.
    pub marker: Option<ParamMarker>,
}

type Invoker<H> = Arc<dyn Fn(&H, &mut Arguments) -> CallbackResult + Send + Sync>;

/// One method of an endpoint type.
pub struct MethodDecl<H> {
    name: String,
    returns: String,
    params: Vec<ParamDecl>,
    lifecycle: Option<Lifecycle>,
    visibility: Visibility,
    invoker: Invoker<H>,
}

impl<H> MethodDecl<H> {
    /// Declare a method whose body is `invoker`.
    pub fn new<F>(name: impl Into<String>, invoker: F) -> Self
    where
        F: Fn(&H, &mut Arguments) -> CallbackResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            returns: "()".into(),
            params: Vec::new(),
            lifecycle: None,
            visibility: Visibility::Public,
            invoker: Arc::new(invoker),
        }
    }

    /// Tag the method with a lifecycle marker.
    #[must_use]
    pub fn on(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Append a parameter.
    #[must_use]
    pub fn param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    /// Declared return type name (default `"()"`).
    #[must_use]
    pub fn returns(mut self, type_name: impl Into<String>) -> Self {
        self.returns = type_name.into();
        self
    }

    /// Mark the method as not invocable by the dispatcher.
    #[must_use]
    pub fn private(mut self) -> Self {
        self.visibility = Visibility::Private;
        self
    }

    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared return type name.
    pub fn return_type(&self) -> &str {
        &self.returns
    }

    /// Declared parameters.
    pub fn params(&self) -> &[ParamDecl] {
        &self.params
    }

    /// Lifecycle marker, if tagged.
    pub fn lifecycle(&self) -> Option<Lifecycle> {
        self.lifecycle
    }

    /// Visibility.
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    /// Same name, same return type, same parameter types.
    pub fn is_override_of(&self, other: &Self) -> bool {
        self.name == other.name
            && self.returns == other.returns
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.ty == b.ty)
    }

    pub(crate) fn invoke(&self, instance: &H, args: &mut Arguments) -> CallbackResult {
        (self.invoker)(instance, args)
    }
}

impl<H> fmt::Debug for MethodDecl<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDecl")
            .field("name", &self.name)
            .field("returns", &self.returns)
            .field("params", &self.params)
            .field("lifecycle", &self.lifecycle)
            .field("visibility", &self.visibility)
            .finish_non_exhaustive()
    }
}

/// A declared endpoint type: its methods plus an optional parent type.
pub struct EndpointClass<H> {
    name: String,
    parent: Option<Arc<EndpointClass<H>>>,
    methods: Vec<Arc<MethodDecl<H>>>,
}

impl<H> EndpointClass<H> {
    /// Declare a root endpoint type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            methods: Vec::new(),
        }
    }

    /// Derive from `parent`.
    #[must_use]
    pub fn extends(mut self, parent: Arc<EndpointClass<H>>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Declare a method on this type.
    #[must_use]
    pub fn method(mut self, method: MethodDecl<H>) -> Self {
        self.methods.push(Arc::new(method));
        self
    }

    /// Type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent type, if any.
    pub fn parent(&self) -> Option<&Arc<EndpointClass<H>>> {
        self.parent.as_ref()
    }

    /// Methods declared directly on this type.
    pub fn methods(&self) -> &[Arc<MethodDecl<H>>] {
        &self.methods
    }

    /// This type followed by its ancestors, most-derived first.
    pub fn hierarchy(&self) -> impl Iterator<Item = &EndpointClass<H>> {
        std::iter::successors(Some(self), |class| class.parent.as_deref())
    }
}

impl<H> fmt::Debug for EndpointClass<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointClass")
            .field("name", &self.name)
            .field("parent", &self.parent.as_ref().map(|p| p.name.as_str()))
            .field("methods", &self.methods)
            .finish()
    }
}
