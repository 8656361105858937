//! Endpoint declarations and the method binding resolver.
//!
//! An endpoint type is declared as an [`EndpointClass`]: a named list of
//! [`MethodDecl`]s with an optional parent class. Methods may carry one
//! [`Lifecycle`] marker. [`MethodBinding::resolve`] walks the class
//! hierarchy once and produces the immutable callback table.

mod declare;
mod resolve;

pub use declare::{
    EndpointClass, Lifecycle, MethodDecl, ParamDecl, ParamMarker, ParamType, ParameterDescriptor,
    Visibility,
};
pub use resolve::{BoundCallback, MethodBinding};
