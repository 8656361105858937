//! Seams through which the hosting process supplies handler instances.

use std::any::Any;
use std::sync::Arc;

use crate::errors::ProviderError;
use crate::events::IdleEvent;

/// Supplies handler instances for one endpoint type.
///
/// The manager calls [`create`](Self::create) at most once per connection,
/// when its handshake completes.
pub trait InstanceProvider<H>: Send + Sync {
    /// Produce a handler instance.
    fn create(&self) -> Result<Arc<H>, ProviderError>;

    /// Optional conversion of idle events into custom parameter types.
    fn event_converter(&self) -> Option<Arc<dyn EventConverter>> {
        None
    }
}

impl<H, F> InstanceProvider<H> for F
where
    F: Fn() -> Result<Arc<H>, ProviderError> + Send + Sync,
{
    fn create(&self) -> Result<Arc<H>, ProviderError> {
        self()
    }
}

/// Converts idle events into types declared by `Event` callback parameters.
#[cfg_attr(test, mockall::automock)]
pub trait EventConverter: Send + Sync {
    /// Whether this converter can produce the named type.
    fn supports(&self, type_name: &str) -> bool;

    /// Convert an idle event into the named type.
    fn convert(&self, type_name: &str, event: IdleEvent)
    -> Result<Box<dyn Any + Send>, ProviderError>;
}
