//! Turns an [`EndpointClass`] into an immutable callback table.

use std::fmt;
use std::ptr;
use std::sync::Arc;

use tracing::debug;

use super::declare::{EndpointClass, Lifecycle, MethodDecl, ParameterDescriptor, Visibility};
use crate::connection::Connection;
use crate::errors::{DispatchError, RegistrationError};
use crate::resolver::{ArgumentResolver, Arguments, EventPayload, ResolverChain};

struct PlannedArgument {
    parameter: ParameterDescriptor,
    resolver: Arc<dyn ArgumentResolver>,
}

/// A lifecycle method bound to its argument plan.
pub struct BoundCallback<H> {
    method: Arc<MethodDecl<H>>,
    declared_in: String,
    plan: Vec<PlannedArgument>,
}

impl<H> BoundCallback<H> {
    /// Bound method name.
    pub fn method_name(&self) -> &str {
        self.method.name()
    }

    /// Type in the hierarchy that declared the bound method.
    pub fn declared_in(&self) -> &str {
        &self.declared_in
    }

    /// Parameter descriptors in declaration order.
    pub fn parameters(&self) -> impl Iterator<Item = &ParameterDescriptor> {
        self.plan.iter().map(|step| &step.parameter)
    }

    /// Resolver chosen for each parameter, in declaration order.
    pub fn resolver_names(&self) -> Vec<&'static str> {
        self.plan.iter().map(|step| step.resolver.name()).collect()
    }

    /// Resolve every argument, then call the method on `instance`.
    ///
    /// Resolution stops at the first failing argument; the method is not
    /// called in that case.
    pub fn invoke(
        &self,
        instance: &H,
        connection: &Connection,
        payload: &EventPayload<'_>,
    ) -> Result<(), DispatchError> {
        let mut values = Vec::with_capacity(self.plan.len());
        for step in &self.plan {
            values.push(step.resolver.resolve(&step.parameter, connection, payload)?);
        }
        let mut args = Arguments::new(values);
        self.method.invoke(instance, &mut args)?;
        Ok(())
    }
}

impl<H> fmt::Debug for BoundCallback<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundCallback")
            .field("method", &self.method.name())
            .field("declared_in", &self.declared_in)
            .field("resolvers", &self.resolver_names())
            .finish()
    }
}

/// Immutable lifecycle → callback table for one endpoint type.
pub struct MethodBinding<H> {
    endpoint: String,
    slots: [Option<BoundCallback<H>>; 6],
}

impl<H> MethodBinding<H> {
    /// Bind `class` against `chain`.
    ///
    /// Walks the hierarchy from the most-derived type to the root. For each
    /// marker the most-derived tagged method wins; an ancestor method may
    /// share the marker only if it is override-equivalent to the winner. A
    /// winner inherited from an ancestor is dropped when the most-derived
    /// type overrides it without the marker. Every parameter of every bound
    /// method must be supported by some resolver in `chain`.
    pub fn resolve(
        class: &EndpointClass<H>,
        chain: &ResolverChain,
    ) -> Result<Self, RegistrationError> {
        let endpoint = class.name().to_owned();
        let mut winners: [Option<(Arc<MethodDecl<H>>, &EndpointClass<H>)>; 6] = Default::default();

        for (depth, current) in class.hierarchy().enumerate() {
            for method in current.methods() {
                let Some(lifecycle) = method.lifecycle() else {
                    continue;
                };
                if method.visibility() != Visibility::Public {
                    return Err(RegistrationError::NotPublic {
                        endpoint,
                        method: method.name().to_owned(),
                    });
                }
                let slot = &mut winners[lifecycle.index()];
                match slot {
                    None => *slot = Some((Arc::clone(method), current)),
                    Some((winner, _)) => {
                        if depth == 0 || !winner.is_override_of(method) {
                            return Err(RegistrationError::DuplicateAnnotation {
                                endpoint,
                                lifecycle,
                                method: method.name().to_owned(),
                            });
                        }
                    }
                }
            }
        }

        for lifecycle in Lifecycle::ALL {
            let slot = &mut winners[lifecycle.index()];
            let suppressed = slot.as_ref().is_some_and(|(winner, declared_in)| {
                !ptr::eq(*declared_in, class)
                    && class
                        .methods()
                        .iter()
                        .any(|m| m.is_override_of(winner) && m.lifecycle() != Some(lifecycle))
            });
            if suppressed {
                debug!(
                    endpoint = %endpoint,
                    lifecycle = %lifecycle,
                    "inherited callback overridden without marker"
                );
                *slot = None;
            }
        }

        let mut slots: [Option<BoundCallback<H>>; 6] = std::array::from_fn(|_| None);
        for lifecycle in Lifecycle::ALL {
            let Some((method, declared_in)) = winners[lifecycle.index()].take() else {
                continue;
            };
            let mut plan = Vec::with_capacity(method.params().len());
            for (index, param) in method.params().iter().enumerate() {
                let parameter = ParameterDescriptor {
                    method: method.name().to_owned(),
                    lifecycle,
                    index,
                    name: param.name().to_owned(),
                    ty: param.ty().clone(),
                    marker: param.marker(),
                };
                let resolver =
                    chain
                        .find(&parameter)
                        .ok_or_else(|| RegistrationError::UnresolvedParameter {
                            endpoint: endpoint.clone(),
                            method: parameter.method.clone(),
                            parameter: parameter.name.clone(),
                            index,
                        })?;
                plan.push(PlannedArgument {
                    parameter,
                    resolver,
                });
            }
            debug!(
                endpoint = %endpoint,
                lifecycle = %lifecycle,
                method = method.name(),
                declared_in = declared_in.name(),
                params = plan.len(),
                "bound lifecycle callback"
            );
            slots[lifecycle.index()] = Some(BoundCallback {
                declared_in: declared_in.name().to_owned(),
                method,
                plan,
            });
        }

        Ok(Self { endpoint, slots })
    }

    /// Endpoint type name.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Callback bound to `lifecycle`, if any.
    pub fn callback(&self, lifecycle: Lifecycle) -> Option<&BoundCallback<H>> {
        self.slots[lifecycle.index()].as_ref()
    }

    /// Whether a callback is bound to `lifecycle`.
    pub fn is_bound(&self, lifecycle: Lifecycle) -> bool {
        self.callback(lifecycle).is_some()
    }
}

impl<H> fmt::Debug for MethodBinding<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for lifecycle in Lifecycle::ALL {
            if let Some(cb) = self.callback(lifecycle) {
                let _ = map.entry(&lifecycle, &cb.method_name());
            }
        }
        map.finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
