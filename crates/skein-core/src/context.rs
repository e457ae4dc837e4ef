// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Capability map carried by every fiber.
//!
//! Services are keyed by their Rust type. A forked fiber gets a copy of
//! its parent's map; overrides made with `Effect::provide_service` last
//! only for the wrapped effect.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::effect::{Data, Effect};
use crate::error::ServiceNotFound;
use crate::instr::Instr;

#[derive(Clone)]
struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    name: &'static str,
}

#[derive(Clone, Default)]
pub struct Context {
    services: IndexMap<TypeId, Entry>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with<S: Send + Sync + 'static>(mut self, service: S) -> Self {
        self.insert(service);
        self
    }

    /// Insert or replace the service of type `S`.
    pub fn insert<S: Send + Sync + 'static>(&mut self, service: S) {
        self.services.insert(
            TypeId::of::<S>(),
            Entry {
                value: Arc::new(service),
                name: std::any::type_name::<S>(),
            },
        );
    }

    pub fn get<S: Clone + 'static>(&self) -> Option<S> {
        self.get_ref::<S>().cloned()
    }

    pub fn get_ref<S: 'static>(&self) -> Option<&S> {
        self.services
            .get(&TypeId::of::<S>())
            .and_then(|e| e.value.downcast_ref::<S>())
    }

    pub fn contains<S: 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<S>())
    }

    pub fn remove<S: 'static>(&mut self) -> bool {
        self.services.shift_remove(&TypeId::of::<S>()).is_some()
    }

    /// Services of `other` win on conflict.
    pub fn merge(mut self, other: &Context) -> Self {
        for (k, v) in &other.services {
            self.services.insert(*k, v.clone());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Type names of the services present, in insertion order.
    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.values().map(|e| e.name).collect()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.service_names()).finish()
    }
}

impl<S: Clone + Send + 'static, E: Data> Effect<S, E> {
    /// Look up a service. Dies with `ServiceNotFound` when it is missing.
    pub fn service() -> Self {
        Effect::from_fn(|| {
            Instr::with_fiber(|st| match st.context.get::<S>() {
                Some(s) => Instr::succeed(s),
                None => Instr::die(ServiceNotFound {
                    service: std::any::type_name::<S>(),
                }),
            })
        })
    }
}

impl<S: Clone + Send + 'static, E: Data> Effect<Option<S>, E> {
    pub fn service_option() -> Self {
        Effect::from_fn(|| Instr::with_fiber(|st| Instr::succeed(st.context.get::<S>())))
    }
}

impl<E: Data> Effect<Context, E> {
    /// The fiber's whole capability map.
    pub fn context() -> Self {
        Effect::from_fn(|| Instr::with_fiber(|st| Instr::succeed(st.context.clone())))
    }
}

impl<A: Send + 'static, E: Data> Effect<A, E> {
    /// Run this effect with the context transformed by `f`, restoring the
    /// previous context afterwards on every exit path.
    pub fn with_context(&self, f: impl Fn(Context) -> Context + Send + Sync + 'static) -> Self {
        let inner = self.clone();
        let f = Arc::new(f);
        Effect::from_fn(move || {
            let inner = inner.instr();
            let f = f.clone();
            Instr::with_fiber(move |st| {
                let previous = st.context.clone();
                st.context = f(previous.clone());
                inner.restoring(move |st| st.context = previous)
            })
        })
    }

    /// Run this effect with `service` replacing any service of the same type.
    pub fn provide_service<S: Send + Sync + Clone + 'static>(&self, service: S) -> Self {
        self.with_context(move |ctx| ctx.with(service.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Port(u16);

    #[test]
    fn insert_replace_remove() {
        let mut ctx = Context::new().with(Port(80)).with("name");
        assert_eq!(ctx.get::<Port>(), Some(Port(80)));
        ctx.insert(Port(8080));
        assert_eq!(ctx.get::<Port>(), Some(Port(8080)));
        assert_eq!(ctx.len(), 2);
        assert!(ctx.remove::<Port>());
        assert!(!ctx.contains::<Port>());
        assert_eq!(ctx.get::<&str>(), Some("name"));
    }

    #[test]
    fn merge_prefers_other() {
        let a = Context::new().with(Port(1)).with(7u8);
        let b = Context::new().with(Port(2));
        let merged = a.merge(&b);
        assert_eq!(merged.get::<Port>(), Some(Port(2)));
        assert_eq!(merged.get::<u8>(), Some(7));
    }
}
