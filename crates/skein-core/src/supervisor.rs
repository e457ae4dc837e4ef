// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber supervision.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::effect::{Data, Effect};
use crate::fiber::{FiberInner, RuntimeFiber};

/// Observes every fiber forked while it is in context.
#[derive(Clone, Default)]
pub struct Supervisor {
    fibers: Arc<Mutex<Vec<RuntimeFiber>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new supervisor each time the effect runs.
    pub fn track<E: Data>() -> Effect<Supervisor, E> {
        Effect::sync(Supervisor::new)
    }

    pub(crate) fn register(&self, fiber: &Arc<FiberInner>) {
        let mut fibers = self.fibers.lock().unwrap();
        fibers.retain(|f| !f.is_done());
        fibers.push(RuntimeFiber {
            inner: fiber.clone(),
        });
    }

    /// Fibers seen so far that have not finished.
    pub fn live(&self) -> Vec<RuntimeFiber> {
        let mut fibers = self.fibers.lock().unwrap();
        fibers.retain(|f| !f.is_done());
        fibers.clone()
    }

    pub fn value<E: Data>(&self) -> Effect<Vec<RuntimeFiber>, E> {
        let sup = self.clone();
        Effect::sync(move || sup.live())
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("fibers", &self.fibers.lock().unwrap().len())
            .finish()
    }
}

impl<A: Send + 'static, E: Data> Effect<A, E> {
    /// Report every fiber forked by this effect to `supervisor`.
    pub fn supervised(&self, supervisor: &Supervisor) -> Self {
        self.provide_service(supervisor.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};
    use std::convert::Infallible;
    use std::time::Duration;

    #[test]
    fn tracks_live_children() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(2));
        let sup = Supervisor::new();
        let short: Effect<(), Infallible> = Effect::unit();
        let long: Effect<(), Infallible> = Effect::sleep(Duration::from_secs(5));
        let watcher = sup.clone();
        let eff: Effect<usize, Infallible> = short
            .fork_daemon()
            .zip_right(&long.fork_daemon())
            .flat_map(move |f| {
                let watcher = watcher.clone();
                Effect::<(), Infallible>::sleep(Duration::from_millis(20))
                    .zip_right(&watcher.value())
                    .map(|live| live.len())
                    .zip_left(&f.interrupt())
            })
            .supervised(&sup);
        assert_eq!(rt.run_blocking(&eff), Ok(1));
        assert!(sup.live().is_empty());
    }
}
