// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Starting child fibers.
//!
//! `fork` attaches the child to the current fiber: when the parent's
//! main effect finishes, still-running children are interrupted and
//! awaited before the parent's exit is published. `fork_daemon` skips
//! that; `fork_scoped` / `fork_in` tie the child to a scope instead.

use std::sync::Arc;

use crate::effect::{Data, Effect};
use crate::fiber::{Fiber, FiberInner, FiberState};
use crate::instr::{take, Instr, SharedValue};
use crate::scope::Scope;
use crate::supervisor::Supervisor;

/// Start `start` on a new fiber with a copy of the caller's context. Its
/// result must already be shared.
pub(crate) fn spawn(st: &mut FiberState, start: Instr, attach: bool, interruptible: bool) -> Arc<FiberInner> {
    let child = FiberInner::new(st.rt.clone(), st.context.clone(), interruptible, start);
    if attach {
        st.children.retain(|c| !c.is_done());
        st.children.push(child.clone());
    }
    if let Some(supervisor) = st.context.get_ref::<Supervisor>() {
        supervisor.register(&child);
    }
    tracing::trace!(parent = %st.id, child = %child.id, attach, "fork");
    child.start();
    child
}

/// Instruction for running `effect` as a fiber's main effect.
pub(crate) fn shared_start<A: Send + Sync + 'static, E>(effect: &Effect<A, E>) -> Instr {
    effect
        .instr()
        .on_success(|v| Instr::succeed::<SharedValue>(Arc::new(take::<A>(v))))
}

impl<A: Data, E: Data> Effect<A, E> {
    fn fork_with<E2: Data>(&self, attach: bool) -> Effect<Fiber<A, E>, E2> {
        let inner = self.clone();
        Effect::from_fn(move || {
            let start = shared_start(&inner);
            Instr::with_fiber(move |st| {
                let interruptible = st.interruptible;
                Instr::succeed(Fiber::<A, E>::from_inner(spawn(st, start, attach, interruptible)))
            })
        })
    }

    /// Run on a new fiber supervised by the current one.
    pub fn fork<E2: Data>(&self) -> Effect<Fiber<A, E>, E2> {
        self.fork_with(true)
    }

    /// Run on a new fiber that outlives the current one.
    pub fn fork_daemon<E2: Data>(&self) -> Effect<Fiber<A, E>, E2> {
        self.fork_with(false)
    }

    /// Run on a new fiber interrupted when `scope` closes. The child
    /// starts with the caller's interruptibility; only the hand-off to the
    /// scope is protected.
    pub fn fork_in<E2: Data>(&self, scope: &Scope) -> Effect<Fiber<A, E>, E2> {
        let inner = self.clone();
        let scope = scope.clone();
        Effect::uninterruptible_mask(move |restore| {
            let scope = scope.clone();
            restore.apply(&inner).fork_daemon::<E2>().flat_map(move |fiber| {
                let target = fiber.clone();
                match scope.try_add_finalizer(move |_| target.interrupt().as_unit()) {
                    Ok(key) => {
                        let scope = scope.clone();
                        fiber.inner.observe(Box::new(move |_| {
                            scope.remove_finalizer(key);
                        }));
                        Effect::succeed(fiber)
                    }
                    Err(_) => fiber.interrupt::<E2>().as_(fiber.clone()),
                }
            })
        })
    }

    /// Run on a new fiber tied to the scope in context.
    pub fn fork_scoped<E2: Data>(&self) -> Effect<Fiber<A, E>, E2> {
        let inner = self.clone();
        Effect::<Scope, E2>::scope().flat_map(move |scope| inner.fork_in(&scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::Exit;
    use crate::runtime::{Runtime, RuntimeConfig};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn rt() -> Runtime {
        Runtime::with_config(RuntimeConfig::default().workers(2))
    }

    #[test]
    fn fork_and_join() {
        let rt = rt();
        let eff: Effect<i32, String> = Effect::<i32, String>::succeed(20)
            .map(|n| n + 1)
            .fork()
            .flat_map(|f| f.join())
            .map(|n| n * 2);
        assert_eq!(rt.run_blocking(&eff), Ok(42));
        let failing: Effect<i32, String> = Effect::<i32, String>::fail("child".into()).fork().flat_map(|f| f.join());
        assert_eq!(rt.run_blocking(&failing).unwrap_err().failure(), Some(&"child".to_string()));
    }

    #[test]
    fn attached_children_end_with_parent() {
        let rt = rt();
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        let child: Effect<(), Infallible> = Effect::<(), Infallible>::sleep(Duration::from_secs(5))
            .zip_right(&Effect::sync(move || d.store(true, Ordering::SeqCst)));
        let parent: Effect<Fiber<(), Infallible>, Infallible> = child.fork();
        let fiber = rt.run_blocking(&parent).unwrap();
        assert!(fiber.is_done());
        assert!(fiber.await_blocking().is_interrupted());
        assert!(!done.load(Ordering::SeqCst));
    }

    #[test]
    fn daemons_escape() {
        let rt = rt();
        let child: Effect<u8, Infallible> = Effect::<(), Infallible>::sleep(Duration::from_millis(20)).as_(1);
        let parent: Effect<Fiber<u8, Infallible>, Infallible> = child.fork_daemon();
        let fiber = rt.run_blocking(&parent).unwrap();
        assert_eq!(fiber.await_blocking(), Exit::succeed(1));
    }

    #[test]
    fn scoped_fibers_stop_with_scope() {
        let rt = rt();
        let child: Effect<(), Infallible> = Effect::never();
        let eff: Effect<Exit<(), Infallible>, Infallible> = child
            .fork_scoped()
            .zip_left(&Effect::sleep(Duration::from_millis(5)))
            .scoped()
            .flat_map(|fiber| fiber.await_exit())
            .timeout_option(Duration::from_secs(2))
            .map(|exit| exit.expect("scope close left the child running"));
        assert!(rt.run_blocking(&eff).unwrap().is_interrupted());
    }

    #[test]
    fn closing_the_scope_cuts_a_sleeping_child_short() {
        let rt = rt();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let child: Effect<(), Infallible> = Effect::<(), Infallible>::sleep(Duration::from_millis(400))
            .zip_right(&Effect::sync(move || flag.store(true, Ordering::SeqCst)));
        let eff: Effect<Fiber<(), Infallible>, Infallible> = child
            .fork_scoped()
            .zip_left(&Effect::sleep(Duration::from_millis(5)))
            .scoped();
        let start = std::time::Instant::now();
        let fiber = rt.run_blocking(&eff).unwrap();
        assert!(start.elapsed() < Duration::from_millis(300), "took {:?}", start.elapsed());
        assert!(fiber.await_blocking().is_interrupted());
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[test]
    fn fork_in_a_closed_scope_interrupts_at_once() {
        let rt = rt();
        let scope = Scope::new();
        let closed: Effect<(), Infallible> = scope.close(Exit::Success(()));
        rt.run_blocking(&closed).unwrap();
        let child: Effect<(), Infallible> = Effect::never();
        let eff: Effect<Exit<(), Infallible>, Infallible> = child
            .fork_in::<Infallible>(&scope)
            .flat_map(|fiber| fiber.await_exit())
            .timeout_option(Duration::from_secs(2))
            .map(|exit| exit.expect("child outlived a closed scope"));
        assert!(rt.run_blocking(&eff).unwrap().is_interrupted());
    }
}
