// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scopes: ordered finalizers closed exactly once.
//!
//! Closing runs the finalizers in reverse order of registration,
//! uninterruptibly, each seeing the exit the scope was closed with.
//! Every finalizer runs even if an earlier one dies; their failures are
//! combined sequentially.

use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cause::{AnyError, Cause};
use crate::effect::{Data, Effect};
use crate::error::{ScopeError, ServiceNotFound};
use crate::exit::{Exit, ScopeExit};
use crate::instr::{take, ErasedCause, Instr};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

type Finalizer = Arc<dyn Fn(&ScopeExit) -> Effect<(), Infallible> + Send + Sync>;

/// Handle for removing a finalizer before the scope closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FinalizerKey(u64);

enum ScopeState {
    Open {
        next_key: u64,
        finalizers: Vec<(u64, Finalizer)>,
    },
    Closed,
}

#[derive(Clone)]
pub struct Scope {
    id: u64,
    state: Arc<Mutex<ScopeState>>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Scope {
    pub fn new() -> Self {
        Self {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(Mutex::new(ScopeState::Open {
                next_key: 0,
                finalizers: Vec::new(),
            })),
        }
    }

    /// A fresh scope each time the effect runs.
    pub fn make<E: Data>() -> Effect<Scope, E> {
        Effect::sync(Scope::new)
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock().unwrap(), ScopeState::Closed)
    }

    /// Number of finalizers waiting for the close.
    pub fn len(&self) -> usize {
        match &*self.state.lock().unwrap() {
            ScopeState::Open { finalizers, .. } => finalizers.len(),
            ScopeState::Closed => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_add_finalizer(
        &self,
        finalizer: impl Fn(&ScopeExit) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Result<FinalizerKey, ScopeError> {
        match &mut *self.state.lock().unwrap() {
            ScopeState::Open { next_key, finalizers } => {
                let key = *next_key;
                *next_key += 1;
                finalizers.push((key, Arc::new(finalizer)));
                Ok(FinalizerKey(key))
            }
            ScopeState::Closed => Err(ScopeError::Closed),
        }
    }

    /// Register a finalizer. Fails with `ScopeError::Closed` once the
    /// scope has been closed.
    pub fn add_finalizer<E: Data + From<ScopeError>>(
        &self,
        finalizer: impl Fn(&ScopeExit) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Effect<FinalizerKey, E> {
        let scope = self.clone();
        let finalizer: Finalizer = Arc::new(finalizer);
        Effect::try_sync(move || {
            let finalizer = finalizer.clone();
            scope
                .try_add_finalizer(move |exit| finalizer(exit))
                .map_err(E::from)
        })
    }

    /// Drop a finalizer without running it. False if it already ran or
    /// was removed.
    pub fn remove_finalizer(&self, key: FinalizerKey) -> bool {
        match &mut *self.state.lock().unwrap() {
            ScopeState::Open { finalizers, .. } => {
                let before = finalizers.len();
                finalizers.retain(|(k, _)| *k != key.0);
                finalizers.len() != before
            }
            ScopeState::Closed => false,
        }
    }

    /// Close the scope with `exit`. Later closes do nothing.
    pub fn close<E: Data>(&self, exit: ScopeExit) -> Effect<(), E> {
        let scope = self.clone();
        Effect::from_fn(move || {
            let finalizers = {
                let mut state = scope.state.lock().unwrap();
                match std::mem::replace(&mut *state, ScopeState::Closed) {
                    ScopeState::Open { finalizers, .. } => finalizers,
                    ScopeState::Closed => return Instr::unit(),
                }
            };
            tracing::trace!(scope = scope.id, finalizers = finalizers.len(), "closing scope");
            run_finalizers(finalizers, exit.clone(), Cause::empty()).region(false)
        })
    }

    /// A child scope, closed when this one closes. Closing the child
    /// first detaches it.
    pub fn fork(&self) -> Result<Scope, ScopeError> {
        let child = Scope::new();
        let closing = child.clone();
        let key = self.try_add_finalizer(move |exit| closing.close(exit.clone()))?;
        let parent = self.clone();
        child.try_add_finalizer(move |_| {
            let parent = parent.clone();
            Effect::sync(move || {
                parent.remove_finalizer(key);
            })
        })?;
        Ok(child)
    }

    /// Run `effect` with this scope as the current one, leaving the scope
    /// open.
    pub fn extend<A: Send + 'static, E: Data>(&self, effect: &Effect<A, E>) -> Effect<A, E> {
        effect.provide_service(self.clone())
    }

    /// Run `effect` in this scope and close it with the outcome.
    pub fn use_<A: Clone + Send + 'static, E: Data>(&self, effect: &Effect<A, E>) -> Effect<A, E> {
        let scope = self.clone();
        self.extend(effect)
            .on_exit(move |exit| scope.close(erase_exit(exit)))
    }
}

/// The scope-facing view of a typed exit.
pub(crate) fn erase_exit<A, E: Data>(exit: &Exit<A, E>) -> ScopeExit {
    match exit {
        Exit::Success(_) => Exit::Success(()),
        Exit::Failure(cause) => Exit::Failure(cause.clone().map(AnyError::new)),
    }
}

/// Pop and run finalizers last-registered first, collecting failures.
fn run_finalizers(mut rest: Vec<(u64, Finalizer)>, exit: ScopeExit, acc: ErasedCause) -> Instr {
    let Some((_, finalizer)) = rest.pop() else {
        return if acc.is_empty() { Instr::unit() } else { Instr::Fail(acc) };
    };
    let run_exit = exit.clone();
    Instr::suspend(move || finalizer(&run_exit).instr())
        .fold(|c| Instr::succeed(Some(c)), |_| Instr::succeed(None::<ErasedCause>))
        .on_success(move |v| {
            let acc = match take::<Option<ErasedCause>>(v) {
                Some(cause) => Cause::sequential(acc, cause),
                None => acc,
            };
            run_finalizers(rest, exit, acc)
        })
}

fn current_scope(st: &crate::fiber::FiberState) -> Result<Scope, Instr> {
    st.context.get::<Scope>().ok_or_else(|| {
        Instr::die(ServiceNotFound {
            service: std::any::type_name::<Scope>(),
        })
    })
}

impl<A: Clone + Send + 'static, E: Data> Effect<A, E> {
    /// Run with a fresh scope that is closed when the effect ends.
    pub fn scoped(&self) -> Self {
        let inner = self.clone();
        Scope::make().flat_map(move |scope| scope.use_(&inner))
    }
}

impl<A: Data, E: Data> Effect<A, E> {
    /// Acquire uninterruptibly and register `release` in the current
    /// scope. Dies when no scope is in context.
    pub fn acquire_release(
        acquire: &Effect<A, E>,
        release: impl Fn(A, &ScopeExit) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        let acquire = acquire.clone();
        let release = Arc::new(release);
        Effect::from_fn(move || {
            let acquire = acquire.instr();
            let release = release.clone();
            Instr::with_fiber(move |st| {
                let scope = match current_scope(st) {
                    Ok(scope) => scope,
                    Err(die) => return die,
                };
                acquire
                    .on_success(move |v| {
                        let a = take::<A>(v);
                        let (kept, registered) = (a.clone(), release.clone());
                        match scope.try_add_finalizer(move |exit| registered(kept.clone(), exit)) {
                            Ok(_) => Instr::succeed(a),
                            Err(closed) => release(a, &Exit::Success(()))
                                .instr()
                                .on_success(move |_| Instr::die(closed)),
                        }
                    })
                    .region(false)
            })
        })
    }
}

impl<E: Data> Effect<(), E> {
    /// Add a finalizer to the current scope. Dies when there is no scope
    /// or it is already closed.
    pub fn add_finalizer(
        finalizer: impl Fn(&ScopeExit) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        let finalizer: Finalizer = Arc::new(finalizer);
        Effect::from_fn(move || {
            let finalizer = finalizer.clone();
            Instr::with_fiber(move |st| {
                let scope = match current_scope(st) {
                    Ok(scope) => scope,
                    Err(die) => return die,
                };
                match scope.try_add_finalizer(move |exit| finalizer(exit)) {
                    Ok(_) => Instr::unit(),
                    Err(closed) => Instr::die(closed),
                }
            })
        })
    }
}

impl<E: Data> Effect<Scope, E> {
    /// The scope in context. Dies when there is none.
    pub fn scope() -> Self {
        Effect::from_fn(|| {
            Instr::with_fiber(|st| match current_scope(st) {
                Ok(scope) => Instr::succeed(scope),
                Err(die) => die,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Effect<(), Infallible> + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let push = move |entry: &str| {
            let (l, entry) = (l.clone(), entry.to_string());
            Effect::sync(move || l.lock().unwrap().push(entry.clone()))
        };
        (log, push)
    }

    #[test]
    fn finalizers_run_in_reverse_and_once() {
        let rt = Runtime::new();
        let (log, push) = recorder();
        let scope = Scope::new();
        for name in ["a", "b", "c"] {
            let push = push.clone();
            scope.try_add_finalizer(move |_| push(name)).unwrap();
        }
        let close: Effect<(), Infallible> = scope.close(Exit::Success(()));
        rt.run_sync(&close).unwrap();
        rt.run_sync(&close).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
        assert_eq!(scope.try_add_finalizer(move |_| push("late")), Err(ScopeError::Closed));
        let add: Effect<FinalizerKey, ScopeError> = scope.add_finalizer(|_| Effect::unit());
        assert_eq!(rt.run_sync(&add).unwrap_err().failure(), Some(&ScopeError::Closed));
    }

    #[test]
    fn failing_finalizers_do_not_stop_the_rest() {
        let rt = Runtime::new();
        let (log, push) = recorder();
        let scope = Scope::new();
        scope.try_add_finalizer(move |_| push("first")).unwrap();
        scope.try_add_finalizer(|_| Effect::die_message("broken")).unwrap();
        let close: Effect<(), Infallible> = scope.close(Exit::Success(()));
        let err = rt.run_sync(&close).unwrap_err();
        assert!(err.cause().is_some_and(|c| c.is_die()));
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn child_scopes() {
        let rt = Runtime::new();
        let (log, push) = recorder();
        let parent = Scope::new();
        let child = parent.fork().unwrap();
        let p = push.clone();
        child.try_add_finalizer(move |_| p("child")).unwrap();
        parent.try_add_finalizer(move |_| push("parent")).unwrap();
        let close: Effect<(), Infallible> = parent.close(Exit::Success(()));
        rt.run_sync(&close).unwrap();
        assert!(child.is_closed());
        assert_eq!(*log.lock().unwrap(), vec!["parent", "child"]);

        let parent = Scope::new();
        let child = parent.fork().unwrap();
        assert_eq!(parent.len(), 1);
        rt.run_sync(&child.close::<Infallible>(Exit::Success(()))).unwrap();
        assert_eq!(parent.len(), 0);
        assert!(!parent.is_closed());
    }

    #[test]
    fn acquire_release_releases_on_every_path() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(2));
        let (log, push) = recorder();
        let resource = move |tag: &'static str| {
            let push = push.clone();
            Effect::<&'static str, String>::acquire_release(&Effect::succeed(tag), move |r, _| push(r))
        };
        let ok = resource("ok").scoped();
        let failed = resource("failed").zip_right(&Effect::<(), String>::fail("x".into())).scoped();
        let died = resource("died").zip_right(&Effect::<(), String>::die_message("x")).scoped();
        let interrupted = resource("interrupted")
            .zip_right(&Effect::<(), String>::never())
            .scoped();
        assert_eq!(rt.run_sync(&ok), Ok("ok"));
        assert!(rt.run_sync(&failed).is_err());
        assert!(rt.run_sync(&died).is_err());
        let fiber = rt.run_fork(&interrupted);
        std::thread::sleep(Duration::from_millis(20));
        let interrupt: Effect<_, Infallible> = fiber.interrupt();
        assert!(rt.run_blocking(&interrupt).unwrap().is_interrupted());
        assert_eq!(*log.lock().unwrap(), vec!["ok", "failed", "died", "interrupted"]);
    }

    #[test]
    fn missing_scope_is_a_defect() {
        let rt = Runtime::new();
        let eff: Effect<(), Infallible> = Effect::add_finalizer(|_| Effect::unit());
        assert!(rt.run_sync(&eff).unwrap_err().cause().is_some_and(|c| c.is_die()));
    }
}
