// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Interruptibility regions and finalizers.

use std::convert::Infallible;
use std::sync::Arc;

use crate::cause::{Cause, FiberId};
use crate::effect::{Data, Effect};
use crate::exit::Exit;
use crate::instr::{ErasedCause, Instr, Value};

/// Token handed out by `uninterruptible_mask`: restores the
/// interruptibility that was in force outside the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restore {
    interruptible: bool,
}

impl Restore {
    pub fn apply<A: Send + 'static, E: Data>(&self, effect: &Effect<A, E>) -> Effect<A, E> {
        let inner = effect.clone();
        let flag = self.interruptible;
        Effect::from_fn(move || inner.instr().region(flag))
    }
}

/// Run `fin`, then finish the way `outcome` says. A failing finalizer is
/// appended after the original cause.
fn then_finalize(fin: Instr, outcome: Result<Value, ErasedCause>) -> Instr {
    // Only one branch runs; share the non-Clone outcome between them.
    let outcome = Arc::new(std::sync::Mutex::new(Some(outcome)));
    let outcome_ok = Arc::clone(&outcome);
    fin.fold(
        move |fin_cause| match outcome.lock().unwrap().take().expect("outcome taken once") {
            Ok(_) => Instr::Fail(fin_cause),
            Err(cause) => Instr::Fail(Cause::sequential(cause, fin_cause)),
        },
        move |_| match outcome_ok.lock().unwrap().take().expect("outcome taken once") {
            Ok(value) => Instr::Succeed(value),
            Err(cause) => Instr::Fail(cause),
        },
    )
}

/// Run `inner` with the caller's interruptibility, and `on_failure` /
/// `on_success` uninterruptibly once it has finished.
fn bracket_exit(
    inner: Instr,
    on_failure: impl FnOnce(&ErasedCause) -> Option<Instr> + Send + 'static,
    on_success: impl FnOnce(&Value) -> Option<Instr> + Send + 'static,
) -> Instr {
    Instr::with_fiber(move |st| {
        let outer = st.interruptible;
        inner
            .region(outer)
            .fold(
                move |cause| match on_failure(&cause) {
                    Some(fin) => then_finalize(fin, Err(cause)),
                    None => Instr::Fail(cause),
                },
                move |value| match on_success(&value) {
                    Some(fin) => then_finalize(fin, Ok(value)),
                    None => Instr::Succeed(value),
                },
            )
            .region(false)
    })
}

impl<A: Send + 'static, E: Data> Effect<A, E> {
    pub fn uninterruptible(&self) -> Self {
        let inner = self.clone();
        Effect::from_fn(move || inner.instr().region(false))
    }

    pub fn interruptible(&self) -> Self {
        let inner = self.clone();
        Effect::from_fn(move || inner.instr().region(true))
    }

    /// Run `f` uninterruptibly; the `Restore` it receives reopens the
    /// caller's interruptibility for chosen sub-effects.
    pub fn uninterruptible_mask(f: impl Fn(Restore) -> Effect<A, E> + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        Effect::from_fn(move || {
            let f = f.clone();
            Instr::with_fiber(move |st| {
                let restore = Restore {
                    interruptible: st.interruptible,
                };
                f(restore).instr().region(false)
            })
        })
    }

    /// Run `finalizer` after this effect on every exit path.
    pub fn ensuring(&self, finalizer: &Effect<(), Infallible>) -> Self {
        let inner = self.clone();
        let fin = finalizer.clone();
        Effect::from_fn(move || {
            let (on_fail, on_ok) = (fin.clone(), fin.clone());
            bracket_exit(
                inner.instr(),
                move |_| Some(on_fail.instr()),
                move |_| Some(on_ok.instr()),
            )
        })
    }

    /// Run `cleanup` when this effect ends, seeing how it ended.
    pub fn on_exit(&self, cleanup: impl Fn(&Exit<A, E>) -> Effect<(), Infallible> + Send + Sync + 'static) -> Self
    where
        A: Clone,
    {
        let inner = self.clone();
        let cleanup = Arc::new(cleanup);
        Effect::from_fn(move || {
            let (on_fail, on_ok) = (cleanup.clone(), cleanup.clone());
            bracket_exit(
                inner.instr(),
                move |cause| Some(on_fail(&Exit::Failure(cause.clone().unerase())).instr()),
                move |value| {
                    let a = value.downcast_ref::<A>()?.clone();
                    Some(on_ok(&Exit::Success(a)).instr())
                },
            )
        })
    }

    /// Run `cleanup` on any failure, with the typed cause.
    pub fn on_error(&self, cleanup: impl Fn(&Cause<E>) -> Effect<(), Infallible> + Send + Sync + 'static) -> Self {
        let inner = self.clone();
        let cleanup = Arc::new(cleanup);
        Effect::from_fn(move || {
            let cleanup = cleanup.clone();
            bracket_exit(
                inner.instr(),
                move |cause| Some(cleanup(&cause.clone().unerase()).instr()),
                |_| None,
            )
        })
    }

    /// Run `cleanup` if this effect is interrupted. It receives the ids
    /// of the interrupting fibers.
    pub fn on_interrupt(
        &self,
        cleanup: impl Fn(&[FiberId]) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        let inner = self.clone();
        let cleanup = Arc::new(cleanup);
        Effect::from_fn(move || {
            let cleanup = cleanup.clone();
            bracket_exit(
                inner.instr(),
                move |cause| {
                    cause
                        .is_interrupted()
                        .then(|| cleanup(&cause.interruptors()).instr())
                },
                |_| None,
            )
        })
    }
}

impl<B: Clone + Send + 'static, E: Data> Effect<B, E> {
    /// Acquire uninterruptibly, use, and release on every exit path.
    pub fn acquire_use_release<R: Data>(
        acquire: &Effect<R, E>,
        use_: impl Fn(R) -> Effect<B, E> + Send + Sync + 'static,
        release: impl Fn(R, &Exit<B, E>) -> Effect<(), Infallible> + Send + Sync + 'static,
    ) -> Self {
        let acquire = acquire.clone();
        let use_ = Arc::new(use_);
        let release = Arc::new(release);
        Effect::uninterruptible_mask(move |restore| {
            let (use_, release) = (use_.clone(), release.clone());
            acquire.flat_map(move |r| {
                let release = release.clone();
                let r2 = r.clone();
                restore
                    .apply(&use_(r))
                    .on_exit(move |exit| release(r2.clone(), exit))
            })
        })
    }
}

impl<E: Data> Effect<bool, E> {
    /// Whether the current fiber has been asked to stop.
    pub fn is_interrupted() -> Self {
        Effect::from_fn(|| Instr::with_fiber(|st| Instr::succeed(st.is_interrupted())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, Effect<(), Infallible>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let eff = Effect::sync(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        (hits, eff)
    }

    #[test]
    fn ensuring_runs_on_every_path() {
        let rt = Runtime::new();
        let (hits, fin) = counter();
        let ok: Effect<i32, String> = Effect::succeed(1).ensuring(&fin);
        let failed: Effect<i32, String> = Effect::fail("no".to_string()).ensuring(&fin);
        let died: Effect<i32, String> = Effect::die_message("bug").ensuring(&fin);
        assert_eq!(rt.run_sync(&ok), Ok(1));
        assert!(rt.run_sync(&failed).is_err());
        assert!(rt.run_sync(&died).is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn finalizer_failure_is_appended() {
        let rt = Runtime::new();
        let eff: Effect<i32, String> = Effect::fail("first".to_string())
            .ensuring(&Effect::die_message("second"));
        let cause = rt.run_sync(&eff).unwrap_err().cause().cloned().unwrap();
        match cause {
            Cause::Sequential(l, r) => {
                assert_eq!(*l, Cause::fail("first".to_string()));
                assert!(r.is_die());
            }
            other => panic!("unexpected cause {other:?}"),
        }
    }

    #[test]
    fn interrupting_runs_finalizers_once() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(2));
        let (hits, fin) = counter();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sleeper: Effect<(), Infallible> = Effect::<(), Infallible>::never()
            .ensuring(&fin)
            .on_interrupt(move |ids| {
                let (s, ids) = (s.clone(), ids.to_vec());
                Effect::sync(move || s.lock().unwrap().extend(ids.clone()))
            });
        let fiber = rt.run_fork(&sleeper);
        std::thread::sleep(Duration::from_millis(20));
        let interrupt: Effect<_, Infallible> = fiber.interrupt();
        let exit = rt.run_blocking(&interrupt).unwrap();
        assert!(exit.is_interrupted());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn uninterruptible_regions_defer_interruption() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(2));
        let (hits, bump) = counter();
        let guarded: Effect<(), Infallible> = Effect::sleep(Duration::from_millis(30))
            .zip_right(&bump)
            .uninterruptible();
        let fiber = rt.run_fork(&guarded);
        std::thread::sleep(Duration::from_millis(5));
        let interrupt: Effect<_, Infallible> = fiber.interrupt();
        let exit = rt.run_blocking(&interrupt).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(exit.is_interrupted());
    }

    #[test]
    fn mask_restores_outer_interruptibility() {
        let rt = Runtime::new();
        let flags: Effect<(bool, bool), Infallible> = Effect::uninterruptible_mask(|restore| {
            let inside = Effect::from_fn(|| Instr::with_fiber(|st| Instr::succeed(st.interruptible)));
            restore.apply(&inside).zip(&inside)
        });
        assert_eq!(rt.run_sync(&flags), Ok((true, false)));
    }

    #[test]
    fn acquire_use_release_sees_exit() {
        let rt = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let eff: Effect<i32, String> = Effect::acquire_use_release(
            &Effect::succeed("res"),
            |r| Effect::fail(format!("{r} broke")),
            move |r, exit| {
                let entry = format!("release {r} failed={}", exit.is_failure());
                let l = l.clone();
                Effect::sync(move || l.lock().unwrap().push(entry.clone()))
            },
        );
        assert!(rt.run_sync(&eff).is_err());
        assert_eq!(*log.lock().unwrap(), vec!["release res failed=true".to_string()]);
    }
}
