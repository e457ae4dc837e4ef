// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The `Effect` description type, its constructors and sequencing.
//!
//! An `Effect<A, E>` does nothing until a runtime runs it. It can be run
//! any number of times; every combinator takes `Fn` closures for that
//! reason.

use std::cell::RefCell;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::cause::{Cause, Defect, FiberId};
use crate::exit::Exit;
use crate::fiber::{Callback, Canceler};
use crate::instr::{take, Erased, Instr};

/// Values that can cross fiber boundaries and be handed out more than
/// once: error types, shared results, service values.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Data for T {}

/// Lazy description of a computation that succeeds with `A`, fails with
/// `E`, dies with a defect, or is interrupted.
pub struct Effect<A, E = Infallible> {
    build: ManuallyDrop<Erased>,
    _marker: PhantomData<fn() -> (A, E)>,
}

thread_local! {
    /// Builders waiting to be released by the outermost `Effect` drop on
    /// this thread. `None` when no drop is in progress.
    static RELEASING: RefCell<Option<Vec<Erased>>> = const { RefCell::new(None) };
}

/// Drop `build` without recursing into the effects its closure captured.
/// A drop that starts while another is running on the same thread is
/// queued, and the outermost one releases the queue in a loop.
fn release(build: Erased) {
    let queued = RELEASING.try_with(|cell| match cell.borrow_mut().as_mut() {
        Some(pending) => {
            pending.push(build);
            None
        }
        None => Some(build),
    });
    // `Err` means thread-locals are gone; `build` was dropped in place.
    let Ok(Some(first)) = queued else { return };
    let _reset = Releasing::start();
    let mut next = Some(first);
    while let Some(build) = next {
        drop(build);
        next = RELEASING.with(|cell| cell.borrow_mut().as_mut().and_then(Vec::pop));
    }
}

/// Marks a release loop as running and clears the mark when it ends,
/// even if a captured value panics while dropping.
struct Releasing;

impl Releasing {
    fn start() -> Self {
        RELEASING.with(|cell| *cell.borrow_mut() = Some(Vec::new()));
        Releasing
    }
}

impl Drop for Releasing {
    fn drop(&mut self) {
        let _ = RELEASING.try_with(|cell| cell.borrow_mut().take());
    }
}

impl<A, E> Drop for Effect<A, E> {
    fn drop(&mut self) {
        // SAFETY: `build` is not used again after this.
        let build = unsafe { ManuallyDrop::take(&mut self.build) };
        release(build);
    }
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self {
            build: self.build.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Effect<{}, {}>",
            std::any::type_name::<A>(),
            std::any::type_name::<E>()
        )
    }
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_fn(build: impl Fn() -> Instr + Send + Sync + 'static) -> Self {
        Self {
            build: ManuallyDrop::new(Arc::new(build)),
            _marker: PhantomData,
        }
    }

    /// Instruction that runs this effect when the fiber reaches it.
    pub(crate) fn instr(&self) -> Instr {
        Instr::Run(Arc::clone(&self.build))
    }

    /// Same runtime representation under different types. Only sound when
    /// the value and every possible failure already have the new types.
    pub(crate) fn coerce<B, E2>(&self) -> Effect<B, E2> {
        Effect {
            build: self.build.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> Effect<A, Infallible> {
    /// An effect that cannot fail can be used at any error type.
    pub fn widen<E>(&self) -> Effect<A, E> {
        self.coerce()
    }
}

impl<A: Send + 'static, E: Data> Effect<A, E> {
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Effect::from_fn(move || Instr::succeed(value.clone()))
    }

    /// Run a side-effecting closure. A panic becomes a defect.
    pub fn sync(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Effect::from_fn(move || Instr::succeed(f()))
    }

    /// Build the effect only when it is run.
    pub fn suspend(f: impl Fn() -> Effect<A, E> + Send + Sync + 'static) -> Self {
        Effect::from_fn(move || f().instr())
    }

    pub fn try_sync(f: impl Fn() -> Result<A, E> + Send + Sync + 'static) -> Self {
        Effect::from_fn(move || match f() {
            Ok(a) => Instr::succeed(a),
            Err(e) => Instr::Fail(Cause::fail(e).erase()),
        })
    }

    pub fn from_result(result: Result<A, E>) -> Self
    where
        A: Clone + Sync,
    {
        Effect::from_exit(result.into())
    }

    pub fn from_exit(exit: Exit<A, E>) -> Self
    where
        A: Clone + Sync,
    {
        Effect::from_fn(move || match exit.clone() {
            Exit::Success(a) => Instr::succeed(a),
            Exit::Failure(c) => Instr::Fail(c.erase()),
        })
    }

    pub fn fail(error: E) -> Self {
        Effect::fail_cause(Cause::fail(error))
    }

    pub fn fail_cause(cause: Cause<E>) -> Self {
        let cause = cause.erase();
        Effect::from_fn(move || Instr::Fail(cause.clone()))
    }

    pub fn die(defect: impl Into<Defect>) -> Self {
        let defect = defect.into();
        Effect::from_fn(move || Instr::die(defect.clone()))
    }

    pub fn die_message(message: impl Into<String>) -> Self {
        Effect::die(Defect::message(message))
    }

    /// Suspend until `register`'s callback is completed. The returned
    /// canceler, if any, runs when the wait is interrupted.
    pub fn async_callback(
        register: impl Fn(Callback<A, E>) -> Option<Canceler> + Send + Sync + 'static,
    ) -> Self {
        let register = Arc::new(register);
        Effect::from_fn(move || {
            let register = register.clone();
            Instr::Async(Box::new(move |slot| register(Callback::new(slot))))
        })
    }

    /// Never completes; only interruption ends it.
    pub fn never() -> Self {
        Effect::from_fn(|| Instr::Async(Box::new(|_| None)))
    }

    /// Interrupt the current fiber.
    pub fn interrupt() -> Self {
        Effect::from_fn(|| {
            Instr::with_fiber(|st| {
                let cause = st
                    .interrupt_cause
                    .get_or_insert_with(|| Cause::interrupt(st.id))
                    .clone();
                Instr::Fail(cause)
            })
        })
    }

    pub fn map<B: Send + 'static>(&self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Effect<B, E> {
        let inner = self.clone();
        let f = Arc::new(f);
        Effect::from_fn(move || {
            let f = f.clone();
            inner.instr().on_success(move |v| Instr::succeed(f(take::<A>(v))))
        })
    }

    pub fn flat_map<B: Send + 'static>(
        &self,
        f: impl Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    ) -> Effect<B, E> {
        let inner = self.clone();
        let f = Arc::new(f);
        Effect::from_fn(move || {
            let f = f.clone();
            inner.instr().on_success(move |v| f(take::<A>(v)).instr())
        })
    }

    /// Alias of `flat_map`.
    pub fn and_then<B: Send + 'static>(
        &self,
        f: impl Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    ) -> Effect<B, E> {
        self.flat_map(f)
    }

    /// Run `that` after this, keeping its value.
    pub fn zip_right<B: Send + 'static>(&self, that: &Effect<B, E>) -> Effect<B, E> {
        let inner = self.clone();
        let that = that.clone();
        Effect::from_fn(move || {
            let that = that.instr();
            inner.instr().on_success(move |_| that)
        })
    }

    /// Run `that` after this, keeping this value.
    pub fn zip_left<B: Send + 'static>(&self, that: &Effect<B, E>) -> Effect<A, E> {
        let inner = self.clone();
        let that = that.clone();
        Effect::from_fn(move || {
            let that = that.instr();
            inner
                .instr()
                .on_success(move |a| that.on_success(move |_| Instr::Succeed(a)))
        })
    }

    /// Run an effect with the value, then pass the value on.
    pub fn tap<B: Send + 'static>(
        &self,
        f: impl Fn(&A) -> Effect<B, E> + Send + Sync + 'static,
    ) -> Self {
        let inner = self.clone();
        let f = Arc::new(f);
        Effect::from_fn(move || {
            let f = f.clone();
            inner.instr().on_success(move |v| {
                let next = match v.downcast_ref::<A>() {
                    Some(a) => f(a).instr(),
                    None => panic!("effect value is not a {}", std::any::type_name::<A>()),
                };
                next.on_success(move |_| Instr::Succeed(v))
            })
        })
    }

    pub fn as_<B: Clone + Send + Sync + 'static>(&self, value: B) -> Effect<B, E> {
        self.map(move |_| value.clone())
    }

    pub fn as_unit(&self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Sequential zip.
    pub fn zip<B: Send + 'static>(&self, that: &Effect<B, E>) -> Effect<(A, B), E> {
        self.zip_with(that, |a, b| (a, b))
    }

    pub fn zip_with<B: Send + 'static, C: Send + 'static>(
        &self,
        that: &Effect<B, E>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Effect<C, E> {
        let inner = self.clone();
        let that = that.clone();
        let f = Arc::new(f);
        Effect::from_fn(move || {
            let that = that.instr();
            let f = f.clone();
            inner.instr().on_success(move |a| {
                that.on_success(move |b| Instr::succeed(f(take::<A>(a), take::<B>(b))))
            })
        })
    }

    /// Run only when `cond` holds, yielding `None` otherwise.
    pub fn when(&self, cond: impl Fn() -> bool + Send + Sync + 'static) -> Effect<Option<A>, E> {
        let inner = self.clone();
        Effect::from_fn(move || {
            if cond() {
                inner.instr().on_success(|v| Instr::succeed(Some(take::<A>(v))))
            } else {
                Instr::succeed(None::<A>)
            }
        })
    }

    /// Choose a branch from the outcome of `cond`.
    pub fn if_(cond: &Effect<bool, E>, on_true: &Effect<A, E>, on_false: &Effect<A, E>) -> Self {
        let (on_true, on_false) = (on_true.clone(), on_false.clone());
        cond.flat_map(move |b| if b { on_true.clone() } else { on_false.clone() })
    }

    /// Repeatedly apply `body` to the state while `cont` holds, starting
    /// from `init`. Yields the final state.
    pub fn iterate(
        init: A,
        cont: impl Fn(&A) -> bool + Send + Sync + 'static,
        body: impl Fn(A) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Self
    where
        A: Clone + Sync,
    {
        fn step<A: Send + 'static>(
            state: A,
            cont: Arc<dyn Fn(&A) -> bool + Send + Sync>,
            body: Arc<dyn Fn(A) -> Instr + Send + Sync>,
        ) -> Instr {
            if !cont(&state) {
                return Instr::succeed(state);
            }
            body(state).on_success(move |v| step(take::<A>(v), cont, body))
        }
        let cont: Arc<dyn Fn(&A) -> bool + Send + Sync> = Arc::new(cont);
        let body: Arc<dyn Fn(A) -> Instr + Send + Sync> = Arc::new(move |a| body(a).instr());
        Effect::from_fn(move || step(init.clone(), cont.clone(), body.clone()))
    }

    /// Succeed with the exit instead of failing.
    pub fn exit<E2: Data>(&self) -> Effect<Exit<A, E>, E2> {
        let inner = self.clone();
        Effect::from_fn(move || {
            inner.instr().fold(
                |c| Instr::succeed(Exit::<A, E>::Failure(c.unerase())),
                |v| Instr::succeed(Exit::<A, E>::Success(take::<A>(v))),
            )
        })
    }

    /// Move expected failures into the value. Defects and interruption
    /// still propagate.
    pub fn either<E2: Data>(&self) -> Effect<Result<A, E>, E2> {
        let inner = self.clone();
        Effect::from_fn(move || {
            inner.instr().fold(
                |c| match c.failure_or_cause() {
                    Ok(any) => match any.downcast_ref::<E>() {
                        Some(e) => Instr::succeed(Err::<A, E>(e.clone())),
                        None => Instr::die(Defect::message("either: unexpected error type")),
                    },
                    Err(rest) => Instr::Fail(rest),
                },
                |v| Instr::succeed(Ok::<A, E>(take::<A>(v))),
            )
        })
    }

    /// Expected failures become `None`.
    pub fn option<E2: Data>(&self) -> Effect<Option<A>, E2> {
        self.either::<E2>().map(|r| r.ok())
    }

    /// Give up the worker so other fibers run, then continue.
    pub fn yield_before(&self) -> Self {
        Effect::<(), E>::yield_now().zip_right(self)
    }
}

impl<E: Data> Effect<(), E> {
    pub fn unit() -> Self {
        Effect::from_fn(Instr::unit)
    }

    /// Cooperative yield point.
    pub fn yield_now() -> Self {
        Effect::from_fn(|| Instr::Yield)
    }

    /// Run `body` while `cont` holds on the counter, stepping it with `step`.
    pub fn loop_discard<S: Clone + Send + Sync + 'static>(
        init: S,
        cont: impl Fn(&S) -> bool + Send + Sync + 'static,
        step: impl Fn(S) -> S + Send + Sync + 'static,
        body: impl Fn(S) -> Effect<(), E> + Send + Sync + 'static,
    ) -> Self {
        let step = Arc::new(step);
        let body = Arc::new(body);
        Effect::<S, E>::iterate(init, cont, move |s| {
            let step = step.clone();
            body(s.clone()).map(move |_| step(s.clone()))
        })
        .as_unit()
    }
}

impl<E: Data> Effect<FiberId, E> {
    pub fn fiber_id() -> Self {
        Effect::from_fn(|| Instr::with_fiber(|st| Instr::succeed(st.id)))
    }
}

impl<A: Send + 'static, E: Data> Effect<Vec<A>, E> {
    /// Run `body` for each state while `cont` holds, collecting results.
    pub fn loop_<S: Clone + Send + Sync + 'static>(
        init: S,
        cont: impl Fn(&S) -> bool + Send + Sync + 'static,
        step: impl Fn(S) -> S + Send + Sync + 'static,
        body: impl Fn(S) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Self {
        fn go<S: Send + 'static, A: Send + 'static>(
            state: S,
            mut acc: Vec<A>,
            cont: Arc<dyn Fn(&S) -> bool + Send + Sync>,
            step: Arc<dyn Fn(S) -> S + Send + Sync>,
            body: Arc<dyn Fn(&S) -> Instr + Send + Sync>,
        ) -> Instr {
            if !cont(&state) {
                return Instr::succeed(acc);
            }
            body(&state).on_success(move |v| {
                acc.push(take::<A>(v));
                go(step(state), acc, cont, step, body)
            })
        }
        let cont: Arc<dyn Fn(&S) -> bool + Send + Sync> = Arc::new(cont);
        let step: Arc<dyn Fn(S) -> S + Send + Sync> = Arc::new(step);
        let body: Arc<dyn Fn(&S) -> Instr + Send + Sync> = Arc::new(move |s: &S| body(s.clone()).instr());
        Effect::from_fn(move || go::<S, A>(init.clone(), Vec::new(), cont.clone(), step.clone(), body.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Oops(&'static str);

    #[test]
    fn descriptions_are_lazy_and_rerunnable() {
        let rt = Runtime::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let eff: Effect<usize> = Effect::sync(move || h.fetch_add(1, Ordering::SeqCst) + 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(rt.run_sync(&eff), Ok(1));
        assert_eq!(rt.run_sync(&eff), Ok(2));
    }

    #[test]
    fn sequencing_combinators() {
        let rt = Runtime::new();
        let eff: Effect<(i32, String), Oops> = Effect::succeed(2)
            .map(|x| x * 10)
            .flat_map(|x| Effect::succeed(x + 1))
            .zip(&Effect::succeed("s".to_string()))
            .tap(|(n, _)| {
                let n = *n;
                Effect::sync(move || assert_eq!(n, 21))
            });
        assert_eq!(rt.run_sync(&eff), Ok((21, "s".to_string())));
    }

    #[test]
    fn failure_short_circuits() {
        let rt = Runtime::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let eff = Effect::<i32, Oops>::fail(Oops("first"))
            .zip_right(&Effect::sync(move || h.fetch_add(1, Ordering::SeqCst)));
        let err = rt.run_sync(&eff).unwrap_err();
        assert_eq!(err.failure(), Some(&Oops("first")));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panics_become_defects() {
        let rt = Runtime::new();
        let eff: Effect<i32> = Effect::sync(|| panic!("kaboom"));
        match rt.run_sync(&eff) {
            Err(crate::RunError::Failed(cause)) => {
                assert!(cause.is_die());
                assert!(cause.defects()[0].to_string().contains("kaboom"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn deep_flat_map_chains_do_not_overflow() {
        let rt = Runtime::new();
        let mut eff: Effect<u64> = Effect::succeed(0);
        for _ in 0..20_000 {
            eff = eff.flat_map(|n| Effect::succeed(n + 1));
        }
        assert_eq!(rt.run_sync(&eff), Ok(20_000));
    }

    #[test]
    fn dropping_a_long_chain_keeps_a_small_stack() {
        let dropper = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(|| {
                let mut eff: Effect<u64> = Effect::succeed(0);
                for _ in 0..100_000 {
                    eff = eff.map(|n| n + 1).zip_left(&Effect::unit());
                }
                drop(eff);
            })
            .unwrap();
        assert!(dropper.join().is_ok());
    }

    #[test]
    fn iterate_and_loop() {
        let rt = Runtime::new();
        let counted: Effect<u32> = Effect::iterate(0, |n| *n < 100_000, |n| Effect::succeed(n + 1));
        assert_eq!(rt.run_sync(&counted), Ok(100_000));
        let squares: Effect<Vec<u32>> = Effect::loop_(1u32, |n| *n <= 4, |n| n + 1, |n| Effect::succeed(n * n));
        assert_eq!(rt.run_sync(&squares), Ok(vec![1, 4, 9, 16]));
    }

    #[test]
    fn either_and_exit_capture_failures() {
        let rt = Runtime::new();
        let failing = Effect::<i32, Oops>::fail(Oops("e"));
        assert_eq!(rt.run_sync(&failing.either::<Infallible>()), Ok(Err(Oops("e"))));
        let exit = rt.run_sync(&failing.exit::<Infallible>()).unwrap();
        assert_eq!(exit, Exit::fail(Oops("e")));
        let died: Effect<i32, Oops> = Effect::die_message("bug");
        assert!(rt.run_sync(&died.either::<Oops>()).is_err());
    }
}
