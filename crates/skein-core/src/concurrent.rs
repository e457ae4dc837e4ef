// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Running effects side by side.
//!
//! Two engines live here. The gather engine runs a list of effects on up
//! to `n` worker fibers, keeps results in input order and stops everything
//! on the first failure. The race engine forks every contender and
//! settles on the first exit that counts, then interrupts and awaits the
//! rest. Both start their fibers uninterruptibly so nothing is leaked if
//! the caller is interrupted while they are being set up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cause::{Cause, Defect, FiberId};
use crate::context::Context;
use crate::effect::{Data, Effect};
use crate::error::TimeoutError;
use crate::exit::Exit;
use crate::fiber::{FiberInner, ResumeSlot};
use crate::fork::{shared_start, spawn};
use crate::instr::{take, ErasedCause, ErasedExit, Instr, SharedValue, Value};

/// How many effects of a collection may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// One after another on the calling fiber.
    #[default]
    Sequential,
    Unbounded,
    /// At most `n` at a time. Zero is treated as one.
    Bounded(usize),
    /// Whatever the nearest `with_concurrency` says, unbounded otherwise.
    Inherit,
}

impl Concurrency {
    /// Worker limit, or `None` for sequential.
    fn limit(self, context: &Context) -> Option<usize> {
        match self {
            Concurrency::Sequential => None,
            Concurrency::Unbounded => Some(usize::MAX),
            Concurrency::Bounded(n) => Some(n.max(1)),
            Concurrency::Inherit => match context.get::<Concurrency>() {
                Some(c) if c != Concurrency::Inherit => c.limit(context),
                _ => Some(usize::MAX),
            },
        }
    }
}

type Task = Arc<dyn Fn() -> Instr + Send + Sync>;

fn task<A: Send + 'static, E: 'static>(effect: Effect<A, E>) -> Task {
    Arc::new(move || effect.instr())
}

fn shared_task<A: Data, E: 'static>(effect: Effect<A, E>) -> Task {
    Arc::new(move || shared_start(&effect))
}

/// Combine failures of concurrent work. Interruptions only matter when
/// nothing else went wrong.
fn merge_causes(causes: Vec<ErasedCause>) -> ErasedCause {
    let real = causes.iter().any(|c| !c.is_interrupted_only());
    causes
        .into_iter()
        .filter(|c| !real || !c.is_interrupted_only())
        .fold(Cause::empty(), Cause::parallel)
}

/// Wait for every fiber in turn; succeeds with their exits.
fn await_all(fibers: Vec<Arc<FiberInner>>) -> Instr {
    fn go(mut rest: std::vec::IntoIter<Arc<FiberInner>>, mut acc: Vec<ErasedExit>) -> Instr {
        match rest.next() {
            None => Instr::succeed(acc),
            Some(fiber) => fiber.await_instr().on_success(move |v| {
                acc.push(take::<ErasedExit>(v));
                go(rest, acc)
            }),
        }
    }
    go(fibers.into_iter(), Vec::new())
}

fn stop_all(fibers: Vec<Arc<FiberInner>>, by: FiberId) -> Instr {
    for fiber in &fibers {
        fiber.interrupt_as(by);
    }
    await_all(fibers)
}

struct Gather {
    tasks: Vec<Task>,
    state: Mutex<GatherState>,
}

struct GatherState {
    next: usize,
    results: Vec<Option<Value>>,
    failed: bool,
    workers: Vec<Arc<FiberInner>>,
}

impl Gather {
    fn new(tasks: Vec<Task>) -> Self {
        let results = tasks.iter().map(|_| None).collect();
        Self {
            tasks,
            state: Mutex::new(GatherState {
                next: 0,
                results,
                failed: false,
                workers: Vec::new(),
            }),
        }
    }

    fn claim(&self) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        if state.failed || state.next >= self.tasks.len() {
            return None;
        }
        state.next += 1;
        Some(state.next - 1)
    }

    fn store(&self, index: usize, value: Value) {
        self.state.lock().unwrap().results[index] = Some(value);
    }

    fn fail_fast(&self, by: FiberId) {
        let mut state = self.state.lock().unwrap();
        state.failed = true;
        for worker in state.workers.iter().filter(|w| w.id != by) {
            worker.interrupt_as(by);
        }
    }

    fn take_results(&self) -> Option<Vec<Value>> {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.results).into_iter().collect()
    }
}

fn worker(gather: Arc<Gather>) -> Instr {
    Instr::suspend(move || match gather.claim() {
        None => Instr::succeed::<SharedValue>(Arc::new(())),
        Some(index) => {
            let (on_fail, on_ok) = (gather.clone(), gather.clone());
            (gather.tasks[index])().fold(
                move |cause| {
                    Instr::with_fiber(move |st| {
                        on_fail.fail_fast(st.id);
                        Instr::Fail(cause)
                    })
                },
                move |value| {
                    on_ok.store(index, value);
                    worker(on_ok)
                },
            )
        }
    })
}

fn gather_sequential(mut rest: std::vec::IntoIter<Task>, mut acc: Vec<Value>) -> Instr {
    match rest.next() {
        None => Instr::succeed(acc),
        Some(task) => task().on_success(move |v| {
            acc.push(v);
            gather_sequential(rest, acc)
        }),
    }
}

fn gather_parallel(tasks: Vec<Task>, limit: usize, outer: bool) -> Instr {
    Instr::with_fiber(move |st| {
        let gather = Arc::new(Gather::new(tasks));
        let count = limit.min(gather.tasks.len());
        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            let w = spawn(st, worker(gather.clone()), true, outer);
            let mut state = gather.state.lock().unwrap();
            if state.failed {
                w.interrupt_as(st.id);
            }
            state.workers.push(w.clone());
            drop(state);
            workers.push(w);
        }
        let parent = st.id;
        let stop = workers.clone();
        await_all(workers).region(outer).fold(
            move |cause| stop_all(stop, parent).on_success(move |_| Instr::Fail(cause)),
            move |v| {
                let causes: Vec<ErasedCause> = take::<Vec<ErasedExit>>(v)
                    .into_iter()
                    .filter_map(|exit| match exit {
                        Exit::Failure(cause) => Some(cause),
                        Exit::Success(_) => None,
                    })
                    .collect();
                if !causes.is_empty() {
                    return Instr::Fail(merge_causes(causes));
                }
                match gather.take_results() {
                    Some(values) => Instr::succeed(values),
                    None => Instr::die(Defect::message("concurrent task finished without a result")),
                }
            },
        )
    })
    .region(false)
}

/// Run `tasks`, succeeding with their values in input order.
fn gather(tasks: Vec<Task>, concurrency: Concurrency) -> Instr {
    Instr::with_fiber(move |st| {
        if tasks.is_empty() {
            return Instr::succeed(Vec::<Value>::new());
        }
        match concurrency.limit(&st.context) {
            None => gather_sequential(tasks.into_iter(), Vec::new()),
            Some(limit) => gather_parallel(tasks, limit, st.interruptible),
        }
    })
}

struct RaceState {
    pending: usize,
    causes: Vec<ErasedCause>,
    settled: bool,
}

/// Fork every start instruction and settle on the first exit, or with
/// `first_exit` false on the first success. Succeeds with the winner's
/// shared value.
fn race(starts: Vec<Task>, first_exit: bool) -> Instr {
    Instr::with_fiber(move |st| {
        let outer = st.interruptible;
        Instr::with_fiber(move |st| {
            let contenders: Vec<Arc<FiberInner>> =
                starts.iter().map(|start| spawn(st, start(), true, outer)).collect();
            let parent = st.id;
            let watched = contenders.clone();
            let settle = Instr::Async(Box::new(move |slot: Arc<ResumeSlot>| {
                let state = Arc::new(Mutex::new(RaceState {
                    pending: watched.len(),
                    causes: Vec::new(),
                    settled: false,
                }));
                for fiber in &watched {
                    let (state, slot) = (state.clone(), slot.clone());
                    fiber.observe(Box::new(move |exit: &ErasedExit| {
                        let mut race = state.lock().unwrap();
                        if race.settled {
                            return;
                        }
                        race.pending -= 1;
                        let outcome = match exit {
                            Exit::Failure(cause) if !first_exit => {
                                race.causes.push(cause.clone());
                                if race.pending > 0 {
                                    return;
                                }
                                Exit::Failure(merge_causes(std::mem::take(&mut race.causes)))
                            }
                            other => other.clone(),
                        };
                        race.settled = true;
                        drop(race);
                        slot.resume(Instr::succeed::<ErasedExit>(outcome));
                    }));
                }
                None
            }));
            let (on_interrupt, on_settled) = (contenders.clone(), contenders);
            settle.region(outer).fold(
                move |cause| stop_all(on_interrupt, parent).on_success(move |_| Instr::Fail(cause)),
                move |v| {
                    let exit = take::<ErasedExit>(v);
                    stop_all(on_settled, parent).on_success(move |_| match exit {
                        Exit::Success(shared) => Instr::succeed(shared),
                        Exit::Failure(cause) => Instr::Fail(cause),
                    })
                },
            )
        })
        .region(false)
    })
}

fn unshare<A: Data>(value: Value) -> Instr {
    match take::<SharedValue>(value).downcast_ref::<A>() {
        Some(a) => Instr::succeed(a.clone()),
        None => Instr::die(Defect::message("race winner has a different result type")),
    }
}

impl<A: Send + 'static, E: Data> Effect<Vec<A>, E> {
    /// Run every effect and collect the results in input order. The first
    /// failure interrupts whatever is still running and effects not yet
    /// started never begin.
    pub fn all(effects: impl IntoIterator<Item = Effect<A, E>>, concurrency: Concurrency) -> Self {
        let tasks: Vec<Task> = effects.into_iter().map(task).collect();
        Effect::from_fn(move || {
            gather(tasks.clone(), concurrency).on_success(|v| {
                let values: Vec<A> = take::<Vec<Value>>(v).into_iter().map(take::<A>).collect();
                Instr::succeed(values)
            })
        })
    }

    pub fn for_each<T>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<A, E>,
        concurrency: Concurrency,
    ) -> Self {
        Self::all(items.into_iter().map(f), concurrency)
    }
}

impl<E: Data> Effect<(), E> {
    pub fn all_discard<A: Send + 'static>(
        effects: impl IntoIterator<Item = Effect<A, E>>,
        concurrency: Concurrency,
    ) -> Self {
        Effect::<Vec<A>, E>::all(effects, concurrency).as_unit()
    }
}

impl<A: Data, E: Data, E2: Data> Effect<Vec<Result<A, E>>, E2> {
    /// Run every effect to completion, keeping each expected failure in
    /// place. Defects and interruption still short-circuit.
    pub fn all_either(effects: impl IntoIterator<Item = Effect<A, E>>, concurrency: Concurrency) -> Self {
        Self::all(effects.into_iter().map(|e| e.either::<E2>()), concurrency)
    }
}

impl<A: Data, E: Data> Effect<Vec<A>, Vec<Option<E>>> {
    /// Run everything. If anything failed, fail with one marker per input:
    /// `Some(error)` where it failed, `None` where it succeeded.
    pub fn all_validate(effects: impl IntoIterator<Item = Effect<A, E>>, concurrency: Concurrency) -> Self {
        Effect::<Vec<Result<A, E>>, Vec<Option<E>>>::all_either(effects, concurrency).flat_map(|results| {
            if results.iter().all(Result::is_ok) {
                Effect::succeed(results.into_iter().filter_map(Result::ok).collect())
            } else {
                Effect::fail(results.into_iter().map(Result::err).collect())
            }
        })
    }
}

impl<A: Data, E: Data> Effect<Vec<A>, Vec<E>> {
    /// Apply `f` to every item; fail with all the errors if any failed.
    pub fn validate_all<T>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<A, E>,
        concurrency: Concurrency,
    ) -> Self {
        Effect::<Vec<Result<A, E>>, Vec<E>>::all_either(items.into_iter().map(f), concurrency).flat_map(|results| {
            let mut values = Vec::new();
            let mut errors = Vec::new();
            for r in results {
                match r {
                    Ok(a) => values.push(a),
                    Err(e) => errors.push(e),
                }
            }
            if errors.is_empty() {
                Effect::succeed(values)
            } else {
                Effect::fail(errors)
            }
        })
    }
}

impl<A: Data, E: Data> Effect<A, Vec<E>> {
    /// The first success of `f` over the items, or every error.
    pub fn validate_first<T>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<A, E>,
        concurrency: Concurrency,
    ) -> Self {
        Effect::<Vec<E>, A>::all(items.into_iter().map(|item| f(item).flip()), concurrency).flip()
    }
}

impl<A: Data, E: Data, E2: Data> Effect<(Vec<E>, Vec<A>), E2> {
    /// Split the outcomes of `f` into failures and successes.
    pub fn partition<T>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<A, E>,
        concurrency: Concurrency,
    ) -> Self {
        Effect::<Vec<Result<A, E>>, E2>::all_either(items.into_iter().map(f), concurrency).map(|results| {
            let mut errors = Vec::new();
            let mut values = Vec::new();
            for r in results {
                match r {
                    Ok(a) => values.push(a),
                    Err(e) => errors.push(e),
                }
            }
            (errors, values)
        })
    }
}

impl<A: Send + 'static, E: Data> Effect<A, E> {
    /// Default for `Concurrency::Inherit` inside this effect.
    pub fn with_concurrency(&self, concurrency: Concurrency) -> Self {
        self.provide_service(concurrency)
    }

    /// Run both at once and combine. If one side fails the other is
    /// interrupted; failures of both sides are merged in parallel.
    pub fn zip_with_par<B: Send + 'static, C: Send + 'static>(
        &self,
        that: &Effect<B, E>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Effect<C, E> {
        let tasks = vec![task(self.clone()), task(that.clone())];
        let f = Arc::new(f);
        Effect::from_fn(move || {
            let f = f.clone();
            gather(tasks.clone(), Concurrency::Unbounded).on_success(move |v| {
                let mut values = take::<Vec<Value>>(v);
                match (values.pop(), values.pop()) {
                    (Some(b), Some(a)) => Instr::succeed(f(take::<A>(a), take::<B>(b))),
                    _ => Instr::die(Defect::message("zip_par lost a result")),
                }
            })
        })
    }

    pub fn zip_par<B: Send + 'static>(&self, that: &Effect<B, E>) -> Effect<(A, B), E> {
        self.zip_with_par(that, |a, b| (a, b))
    }
}

impl<A: Data, E: Data> Effect<A, E> {
    fn race_with(effects: Vec<Effect<A, E>>, first_exit: bool) -> Self {
        let starts: Vec<Task> = effects.into_iter().map(shared_task).collect();
        Effect::from_fn(move || race(starts.clone(), first_exit).on_success(unshare::<A>))
    }

    /// First success wins and the loser is interrupted. Fails only if
    /// both fail, with both causes.
    pub fn race(&self, that: &Effect<A, E>) -> Self {
        Self::race_with(vec![self.clone(), that.clone()], false)
    }

    /// First exit wins, success or failure.
    pub fn race_first(&self, that: &Effect<A, E>) -> Self {
        Self::race_with(vec![self.clone(), that.clone()], true)
    }

    pub fn race_all(effects: impl IntoIterator<Item = Effect<A, E>>) -> Self {
        let effects: Vec<Effect<A, E>> = effects.into_iter().collect();
        if effects.is_empty() {
            return Effect::die_message("race_all needs at least one effect");
        }
        Self::race_with(effects, false)
    }

    /// `on_timeout` if `duration` passes first, `on_success` of the value
    /// otherwise. The slower side is interrupted and awaited.
    pub fn timeout_to<B: Data>(
        &self,
        duration: Duration,
        on_timeout: B,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<B, E> {
        let finished = self.map(on_success);
        let expired = Effect::<(), E>::sleep(duration).as_(on_timeout);
        finished.race_first(&expired)
    }

    pub fn timeout_option(&self, duration: Duration) -> Effect<Option<A>, E> {
        self.timeout_to(duration, None, Some)
    }

    pub fn timeout(&self, duration: Duration) -> Self
    where
        E: From<TimeoutError>,
    {
        self.timeout_fail(duration, TimeoutError.into())
    }

    pub fn timeout_fail(&self, duration: Duration, error: E) -> Self {
        self.timeout_fail_cause(duration, Cause::fail(error))
    }

    pub fn timeout_fail_cause(&self, duration: Duration, cause: Cause<E>) -> Self {
        self.timeout_option(duration).flat_map(move |found| match found {
            Some(a) => Effect::succeed(a),
            None => Effect::fail_cause(cause.clone()),
        })
    }

    /// Run on a detached fiber. Interrupting the caller returns at once
    /// and leaves the detached fiber to wind down on its own.
    pub fn disconnect(&self) -> Self {
        let inner = self.clone();
        Effect::uninterruptible_mask(move |restore| {
            restore.apply(&inner).fork_daemon::<E>().flat_map(move |fiber| {
                let target = fiber.clone();
                restore
                    .apply(&fiber.join())
                    .on_interrupt(move |_| target.interrupt_fork())
            })
        })
    }
}
