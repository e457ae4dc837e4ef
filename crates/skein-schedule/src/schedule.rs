// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Schedule descriptions, their drivers and combinators.

use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skein_core::{Data, Effect};

/// What a schedule decided for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<Out> {
    /// Recur after `delay`.
    Continue { output: Out, delay: Duration },
    /// Stop recurring.
    Done { output: Out },
}

impl<Out> Decision<Out> {
    pub fn output(&self) -> &Out {
        match self {
            Decision::Continue { output, .. } | Decision::Done { output } => output,
        }
    }

    pub fn into_output(self) -> Out {
        match self {
            Decision::Continue { output, .. } | Decision::Done { output } => output,
        }
    }

    /// The delay before the next attempt, `None` once done.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Decision::Continue { delay, .. } => Some(*delay),
            Decision::Done { .. } => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Decision::Done { .. })
    }

    /// The same output, but stop.
    pub fn finish(self) -> Self {
        Decision::Done {
            output: self.into_output(),
        }
    }

    pub fn map<B>(self, f: impl FnOnce(Out) -> B) -> Decision<B> {
        match self {
            Decision::Continue { output, delay } => Decision::Continue {
                output: f(output),
                delay,
            },
            Decision::Done { output } => Decision::Done { output: f(output) },
        }
    }

    fn with_delay(self, f: impl FnOnce(&Out, Duration) -> Duration) -> Self {
        match self {
            Decision::Continue { output, delay } => {
                let delay = f(&output, delay);
                Decision::Continue { output, delay }
            }
            done => done,
        }
    }
}

type StepFn<In, Out> = dyn Fn(Duration, In) -> Effect<Decision<Out>, Infallible> + Send + Sync;

/// One run of a schedule. Each call to `step` advances the driver's state
/// immediately; the returned effect performs whatever the step observes
/// (taps, random jitter, effectful predicates) and yields the decision.
pub struct Driver<In, Out> {
    step: Arc<StepFn<In, Out>>,
}

impl<In, Out> Clone for Driver<In, Out> {
    fn clone(&self) -> Self {
        Self {
            step: self.step.clone(),
        }
    }
}

impl<In: Data, Out: Data> Driver<In, Out> {
    pub fn from_fn(
        step: impl Fn(Duration, In) -> Effect<Decision<Out>, Infallible> + Send + Sync + 'static,
    ) -> Self {
        Self { step: Arc::new(step) }
    }

    /// Feed the clock time and the latest input.
    pub fn step(&self, now: Duration, input: In) -> Effect<Decision<Out>, Infallible> {
        (self.step)(now, input)
    }
}

/// A recurrence policy consuming `In` values and producing `Out` values.
pub struct Schedule<In, Out> {
    make: Arc<dyn Fn() -> Driver<In, Out> + Send + Sync>,
}

impl<In, Out> Clone for Schedule<In, Out> {
    fn clone(&self) -> Self {
        Self {
            make: self.make.clone(),
        }
    }
}

impl<In, Out> fmt::Debug for Schedule<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Schedule(<driver>)")
    }
}

impl<In: Data, Out: Data> Schedule<In, Out> {
    pub fn from_driver(make: impl Fn() -> Driver<In, Out> + Send + Sync + 'static) -> Self {
        Self { make: Arc::new(make) }
    }

    /// A schedule that threads `initial` through a pure step function.
    /// Every driver starts from its own copy of `initial`.
    pub fn stateful<S: Clone + Send + Sync + 'static>(
        initial: S,
        step: impl Fn(&mut S, Duration, &In) -> Decision<Out> + Send + Sync + 'static,
    ) -> Self {
        let step = Arc::new(step);
        Schedule::from_driver(move || {
            let state = Mutex::new(initial.clone());
            let step = step.clone();
            Driver::from_fn(move |now, input| {
                let mut state = state.lock().unwrap();
                Effect::succeed(step(&mut *state, now, &input))
            })
        })
    }

    /// A fresh driver positioned before the first step.
    pub fn driver(&self) -> Driver<In, Out> {
        (self.make)()
    }

    /// Step a fresh driver once per input at a fixed clock time and
    /// collect the outputs, stopping after the first `Done`.
    pub fn run<E: Data>(&self, now: Duration, inputs: impl IntoIterator<Item = In>) -> Effect<Vec<Out>, E> {
        fn go<In: Data, Out: Data>(
            driver: Driver<In, Out>,
            now: Duration,
            inputs: Arc<Vec<In>>,
            at: usize,
            acc: Vec<Out>,
        ) -> Effect<Vec<Out>, Infallible> {
            let Some(input) = inputs.get(at).cloned() else {
                return Effect::succeed(acc);
            };
            driver.step(now, input).flat_map({
                let driver = driver.clone();
                move |decision| {
                    let mut acc = acc.clone();
                    let done = decision.is_done();
                    acc.push(decision.into_output());
                    if done {
                        Effect::succeed(acc)
                    } else {
                        go(driver.clone(), now, inputs.clone(), at + 1, acc)
                    }
                }
            })
        }
        let this = self.clone();
        let inputs: Arc<Vec<In>> = Arc::new(inputs.into_iter().collect());
        Effect::<Vec<Out>, Infallible>::suspend(move || go(this.driver(), now, inputs.clone(), 0, Vec::new())).widen()
    }

    fn lift<O2: Data>(
        &self,
        wrap: impl Fn(Driver<In, Out>) -> Driver<In, O2> + Send + Sync + 'static,
    ) -> Schedule<In, O2> {
        let this = self.clone();
        Schedule::from_driver(move || wrap(this.driver()))
    }

    pub fn map<O2: Data>(&self, f: impl Fn(Out) -> O2 + Send + Sync + 'static) -> Schedule<In, O2> {
        let f = Arc::new(f);
        self.lift(move |inner| {
            let f = f.clone();
            Driver::from_fn(move |now, input| {
                let f = f.clone();
                inner.step(now, input).map(move |d| d.map(|o| f(o)))
            })
        })
    }

    /// Recur while either side recurs, using the shorter delay.
    pub fn union<O2: Data>(&self, that: &Schedule<In, O2>) -> Schedule<In, (Out, O2)> {
        self.combine(that, |left, right| match (left, right) {
            (Decision::Continue { output: a, delay: x }, Decision::Continue { output: b, delay: y }) => {
                Decision::Continue {
                    output: (a, b),
                    delay: x.min(y),
                }
            }
            (Decision::Continue { output: a, delay }, Decision::Done { output: b })
            | (Decision::Done { output: a }, Decision::Continue { output: b, delay }) => Decision::Continue {
                output: (a, b),
                delay,
            },
            (Decision::Done { output: a }, Decision::Done { output: b }) => Decision::Done { output: (a, b) },
        })
    }

    /// Recur only while both sides recur, using the longer delay.
    pub fn intersect<O2: Data>(&self, that: &Schedule<In, O2>) -> Schedule<In, (Out, O2)> {
        self.combine(that, |left, right| match (left, right) {
            (Decision::Continue { output: a, delay: x }, Decision::Continue { output: b, delay: y }) => {
                Decision::Continue {
                    output: (a, b),
                    delay: x.max(y),
                }
            }
            (left, right) => Decision::Done {
                output: (left.into_output(), right.into_output()),
            },
        })
    }

    fn combine<O2: Data>(
        &self,
        that: &Schedule<In, O2>,
        merge: fn(Decision<Out>, Decision<O2>) -> Decision<(Out, O2)>,
    ) -> Schedule<In, (Out, O2)> {
        let (left, right) = (self.clone(), that.clone());
        Schedule::from_driver(move || {
            let (l, r) = (left.driver(), right.driver());
            Driver::from_fn(move |now, input: In| {
                l.step(now, input.clone())
                    .zip(&r.step(now, input))
                    .map(move |(a, b)| merge(a, b))
            })
        })
    }

    /// Scale each delay by a random factor in `[0.8, 1.2)`.
    pub fn jittered(&self) -> Self {
        self.jittered_with(0.8, 1.2)
    }

    /// Scale each delay by a random factor in `[min, max)`, drawn from the
    /// fiber's `Random`.
    pub fn jittered_with(&self, min: f64, max: f64) -> Self {
        self.lift(move |inner| {
            Driver::from_fn(move |now, input| {
                inner.step(now, input).flat_map(move |decision| match decision {
                    Decision::Continue { output, delay } => {
                        Effect::<f64, Infallible>::random_with(move |r| r.next_f64_between(min, max)).map(
                            move |factor| Decision::Continue {
                                output: output.clone(),
                                delay: delay.mul_f64(factor.max(0.0)),
                            },
                        )
                    }
                    done => Effect::succeed(done),
                })
            })
        })
    }

    /// Stop as soon as an output fails `pred`.
    pub fn while_output(&self, pred: impl Fn(&Out) -> bool + Send + Sync + 'static) -> Self {
        let pred = Arc::new(pred);
        self.lift(move |inner| {
            let pred = pred.clone();
            Driver::from_fn(move |now, input| {
                let pred = pred.clone();
                inner.step(now, input).map(move |decision| match decision {
                    Decision::Continue { output, .. } if !pred(&output) => Decision::Done { output },
                    decision => decision,
                })
            })
        })
    }

    pub fn until_output(&self, pred: impl Fn(&Out) -> bool + Send + Sync + 'static) -> Self {
        self.while_output(move |o| !pred(o))
    }

    /// Stop as soon as an input fails `pred`.
    pub fn while_input(&self, pred: impl Fn(&In) -> bool + Send + Sync + 'static) -> Self {
        let pred = Arc::new(pred);
        self.lift(move |inner| {
            let pred = pred.clone();
            Driver::from_fn(move |now, input| {
                let keep = pred(&input);
                inner
                    .step(now, input)
                    .map(move |decision| if keep { decision } else { decision.finish() })
            })
        })
    }

    pub fn until_input(&self, pred: impl Fn(&In) -> bool + Send + Sync + 'static) -> Self {
        self.while_input(move |i| !pred(i))
    }

    /// Like `while_input`, with an effectful check.
    pub fn while_input_effect(
        &self,
        check: impl Fn(&In) -> Effect<bool, Infallible> + Send + Sync + 'static,
    ) -> Self {
        let check = Arc::new(check);
        self.lift(move |inner| {
            let check = check.clone();
            Driver::from_fn(move |now, input| {
                check(&input)
                    .zip(&inner.step(now, input))
                    .map(|(keep, decision)| if keep { decision } else { decision.finish() })
            })
        })
    }

    pub fn modify_delay(&self, f: impl Fn(&Out, Duration) -> Duration + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        self.lift(move |inner| {
            let f = f.clone();
            Driver::from_fn(move |now, input| {
                let f = f.clone();
                inner.step(now, input).map(move |d| d.with_delay(|o, delay| f(o, delay)))
            })
        })
    }

    pub fn add_delay(&self, f: impl Fn(&Out) -> Duration + Send + Sync + 'static) -> Self {
        self.modify_delay(move |o, delay| delay.saturating_add(f(o)))
    }

    /// Run `f` on every output. The decision is unchanged.
    pub fn tap_output(&self, f: impl Fn(&Out) -> Effect<(), Infallible> + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        self.lift(move |inner| {
            let f = f.clone();
            Driver::from_fn(move |now, input| {
                let f = f.clone();
                inner.step(now, input).tap(move |d| f(d.output()))
            })
        })
    }

    /// Run `f` on every input before stepping.
    pub fn tap_input(&self, f: impl Fn(&In) -> Effect<(), Infallible> + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        self.lift(move |inner| {
            let f = f.clone();
            Driver::from_fn(move |now, input| f(&input).zip_right(&inner.step(now, input)))
        })
    }

    /// Run this schedule to completion, then `that` one.
    pub fn and_then(&self, that: &Schedule<In, Out>) -> Self {
        let (first, second) = (self.clone(), that.clone());
        Schedule::from_driver(move || {
            let (a, b) = (first.driver(), second.driver());
            let switched = Arc::new(AtomicBool::new(false));
            Driver::from_fn(move |now, input: In| {
                if switched.load(Ordering::SeqCst) {
                    return b.step(now, input);
                }
                let (b, switched, again) = (b.clone(), switched.clone(), input.clone());
                a.step(now, input).flat_map(move |decision| match decision {
                    Decision::Done { .. } => {
                        switched.store(true, Ordering::SeqCst);
                        b.step(now, again.clone())
                    }
                    decision => Effect::succeed(decision),
                })
            })
        })
    }

    /// Feed this schedule's outputs into `that`. Recurs while both recur,
    /// using the longer delay.
    pub fn compose<O2: Data>(&self, that: &Schedule<Out, O2>) -> Schedule<In, O2> {
        let (left, right) = (self.clone(), that.clone());
        Schedule::from_driver(move || {
            let (l, r) = (left.driver(), right.driver());
            Driver::from_fn(move |now, input| {
                let r = r.clone();
                l.step(now, input).flat_map(move |first| {
                    let first_delay = first.delay();
                    r.step(now, first.into_output()).map(move |second| match (first_delay, second) {
                        (Some(x), Decision::Continue { output, delay }) => Decision::Continue {
                            output,
                            delay: x.max(delay),
                        },
                        (_, second) => second.finish(),
                    })
                })
            })
        })
    }

    /// Stop once `limit` of clock time has passed since the first step.
    pub fn up_to(&self, limit: Duration) -> Self {
        self.intersect(&Schedule::elapsed().while_output(move |e| *e < limit))
            .map(|(out, _)| out)
    }
}

impl<In: Data> Schedule<In, u64> {
    /// Recur without delay, forever. Outputs the step count.
    pub fn forever() -> Self {
        Self::spaced(Duration::ZERO)
    }

    /// Recur `times` more times without delay. Outputs the step count.
    pub fn recurs(times: u64) -> Self {
        Schedule::stateful(0u64, move |n, _, _| {
            let output = *n;
            *n += 1;
            if output < times {
                Decision::Continue {
                    output,
                    delay: Duration::ZERO,
                }
            } else {
                Decision::Done { output }
            }
        })
    }

    /// Recur forever, waiting `delay` after each attempt ends.
    pub fn spaced(delay: Duration) -> Self {
        Schedule::stateful(0u64, move |n, _, _| {
            let output = *n;
            *n += 1;
            Decision::Continue { output, delay }
        })
    }

    /// Recur on period boundaries anchored at the first step, so attempt
    /// duration does not stretch the period. An attempt that overruns a
    /// whole period is followed immediately.
    pub fn fixed(interval: Duration) -> Self {
        Schedule::stateful((None::<(Duration, Duration)>, 0u64), move |(window, n), now, _| {
            let output = *n;
            *n += 1;
            let delay = match *window {
                None => interval,
                Some((start, last_run)) => {
                    if interval.is_zero() || now > last_run.saturating_add(interval) {
                        Duration::ZERO
                    } else {
                        let into = now.saturating_sub(start).as_nanos() % interval.as_nanos();
                        interval - Duration::from_nanos(into as u64)
                    }
                }
            };
            let start = window.map_or(now, |(start, _)| start);
            *window = Some((start, now + delay));
            Decision::Continue { output, delay }
        })
    }
}

impl<In: Data> Schedule<In, Duration> {
    /// Delays of `base`, then doubling. Outputs the delay.
    pub fn exponential(base: Duration) -> Self {
        Self::exponential_with(base, 2.0)
    }

    pub fn exponential_with(base: Duration, factor: f64) -> Self {
        Schedule::stateful(0i32, move |n, _, _| {
            let nanos = (base.as_nanos() as f64 * factor.powi(*n)).round();
            let delay = if nanos < u64::MAX as f64 {
                Duration::from_nanos(nanos.max(0.0) as u64)
            } else {
                Duration::from_nanos(u64::MAX)
            };
            *n = n.saturating_add(1);
            Decision::Continue { output: delay, delay }
        })
    }

    /// Delays following the Fibonacci sequence scaled by `base`.
    pub fn fibonacci(base: Duration) -> Self {
        Schedule::stateful((base, base), |(current, next), _, _| {
            let delay = *current;
            let after = current.saturating_add(*next);
            *current = *next;
            *next = after;
            Decision::Continue { output: delay, delay }
        })
    }

    /// Delays of `base`, `2 * base`, `3 * base`, ...
    pub fn linear(base: Duration) -> Self {
        Schedule::stateful(1u32, move |n, _, _| {
            let delay = base.saturating_mul(*n);
            *n = n.saturating_add(1);
            Decision::Continue { output: delay, delay }
        })
    }

    /// Recur forever without delay, outputting the clock time elapsed
    /// since the first step.
    pub fn elapsed() -> Self {
        Schedule::stateful(None::<Duration>, |start, now, _| {
            let since = now.saturating_sub(*start.get_or_insert(now));
            Decision::Continue {
                output: since,
                delay: Duration::ZERO,
            }
        })
    }
}

impl<In: Data> Schedule<In, ()> {
    /// Recur exactly once.
    pub fn once() -> Self {
        Schedule::<In, u64>::recurs(1).map(|_| ())
    }

    /// Never recur.
    pub fn stop() -> Self {
        Schedule::<In, u64>::recurs(0).map(|_| ())
    }
}

impl<In: Data> Schedule<In, In> {
    /// Recur forever, passing each input through as the output.
    pub fn identity() -> Self {
        Schedule::from_driver(|| {
            Driver::from_fn(|_, input| {
                Effect::succeed(Decision::Continue {
                    output: input,
                    delay: Duration::ZERO,
                })
            })
        })
    }
}
