// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Retry and repeat driven by a [`Schedule`].

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use skein_core::{Data, Effect};

use crate::schedule::{Decision, Driver, Schedule};

/// Recurrence combinators for effects.
///
/// Every run of the returned effect starts a fresh driver, so the same
/// effect can be retried or repeated any number of times.
pub trait ScheduleExt<A, E> {
    /// Run again after each expected failure while `policy` continues,
    /// feeding it the error. Once it stops, fail with the last error.
    /// Defects and interruption are never retried.
    fn retry<Out: Data>(&self, policy: &Schedule<E, Out>) -> Effect<A, E>;

    /// Like `retry`, but once the policy stops, recover with `fallback`
    /// given the last error and the policy's final output.
    fn retry_or_else<Out: Data, E2: Data>(
        &self,
        policy: &Schedule<E, Out>,
        fallback: impl Fn(E, Out) -> Effect<A, E2> + Send + Sync + 'static,
    ) -> Effect<A, E2>;

    /// Retry at most `times` times, without delay.
    fn retry_n(&self, times: u64) -> Effect<A, E>;

    /// Retry, without delay, as long as the error satisfies `pred`.
    fn retry_while(&self, pred: impl Fn(&E) -> bool + Send + Sync + 'static) -> Effect<A, E>;

    /// Retry, without delay, until the error satisfies `pred`.
    fn retry_until(&self, pred: impl Fn(&E) -> bool + Send + Sync + 'static) -> Effect<A, E>;

    /// Run once, then again after each success while `policy` continues,
    /// feeding it the value. Succeeds with the policy's final output.
    /// The first failure ends the repetition.
    fn repeat<Out: Data>(&self, policy: &Schedule<A, Out>) -> Effect<Out, E>;

    /// Like `repeat`, but a failure is handed to `fallback` along with the
    /// latest policy output, if the policy has been stepped yet.
    fn repeat_or_else<Out: Data, E2: Data>(
        &self,
        policy: &Schedule<A, Out>,
        fallback: impl Fn(E, Option<Out>) -> Effect<Out, E2> + Send + Sync + 'static,
    ) -> Effect<Out, E2>;

    /// Run once and then `times` more times. Succeeds with the last value.
    fn repeat_n(&self, times: u64) -> Effect<A, E>;

    /// Step `policy` before every run, starting before the first one.
    /// Succeeds with the policy's final output.
    fn schedule<Out: Data>(&self, policy: &Schedule<(), Out>) -> Effect<Out, E>;

    /// Run again after each success, forever. Only a failure ends it.
    fn forever(&self) -> Effect<Infallible, E>;
}

fn pause<E: Data>(delay: Duration) -> Effect<(), E> {
    if delay.is_zero() {
        Effect::unit()
    } else {
        Effect::sleep(delay)
    }
}

/// Step `driver` with the current clock time.
fn step_now<In: Data, Out: Data, E: Data>(driver: &Driver<In, Out>, input: In) -> Effect<Decision<Out>, E> {
    let driver = driver.clone();
    Effect::<Duration, E>::clock_now().flat_map(move |now| driver.step(now, input.clone()).widen())
}

type Fallback<A, E, Out, E2> = Arc<dyn Fn(E, Out) -> Effect<A, E2> + Send + Sync>;

fn retry_loop<A: Data, E: Data, Out: Data, E2: Data>(
    effect: Effect<A, E>,
    driver: Driver<E, Out>,
    fallback: Fallback<A, E, Out, E2>,
) -> Effect<A, E2> {
    let attempt = effect.clone();
    attempt.catch_all(move |error| {
        let (effect, driver, fallback) = (effect.clone(), driver.clone(), fallback.clone());
        let last = error.clone();
        step_now(&driver, error).flat_map(move |decision| match decision {
            Decision::Continue { delay, .. } => {
                tracing::trace!(?delay, "retrying after failure");
                pause(delay).zip_right(&retry_loop(effect.clone(), driver.clone(), fallback.clone()))
            }
            Decision::Done { output } => fallback(last.clone(), output),
        })
    })
}

type RepeatFallback<Out, E, E2> = Arc<dyn Fn(E, Option<Out>) -> Effect<Out, E2> + Send + Sync>;

fn repeat_loop<A: Data, E: Data, Out: Data, E2: Data>(
    effect: Effect<A, E>,
    driver: Driver<A, Out>,
    last: Option<Out>,
    fallback: RepeatFallback<Out, E, E2>,
) -> Effect<Out, E2> {
    let (next, on_failure) = (effect.clone(), fallback.clone());
    effect.match_effect(
        move |error| on_failure(error, last.clone()),
        move |value| {
            let (next, driver, fallback) = (next.clone(), driver.clone(), fallback.clone());
            step_now(&driver, value).flat_map(move |decision| match decision {
                Decision::Continue { output, delay } => pause(delay).zip_right(&repeat_loop(
                    next.clone(),
                    driver.clone(),
                    Some(output),
                    fallback.clone(),
                )),
                Decision::Done { output } => Effect::succeed(output),
            })
        },
    )
}

fn schedule_loop<A: Data, E: Data, Out: Data>(effect: Effect<A, E>, driver: Driver<(), Out>) -> Effect<Out, E> {
    step_now(&driver, ()).flat_map(move |decision| match decision {
        Decision::Continue { delay, .. } => pause(delay)
            .zip_right(&effect)
            .zip_right(&schedule_loop(effect.clone(), driver.clone())),
        Decision::Done { output } => Effect::succeed(output),
    })
}

impl<A: Data, E: Data> ScheduleExt<A, E> for Effect<A, E> {
    fn retry<Out: Data>(&self, policy: &Schedule<E, Out>) -> Effect<A, E> {
        self.retry_or_else(policy, |error, _| Effect::fail(error))
    }

    fn retry_or_else<Out: Data, E2: Data>(
        &self,
        policy: &Schedule<E, Out>,
        fallback: impl Fn(E, Out) -> Effect<A, E2> + Send + Sync + 'static,
    ) -> Effect<A, E2> {
        let (effect, policy) = (self.clone(), policy.clone());
        let fallback: Fallback<A, E, Out, E2> = Arc::new(fallback);
        Effect::suspend(move || retry_loop(effect.clone(), policy.driver(), fallback.clone()))
    }

    fn retry_n(&self, times: u64) -> Effect<A, E> {
        self.retry(&Schedule::recurs(times))
    }

    fn retry_while(&self, pred: impl Fn(&E) -> bool + Send + Sync + 'static) -> Effect<A, E> {
        self.retry(&Schedule::forever().while_input(pred))
    }

    fn retry_until(&self, pred: impl Fn(&E) -> bool + Send + Sync + 'static) -> Effect<A, E> {
        self.retry(&Schedule::forever().until_input(pred))
    }

    fn repeat<Out: Data>(&self, policy: &Schedule<A, Out>) -> Effect<Out, E> {
        self.repeat_or_else(policy, |error, _| Effect::fail(error))
    }

    fn repeat_or_else<Out: Data, E2: Data>(
        &self,
        policy: &Schedule<A, Out>,
        fallback: impl Fn(E, Option<Out>) -> Effect<Out, E2> + Send + Sync + 'static,
    ) -> Effect<Out, E2> {
        let (effect, policy) = (self.clone(), policy.clone());
        let fallback: RepeatFallback<Out, E, E2> = Arc::new(fallback);
        Effect::suspend(move || repeat_loop(effect.clone(), policy.driver(), None, fallback.clone()))
    }

    fn repeat_n(&self, times: u64) -> Effect<A, E> {
        let policy = Schedule::identity()
            .intersect(&Schedule::recurs(times))
            .map(|(last, _)| last);
        self.repeat(&policy)
    }

    fn schedule<Out: Data>(&self, policy: &Schedule<(), Out>) -> Effect<Out, E> {
        let (effect, policy) = (self.clone(), policy.clone());
        Effect::suspend(move || schedule_loop(effect.clone(), policy.driver()))
    }

    fn forever(&self) -> Effect<Infallible, E> {
        let this = self.clone();
        Effect::suspend(move || this.zip_right(&this.forever()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::{Cause, Concurrency, Ref, Runtime, RuntimeConfig, TestClock};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with the attempt number until attempt `succeed_on`.
    fn flaky(succeed_on: u32) -> (Arc<AtomicU32>, Effect<&'static str, u32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let effect = Effect::try_sync(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= succeed_on {
                Ok("yay")
            } else {
                Err(n)
            }
        });
        (calls, effect)
    }

    fn counting() -> (Arc<AtomicU32>, Effect<u32, String>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        (calls, Effect::sync(move || counter.fetch_add(1, Ordering::SeqCst) + 1))
    }

    #[test]
    fn retry_recurs_two_succeeds_on_third_call() {
        let rt = Runtime::new();
        let (calls, effect) = flaky(3);
        assert_eq!(rt.run_sync(&effect.retry(&Schedule::recurs(2))), Ok("yay"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausted_retry_fails_with_the_last_error() {
        let rt = Runtime::new();
        let (calls, effect) = flaky(10);
        let exit = rt.run_sync_exit(&effect.retry_n(2));
        assert_eq!(exit.cause().and_then(|c| c.first_failure().copied()), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_or_else_recovers_once_exhausted() {
        let rt = Runtime::new();
        let (calls, effect) = flaky(10);
        let recovered: Effect<&'static str, String> =
            effect.retry_or_else(&Schedule::recurs(2), |last, tries| {
                assert_eq!((last, tries), (3, 2));
                Effect::succeed("default value")
            });
        assert_eq!(rt.run_sync(&recovered), Ok("default value"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_while_checks_each_error() {
        let rt = Runtime::new();
        let (calls, effect) = flaky(10);
        let exit = rt.run_sync_exit(&effect.retry_while(|n| *n < 4));
        assert_eq!(exit.cause().and_then(|c| c.first_failure().copied()), Some(4));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let (calls, effect) = flaky(10);
        assert!(rt.run_sync(&effect.retry_until(|n| *n == 2)).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn defects_are_not_retried() {
        let rt = Runtime::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let dying: Effect<(), String> = Effect::suspend(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Effect::die_message("broken")
        });
        let exit = rt.run_sync_exit(&dying.retry(&Schedule::forever()));
        assert!(exit.cause().is_some_and(Cause::is_die));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeat_returns_the_final_output() {
        let rt = Runtime::new();
        let (calls, effect) = counting();
        assert_eq!(rt.run_sync(&effect.repeat(&Schedule::recurs(2))), Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let (calls, effect) = counting();
        assert_eq!(rt.run_sync(&effect.repeat_n(4)), Ok(5));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn repeat_or_else_hands_over_the_failure() {
        let rt = Runtime::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let effect: Effect<&'static str, String> = Effect::try_sync(move || {
            if counter.fetch_add(1, Ordering::SeqCst) > 1 {
                Err("Uh oh!".to_string())
            } else {
                Ok("yay!")
            }
        });
        let program: Effect<u64, Infallible> =
            effect.repeat_or_else(&Schedule::recurs(5), |error, last| {
                assert_eq!(error, "Uh oh!");
                Effect::succeed(last.unwrap_or_default())
            });
        assert_eq!(rt.run_sync(&program), Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn schedule_steps_before_the_first_run() {
        let rt = Runtime::new();
        let (calls, effect) = counting();
        assert_eq!(rt.run_sync(&effect.schedule(&Schedule::recurs(2))), Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn forever_ends_only_on_failure() {
        let rt = Runtime::new();
        let count: Ref<u32> = Ref::new(0);
        let bump: Effect<(), String> = count.update_and_get(|n| n + 1).flat_map(|n| {
            if n == 50 {
                Effect::fail(format!("stopped at {n}"))
            } else {
                Effect::unit()
            }
        });
        let exit = rt.run_sync_exit(&bump.forever());
        assert_eq!(
            exit.cause().and_then(|c| c.first_failure().cloned()),
            Some("stopped at 50".to_string())
        );
    }

    #[test]
    fn retry_sleeps_between_attempts() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(2));
        let clock = TestClock::new();
        let (calls, effect) = flaky(3);
        let retried = effect.retry(&Schedule::spaced(Duration::from_secs(60)));
        let program: Effect<(&'static str, u32), u32> = retried
            .fork()
            .flat_map({
                let (clock, calls) = (clock.clone(), calls.clone());
                move |fiber| {
                    let calls = calls.clone();
                    clock
                        .await_sleepers(1)
                        .zip_right(&clock.adjust(Duration::from_secs(60)))
                        .zip_right(&clock.await_sleepers(1))
                        .zip_right(&Effect::sync(move || calls.load(Ordering::SeqCst)))
                        .zip_left(&clock.adjust(Duration::from_secs(60)))
                        .zip(&fiber.join())
                        .map(|(seen, value)| (value, seen))
                }
            })
            .with_clock(clock.as_clock());
        assert_eq!(rt.run_blocking(&program), Ok(("yay", 2)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn repeat_spaced_runs_on_clock_ticks() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(2));
        let clock = TestClock::new();
        let (calls, effect) = counting();
        let program: Effect<u32, String> = effect
            .repeat(&Schedule::spaced(Duration::from_secs(1)))
            .fork()
            .flat_map({
                let (clock, calls) = (clock.clone(), calls.clone());
                move |fiber| {
                    let calls = calls.clone();
                    let tick = clock.await_sleepers(1).zip_right(&clock.adjust(Duration::from_secs(1)));
                    Effect::all_discard(vec![tick; 4], Concurrency::Sequential)
                        .zip_right(&clock.await_sleepers(1))
                        .zip_right(&fiber.interrupt())
                        .zip_right(&Effect::sync(move || calls.load(Ordering::SeqCst)))
                }
            })
            .with_clock(clock.as_clock());
        assert_eq!(rt.run_blocking(&program), Ok(5));
    }
}
