// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Time capability.
//!
//! Fibers read time and sleep through the `Arc<dyn Clock>` in their
//! context. The runtime installs a `LiveClock` backed by the timer
//! thread; tests swap in a `TestClock` and move time by hand.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use skein_rt::Timer;

use crate::effect::{Data, Effect};
use crate::error::ServiceNotFound;
use crate::fiber::Canceler;
use crate::instr::Instr;

pub type Wake = Box<dyn FnOnce() + Send>;

pub trait Clock: Send + Sync + 'static {
    /// Current time as an offset from the clock's epoch.
    fn now(&self) -> Duration;

    /// Call `wake` once `delay` has passed. The canceler withdraws it.
    fn schedule(&self, delay: Duration, wake: Wake) -> Canceler;

    fn current_time_millis(&self) -> u64 {
        self.now().as_millis() as u64
    }
}

/// Real time, sleeps fired by the runtime's timer thread.
///
/// `now` is the wall time read at construction plus a monotonic offset,
/// so it reads as Unix time yet never jumps when the system clock is set.
pub struct LiveClock {
    timer: Arc<Timer>,
    started: Instant,
    wall_at_start: Duration,
}

impl LiveClock {
    pub fn new(timer: Arc<Timer>) -> Self {
        Self {
            timer,
            started: Instant::now(),
            wall_at_start: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default(),
        }
    }
}

impl Clock for LiveClock {
    fn now(&self) -> Duration {
        self.wall_at_start + self.started.elapsed()
    }

    fn schedule(&self, delay: Duration, wake: Wake) -> Canceler {
        let key = self.timer.schedule_after(delay, wake);
        let timer = self.timer.clone();
        Box::new(move || {
            timer.cancel(key);
        })
    }
}

impl fmt::Debug for LiveClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveClock").finish_non_exhaustive()
    }
}

struct Sleeper {
    id: u64,
    deadline: Duration,
    wake: Wake,
}

struct TestState {
    now: Duration,
    next_id: u64,
    sleepers: Vec<Sleeper>,
}

/// Virtual clock. Time starts at zero and only moves on `adjust` or
/// `set_time`; sleepers whose deadline is reached are woken in deadline
/// order.
#[derive(Clone)]
pub struct TestClock {
    state: Arc<Mutex<TestState>>,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TestState {
                now: Duration::ZERO,
                next_id: 0,
                sleepers: Vec::new(),
            })),
        }
    }

    pub fn as_clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clone())
    }

    /// Move time forward by `by` right away, from outside any fiber.
    pub fn adjust_now(&self, by: Duration) {
        let target = self.state.lock().unwrap().now + by;
        self.set_time_now(target);
    }

    /// Jump to `to`. Going backwards only moves `now`.
    pub fn set_time_now(&self, to: Duration) {
        let due = {
            let mut st = self.state.lock().unwrap();
            st.now = to;
            let (mut due, rest): (Vec<Sleeper>, Vec<Sleeper>) =
                st.sleepers.drain(..).partition(|s| s.deadline <= to);
            st.sleepers = rest;
            due.sort_by_key(|s| (s.deadline, s.id));
            due
        };
        for sleeper in due {
            (sleeper.wake)();
        }
    }

    /// Advance time and give woken fibers a chance to run.
    pub fn adjust<E: Data>(&self, by: Duration) -> Effect<(), E> {
        let clock = self.clone();
        Effect::sync(move || clock.adjust_now(by)).zip_right(&Effect::yield_now())
    }

    pub fn set_time<E: Data>(&self, to: Duration) -> Effect<(), E> {
        let clock = self.clone();
        Effect::sync(move || clock.set_time_now(to)).zip_right(&Effect::yield_now())
    }

    /// Deadlines of the fibers currently sleeping on this clock.
    pub fn sleepers(&self) -> Vec<Duration> {
        let st = self.state.lock().unwrap();
        let mut out: Vec<Duration> = st.sleepers.iter().map(|s| s.deadline).collect();
        out.sort();
        out
    }

    /// Yield until at least `n` fibers are asleep on this clock.
    pub fn await_sleepers<E: Data>(&self, n: usize) -> Effect<(), E> {
        let clock = self.clone();
        Effect::iterate(
            false,
            |ready| !*ready,
            move |_| {
                let clock = clock.clone();
                Effect::<(), E>::yield_now().map(move |_| clock.sleepers().len() >= n)
            },
        )
        .as_unit()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    fn schedule(&self, delay: Duration, wake: Wake) -> Canceler {
        let mut st = self.state.lock().unwrap();
        if delay.is_zero() {
            drop(st);
            wake();
            return Box::new(|| {});
        }
        let id = st.next_id;
        st.next_id += 1;
        let deadline = st.now + delay;
        st.sleepers.push(Sleeper { id, deadline, wake });
        let state = self.state.clone();
        Box::new(move || {
            state.lock().unwrap().sleepers.retain(|s| s.id != id);
        })
    }
}

impl fmt::Debug for TestClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock().unwrap();
        f.debug_struct("TestClock")
            .field("now", &st.now)
            .field("sleepers", &st.sleepers.len())
            .finish()
    }
}

fn with_clock(f: impl FnOnce(Arc<dyn Clock>) -> Instr + Send + 'static) -> Instr {
    Instr::with_fiber(move |st| match st.context.get::<Arc<dyn Clock>>() {
        Some(clock) => f(clock),
        None => Instr::die(ServiceNotFound {
            service: "dyn Clock",
        }),
    })
}

impl<E: Data> Effect<(), E> {
    /// Suspend the fiber for `duration` of clock time.
    pub fn sleep(duration: Duration) -> Self {
        Effect::from_fn(move || {
            with_clock(move |clock| {
                Instr::Async(Box::new(move |slot| {
                    let resume = slot.clone();
                    let wake: Wake = Box::new(move || {
                        resume.resume(Instr::unit());
                    });
                    Some(clock.schedule(duration, wake))
                }))
            })
        })
    }
}

impl<E: Data> Effect<Arc<dyn Clock>, E> {
    pub fn clock() -> Self {
        Effect::from_fn(|| with_clock(Instr::succeed))
    }
}

impl<E: Data> Effect<u64, E> {
    pub fn current_time_millis() -> Self {
        Effect::from_fn(|| with_clock(|c| Instr::succeed(c.current_time_millis())))
    }
}

impl<E: Data> Effect<Duration, E> {
    /// Clock time as an offset from the clock's epoch.
    pub fn clock_now() -> Self {
        Effect::from_fn(|| with_clock(|c| Instr::succeed(c.now())))
    }
}

impl<A: Send + 'static, E: Data> Effect<A, E> {
    pub fn with_clock(&self, clock: Arc<dyn Clock>) -> Self {
        self.provide_service(clock)
    }

    /// Wait `duration`, then run this effect.
    pub fn delay(&self, duration: Duration) -> Self {
        Effect::<(), E>::sleep(duration).zip_right(self)
    }

    /// Pair the result with how much clock time the effect took.
    pub fn timed(&self) -> Effect<(Duration, A), E> {
        let inner = self.clone();
        Effect::<Duration, E>::clock_now().flat_map(move |start| {
            inner.zip_with(&Effect::clock_now(), move |a, end| (end.saturating_sub(start), a))
        })
    }
}
