// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-shot synchronization cell.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::cause::{Cause, Defect};
use crate::effect::{Data, Effect};
use crate::exit::Exit;
use crate::fiber::{Callback, Canceler};
use crate::instr::Instr;

enum State<A, E> {
    Pending {
        next_id: u64,
        waiters: Vec<(u64, Callback<A, E>)>,
    },
    Done(Exit<A, E>),
}

/// A value that is set exactly once. Every `await_` sees the same exit.
pub struct Deferred<A, E> {
    state: Arc<Mutex<State<A, E>>>,
}

impl<A, E> Clone for Deferred<A, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<A: Data, E: Data> Default for Deferred<A, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, E> fmt::Debug for Deferred<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(*self.state.lock().unwrap(), State::Done(_));
        f.debug_struct("Deferred").field("done", &done).finish()
    }
}

impl<A: Data, E: Data> Deferred<A, E> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending {
                next_id: 0,
                waiters: Vec::new(),
            })),
        }
    }

    /// A fresh deferred each time the effect runs.
    pub fn make<E2: Data>() -> Effect<Deferred<A, E>, E2> {
        Effect::sync(Deferred::new)
    }

    /// Complete right away. False if already completed.
    pub fn try_complete(&self, exit: Exit<A, E>) -> bool {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending { waiters, .. } => {
                    let waiters = std::mem::take(waiters);
                    *state = State::Done(exit.clone());
                    waiters
                }
            }
        };
        for (_, waiter) in waiters {
            waiter.done(exit.clone());
        }
        true
    }

    pub fn done<E2: Data>(&self, exit: Exit<A, E>) -> Effect<bool, E2> {
        let this = self.clone();
        Effect::sync(move || this.try_complete(exit.clone()))
    }

    pub fn succeed<E2: Data>(&self, value: A) -> Effect<bool, E2> {
        self.done(Exit::Success(value))
    }

    pub fn fail<E2: Data>(&self, error: E) -> Effect<bool, E2> {
        self.done(Exit::fail(error))
    }

    pub fn fail_cause<E2: Data>(&self, cause: Cause<E>) -> Effect<bool, E2> {
        self.done(Exit::Failure(cause))
    }

    pub fn die<E2: Data>(&self, defect: impl Into<Defect>) -> Effect<bool, E2> {
        self.done(Exit::die(defect))
    }

    /// Complete with an interruption by the calling fiber.
    pub fn interrupt<E2: Data>(&self) -> Effect<bool, E2> {
        let this = self.clone();
        Effect::from_fn(move || {
            let this = this.clone();
            Instr::with_fiber(move |st| Instr::succeed(this.try_complete(Exit::interrupt(st.id))))
        })
    }

    /// Run `effect` and complete with its exit, interruption included.
    pub fn complete<E2: Data>(&self, effect: &Effect<A, E>) -> Effect<bool, E2> {
        let (this, effect) = (self.clone(), effect.clone());
        Effect::uninterruptible_mask(move |restore| {
            let this = this.clone();
            restore
                .apply(&effect)
                .exit::<E2>()
                .map(move |exit| this.try_complete(exit))
        })
    }

    /// Suspend until completed, then succeed or fail with the stored exit.
    pub fn await_(&self) -> Effect<A, E> {
        let this = self.clone();
        Effect::suspend(move || match this.poll_now() {
            Some(exit) => Effect::from_exit(exit),
            None => this.wait(),
        })
    }

    fn wait(&self) -> Effect<A, E> {
        let this = self.clone();
        Effect::async_callback(move |cb: Callback<A, E>| -> Option<Canceler> {
            let mut state = this.state.lock().unwrap();
            let id = match &mut *state {
                State::Done(exit) => Err(exit.clone()),
                State::Pending { next_id, waiters } => {
                    let id = *next_id;
                    *next_id += 1;
                    waiters.push((id, cb.clone()));
                    Ok(id)
                }
            };
            drop(state);
            match id {
                Err(exit) => {
                    cb.done(exit);
                    None
                }
                Ok(id) => {
                    let cell = this.state.clone();
                    Some(Box::new(move || {
                        if let State::Pending { waiters, .. } = &mut *cell.lock().unwrap() {
                            waiters.retain(|(w, _)| *w != id);
                        }
                    }))
                }
            }
        })
    }

    pub fn poll<E2: Data>(&self) -> Effect<Option<Exit<A, E>>, E2> {
        let this = self.clone();
        Effect::sync(move || this.poll_now())
    }

    pub fn poll_now(&self) -> Option<Exit<A, E>> {
        match &*self.state.lock().unwrap() {
            State::Done(exit) => Some(exit.clone()),
            State::Pending { .. } => None,
        }
    }

    pub fn is_done<E2: Data>(&self) -> Effect<bool, E2> {
        let this = self.clone();
        Effect::sync(move || this.poll_now().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};
    use std::convert::Infallible;
    use std::time::Duration;

    #[test]
    fn first_completion_wins() {
        let rt = Runtime::new();
        let d: Deferred<i32, String> = Deferred::new();
        let eff: Effect<(bool, bool, i32), String> = d
            .succeed(1)
            .zip(&d.succeed(2))
            .zip_with(&d.await_(), |(a, b), v| (a, b, v));
        assert_eq!(rt.run_sync(&eff), Ok((true, false, 1)));
        assert_eq!(rt.run_sync(&d.await_()), Ok(1));
    }

    #[test]
    fn waiters_all_see_the_same_exit() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(2));
        let d: Deferred<i32, String> = Deferred::new();
        let waiter = d.await_();
        let eff: Effect<Vec<i32>, String> = waiter
            .fork()
            .zip(&waiter.fork())
            .flat_map({
                let d = d.clone();
                move |(f1, f2)| {
                    Effect::<(), String>::sleep(Duration::from_millis(10))
                        .zip_right(&d.fail("boom".to_string()))
                        .zip_right(&f1.await_exit())
                        .zip(&f2.await_exit())
                        .map(|(a, b)| {
                            assert_eq!(a, b);
                            vec![a.is_failure() as i32]
                        })
                }
            });
        assert_eq!(rt.run_blocking(&eff), Ok(vec![1]));
    }

    #[test]
    fn interrupted_waiter_is_removed() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(2));
        let d: Deferred<(), Infallible> = Deferred::new();
        let fiber = rt.run_fork(&d.await_());
        std::thread::sleep(Duration::from_millis(10));
        let interrupt: Effect<_, Infallible> = fiber.interrupt();
        assert!(rt.run_blocking(&interrupt).unwrap().is_interrupted());
        match &*d.state.lock().unwrap() {
            State::Pending { waiters, .. } => assert!(waiters.is_empty()),
            State::Done(_) => panic!("deferred should still be pending"),
        };
    }
}
