// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Counting semaphore for fibers.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use skein_core::{Callback, Canceler, Data, Effect};

struct Waiter {
    id: u64,
    permits: usize,
    granted: Arc<AtomicBool>,
    cb: Callback<(), Infallible>,
}

struct State {
    available: usize,
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

impl State {
    /// Hand permits to waiters in arrival order. A waiter at the front that
    /// needs more than is available blocks everyone behind it.
    fn grant(&mut self) {
        while let Some(front) = self.waiters.front() {
            if front.permits > self.available {
                break;
            }
            let Some(w) = self.waiters.pop_front() else {
                break;
            };
            self.available -= w.permits;
            w.granted.store(true, Ordering::SeqCst);
            if w.cb.try_succeed(()).is_err() {
                w.granted.store(false, Ordering::SeqCst);
                self.available += w.permits;
            }
        }
    }
}

/// A fixed pool of permits. Fibers that ask for more than is available
/// wait in FIFO order.
#[derive(Clone)]
pub struct Semaphore {
    permits: usize,
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock().unwrap();
        f.debug_struct("Semaphore")
            .field("permits", &self.permits)
            .field("available", &st.available)
            .field("waiting", &st.waiters.len())
            .finish()
    }
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits,
            state: Arc::new(Mutex::new(State {
                available: permits,
                waiters: VecDeque::new(),
                next_id: 0,
            })),
        }
    }

    pub fn make<E: Data>(permits: usize) -> Effect<Semaphore, E> {
        Effect::sync(move || Semaphore::new(permits))
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    pub fn available_now(&self) -> usize {
        self.state.lock().unwrap().available
    }

    pub fn available<E: Data>(&self) -> Effect<usize, E> {
        let this = self.clone();
        Effect::sync(move || this.available_now())
    }

    /// Take `n` permits if they are free and nobody is queued ahead.
    pub fn try_take_now(&self, n: usize) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.waiters.is_empty() && st.available >= n {
            st.available -= n;
            true
        } else {
            false
        }
    }

    /// Take `n` permits, waiting until they are free. Dies when `n`
    /// exceeds the total.
    pub fn take<E: Data>(&self, n: usize) -> Effect<(), E> {
        if n > self.permits {
            return Effect::die_message(format!(
                "cannot take {n} permits from a semaphore of {}",
                self.permits
            ));
        }
        let this = self.clone();
        Effect::<(), Infallible>::suspend(move || {
            // Set once permits are handed over, so an interruption that
            // lands after the hand-off still gives them back.
            let granted = Arc::new(AtomicBool::new(false));
            let (waiting, flag) = (this.clone(), granted.clone());
            let returning = this.clone();
            Effect::<(), Infallible>::async_callback(move |cb| waiting.take_or_wait(n, flag.clone(), cb))
                .on_interrupt(move |_| {
                    let (granted, sem) = (granted.clone(), returning.clone());
                    Effect::sync(move || {
                        if granted.swap(false, Ordering::SeqCst) {
                            sem.release_now(n);
                        }
                    })
                })
        })
        .widen()
    }

    fn take_or_wait(&self, n: usize, granted: Arc<AtomicBool>, cb: Callback<(), Infallible>) -> Option<Canceler> {
        let mut st = self.state.lock().unwrap();
        if st.waiters.is_empty() && st.available >= n {
            st.available -= n;
            granted.store(true, Ordering::SeqCst);
            drop(st);
            cb.succeed(());
            return None;
        }
        let id = st.next_id;
        st.next_id += 1;
        st.waiters.push_back(Waiter {
            id,
            permits: n,
            granted,
            cb,
        });
        let state = self.state.clone();
        Some(Box::new(move || {
            let mut st = state.lock().unwrap();
            st.waiters.retain(|w| w.id != id);
            st.grant();
        }))
    }

    /// Return `n` permits and wake whoever now fits.
    pub fn release_now(&self, n: usize) {
        let mut st = self.state.lock().unwrap();
        st.available = (st.available + n).min(self.permits);
        st.grant();
    }

    pub fn release<E: Data>(&self, n: usize) -> Effect<(), E> {
        let this = self.clone();
        Effect::sync(move || this.release_now(n))
    }

    /// Run `effect` holding `n` permits. They are returned however the
    /// effect ends.
    pub fn with_permits<A: Send + 'static, E: Data>(&self, n: usize, effect: &Effect<A, E>) -> Effect<A, E> {
        let (this, effect) = (self.clone(), effect.clone());
        Effect::uninterruptible_mask(move |restore| {
            restore
                .apply(&this.take(n))
                .zip_right(&restore.apply(&effect).ensuring(&this.release(n)))
        })
    }

    pub fn with_permit<A: Send + 'static, E: Data>(&self, effect: &Effect<A, E>) -> Effect<A, E> {
        self.with_permits(1, effect)
    }
}
