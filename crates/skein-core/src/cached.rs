// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Memoized effects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::deferred::Deferred;
use crate::effect::{Data, Effect};

impl<A: Send + 'static, E: Data> Effect<A, E> {
    /// An effect that runs this one the first time it is run and does
    /// nothing afterwards.
    pub fn once<E2: Data>(&self) -> Effect<Effect<(), E>, E2> {
        let inner = self.as_unit();
        Effect::sync(move || {
            let ran = Arc::new(AtomicBool::new(false));
            let inner = inner.clone();
            Effect::suspend(move || {
                if ran.swap(true, Ordering::SeqCst) {
                    Effect::unit()
                } else {
                    inner.clone()
                }
            })
        })
    }
}

impl<A: Data, E: Data> Effect<A, E> {
    /// An effect that runs this one once and replays its exit to every
    /// later caller, concurrent ones included.
    pub fn cached<E2: Data>(&self) -> Effect<Effect<A, E>, E2> {
        let inner = self.clone();
        Effect::sync(move || {
            let cell: Deferred<A, E> = Deferred::new();
            let started = Arc::new(AtomicBool::new(false));
            let inner = inner.clone();
            Effect::suspend(move || {
                if started.swap(true, Ordering::SeqCst) {
                    cell.await_()
                } else {
                    cell.complete::<E>(&inner).zip_right(&cell.await_())
                }
            })
        })
    }

    /// Like `cached`, but the stored exit expires `ttl` of clock time
    /// after it was computed.
    pub fn cached_with_ttl<E2: Data>(&self, ttl: Duration) -> Effect<Effect<A, E>, E2> {
        let inner = self.clone();
        Effect::sync(move || {
            let slot: Arc<Mutex<Option<(Duration, Deferred<A, E>)>>> = Arc::new(Mutex::new(None));
            let inner = inner.clone();
            Effect::<Duration, E>::clock_now().flat_map(move |now| {
                let mut current = slot.lock().unwrap();
                let fresh = match &*current {
                    Some((expires, cell)) if now < *expires => Some(cell.clone()),
                    _ => None,
                };
                match fresh {
                    Some(cell) => cell.await_(),
                    None => {
                        let cell = Deferred::new();
                        *current = Some((now + ttl, cell.clone()));
                        drop(current);
                        cell.complete::<E>(&inner).zip_right(&cell.await_())
                    }
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::runtime::{Runtime, RuntimeConfig};
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    fn counted() -> (Arc<AtomicUsize>, Effect<usize, String>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        (runs, Effect::sync(move || r.fetch_add(1, Ordering::SeqCst) + 1))
    }

    #[test]
    fn once_runs_a_single_time() {
        let rt = Runtime::new();
        let (runs, eff) = counted();
        let twice: Effect<(), String> = eff
            .once()
            .flat_map(|once| once.zip_right(&once).zip_right(&once));
        rt.run_sync(&twice).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        rt.run_sync(&twice).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cached_replays_to_concurrent_callers() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(4));
        let (runs, eff) = counted();
        let slow = eff.delay(Duration::from_millis(20));
        let all: Effect<Vec<usize>, String> = slow.cached().flat_map(|cached| {
            Effect::all(vec![cached.clone(); 5], crate::concurrent::Concurrency::Unbounded)
        });
        assert_eq!(rt.run_blocking(&all), Ok(vec![1; 5]));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cached_failures_are_replayed_too() {
        let rt = Runtime::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let failing: Effect<u8, String> = Effect::try_sync(move || {
            r.fetch_add(1, Ordering::SeqCst);
            Err("nope".to_string())
        });
        let eff: Effect<(bool, bool), Infallible> = failing
            .cached()
            .flat_map(|c| c.either().zip(&c.either()).map(|(a, b)| (a.is_err(), b.is_err())));
        assert_eq!(rt.run_sync(&eff), Ok((true, true)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ttl_expires_with_clock_time() {
        let rt = Runtime::new();
        let clock = TestClock::new();
        let (runs, eff) = counted();
        let reads: Effect<Vec<usize>, String> = eff
            .cached_with_ttl(Duration::from_secs(10))
            .flat_map({
                let clock = clock.clone();
                move |cached| {
                    cached
                        .zip(&clock.adjust(Duration::from_secs(5)).zip_right(&cached))
                        .zip(&clock.adjust(Duration::from_secs(6)).zip_right(&cached))
                        .map(|((a, b), c)| vec![a, b, c])
                }
            })
            .with_clock(clock.as_clock());
        assert_eq!(rt.run_sync(&reads), Ok(vec![1, 1, 2]));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
