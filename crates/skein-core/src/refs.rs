// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared mutable reference with atomic updates.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::effect::{Data, Effect};

/// A cell shared between fibers. Every operation runs under the lock and
/// never suspends.
pub struct Ref<A> {
    cell: Arc<Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&*self.lock()).finish()
    }
}

impl<A> Ref<A> {
    /// The value is only replaced after an update closure returns, so a
    /// panic inside one leaves it intact and the poison can be ignored.
    fn lock(&self) -> MutexGuard<'_, A> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A: Data> Ref<A> {
    pub fn new(value: A) -> Self {
        Self {
            cell: Arc::new(Mutex::new(value)),
        }
    }

    /// A fresh ref holding `value` each time the effect runs.
    pub fn make<E: Data>(value: A) -> Effect<Ref<A>, E> {
        Effect::sync(move || Ref::new(value.clone()))
    }

    pub fn get_now(&self) -> A {
        self.lock().clone()
    }

    pub fn set_now(&self, value: A) {
        *self.lock() = value;
    }

    /// Apply `f` to the current value under the lock, store the new
    /// state and return the result.
    pub fn modify_now<B>(&self, f: impl FnOnce(&A) -> (B, A)) -> B {
        let mut value = self.lock();
        let (out, next) = f(&value);
        *value = next;
        out
    }

    pub fn get<E: Data>(&self) -> Effect<A, E> {
        let this = self.clone();
        Effect::sync(move || this.get_now())
    }

    pub fn set<E: Data>(&self, value: A) -> Effect<(), E> {
        let this = self.clone();
        Effect::sync(move || this.set_now(value.clone()))
    }

    pub fn update<E: Data>(&self, f: impl Fn(&A) -> A + Send + Sync + 'static) -> Effect<(), E> {
        self.modify(move |a| ((), f(a)))
    }

    pub fn modify<B: Send + 'static, E: Data>(
        &self,
        f: impl Fn(&A) -> (B, A) + Send + Sync + 'static,
    ) -> Effect<B, E> {
        let this = self.clone();
        Effect::sync(move || this.modify_now(&f))
    }

    pub fn get_and_set<E: Data>(&self, value: A) -> Effect<A, E> {
        self.modify(move |old| (old.clone(), value.clone()))
    }

    pub fn get_and_update<E: Data>(&self, f: impl Fn(&A) -> A + Send + Sync + 'static) -> Effect<A, E> {
        self.modify(move |old| (old.clone(), f(old)))
    }

    pub fn update_and_get<E: Data>(&self, f: impl Fn(&A) -> A + Send + Sync + 'static) -> Effect<A, E> {
        self.modify(move |old| {
            let next = f(old);
            (next.clone(), next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Runtime, RuntimeConfig};
    use std::convert::Infallible;

    #[test]
    fn reads_and_writes() {
        let rt = Runtime::new();
        let r = Ref::new(1);
        let eff: Effect<(i32, i32, i32), Infallible> = r
            .get_and_set(5)
            .zip(&r.update_and_get(|n| n * 2))
            .zip_with(&r.get_and_update(|n| n + 1), |(a, b), c| (a, b, c));
        assert_eq!(rt.run_sync(&eff), Ok((1, 10, 10)));
        assert_eq!(r.get_now(), 11);
        let label: Effect<String, Infallible> = r.modify(|n| (format!("was {n}"), 0));
        assert_eq!(rt.run_sync(&label).unwrap(), "was 11");
        assert_eq!(r.get_now(), 0);
    }

    #[test]
    fn a_panicking_update_leaves_the_ref_usable() {
        let rt = Runtime::new();
        let r = Ref::new(1);
        let boom: Effect<(), Infallible> = r.update(|_| panic!("boom"));
        assert!(rt.run_sync_exit(&boom).cause().is_some_and(|c| c.is_die()));
        assert_eq!(rt.run_sync(&r.get::<Infallible>()), Ok(1));
        let bumped: Effect<i32, Infallible> = r.update_and_get(|n| n + 1);
        assert_eq!(rt.run_sync(&bumped), Ok(2));
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(4));
        let counter = Ref::new(0u32);
        let bump: Effect<(), Infallible> = Effect::<(), Infallible>::loop_discard(
            0,
            |i| *i < 500,
            |i| i + 1,
            {
                let counter = counter.clone();
                move |_| counter.update(|n| n + 1)
            },
        );
        let fibers: Effect<(), Infallible> = bump
            .fork()
            .zip(&bump.fork())
            .zip(&bump.fork())
            .flat_map(|((a, b), c)| a.join().zip_right(&b.join()).zip_right(&c.join()));
        rt.run_blocking(&fibers).unwrap();
        assert_eq!(counter.get_now(), 1500);
    }
}
