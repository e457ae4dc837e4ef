// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared cell whose updates may run effects.

use std::fmt;
use std::sync::Arc;

use skein_core::{Data, Effect, Ref};

use crate::semaphore::Semaphore;

/// A [`Ref`] whose updates are serialized behind a single permit, so an
/// update may suspend or fail without another update slipping in between
/// its read and its write. Reads never wait.
pub struct SynchronizedRef<A> {
    cell: Ref<A>,
    lock: Semaphore,
}

impl<A> Clone for SynchronizedRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            lock: self.lock.clone(),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for SynchronizedRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SynchronizedRef").field(&self.cell).finish()
    }
}

impl<A: Data> SynchronizedRef<A> {
    pub fn new(value: A) -> Self {
        Self {
            cell: Ref::new(value),
            lock: Semaphore::new(1),
        }
    }

    pub fn make<E: Data>(value: A) -> Effect<SynchronizedRef<A>, E> {
        Effect::sync(move || SynchronizedRef::new(value.clone()))
    }

    pub fn get_now(&self) -> A {
        self.cell.get_now()
    }

    pub fn get<E: Data>(&self) -> Effect<A, E> {
        self.cell.get()
    }

    pub fn set<E: Data>(&self, value: A) -> Effect<(), E> {
        self.lock.with_permit(&self.cell.set(value))
    }

    pub fn update<E: Data>(&self, f: impl Fn(&A) -> A + Send + Sync + 'static) -> Effect<(), E> {
        self.lock.with_permit(&self.cell.update(f))
    }

    pub fn modify<B: Send + 'static, E: Data>(
        &self,
        f: impl Fn(&A) -> (B, A) + Send + Sync + 'static,
    ) -> Effect<B, E> {
        self.lock.with_permit(&self.cell.modify(f))
    }

    /// Compute the result and the next value with an effect. Nothing is
    /// written when the effect fails or is interrupted.
    pub fn modify_effect<B: Send + 'static, E: Data>(
        &self,
        f: impl Fn(A) -> Effect<(B, A), E> + Send + Sync + 'static,
    ) -> Effect<B, E> {
        let cell = self.cell.clone();
        let f = Arc::new(f);
        self.lock.with_permit(&Effect::suspend(move || {
            let commit = cell.clone();
            f(cell.get_now()).map(move |(out, next)| {
                commit.set_now(next);
                out
            })
        }))
    }

    pub fn update_effect<E: Data>(&self, f: impl Fn(A) -> Effect<A, E> + Send + Sync + 'static) -> Effect<(), E> {
        self.modify_effect(move |a| f(a).map(|next| ((), next)))
    }

    pub fn get_and_update_effect<E: Data>(
        &self,
        f: impl Fn(A) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Effect<A, E> {
        self.modify_effect(move |a| f(a.clone()).map(move |next| (a.clone(), next)))
    }

    pub fn update_and_get_effect<E: Data>(
        &self,
        f: impl Fn(A) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Effect<A, E> {
        self.modify_effect(move |a| f(a).map(|next| (next.clone(), next)))
    }
}
