// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error-channel operators.
//!
//! Recovery operators only ever see expected failures; defects and
//! interruption pass through unless the operator names them
//! (`catch_all_cause`, `catch_all_defect`, ...).

use std::sync::Arc;

use crate::cause::{Cause, Defect};
use crate::effect::{Data, Effect};
use crate::instr::{take, ErasedCause, Instr};

/// Errors that carry a discriminating tag, for `catch_tag`.
pub trait Tagged {
    fn tag(&self) -> &'static str;
}

/// Split off the first expected failure of an erased cause.
fn split<E: Data>(cause: ErasedCause) -> Result<E, ErasedCause> {
    match cause.failure_or_cause() {
        Ok(any) => match any.downcast_ref::<E>() {
            Some(e) => Ok(e.clone()),
            None => Err(Cause::die(Defect::message(format!(
                "unexpected error type in effect: {}",
                any.type_name()
            )))),
        },
        Err(rest) => Err(rest),
    }
}

type Handler<A, E> = Arc<dyn Fn(E) -> Effect<A, E> + Send + Sync>;

/// Per-tag handlers for `Effect::catch_tags`.
pub struct TagHandlers<A, E> {
    handlers: Vec<(&'static str, Handler<A, E>)>,
}

impl<A, E> Default for TagHandlers<A, E> {
    fn default() -> Self {
        Self { handlers: Vec::new() }
    }
}

impl<A, E> TagHandlers<A, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, tag: &'static str, f: impl Fn(E) -> Effect<A, E> + Send + Sync + 'static) -> Self {
        self.handlers.push((tag, Arc::new(f)));
        self
    }
}

impl<A: Send + 'static, E: Data> Effect<A, E> {
    /// Recover from a failed run with whatever `handler` builds.
    pub(crate) fn recover<E2: Data>(&self, handler: impl Fn(ErasedCause) -> Instr + Send + Sync + 'static) -> Effect<A, E2> {
        let inner = self.clone();
        let handler = Arc::new(handler);
        Effect::from_fn(move || {
            let handler = handler.clone();
            inner.instr().fold(move |c| handler(c), Instr::Succeed)
        })
    }

    pub fn map_error<E2: Data>(&self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Effect<A, E2> {
        let inner = self.clone();
        let f = Arc::new(f);
        Effect::from_fn(move || {
            let f = f.clone();
            inner
                .instr()
                .map_failure(move |c| c.unerase::<E>().map(|e| f(e)).erase())
        })
    }

    pub fn map_error_cause<E2: Data>(
        &self,
        f: impl Fn(Cause<E>) -> Cause<E2> + Send + Sync + 'static,
    ) -> Effect<A, E2> {
        let inner = self.clone();
        let f = Arc::new(f);
        Effect::from_fn(move || {
            let f = f.clone();
            inner.instr().map_failure(move |c| f(c.unerase()).erase())
        })
    }

    pub fn map_both<B: Send + 'static, E2: Data>(
        &self,
        on_error: impl Fn(E) -> E2 + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<B, E2> {
        self.map_error(on_error).map(on_success)
    }

    /// Recover from the first expected failure.
    pub fn catch_all<E2: Data>(&self, f: impl Fn(E) -> Effect<A, E2> + Send + Sync + 'static) -> Effect<A, E2> {
        self.recover(move |c| match split::<E>(c) {
            Ok(e) => f(e).instr(),
            Err(rest) => Instr::Fail(rest),
        })
    }

    /// Recover from any failure, defects and interruption included.
    pub fn catch_all_cause<E2: Data>(
        &self,
        f: impl Fn(Cause<E>) -> Effect<A, E2> + Send + Sync + 'static,
    ) -> Effect<A, E2> {
        self.recover(move |c| f(c.unerase()).instr())
    }

    /// Recover from the failures `f` has a handler for.
    pub fn catch_some(&self, f: impl Fn(&E) -> Option<Effect<A, E>> + Send + Sync + 'static) -> Self {
        self.recover(move |c| {
            let original = c.clone();
            match split::<E>(c) {
                Ok(e) => match f(&e) {
                    Some(handled) => handled.instr(),
                    None => Instr::Fail(original),
                },
                Err(rest) => Instr::Fail(rest),
            }
        })
    }

    pub fn catch_if(
        &self,
        pred: impl Fn(&E) -> bool + Send + Sync + 'static,
        f: impl Fn(E) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Self {
        self.catch_some(move |e| pred(e).then(|| f(e.clone())))
    }

    pub fn catch_tag(&self, tag: &'static str, f: impl Fn(E) -> Effect<A, E> + Send + Sync + 'static) -> Self
    where
        E: Tagged,
    {
        self.catch_if(move |e| e.tag() == tag, f)
    }

    pub fn catch_tags(&self, handlers: TagHandlers<A, E>) -> Self
    where
        E: Tagged,
    {
        let handlers = handlers.handlers;
        self.catch_some(move |e| {
            handlers
                .iter()
                .find(|(tag, _)| *tag == e.tag())
                .map(|(_, h)| h(e.clone()))
        })
    }

    /// Recover from the first defect. Expected failures pass through.
    pub fn catch_all_defect(&self, f: impl Fn(Defect) -> Effect<A, E> + Send + Sync + 'static) -> Self {
        self.catch_some_defect(move |d| Some(f(d.clone())))
    }

    pub fn catch_some_defect(
        &self,
        f: impl Fn(&Defect) -> Option<Effect<A, E>> + Send + Sync + 'static,
    ) -> Self {
        self.recover(move |c| match c.defects().first().and_then(|d| f(d)) {
            Some(handled) => handled.instr(),
            None => Instr::Fail(c),
        })
    }

    pub fn or_else<E2: Data>(&self, that: &Effect<A, E2>) -> Effect<A, E2> {
        let that = that.clone();
        self.catch_all(move |_| that.clone())
    }

    pub fn or_else_succeed<E2: Data>(&self, value: A) -> Effect<A, E2>
    where
        A: Clone + Sync,
    {
        self.catch_all(move |_| Effect::succeed(value.clone()))
    }

    pub fn or_else_fail<E2: Data>(&self, error: E2) -> Effect<A, E2> {
        self.catch_all(move |_| Effect::fail(error.clone()))
    }

    /// Turn expected failures into defects.
    pub fn or_die<E2: Data>(&self) -> Effect<A, E2>
    where
        E: std::error::Error,
    {
        self.catch_all(|e| Effect::die(e))
    }

    pub fn or_die_with<E2: Data>(&self, f: impl Fn(E) -> Defect + Send + Sync + 'static) -> Effect<A, E2> {
        self.catch_all(move |e| Effect::die(f(e)))
    }

    /// Discard the value and any expected failure.
    pub fn ignore<E2: Data>(&self) -> Effect<(), E2> {
        self.as_unit().catch_all(|_| Effect::unit())
    }

    /// Run `f` on an expected failure, then fail as before.
    pub fn tap_error<B: Send + 'static>(&self, f: impl Fn(&E) -> Effect<B, E> + Send + Sync + 'static) -> Self {
        self.recover(move |c| {
            let original = c.clone();
            match split::<E>(c) {
                Ok(e) => f(&e).instr().on_success(move |_| Instr::Fail(original)),
                Err(_) => Instr::Fail(original),
            }
        })
    }

    pub fn tap_error_cause<B: Send + 'static>(
        &self,
        f: impl Fn(&Cause<E>) -> Effect<B, E> + Send + Sync + 'static,
    ) -> Self {
        self.recover(move |c| {
            let typed: Cause<E> = c.clone().unerase();
            f(&typed).instr().on_success(move |_| Instr::Fail(c))
        })
    }

    pub fn tap_defect<B: Send + 'static>(&self, f: impl Fn(&Defect) -> Effect<B, E> + Send + Sync + 'static) -> Self {
        self.recover(move |c| match c.defects().first() {
            Some(d) => f(d).instr().on_success(move |_| Instr::Fail(c)),
            None => Instr::Fail(c),
        })
    }

    pub fn tap_both<B: Send + 'static, C: Send + 'static>(
        &self,
        on_error: impl Fn(&E) -> Effect<B, E> + Send + Sync + 'static,
        on_success: impl Fn(&A) -> Effect<C, E> + Send + Sync + 'static,
    ) -> Self {
        self.tap(on_success).tap_error(on_error)
    }

    /// Fold both channels into a value. Defects still propagate.
    pub fn match_<B: Send + 'static, E2: Data>(
        &self,
        on_failure: impl Fn(E) -> B + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<B, E2> {
        let inner = self.clone();
        let on_failure = Arc::new(on_failure);
        let on_success = Arc::new(on_success);
        Effect::from_fn(move || {
            let (on_failure, on_success) = (on_failure.clone(), on_success.clone());
            inner.instr().fold(
                move |c| match split::<E>(c) {
                    Ok(e) => Instr::succeed(on_failure(e)),
                    Err(rest) => Instr::Fail(rest),
                },
                move |v| Instr::succeed(on_success(take::<A>(v))),
            )
        })
    }

    pub fn match_effect<B: Send + 'static, E2: Data>(
        &self,
        on_failure: impl Fn(E) -> Effect<B, E2> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<B, E2> + Send + Sync + 'static,
    ) -> Effect<B, E2> {
        let inner = self.clone();
        let on_failure = Arc::new(on_failure);
        let on_success = Arc::new(on_success);
        Effect::from_fn(move || {
            let (on_failure, on_success) = (on_failure.clone(), on_success.clone());
            inner.instr().fold(
                move |c| match split::<E>(c) {
                    Ok(e) => on_failure(e).instr(),
                    Err(rest) => Instr::Fail(rest),
                },
                move |v| on_success(take::<A>(v)).instr(),
            )
        })
    }

    pub fn match_cause<B: Send + 'static, E2: Data>(
        &self,
        on_failure: impl Fn(Cause<E>) -> B + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<B, E2> {
        let inner = self.clone();
        let on_failure = Arc::new(on_failure);
        let on_success = Arc::new(on_success);
        Effect::from_fn(move || {
            let (on_failure, on_success) = (on_failure.clone(), on_success.clone());
            inner.instr().fold(
                move |c| Instr::succeed(on_failure(c.unerase())),
                move |v| Instr::succeed(on_success(take::<A>(v))),
            )
        })
    }

    pub fn match_cause_effect<B: Send + 'static, E2: Data>(
        &self,
        on_failure: impl Fn(Cause<E>) -> Effect<B, E2> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<B, E2> + Send + Sync + 'static,
    ) -> Effect<B, E2> {
        let inner = self.clone();
        let on_failure = Arc::new(on_failure);
        let on_success = Arc::new(on_success);
        Effect::from_fn(move || {
            let (on_failure, on_success) = (on_failure.clone(), on_success.clone());
            inner.instr().fold(
                move |c| on_failure(c.unerase()).instr(),
                move |v| on_success(take::<A>(v)).instr(),
            )
        })
    }

    fn filter_with(&self, pred: impl Fn(&A) -> bool + Send + Sync + 'static, reject: impl Fn(A) -> Instr + Send + Sync + 'static) -> Self {
        let inner = self.clone();
        let pred = Arc::new(pred);
        let reject = Arc::new(reject);
        Effect::from_fn(move || {
            let (pred, reject) = (pred.clone(), reject.clone());
            inner.instr().on_success(move |v| {
                let a = take::<A>(v);
                if pred(&a) {
                    Instr::succeed(a)
                } else {
                    reject(a)
                }
            })
        })
    }

    /// Fail with `or_fail(value)` when the value does not satisfy `pred`.
    pub fn filter_or_fail(
        &self,
        pred: impl Fn(&A) -> bool + Send + Sync + 'static,
        or_fail: impl Fn(A) -> E + Send + Sync + 'static,
    ) -> Self {
        self.filter_with(pred, move |a| Instr::Fail(Cause::fail(or_fail(a)).erase()))
    }

    pub fn filter_or_die(
        &self,
        pred: impl Fn(&A) -> bool + Send + Sync + 'static,
        or_die: impl Fn(A) -> Defect + Send + Sync + 'static,
    ) -> Self {
        self.filter_with(pred, move |a| Instr::die(or_die(a)))
    }

    pub fn filter_or_die_message(
        &self,
        pred: impl Fn(&A) -> bool + Send + Sync + 'static,
        message: impl Into<String>,
    ) -> Self {
        let message: String = message.into();
        self.filter_with(pred, move |_| Instr::die(Defect::message(message.clone())))
    }

    pub fn filter_or_else(
        &self,
        pred: impl Fn(&A) -> bool + Send + Sync + 'static,
        or_else: impl Fn(A) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Self {
        self.filter_with(pred, move |a| or_else(a).instr())
    }

    /// Collect every expected failure of the cause into one list.
    /// Defects and interruption pass through when there are none.
    pub fn parallel_errors(&self) -> Effect<A, Vec<E>> {
        let inner = self.clone();
        Effect::from_fn(move || {
            inner.instr().map_failure(|c| {
                let typed: Cause<E> = c.unerase();
                let failures: Vec<E> = typed.failures().into_iter().cloned().collect();
                if failures.is_empty() {
                    typed.strip_failures::<Vec<E>>().erase()
                } else {
                    Cause::fail(failures).erase()
                }
            })
        })
    }

    /// Run both effects even if the first fails, combining failures
    /// sequentially.
    pub fn validate<B: Send + 'static>(&self, that: &Effect<B, E>) -> Effect<(A, B), E> {
        let (left, right) = (self.clone(), that.clone());
        Effect::from_fn(move || {
            let (on_fail, on_ok) = (right.clone(), right.clone());
            left.instr().fold(
                move |c1| {
                    let c1b = c1.clone();
                    on_fail
                        .instr()
                        .fold(move |c2| Instr::Fail(Cause::sequential(c1, c2)), move |_| Instr::Fail(c1b))
                },
                move |a| {
                    on_ok
                        .instr()
                        .on_success(move |b| Instr::succeed((take::<A>(a), take::<B>(b))))
                },
            )
        })
    }

    /// Swap the success and failure channels.
    pub fn flip(&self) -> Effect<E, A>
    where
        A: Data,
    {
        self.match_effect(|e| Effect::succeed(e), |a| Effect::fail(a))
    }
}
