// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Failure descriptions.
//!
//! A `Cause` records everything that went wrong in a computation:
//! expected failures, defects, and interruptions, combined sequentially
//! or in parallel. Combining with `Empty` collapses, so a non-empty cause
//! always contains at least one terminal leaf.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fiber identity: a process-unique monotonic id plus the wall-clock
/// start time in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    id: u64,
    start_time_millis: u64,
}

impl FiberId {
    pub(crate) fn next() -> Self {
        Self {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            start_time_millis: now_millis(),
        }
    }

    /// The id used for interruptions that come from outside any fiber.
    pub const fn none() -> Self {
        Self {
            id: 0,
            start_time_millis: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start_time_millis(&self) -> u64 {
        self.start_time_millis
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

/// An unexpected failure: a bug, a panic, or an error nobody declared.
#[derive(Clone)]
pub struct Defect(Arc<dyn std::error::Error + Send + Sync>);

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct DefectMessage(String);

/// Defect produced when user code panics inside a fiber.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("panicked: {0}")]
pub struct Panicked(pub String);

impl Defect {
    pub fn new<T: std::error::Error + Send + Sync + 'static>(err: T) -> Self {
        Self(Arc::new(err))
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Self(Arc::new(DefectMessage(msg.into())))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self::new(Panicked(msg))
    }

    pub fn downcast_ref<T: std::error::Error + 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Defect({})", self.0)
    }
}

/// Defects compare by their rendered message.
impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.to_string() == other.to_string()
    }
}

impl<T: std::error::Error + Send + Sync + 'static> From<T> for Defect {
    fn from(err: T) -> Self {
        Self::new(err)
    }
}

/// Type-erased expected failure. The interpreter carries every error
/// channel in this form; typed operators downcast at the edges.
#[derive(Clone)]
pub struct AnyError {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl AnyError {
    pub fn new<E: Any + Send + Sync>(err: E) -> Self {
        Self {
            value: Arc::new(err),
            type_name: std::any::type_name::<E>(),
        }
    }

    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyError({})", self.type_name)
    }
}

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

/// Full failure description of a completed computation.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    Empty,
    Fail(E),
    Die(Defect),
    Interrupt(FiberId),
    Sequential(Box<Cause<E>>, Box<Cause<E>>),
    Parallel(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    pub fn empty() -> Self {
        Cause::Empty
    }

    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    pub fn die(defect: impl Into<Defect>) -> Self {
        Cause::Die(defect.into())
    }

    pub fn interrupt(by: FiberId) -> Self {
        Cause::Interrupt(by)
    }

    /// `left` happened, then `right`.
    pub fn sequential(left: Cause<E>, right: Cause<E>) -> Self {
        match (left.is_empty(), right.is_empty()) {
            (true, _) => right,
            (_, true) => left,
            _ => Cause::Sequential(Box::new(left), Box::new(right)),
        }
    }

    /// `left` and `right` happened concurrently.
    pub fn parallel(left: Cause<E>, right: Cause<E>) -> Self {
        match (left.is_empty(), right.is_empty()) {
            (true, _) => right,
            (_, true) => left,
            _ => Cause::Parallel(Box::new(left), Box::new(right)),
        }
    }

    pub fn then(self, next: Cause<E>) -> Self {
        Self::sequential(self, next)
    }

    pub fn both(self, other: Cause<E>) -> Self {
        Self::parallel(self, other)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Cause::Empty => true,
            Cause::Sequential(l, r) | Cause::Parallel(l, r) => l.is_empty() && r.is_empty(),
            _ => false,
        }
    }

    fn any_leaf(&self, pred: &mut impl FnMut(&Cause<E>) -> bool) -> bool {
        match self {
            Cause::Sequential(l, r) | Cause::Parallel(l, r) => l.any_leaf(pred) || r.any_leaf(pred),
            leaf => pred(leaf),
        }
    }

    fn for_each_leaf<'a>(&'a self, f: &mut impl FnMut(&'a Cause<E>)) {
        match self {
            Cause::Sequential(l, r) | Cause::Parallel(l, r) => {
                l.for_each_leaf(f);
                r.for_each_leaf(f);
            }
            leaf => f(leaf),
        }
    }

    /// Contains at least one expected failure.
    pub fn is_failure(&self) -> bool {
        self.any_leaf(&mut |c| matches!(c, Cause::Fail(_)))
    }

    pub fn is_die(&self) -> bool {
        self.any_leaf(&mut |c| matches!(c, Cause::Die(_)))
    }

    pub fn is_interrupted(&self) -> bool {
        self.any_leaf(&mut |c| matches!(c, Cause::Interrupt(_)))
    }

    /// Interrupted, with no failure or defect alongside.
    pub fn is_interrupted_only(&self) -> bool {
        self.is_interrupted() && !self.is_failure() && !self.is_die()
    }

    /// Expected failures, left to right.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.for_each_leaf(&mut |c| {
            if let Cause::Fail(e) = c {
                out.push(e);
            }
        });
        out
    }

    pub fn first_failure(&self) -> Option<&E> {
        self.failures().into_iter().next()
    }

    pub fn defects(&self) -> Vec<Defect> {
        let mut out = Vec::new();
        self.for_each_leaf(&mut |c| {
            if let Cause::Die(d) = c {
                out.push(d.clone());
            }
        });
        out
    }

    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut out = Vec::new();
        self.for_each_leaf(&mut |c| {
            if let Cause::Interrupt(id) = c {
                if !out.contains(id) {
                    out.push(*id);
                }
            }
        });
        out
    }

    /// The first expected failure, or the whole cause if there is none.
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        match self.take_first_failure() {
            (Some(e), _) => Ok(e),
            (None, cause) => Err(cause),
        }
    }

    fn take_first_failure(self) -> (Option<E>, Cause<E>) {
        match self {
            Cause::Fail(e) => (Some(e), Cause::Empty),
            Cause::Sequential(l, r) => match l.take_first_failure() {
                (Some(e), _) => (Some(e), Cause::Empty),
                (None, l) => match r.take_first_failure() {
                    (Some(e), _) => (Some(e), Cause::Empty),
                    (None, r) => (None, Cause::Sequential(Box::new(l), r.boxed())),
                },
            },
            Cause::Parallel(l, r) => match l.take_first_failure() {
                (Some(e), _) => (Some(e), Cause::Empty),
                (None, l) => match r.take_first_failure() {
                    (Some(e), _) => (Some(e), Cause::Empty),
                    (None, r) => (None, Cause::Parallel(Box::new(l), r.boxed())),
                },
            },
            other => (None, other),
        }
    }

    fn boxed(self) -> Box<Cause<E>> {
        Box::new(self)
    }

    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        self.map_with(&mut f)
    }

    fn map_with<E2, F: FnMut(E) -> E2>(self, f: &mut F) -> Cause<E2> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Sequential(l, r) => Cause::Sequential(l.map_with(f).boxed(), r.map_with(f).boxed()),
            Cause::Parallel(l, r) => Cause::Parallel(l.map_with(f).boxed(), r.map_with(f).boxed()),
        }
    }

    /// Replace every expected failure with the cause `f` returns for it.
    pub fn flat_map<E2>(self, mut f: impl FnMut(E) -> Cause<E2>) -> Cause<E2> {
        self.flat_map_with(&mut f)
    }

    fn flat_map_with<E2, F: FnMut(E) -> Cause<E2>>(self, f: &mut F) -> Cause<E2> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => f(e),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Sequential(l, r) => Cause::sequential(l.flat_map_with(f), r.flat_map_with(f)),
            Cause::Parallel(l, r) => Cause::parallel(l.flat_map_with(f), r.flat_map_with(f)),
        }
    }

    /// Drop expected failures, keeping defects and interruptions.
    pub fn strip_failures<E2>(self) -> Cause<E2> {
        self.flat_map(|_| Cause::Empty)
    }
}

impl<E: fmt::Debug> Cause<E> {
    /// Multi-line rendering, one leaf per line.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.render(&mut out, 0);
        out
    }

    fn render(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        match self {
            Cause::Empty => out.push_str(&format!("{pad}Empty\n")),
            Cause::Fail(e) => out.push_str(&format!("{pad}Fail({e:?})\n")),
            Cause::Die(d) => out.push_str(&format!("{pad}Die({d})\n")),
            Cause::Interrupt(id) => out.push_str(&format!("{pad}Interrupt({id})\n")),
            Cause::Sequential(l, r) => {
                out.push_str(&format!("{pad}Sequential\n"));
                l.render(out, depth + 1);
                r.render(out, depth + 1);
            }
            Cause::Parallel(l, r) => {
                out.push_str(&format!("{pad}Parallel\n"));
                l.render(out, depth + 1);
                r.render(out, depth + 1);
            }
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pretty().trim_end())
    }
}

/// Defect raised when an erased failure does not have the expected type.
#[derive(Debug, thiserror::Error)]
#[error("unexpected error type in effect: {found}")]
struct ErrorTypeMismatch {
    found: &'static str,
}

impl Cause<AnyError> {
    pub(crate) fn unerase<E: Clone + 'static>(self) -> Cause<E> {
        self.flat_map(|any| match any.downcast_ref::<E>() {
            Some(e) => Cause::Fail(e.clone()),
            None => Cause::die(ErrorTypeMismatch {
                found: any.type_name(),
            }),
        })
    }
}

impl<E: Send + Sync + 'static> Cause<E> {
    pub(crate) fn erase(self) -> Cause<AnyError> {
        self.map(AnyError::new)
    }
}
