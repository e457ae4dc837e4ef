// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Terminal results.

use crate::cause::{AnyError, Cause, Defect, FiberId};

/// How a computation ended: a value, or the cause of its failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<A, E> {
    Success(A),
    Failure(Cause<E>),
}

/// The exit a scope is closed with. Its value and error are erased
/// because finalizers outlive the types of whatever they cleaned up.
pub type ScopeExit = Exit<(), AnyError>;

impl<A, E> Exit<A, E> {
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    pub fn fail_cause(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    pub fn die(defect: impl Into<Defect>) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    pub fn interrupt(by: FiberId) -> Self {
        Exit::Failure(Cause::interrupt(by))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Failure(c) if c.is_interrupted())
    }

    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(c) => Some(c),
        }
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(c) => Exit::Failure(c),
        }
    }

    pub fn map_error<E2>(self, f: impl FnMut(E) -> E2) -> Exit<A, E2> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(c) => Exit::Failure(c.map(f)),
        }
    }

    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(c) => Err(c),
        }
    }

    /// Forget the value, keeping only whether and how it failed.
    pub fn as_unit(&self) -> Exit<(), E>
    where
        E: Clone,
    {
        match self {
            Exit::Success(_) => Exit::Success(()),
            Exit::Failure(c) => Exit::Failure(c.clone()),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_accessors() {
        let ok: Exit<i32, &str> = Exit::succeed(1);
        assert_eq!(ok.value(), Some(&1));
        assert!(ok.cause().is_none());
        let bad: Exit<i32, &str> = Exit::fail("nope");
        assert!(bad.is_failure());
        assert!(!bad.is_interrupted());
        assert_eq!(bad.map_error(|e| e.len()).into_result(), Err(Cause::fail(4)));
    }

    #[test]
    fn interrupted_exit() {
        let exit: Exit<(), ()> = Exit::interrupt(FiberId::none());
        assert!(exit.is_interrupted());
        assert_eq!(exit.as_unit(), exit);
    }
}
