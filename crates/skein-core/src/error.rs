// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error types.

use std::fmt;

use thiserror::Error;

use crate::cause::{Cause, FiberId};
use crate::exit::Exit;

/// Defect raised when an effect asks for a service nobody provided.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("service not found: {service}")]
pub struct ServiceNotFound {
    pub service: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("scope is already closed")]
    Closed,
}

/// Expected failure produced by `Effect::timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out")]
pub struct TimeoutError;

/// Defect raised when a synchronous run reaches asynchronous work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fiber {fiber} suspended on asynchronous work during a synchronous run")]
pub struct AsyncFiberError {
    pub fiber: FiberId,
}

/// Outcome of a run that did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum RunError<E> {
    /// An expected failure or a defect reached the top.
    Failed(Cause<E>),
    /// The root fiber was interrupted and nothing else went wrong.
    Interrupted(Cause<E>),
    /// A synchronous run hit work that can only finish asynchronously.
    Suspended(FiberId),
}

impl<E> RunError<E> {
    pub fn from_cause(cause: Cause<E>) -> Self {
        if cause.is_interrupted_only() {
            RunError::Interrupted(cause)
        } else {
            RunError::Failed(cause)
        }
    }

    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            RunError::Failed(c) | RunError::Interrupted(c) => Some(c),
            RunError::Suspended(_) => None,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunError::Interrupted(_))
    }

    /// The first expected failure, if that is what ended the run.
    pub fn failure(&self) -> Option<&E> {
        match self {
            RunError::Failed(c) => c.first_failure(),
            _ => None,
        }
    }
}

pub(crate) fn exit_to_result<A, E>(exit: Exit<A, E>) -> Result<A, RunError<E>> {
    exit.into_result().map_err(RunError::from_cause)
}

impl<E: fmt::Debug> fmt::Display for RunError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Failed(cause) => write!(f, "effect failed:\n{}", cause),
            RunError::Interrupted(cause) => {
                let ids: Vec<String> = cause.interruptors().iter().map(|id| id.to_string()).collect();
                write!(f, "effect was interrupted by {}", ids.join(", "))
            }
            RunError::Suspended(id) => {
                write!(f, "fiber {} cannot complete synchronously", id)
            }
        }
    }
}

impl<E: fmt::Debug> std::error::Error for RunError<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_interruption() {
        let err: RunError<()> = RunError::from_cause(Cause::interrupt(FiberId::none()));
        assert!(err.is_interrupted());
        assert_eq!(err.to_string(), "effect was interrupted by #0");
        let err = RunError::from_cause(Cause::sequential(
            Cause::fail("bad"),
            Cause::interrupt(FiberId::none()),
        ));
        assert_eq!(err.failure(), Some(&"bad"));
    }
}
