// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Interpreter instructions.
//!
//! An `Effect` is a re-runnable builder; building it yields one `Instr`,
//! a single-use node whose continuations are `FnOnce`. Sub-effects stay
//! behind `Instr::Run` until the fiber reaches them, so building never
//! walks a whole description.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::cause::{AnyError, Cause, Defect};
use crate::exit::Exit;
use crate::fiber::{Canceler, FiberState, ResumeSlot};

pub(crate) type Value = Box<dyn Any + Send>;
pub(crate) type SharedValue = Arc<dyn Any + Send + Sync>;
pub(crate) type ErasedCause = Cause<AnyError>;
pub(crate) type ErasedExit = Exit<SharedValue, AnyError>;
pub(crate) type Erased = Arc<dyn Fn() -> Instr + Send + Sync>;

pub(crate) type SuccessK = Box<dyn FnOnce(Value) -> Instr + Send>;
pub(crate) type FailureK = Box<dyn FnOnce(ErasedCause) -> Instr + Send>;
pub(crate) type MapCauseK = Box<dyn FnOnce(ErasedCause) -> ErasedCause + Send>;
pub(crate) type RestoreK = Box<dyn FnOnce(&mut FiberState) + Send>;
pub(crate) type Register = Box<dyn FnOnce(Arc<ResumeSlot>) -> Option<Canceler> + Send>;

pub(crate) enum Instr {
    Succeed(Value),
    Fail(ErasedCause),
    /// Run a closure (side effects allowed) to get the next instruction.
    Suspend(Box<dyn FnOnce() -> Instr + Send>),
    /// Build and run a sub-effect.
    Run(Erased),
    OnSuccess(Box<Instr>, SuccessK),
    Fold(Box<Instr>, FailureK, SuccessK),
    /// Rewrite a failure cause on the way out. Unlike `Fold` this also
    /// applies while an interruption unwinds.
    MapFailure(Box<Instr>, MapCauseK),
    /// Run the inner instruction with the given interruptibility.
    Region(bool, Box<Instr>),
    /// Run the inner instruction, then the restore hook on every exit path.
    Restoring(Box<Instr>, RestoreK),
    WithFiber(Box<dyn FnOnce(&mut FiberState) -> Instr + Send>),
    /// Suspend until the registered callback resumes the fiber.
    Async(Register),
    Yield,
}

impl Instr {
    pub fn succeed<A: Send + 'static>(value: A) -> Self {
        Instr::Succeed(Box::new(value))
    }

    pub fn unit() -> Self {
        Instr::succeed(())
    }

    pub fn die(defect: impl Into<Defect>) -> Self {
        Instr::Fail(Cause::die(defect))
    }

    pub fn on_success(self, k: impl FnOnce(Value) -> Instr + Send + 'static) -> Self {
        Instr::OnSuccess(Box::new(self), Box::new(k))
    }

    pub fn fold(
        self,
        on_failure: impl FnOnce(ErasedCause) -> Instr + Send + 'static,
        on_success: impl FnOnce(Value) -> Instr + Send + 'static,
    ) -> Self {
        Instr::Fold(Box::new(self), Box::new(on_failure), Box::new(on_success))
    }

    pub fn map_failure(self, f: impl FnOnce(ErasedCause) -> ErasedCause + Send + 'static) -> Self {
        Instr::MapFailure(Box::new(self), Box::new(f))
    }

    pub fn region(self, interruptible: bool) -> Self {
        Instr::Region(interruptible, Box::new(self))
    }

    pub fn restoring(self, hook: impl FnOnce(&mut FiberState) + Send + 'static) -> Self {
        Instr::Restoring(Box::new(self), Box::new(hook))
    }

    pub fn with_fiber(f: impl FnOnce(&mut FiberState) -> Instr + Send + 'static) -> Self {
        Instr::WithFiber(Box::new(f))
    }

    pub fn suspend(f: impl FnOnce() -> Instr + Send + 'static) -> Self {
        Instr::Suspend(Box::new(f))
    }

    pub fn from_exit<A: Send + 'static>(exit: Exit<A, AnyError>) -> Self {
        match exit {
            Exit::Success(a) => Instr::succeed(a),
            Exit::Failure(c) => Instr::Fail(c),
        }
    }
}

/// Unbox a value the interpreter handed to a continuation.
pub(crate) fn take<A: 'static>(value: Value) -> A {
    match value.downcast::<A>() {
        Ok(a) => *a,
        Err(_) => panic!("effect value is not a {}", std::any::type_name::<A>()),
    }
}

/// Run user code, turning a panic into a defect.
pub(crate) fn guard(f: impl FnOnce() -> Instr) -> Instr {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(instr) => instr,
        Err(payload) => Instr::Fail(Cause::die(Defect::from_panic(payload))),
    }
}
