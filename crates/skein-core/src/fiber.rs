// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fibers and the run loop.
//!
//! A fiber is an actor: other threads talk to it only through its
//! mailbox (resume / interrupt messages), and whichever worker holds the
//! `scheduled` flag is the one driving it. The run loop is a trampoline
//! over `Instr` with an explicit continuation stack, so effect depth
//! never turns into Rust stack depth.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Poll, Waker};

use skein_rt::Task;

use crate::cause::{Cause, Defect, FiberId};
use crate::context::Context;
use crate::effect::{Data, Effect};
use crate::exit::Exit;
use crate::instr::{
    guard, take, ErasedCause, ErasedExit, FailureK, Instr, MapCauseK, RestoreK, SharedValue, SuccessK,
    Value,
};
use crate::runtime::RuntimeShared;

/// Called when a suspended fiber is interrupted, to withdraw whatever
/// registration would have resumed it.
pub type Canceler = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    Running,
    Suspended,
    Done,
}

impl FiberStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Suspended,
            _ => Self::Done,
        }
    }
}

pub(crate) enum Frame {
    OnSuccess(SuccessK),
    Fold(FailureK, SuccessK),
    MapFailure(MapCauseK),
    /// Interruptibility to restore when unwinding past this point.
    Region(bool),
    Restore(RestoreK),
}

enum Message {
    Resume(u64, Instr),
    Interrupt(FiberId),
}

struct Suspension {
    slot: Arc<ResumeSlot>,
    canceler: Option<Canceler>,
    interruptible: bool,
}

/// Run state. Only the worker currently driving the fiber touches it.
pub(crate) struct FiberState {
    pub(crate) id: FiberId,
    pub(crate) rt: Arc<RuntimeShared>,
    pub(crate) context: Context,
    pub(crate) interruptible: bool,
    /// Set on the first interrupt request and never cleared.
    pub(crate) interrupt_cause: Option<ErasedCause>,
    pub(crate) children: Vec<Arc<FiberInner>>,
    stack: Vec<Frame>,
    current: Option<Instr>,
    suspended: Option<Suspension>,
    epoch: u64,
    finishing: bool,
}

impl FiberState {
    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupt_cause.is_some()
    }
}

pub(crate) type Observer = Box<dyn FnOnce(&ErasedExit) + Send>;

struct ExitSlot {
    exit: Option<ErasedExit>,
    observers: Vec<(u64, Observer)>,
    next_observer: u64,
}

const RUNNING: u8 = 0;
const SUSPENDED: u8 = 1;
const DONE: u8 = 2;

pub(crate) struct FiberInner {
    pub(crate) id: FiberId,
    rt: Arc<RuntimeShared>,
    mailbox: Mutex<VecDeque<Message>>,
    has_mail: AtomicBool,
    /// Whoever flips this false→true owns the next run.
    scheduled: AtomicBool,
    /// Driven on the caller's thread by `run_sync`; yields are ignored.
    inline: AtomicBool,
    status: AtomicU8,
    state: Mutex<FiberState>,
    exit: Mutex<ExitSlot>,
    exit_ready: Condvar,
}

enum Step {
    Suspend,
    Yield,
    Done(ErasedExit),
}

impl FiberInner {
    /// Create a fiber that will run `start`. The final value of `start`
    /// must be a `SharedValue`.
    pub(crate) fn new(
        rt: Arc<RuntimeShared>,
        context: Context,
        interruptible: bool,
        start: Instr,
    ) -> Arc<Self> {
        let id = FiberId::next();
        Arc::new(Self {
            id,
            rt: rt.clone(),
            mailbox: Mutex::new(VecDeque::new()),
            has_mail: AtomicBool::new(false),
            scheduled: AtomicBool::new(true),
            inline: AtomicBool::new(false),
            status: AtomicU8::new(RUNNING),
            state: Mutex::new(FiberState {
                id,
                rt,
                context,
                interruptible,
                interrupt_cause: None,
                children: Vec::new(),
                stack: Vec::new(),
                current: Some(start),
                suspended: None,
                epoch: 0,
                finishing: false,
            }),
            exit: Mutex::new(ExitSlot {
                exit: None,
                observers: Vec::new(),
                next_observer: 0,
            }),
            exit_ready: Condvar::new(),
        })
    }

    /// Hand a freshly created fiber to the worker pool.
    pub(crate) fn start(self: &Arc<Self>) {
        tracing::trace!(fiber = %self.id, "fiber started");
        self.rt.scheduler.schedule(self.clone());
    }

    /// Drive a freshly created fiber on the calling thread until it
    /// finishes or suspends. Returns true if it finished.
    pub(crate) fn run_inline(self: &Arc<Self>) -> bool {
        self.inline.store(true, Ordering::Release);
        self.drive();
        self.inline.store(false, Ordering::Release);
        self.is_done()
    }

    pub(crate) fn status(&self) -> FiberStatus {
        FiberStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn is_done(&self) -> bool {
        self.status.load(Ordering::Acquire) == DONE
    }

    fn send(self: &Arc<Self>, msg: Message) {
        if self.is_done() {
            return;
        }
        {
            let mut mailbox = self.mailbox.lock().unwrap();
            mailbox.push_back(msg);
            self.has_mail.store(true, Ordering::Release);
        }
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            self.rt.scheduler.schedule(self.clone());
        }
    }

    /// Ask the fiber to stop. Takes effect at its next interruptible point.
    pub(crate) fn interrupt_as(self: &Arc<Self>, by: FiberId) {
        self.send(Message::Interrupt(by));
    }

    /// Register a callback for the exit. Runs it right away (and returns
    /// `None`) if the fiber is already done.
    pub(crate) fn observe(&self, observer: Observer) -> Option<u64> {
        let mut slot = self.exit.lock().unwrap();
        if let Some(exit) = slot.exit.clone() {
            drop(slot);
            observer(&exit);
            return None;
        }
        let id = slot.next_observer;
        slot.next_observer += 1;
        slot.observers.push((id, observer));
        Some(id)
    }

    fn unobserve(&self, id: u64) {
        self.exit.lock().unwrap().observers.retain(|(i, _)| *i != id);
    }

    pub(crate) fn poll_exit(&self) -> Option<ErasedExit> {
        self.exit.lock().unwrap().exit.clone()
    }

    /// Block the calling OS thread until the fiber is done.
    pub(crate) fn wait_blocking(&self) -> ErasedExit {
        let mut slot = self.exit.lock().unwrap();
        loop {
            if let Some(exit) = &slot.exit {
                return exit.clone();
            }
            slot = self.exit_ready.wait(slot).unwrap();
        }
    }

    /// Suspend the current fiber until this one is done, then succeed
    /// with its erased exit.
    pub(crate) fn await_instr(self: &Arc<Self>) -> Instr {
        let fiber = self.clone();
        Instr::Async(Box::new(move |slot: Arc<ResumeSlot>| -> Option<Canceler> {
            let resume = slot.clone();
            let id = fiber.observe(Box::new(move |exit| {
                resume.resume(Instr::succeed(exit.clone()));
            }))?;
            let canceler: Canceler = Box::new(move || fiber.unobserve(id));
            Some(canceler)
        }))
    }

    fn publish(&self, exit: ErasedExit) {
        self.status.store(DONE, Ordering::Release);
        match &exit {
            Exit::Failure(cause) if !cause.is_interrupted_only() => {
                tracing::debug!(fiber = %self.id, "fiber failed:\n{}", cause);
            }
            _ => tracing::trace!(fiber = %self.id, "fiber done"),
        }
        let observers = {
            let mut slot = self.exit.lock().unwrap();
            slot.exit = Some(exit.clone());
            self.exit_ready.notify_all();
            std::mem::take(&mut slot.observers)
        };
        self.mailbox.lock().unwrap().clear();
        for (_, observer) in observers {
            observer(&exit);
        }
    }

    fn drive(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        loop {
            self.status.store(RUNNING, Ordering::Release);
            match self.run_loop(&mut state) {
                Step::Yield => {
                    if self.inline.load(Ordering::Acquire) {
                        continue;
                    }
                    drop(state);
                    self.rt.scheduler.schedule(self.clone());
                    return;
                }
                Step::Suspend => {
                    self.status.store(SUSPENDED, Ordering::Release);
                    self.scheduled.store(false, Ordering::SeqCst);
                    if !self.has_mail.load(Ordering::SeqCst) {
                        return;
                    }
                    // Mail arrived while parking: take the run back unless a
                    // sender already rescheduled us.
                    if self.scheduled.swap(true, Ordering::SeqCst) {
                        return;
                    }
                }
                Step::Done(exit) => {
                    drop(state);
                    self.publish(exit);
                    return;
                }
            }
        }
    }

    fn drain_mailbox(&self, st: &mut FiberState) {
        let messages: Vec<Message> = {
            let mut mailbox = self.mailbox.lock().unwrap();
            self.has_mail.store(false, Ordering::Release);
            mailbox.drain(..).collect()
        };
        for msg in messages {
            match msg {
                Message::Resume(epoch, instr) => {
                    if st.suspended.as_ref().is_some_and(|s| s.slot.epoch == epoch) {
                        st.suspended = None;
                        st.current = Some(instr);
                    }
                }
                Message::Interrupt(by) => {
                    if st.interrupt_cause.is_none() {
                        tracing::trace!(fiber = %st.id, by = %by, "interrupt requested");
                        st.interrupt_cause = Some(Cause::interrupt(by));
                    }
                    let blocked = st
                        .suspended
                        .as_ref()
                        .is_some_and(|s| s.interruptible && s.slot.cancel());
                    if blocked {
                        if let Some(canceler) = st.suspended.take().and_then(|s| s.canceler) {
                            let _ = panic::catch_unwind(AssertUnwindSafe(canceler));
                        }
                        st.current = st.interrupt_cause.clone().map(Instr::Fail);
                    }
                }
            }
        }
    }

    fn run_loop(self: &Arc<Self>, st: &mut FiberState) -> Step {
        self.drain_mailbox(st);
        let Some(mut cur) = st.current.take() else {
            return Step::Suspend;
        };
        let budget = self.rt.ops_before_yield;
        let mut ops: u32 = 0;

        loop {
            if self.has_mail.load(Ordering::Acquire) {
                self.drain_mailbox(st);
            }
            if st.interruptible && !matches!(cur, Instr::Fail(_)) {
                if let Some(cause) = &st.interrupt_cause {
                    cur = Instr::Fail(cause.clone());
                }
            }
            ops += 1;
            if ops > budget {
                st.current = Some(cur);
                return Step::Yield;
            }

            cur = match cur {
                Instr::Succeed(value) => match st.stack.pop() {
                    None => match self.complete(st, Ok(value)) {
                        Ok(next) => next,
                        Err(exit) => return Step::Done(exit),
                    },
                    Some(Frame::OnSuccess(k)) | Some(Frame::Fold(_, k)) => guard(|| k(value)),
                    Some(Frame::MapFailure(_)) => Instr::Succeed(value),
                    Some(Frame::Region(flag)) => {
                        st.interruptible = flag;
                        Instr::Succeed(value)
                    }
                    Some(Frame::Restore(hook)) => {
                        hook(st);
                        Instr::Succeed(value)
                    }
                },
                Instr::Fail(cause) => match st.stack.pop() {
                    None => match self.complete(st, Err(cause)) {
                        Ok(next) => next,
                        Err(exit) => return Step::Done(exit),
                    },
                    Some(Frame::OnSuccess(_)) => Instr::Fail(cause),
                    Some(Frame::Fold(k, _)) => {
                        // Recovery is skipped while an interruption unwinds
                        // through an interruptible region.
                        if st.interruptible && st.is_interrupted() {
                            Instr::Fail(cause)
                        } else {
                            guard(|| k(cause))
                        }
                    }
                    Some(Frame::MapFailure(f)) => guard(|| Instr::Fail(f(cause))),
                    Some(Frame::Region(flag)) => {
                        st.interruptible = flag;
                        Instr::Fail(cause)
                    }
                    Some(Frame::Restore(hook)) => {
                        hook(st);
                        Instr::Fail(cause)
                    }
                },
                Instr::Suspend(f) => guard(f),
                Instr::Run(effect) => guard(|| effect()),
                Instr::OnSuccess(inner, k) => {
                    st.stack.push(Frame::OnSuccess(k));
                    *inner
                }
                Instr::Fold(inner, on_failure, on_success) => {
                    st.stack.push(Frame::Fold(on_failure, on_success));
                    *inner
                }
                Instr::MapFailure(inner, f) => {
                    st.stack.push(Frame::MapFailure(f));
                    *inner
                }
                Instr::Region(flag, inner) => {
                    st.stack.push(Frame::Region(st.interruptible));
                    st.interruptible = flag;
                    *inner
                }
                Instr::Restoring(inner, hook) => {
                    st.stack.push(Frame::Restore(hook));
                    *inner
                }
                Instr::WithFiber(f) => guard(|| f(st)),
                Instr::Async(register) => {
                    st.epoch += 1;
                    let slot = Arc::new(ResumeSlot {
                        fiber: self.clone(),
                        epoch: st.epoch,
                        state: AtomicU8::new(SLOT_PENDING),
                    });
                    match panic::catch_unwind(AssertUnwindSafe(|| register(slot.clone()))) {
                        Ok(canceler) => {
                            st.suspended = Some(Suspension {
                                slot,
                                canceler,
                                interruptible: st.interruptible,
                            });
                            return Step::Suspend;
                        }
                        Err(payload) => {
                            slot.cancel();
                            Instr::Fail(Cause::die(Defect::from_panic(payload)))
                        }
                    }
                }
                Instr::Yield => {
                    if self.inline.load(Ordering::Acquire) {
                        Instr::unit()
                    } else {
                        st.current = Some(Instr::unit());
                        return Step::Yield;
                    }
                }
            };
        }
    }

    /// The main effect finished. Attached children are interrupted and
    /// awaited before the exit becomes visible.
    fn complete(&self, st: &mut FiberState, outcome: Result<Value, ErasedCause>) -> Result<Instr, ErasedExit> {
        if !st.finishing {
            st.finishing = true;
            st.children.retain(|c| !c.is_done());
            if !st.children.is_empty() {
                st.interruptible = false;
                let children = std::mem::take(&mut st.children);
                for child in &children {
                    child.interrupt_as(st.id);
                }
                let last = match outcome {
                    Ok(value) => Instr::Succeed(value),
                    Err(cause) => Instr::Fail(cause),
                };
                let next = children
                    .into_iter()
                    .rev()
                    .fold(last, |next, child| child.await_instr().on_success(move |_| next));
                return Ok(next);
            }
        }
        Err(match outcome {
            Ok(value) => match value.downcast::<SharedValue>() {
                Ok(shared) => Exit::Success(*shared),
                Err(_) => Exit::die(Defect::message("fiber result is not shareable")),
            },
            Err(cause) => Exit::Failure(cause),
        })
    }
}

impl Task for FiberInner {
    fn run(self: Arc<Self>) {
        self.drive();
    }

    fn label(&self) -> &str {
        "fiber"
    }
}

const SLOT_PENDING: u8 = 0;
const SLOT_RESUMED: u8 = 1;
const SLOT_CANCELLED: u8 = 2;

/// One suspension of one fiber. Exactly one of resume or cancel wins.
pub(crate) struct ResumeSlot {
    fiber: Arc<FiberInner>,
    epoch: u64,
    state: AtomicU8,
}

impl ResumeSlot {
    fn claim(&self) -> bool {
        self.state
            .compare_exchange(SLOT_PENDING, SLOT_RESUMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancel(&self) -> bool {
        self.state
            .compare_exchange(SLOT_PENDING, SLOT_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn deliver(&self, instr: Instr) {
        self.fiber.send(Message::Resume(self.epoch, instr));
    }

    /// Resume the fiber with `instr`. False if it was already resumed or
    /// the suspension was interrupted away.
    pub(crate) fn resume(&self, instr: Instr) -> bool {
        if self.claim() {
            self.deliver(instr);
            true
        } else {
            false
        }
    }
}

/// Completion handle passed to `Effect::async_callback` registrations.
///
/// The first completion wins; later ones are ignored and report `false`.
pub struct Callback<A, E> {
    slot: Arc<ResumeSlot>,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for Callback<A, E> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Send + 'static, E: Data> Callback<A, E> {
    pub(crate) fn new(slot: Arc<ResumeSlot>) -> Self {
        Self {
            slot,
            _marker: PhantomData,
        }
    }

    pub fn succeed(&self, value: A) -> bool {
        self.slot.resume(Instr::succeed(value))
    }

    /// Like `succeed`, but hands the value back when the waiting fiber
    /// has already gone (interrupted or resumed elsewhere).
    pub fn try_succeed(&self, value: A) -> Result<(), A> {
        if self.slot.claim() {
            self.slot.deliver(Instr::succeed(value));
            Ok(())
        } else {
            Err(value)
        }
    }

    pub fn fail(&self, error: E) -> bool {
        self.fail_cause(Cause::fail(error))
    }

    pub fn fail_cause(&self, cause: Cause<E>) -> bool {
        self.slot.resume(Instr::Fail(cause.erase()))
    }

    pub fn die(&self, defect: impl Into<Defect>) -> bool {
        self.slot.resume(Instr::die(defect))
    }

    pub fn done(&self, exit: Exit<A, E>) -> bool {
        match exit {
            Exit::Success(a) => self.succeed(a),
            Exit::Failure(c) => self.fail_cause(c),
        }
    }

    /// Resume by running `effect` on the waiting fiber.
    pub fn resume_with(&self, effect: Effect<A, E>) -> bool {
        self.slot.resume(effect.instr())
    }

    /// Whether the waiting fiber can still be resumed through this handle.
    pub fn is_pending(&self) -> bool {
        self.slot.state.load(Ordering::Acquire) == SLOT_PENDING
    }
}

/// Typed view of an erased exit.
pub(crate) fn typed_exit<A: Clone + 'static, E: Clone + 'static>(exit: &ErasedExit) -> Exit<A, E> {
    match exit {
        Exit::Success(value) => match value.downcast_ref::<A>() {
            Some(a) => Exit::Success(a.clone()),
            None => Exit::die(Defect::message(format!(
                "fiber result is not a {}",
                std::any::type_name::<A>()
            ))),
        },
        Exit::Failure(cause) => Exit::Failure(cause.clone().unerase()),
    }
}

/// Handle to a running fiber producing `A` or failing with `E`.
pub struct Fiber<A, E> {
    pub(crate) inner: Arc<FiberInner>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status())
            .finish()
    }
}

impl<A: Data, E: Data> Fiber<A, E> {
    pub(crate) fn from_inner(inner: Arc<FiberInner>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    pub fn status(&self) -> FiberStatus {
        self.inner.status()
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// Wait for the fiber and return its exit without re-raising.
    pub fn await_exit<E2: Data>(&self) -> Effect<Exit<A, E>, E2> {
        let inner = self.inner.clone();
        Effect::from_fn(move || {
            inner
                .await_instr()
                .on_success(|v| Instr::succeed(typed_exit::<A, E>(&take::<ErasedExit>(v))))
        })
    }

    /// Wait for the fiber and re-raise its failure in the caller.
    pub fn join(&self) -> Effect<A, E> {
        let inner = self.inner.clone();
        Effect::from_fn(move || {
            inner.await_instr().on_success(|v| match take::<ErasedExit>(v) {
                Exit::Success(shared) => match shared.downcast_ref::<A>() {
                    Some(a) => Instr::succeed(a.clone()),
                    None => Instr::die(Defect::message("joined fiber has a different result type")),
                },
                Exit::Failure(cause) => Instr::Fail(cause),
            })
        })
    }

    /// Interrupt the fiber and wait until it has finished.
    pub fn interrupt<E2: Data>(&self) -> Effect<Exit<A, E>, E2> {
        let target = self.inner.clone();
        let awaited = self.await_exit::<E2>();
        Effect::from_fn(move || {
            let target = target.clone();
            let awaited = awaited.instr();
            Instr::with_fiber(move |st| {
                target.interrupt_as(st.id);
                awaited
            })
        })
    }

    /// Request interruption without waiting for it to take effect.
    pub fn interrupt_fork<E2: Data>(&self) -> Effect<(), E2> {
        let target = self.inner.clone();
        Effect::from_fn(move || {
            let target = target.clone();
            Instr::with_fiber(move |st| {
                target.interrupt_as(st.id);
                Instr::unit()
            })
        })
    }

    /// The exit, if the fiber is already done.
    pub fn poll<E2: Data>(&self) -> Effect<Option<Exit<A, E>>, E2> {
        let inner = self.inner.clone();
        Effect::sync(move || inner.poll_exit().map(|e| typed_exit::<A, E>(&e)))
    }

    /// Block the calling OS thread until the fiber is done. For use
    /// outside the runtime only.
    pub fn await_blocking(&self) -> Exit<A, E> {
        typed_exit(&self.inner.wait_blocking())
    }

    /// Future resolving to the fiber's exit.
    pub fn to_future(&self) -> ExitFuture<A, E> {
        ExitFuture {
            inner: self.inner.clone(),
            waker: Arc::new(Mutex::new(None)),
            registered: false,
            _marker: PhantomData,
        }
    }

    pub fn to_runtime_fiber(&self) -> RuntimeFiber {
        RuntimeFiber {
            inner: self.inner.clone(),
        }
    }
}

/// Type-erased fiber handle, as reported by supervisors.
#[derive(Clone)]
pub struct RuntimeFiber {
    pub(crate) inner: Arc<FiberInner>,
}

impl RuntimeFiber {
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    pub fn status(&self) -> FiberStatus {
        self.inner.status()
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn interrupt_fork<E: Data>(&self) -> Effect<(), E> {
        let target = self.inner.clone();
        Effect::from_fn(move || {
            let target = target.clone();
            Instr::with_fiber(move |st| {
                target.interrupt_as(st.id);
                Instr::unit()
            })
        })
    }

    /// Wait until the fiber is done, ignoring how it ended.
    pub fn await_done<E: Data>(&self) -> Effect<(), E> {
        let inner = self.inner.clone();
        Effect::from_fn(move || inner.await_instr().on_success(|_| Instr::unit()))
    }
}

impl fmt::Debug for RuntimeFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeFiber")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status())
            .finish()
    }
}

/// Future over a fiber's exit, for callers living in async Rust.
pub struct ExitFuture<A, E> {
    inner: Arc<FiberInner>,
    waker: Arc<Mutex<Option<Waker>>>,
    registered: bool,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A: Data, E: Data> Future for ExitFuture<A, E> {
    type Output = Exit<A, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(exit) = this.inner.poll_exit() {
            return Poll::Ready(typed_exit(&exit));
        }
        *this.waker.lock().unwrap() = Some(cx.waker().clone());
        if !this.registered {
            this.registered = true;
            let waker = this.waker.clone();
            this.inner.observe(Box::new(move |_| {
                if let Some(w) = waker.lock().unwrap().take() {
                    w.wake();
                }
            }));
        }
        // The exit may have landed between the first check and registration.
        match this.inner.poll_exit() {
            Some(exit) => Poll::Ready(typed_exit(&exit)),
            None => Poll::Pending,
        }
    }
}
