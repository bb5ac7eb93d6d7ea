// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Continuations: resumable execution contexts.
//!
//! The scheduler only relies on `run`, `is_done` and the module-level
//! [`yield_now`]. A yield can fail ("pin") when the current context may
//! not be suspended; callers must then block their carrier instead.
//!
//! [`ThreadContinuation`] is the shipped implementation: the body runs on
//! its own OS thread and control is passed back and forth with a baton,
//! so exactly one side runs at a time. Other stack-switching strategies
//! plug in through [`ContinuationFactory`] and [`install_scope`].

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::error::ThreadError;

/// Work wrapped by a continuation.
pub type Body = Box<dyn FnOnce() + Send + 'static>;

/// A resumable execution context.
pub trait Continuation: Send {
    /// Begin or resume the body. Returns once the body yields or returns.
    ///
    /// An error means the continuation could not be started at all; it is
    /// done afterwards and the body never ran.
    fn run(&mut self) -> Result<(), ThreadError>;

    /// True once the body has returned (or failed to start).
    fn is_done(&self) -> bool;
}

/// Creates the continuation for each new virtual thread.
pub trait ContinuationFactory: Send + Sync {
    fn create(&self, name: &str, body: Body) -> Box<dyn Continuation>;
}

/// The suspension point of the continuation running on this OS thread.
pub trait Suspend: Send + Sync {
    /// Hand control back to whoever called `run`; returns when resumed.
    fn suspend(&self);
}

/// Why a yield could not suspend the current context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PinReason {
    /// A [`PinGuard`] is alive on this continuation.
    CriticalSection,
    /// The caller is not running inside any continuation.
    NoContinuation,
}

thread_local! {
    static SCOPE: RefCell<Option<Arc<dyn Suspend>>> = const { RefCell::new(None) };
    static PIN_COUNT: Cell<usize> = const { Cell::new(0) };
}

/// Suspend the continuation running on this thread.
pub fn yield_now() -> Result<(), PinReason> {
    if let Some(reason) = pin_reason() {
        return Err(reason);
    }
    let scope = SCOPE.with(|s| s.borrow().clone());
    match scope {
        Some(scope) => {
            scope.suspend();
            Ok(())
        }
        None => Err(PinReason::NoContinuation),
    }
}

/// What [`yield_now`] would fail with right now, if anything.
pub fn pin_reason() -> Option<PinReason> {
    if PIN_COUNT.with(|c| c.get()) > 0 {
        Some(PinReason::CriticalSection)
    } else if SCOPE.with(|s| s.borrow().is_none()) {
        Some(PinReason::NoContinuation)
    } else {
        None
    }
}

/// Forbid suspension of the current continuation until the guard drops.
///
/// Stands in for frames that cannot be moved off the carrier (foreign
/// calls, borrowed thread-local state). Guards nest.
pub fn pin() -> PinGuard {
    PIN_COUNT.with(|c| c.set(c.get() + 1));
    PinGuard {
        _not_send: PhantomData,
    }
}

/// Keeps the current continuation pinned. See [`pin`].
#[must_use = "the continuation is unpinned as soon as the guard drops"]
pub struct PinGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        PIN_COUNT.with(|c| c.set(c.get().saturating_sub(1)));
    }
}

/// Make `scope` the suspension point for this OS thread until the guard
/// drops. Called by continuation implementations on the thread that
/// executes the body.
pub fn install_scope(scope: Arc<dyn Suspend>) -> ScopeGuard {
    let previous = SCOPE.with(|s| s.borrow_mut().replace(scope));
    ScopeGuard {
        previous,
        _not_send: PhantomData,
    }
}

pub struct ScopeGuard {
    previous: Option<Arc<dyn Suspend>>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        SCOPE.with(|s| *s.borrow_mut() = previous);
    }
}

/// Unwind payload used to tear down the body of a dropped continuation.
#[derive(Debug)]
pub struct Abandoned;

/// True if a caught panic payload is continuation teardown rather than
/// a failure of the body.
pub fn is_abandoned(payload: &(dyn Any + Send)) -> bool {
    payload.is::<Abandoned>()
}

/// Factory for [`ThreadContinuation`]s.
#[derive(Debug, Clone)]
pub struct ThreadBacked {
    stack_size: usize,
}

impl ThreadBacked {
    pub fn new(stack_size: usize) -> Self {
        Self { stack_size }
    }
}

impl ContinuationFactory for ThreadBacked {
    fn create(&self, name: &str, body: Body) -> Box<dyn Continuation> {
        Box::new(ThreadContinuation::new(name, self.stack_size, body))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    Caller,
    Body,
    Done,
    Abandoned,
}

struct Baton {
    turn: Mutex<Turn>,
    cv: Condvar,
}

impl Baton {
    /// Give the body the turn and wait until it yields or finishes.
    fn resume_body(&self) -> Turn {
        let mut turn = self.turn.lock();
        *turn = Turn::Body;
        self.cv.notify_all();
        while *turn == Turn::Body {
            self.cv.wait(&mut turn);
        }
        *turn
    }

    fn wait_for_caller(&self) -> Turn {
        let mut turn = self.turn.lock();
        while *turn == Turn::Body {
            self.cv.wait(&mut turn);
        }
        *turn
    }

    fn finish(&self) {
        let mut turn = self.turn.lock();
        *turn = Turn::Done;
        self.cv.notify_all();
    }
}

impl Suspend for Baton {
    fn suspend(&self) {
        let mut turn = self.turn.lock();
        // Already unwinding a dropped continuation: nobody will resume us.
        if *turn == Turn::Abandoned {
            return;
        }
        *turn = Turn::Caller;
        self.cv.notify_all();
        while *turn == Turn::Caller {
            self.cv.wait(&mut turn);
        }
        if *turn == Turn::Abandoned {
            drop(turn);
            std::panic::resume_unwind(Box::new(Abandoned));
        }
    }
}

/// Continuation whose body runs on a dedicated OS thread.
///
/// The thread is created on the first `run`; `run` then blocks until the
/// body yields or returns, so the caller's thread stays occupied for
/// exactly as long as the body runs. Dropping an unfinished continuation
/// unwinds the body with an [`Abandoned`] payload.
pub struct ThreadContinuation {
    name: String,
    stack_size: usize,
    body: Option<Body>,
    baton: Arc<Baton>,
    thread: Option<JoinHandle<()>>,
    done: bool,
}

impl ThreadContinuation {
    pub fn new(name: &str, stack_size: usize, body: Body) -> Self {
        Self {
            name: name.to_string(),
            stack_size,
            body: Some(body),
            baton: Arc::new(Baton {
                turn: Mutex::new(Turn::Caller),
                cv: Condvar::new(),
            }),
            thread: None,
            done: false,
        }
    }

    fn start(&mut self, body: Body) -> Result<(), ThreadError> {
        *self.baton.turn.lock() = Turn::Body;
        let baton = self.baton.clone();
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .stack_size(self.stack_size)
            .spawn(move || {
                let scope: Arc<dyn Suspend> = baton.clone();
                let guard = install_scope(scope);
                // Abandoned teardown lands here; body panics are caught inside.
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
                drop(guard);
                baton.finish();
            });
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                *self.baton.turn.lock() = Turn::Done;
                self.done = true;
                Err(ThreadError::Spawn(e))
            }
        }
    }
}

impl Continuation for ThreadContinuation {
    fn run(&mut self) -> Result<(), ThreadError> {
        if self.done {
            return Ok(());
        }
        let turn = match self.body.take() {
            Some(body) => {
                self.start(body)?;
                self.baton.wait_for_caller()
            }
            None => self.baton.resume_body(),
        };
        if turn == Turn::Done {
            self.done = true;
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

impl Drop for ThreadContinuation {
    fn drop(&mut self) {
        if self.thread.is_some() && !self.done {
            let mut turn = self.baton.turn.lock();
            *turn = Turn::Abandoned;
            self.baton.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    const STACK: usize = 256 * 1024;

    #[test]
    fn run_stops_at_each_yield() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let mut cont = ThreadContinuation::new(
            "cont-test",
            STACK,
            Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
                yield_now().unwrap();
                s.fetch_add(1, Ordering::SeqCst);
                yield_now().unwrap();
                s.fetch_add(1, Ordering::SeqCst);
            }),
        );

        cont.run().unwrap();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert!(!cont.is_done());
        cont.run().unwrap();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        cont.run().unwrap();
        assert_eq!(steps.load(Ordering::SeqCst), 3);
        assert!(cont.is_done());

        // Running a finished continuation is a no-op.
        cont.run().unwrap();
        assert_eq!(steps.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn pinned_yield_fails_and_keeps_running() {
        let (tx, rx) = mpsc::channel();
        let mut cont = ThreadContinuation::new(
            "cont-pinned",
            STACK,
            Box::new(move || {
                {
                    let _pin = pin();
                    tx.send(yield_now()).unwrap();
                }
                tx.send(yield_now()).unwrap();
            }),
        );

        cont.run().unwrap();
        assert_eq!(rx.recv().unwrap(), Err(PinReason::CriticalSection));
        assert_eq!(rx.recv().unwrap(), Ok(()));
        assert!(!cont.is_done());
        cont.run().unwrap();
        assert!(cont.is_done());
    }

    #[test]
    fn yield_outside_continuation_fails() {
        assert_eq!(yield_now(), Err(PinReason::NoContinuation));
        assert_eq!(pin_reason(), Some(PinReason::NoContinuation));
    }

    #[test]
    fn nested_pins_release_in_order() {
        let (tx, rx) = mpsc::channel();
        let mut cont = ThreadContinuation::new(
            "cont-nested",
            STACK,
            Box::new(move || {
                let outer = pin();
                let inner = pin();
                drop(inner);
                tx.send(pin_reason()).unwrap();
                drop(outer);
                tx.send(pin_reason()).unwrap();
            }),
        );
        cont.run().unwrap();
        assert_eq!(rx.recv().unwrap(), Some(PinReason::CriticalSection));
        assert_eq!(rx.recv().unwrap(), None);
    }

    #[test]
    fn dropping_unfinished_continuation_unwinds_body() {
        struct Notify(mpsc::Sender<&'static str>);
        impl Drop for Notify {
            fn drop(&mut self) {
                let _ = self.0.send("unwound");
            }
        }

        let (tx, rx) = mpsc::channel();
        let mut cont = ThreadContinuation::new(
            "cont-drop",
            STACK,
            Box::new(move || {
                let _n = Notify(tx);
                let _ = yield_now();
            }),
        );
        cont.run().unwrap();
        drop(cont);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "unwound"
        );
    }

    #[test]
    fn factory_builds_thread_backed_continuations() {
        let factory = ThreadBacked::new(STACK);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let mut cont = factory.create(
            "cont-factory",
            Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cont.run().unwrap();
        assert!(cont.is_done());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
