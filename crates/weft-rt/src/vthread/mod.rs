// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Virtual threads.
//!
//! A virtual thread wraps its task in a continuation and runs it on
//! carriers of its scheduler. Every blocking operation moves the thread
//! into a transitional `…ING` state and yields; once the continuation
//! has suspended, the carrier settles the state (`after_yield`) and then
//! re-checks the permit or notification that may have raced with the
//! suspension. Any state that owes the thread a carrier (UNPARKED,
//! UNBLOCKED, YIELDED) is only ever entered by a successful
//! compare-and-set, and only that winner submits the resumption task.
//!
//! When a yield fails because the continuation is pinned, the thread
//! blocks its carrier instead and a [`RuntimeEvent::Pinned`] is emitted.

pub mod builder;
pub mod state;

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub use builder::{spawn, Builder};
pub use state::{State, ThreadState};

use crate::carrier::{next_thread_id, CarrierThread};
use crate::container::ThreadContainer;
use crate::continuation::{self, Body, Continuation, ContinuationFactory, PinReason};
use crate::error::{SubmitError, ThreadError};
use crate::events::{self, BlockingOp, RuntimeEvent};
use crate::latch::CountDownLatch;
use crate::park::duration_nanos;
use crate::pool::{panic_message, Executor, Runnable};
use crate::timer::{TimerHandle, TimerService};
use state::{Action, Event, Step};

/// Called with the thread and the panic payload when a task panics.
pub type UncaughtHandler = Arc<dyn Fn(&VirtualThread, &(dyn Any + Send)) + Send + Sync>;

/// Pause between submission attempts while the scheduler is out of
/// resources.
const SUBMIT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

thread_local! {
    static CURRENT: RefCell<Option<Weak<VirtualThread>>> = const { RefCell::new(None) };
}

/// The virtual thread running the caller, if any.
pub fn current() -> Option<Arc<VirtualThread>> {
    CURRENT.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

pub fn is_virtual() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

#[derive(Debug, Clone, Copy)]
enum SubmitMode {
    Normal,
    /// Prefer the current carrier's queue when it is empty.
    Lazy,
    /// Through the scheduler's shared queue.
    External,
}

/// Everything a [`Builder`] decides.
pub(crate) struct Parts {
    pub name: String,
    pub scheduler: Arc<dyn Executor>,
    pub timers: Arc<TimerService>,
    pub container: Arc<ThreadContainer>,
    pub uncaught: Option<UncaughtHandler>,
    pub factory: Arc<dyn ContinuationFactory>,
    pub retry_on_exhaustion: bool,
}

/// A lightweight thread scheduled in user mode.
pub struct VirtualThread {
    id: u64,
    name: String,
    scheduler: Arc<dyn Executor>,
    timers: Arc<TimerService>,
    container: Arc<ThreadContainer>,
    uncaught: Option<UncaughtHandler>,
    retry_on_exhaustion: bool,

    cont: Mutex<Option<Box<dyn Continuation>>>,
    state: AtomicU8,

    /// Mounted carrier. The lock also serializes interrupt delivery
    /// against mount and unmount.
    carrier: Mutex<Option<Arc<CarrierThread>>>,
    interrupted: AtomicBool,

    park_permit: AtomicBool,
    block_permit: AtomicBool,

    /// Pending timed park or timed wait, in nanoseconds.
    timeout_nanos: AtomicU64,
    timeout_task: Mutex<Option<TimerHandle>>,

    termination: OnceLock<Arc<CountDownLatch>>,

    /// Queued for the unblocker.
    pub(crate) on_waiting_list: AtomicBool,

    notified: AtomicBool,
    interruptible_wait: AtomicBool,
    timed_wait_seq: AtomicU64,
    timed_wait_lock: Mutex<()>,
}

impl VirtualThread {
    pub(crate) fn new(parts: Parts, task: Body) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<VirtualThread>| {
            let id = next_thread_id();
            let this = weak.clone();
            let body: Body = Box::new(move || run_body(this, task));
            let cont_name = if parts.name.is_empty() {
                format!("weft-vthread-{id}")
            } else {
                parts.name.clone()
            };
            let cont = parts.factory.create(&cont_name, body);

            Self {
                id,
                name: parts.name,
                scheduler: parts.scheduler,
                timers: parts.timers,
                container: parts.container,
                uncaught: parts.uncaught,
                retry_on_exhaustion: parts.retry_on_exhaustion,
                cont: Mutex::new(Some(cont)),
                state: AtomicU8::new(State::New as u8),
                carrier: Mutex::new(None),
                interrupted: AtomicBool::new(false),
                park_permit: AtomicBool::new(false),
                block_permit: AtomicBool::new(false),
                timeout_nanos: AtomicU64::new(0),
                timeout_task: Mutex::new(None),
                termination: OnceLock::new(),
                on_waiting_list: AtomicBool::new(false),
                notified: AtomicBool::new(false),
                interruptible_wait: AtomicBool::new(false),
                timed_wait_seq: AtomicU64::new(0),
                timed_wait_lock: Mutex::new(()),
            }
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Empty unless a name was given.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        // Only values written from `State` are ever stored.
        State::from_u8(self.state.load(Ordering::SeqCst)).unwrap_or(State::Terminated)
    }

    pub fn thread_state(&self) -> ThreadState {
        self.state().thread_state()
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state(), State::New | State::Terminated)
    }

    pub fn scheduler(&self) -> &Arc<dyn Executor> {
        &self.scheduler
    }

    pub fn container(&self) -> &Arc<ThreadContainer> {
        &self.container
    }

    /// The carrier this thread is mounted on.
    pub fn carrier(&self) -> Option<Arc<CarrierThread>> {
        self.carrier.lock().clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn is_current(&self) -> bool {
        current().is_some_and(|vt| std::ptr::eq(Arc::as_ptr(&vt), self))
    }

    /// Compare-and-set along the transition table. Returns the step if
    /// this caller won it; the caller then owes the step's action.
    fn advance(&self, from: State, event: Event) -> Option<Step> {
        let step = from.on(event)?;
        let ok = self
            .state
            .compare_exchange(
                from as u8,
                step.to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !ok {
            return None;
        }
        tracing::trace!(thread_id = self.id, %from, to = %step.to, ?event, "state transition");
        Some(step)
    }

    /// A transition only this thread (or its carrier) can make.
    fn advance_owned(&self, from: State, event: Event) -> Option<Step> {
        let step = self.advance(from, event);
        debug_assert!(
            step.is_some(),
            "{from} --{event:?}--> rejected, state is {}",
            self.state()
        );
        step
    }

    /// Carry out the submission a won step owes.
    fn follow(self: &Arc<Self>, step: Step, mode: SubmitMode) -> Result<(), ThreadError> {
        match step.action {
            Action::Submit => self.submit(mode),
            Action::None | Action::ArmTimer | Action::BlockCarrier => Ok(()),
        }
    }

    /// Schedule the thread for its first run.
    ///
    /// Fails with `StateConflict` if it was already started, and with the
    /// scheduler's error if the first submission fails; the thread is
    /// terminated in that case.
    pub fn start(self: &Arc<Self>) -> Result<(), ThreadError> {
        let Some(step) = self.advance(State::New, Event::Start) else {
            return Err(ThreadError::StateConflict("thread already started"));
        };
        self.container.on_start(self);
        if let Err(err) = self.follow(step, SubmitMode::External) {
            self.after_done(true);
            return Err(err);
        }
        Ok(())
    }

    fn submit(self: &Arc<Self>, mode: SubmitMode) -> Result<(), ThreadError> {
        loop {
            let vt = self.clone();
            let task: Runnable = Box::new(move || vt.run_continuation());
            let result = match mode {
                SubmitMode::Normal => self.scheduler.execute(task),
                SubmitMode::Lazy => self.scheduler.lazy_execute(task),
                SubmitMode::External => self.scheduler.external_execute(task),
            };
            let error = match result {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            events::emit(RuntimeEvent::SubmitFailed {
                thread_id: self.id,
                error,
            });
            match error {
                SubmitError::ResourceExhausted if self.retry_on_exhaustion => {
                    std::thread::sleep(SUBMIT_RETRY_BACKOFF);
                }
                _ => return Err(error.into()),
            }
        }
    }

    /// Follow a step where nobody is waiting for the outcome. Failures
    /// have already been reported through `events`.
    fn resubmit(self: &Arc<Self>, step: Step, mode: SubmitMode) {
        if let Err(err) = self.follow(step, mode) {
            tracing::debug!(thread_id = self.id, %err, "resumption dropped");
        }
    }

    /// Body of every resumption task.
    fn run_continuation(self: &Arc<Self>) {
        let initial = self.state();
        if !matches!(
            initial,
            State::Started | State::Unparked | State::Unblocked | State::Yielded
        ) {
            return;
        }
        if self.advance(initial, Event::Resume).is_none() {
            return;
        }
        match initial {
            State::Unparked => {
                self.cancel_timeout_task();
                self.park_permit.store(false, Ordering::SeqCst);
            }
            State::Unblocked => {
                self.cancel_timeout_task();
                self.block_permit.store(false, Ordering::SeqCst);
            }
            _ => {}
        }

        let carrier = CarrierThread::current_or_adhoc();
        self.mount(&carrier);
        let outcome = {
            let mut cont = self.cont.lock();
            match cont.as_mut() {
                Some(cont) => cont.run().map(|()| cont.is_done()),
                None => Ok(true),
            }
        };
        self.unmount(&carrier);

        match outcome {
            Ok(true) => self.after_done(true),
            Ok(false) => self.after_yield(),
            Err(err) => {
                tracing::error!(thread_id = self.id, %err, "virtual thread failed to start");
                self.after_done(true);
            }
        }
    }

    fn mount(&self, carrier: &Arc<CarrierThread>) {
        let mut slot = self.carrier.lock();
        *slot = Some(carrier.clone());
        // Carry a pending interrupt over so a pinned park returns at once.
        if self.interrupted.load(Ordering::SeqCst) {
            carrier.parker().interrupt();
        } else {
            carrier.parker().clear_interrupt();
        }
    }

    fn unmount(&self, carrier: &Arc<CarrierThread>) {
        let mut slot = self.carrier.lock();
        *slot = None;
        carrier.parker().clear_interrupt();
    }

    /// Settle a suspended continuation. Runs on the carrier.
    fn after_yield(self: &Arc<Self>) {
        let mut s = self.state();
        if s == State::Running {
            // The body called `continuation::yield_now` directly.
            self.advance_owned(State::Running, Event::Yield);
            s = State::Yielding;
        }
        let Some(step) = s.on(Event::Settle) else {
            tracing::error!(thread_id = self.id, state = %s, "unexpected state after yield");
            return;
        };

        // The timer is armed before the settled state is published, so a
        // resumption always finds its handle to cancel. Holding the
        // timed-wait lock keeps an early expiry from checking the state
        // before it has settled.
        let wait_guard = (s == State::TimedWaiting).then(|| self.timed_wait_lock.lock());
        if step.action == Action::ArmTimer {
            if s == State::TimedWaiting {
                let seq = self.timed_wait_seq.fetch_add(1, Ordering::SeqCst) + 1;
                self.arm_timeout(move |vt| vt.wait_timeout_expired(seq));
            } else {
                self.arm_timeout(|vt| vt.park_timeout_expired());
            }
        }
        self.advance_owned(s, Event::Settle);
        drop(wait_guard);

        if step.action == Action::Submit {
            // Let queued work run first when our queue is empty.
            let mode = if self.scheduler.current_carrier_queue_len() == Some(0) {
                SubmitMode::External
            } else {
                SubmitMode::Normal
            };
            self.resubmit(step, mode);
            return;
        }

        match step.to {
            // Unparked while parking.
            State::Parked | State::TimedParked => {
                if self.park_permit.load(Ordering::SeqCst) {
                    if let Some(next) = self.advance(step.to, Event::Unpark) {
                        self.resubmit(next, SubmitMode::Lazy);
                    }
                }
            }
            // Unblocked while blocking.
            State::Blocked => {
                if self.block_permit.load(Ordering::SeqCst) {
                    if let Some(next) = self.advance(State::Blocked, Event::Unblock) {
                        self.resubmit(next, SubmitMode::Lazy);
                    }
                }
            }
            State::Wait | State::TimedWait => {
                // Notified while waiting.
                if self.notified.load(Ordering::SeqCst)
                    && self.advance(step.to, Event::Notify).is_some()
                {
                    if self.block_permit.load(Ordering::SeqCst) {
                        if let Some(next) = self.advance(State::Blocked, Event::Unblock) {
                            self.resubmit(next, SubmitMode::Normal);
                        }
                    }
                    return;
                }

                // Interrupted while waiting.
                if self.interruptible_wait.load(Ordering::SeqCst) && self.is_interrupted() {
                    if let Some(next) = self.advance(step.to, Event::Interrupt) {
                        self.resubmit(next, SubmitMode::Normal);
                    }
                }
            }
            _ => {}
        }
    }

    fn arm_timeout<F>(self: &Arc<Self>, on_expiry: F)
    where
        F: FnOnce(&Arc<VirtualThread>) + Send + 'static,
    {
        let nanos = self.timeout_nanos.load(Ordering::SeqCst);
        let vt = self.clone();
        let handle = self
            .timers
            .schedule_keyed(self.id, Duration::from_nanos(nanos), move || on_expiry(&vt));
        *self.timeout_task.lock() = Some(handle);
    }

    fn cancel_timeout_task(&self) {
        if let Some(handle) = self.timeout_task.lock().take() {
            handle.cancel();
        }
    }

    fn after_done(&self, notify_container: bool) {
        loop {
            let s = self.state();
            if s == State::Terminated || self.advance(s, Event::Terminate).is_some() {
                break;
            }
            if s == State::New {
                tracing::error!(thread_id = self.id, "terminating a thread that never started");
                return;
            }
        }
        // Pairs with the fence in `join`: either the joiner sees
        // TERMINATED or we see its latch.
        fence(Ordering::SeqCst);
        if let Some(latch) = self.termination.get() {
            latch.count_down();
        }
        if notify_container {
            self.container.on_exit(self);
        }
        self.cancel_timeout_task();
        drop(self.cont.lock().take());
        tracing::trace!(thread_id = self.id, "virtual thread terminated");
    }

    fn dispatch_uncaught(&self, payload: &(dyn Any + Send)) {
        match &self.uncaught {
            Some(handler) => handler(self, payload),
            None => tracing::error!(
                thread_id = self.id,
                name = %self.name,
                panic = %panic_message(payload),
                "uncaught panic in virtual thread"
            ),
        }
    }

    /// Park the current thread. Must be called on this thread.
    pub(crate) fn park(self: &Arc<Self>) {
        if self.park_permit.swap(false, Ordering::SeqCst) || self.is_interrupted() {
            return;
        }
        self.advance_owned(State::Running, Event::Park);
        if let Err(reason) = continuation::yield_now() {
            self.advance_owned(State::Parking, Event::Unpin);
            self.park_on_carrier(None, reason);
        }
    }

    /// Park for up to `nanos`. Must be called on this thread.
    pub(crate) fn park_nanos(self: &Arc<Self>, nanos: u64) {
        if self.park_permit.swap(false, Ordering::SeqCst) || self.is_interrupted() {
            return;
        }
        if nanos == 0 {
            return;
        }
        let start = Instant::now();
        self.timeout_nanos.store(nanos, Ordering::SeqCst);
        self.advance_owned(State::Running, Event::TimedPark);
        if let Err(reason) = continuation::yield_now() {
            self.advance_owned(State::TimedParking, Event::Unpin);
            let remaining = nanos.saturating_sub(duration_nanos(start.elapsed()));
            self.park_on_carrier(Some(remaining), reason);
        }
    }

    /// Block the carrier in place of yielding.
    fn park_on_carrier(&self, timeout: Option<u64>, reason: PinReason) {
        let Some(carrier) = self.carrier() else {
            tracing::error!(thread_id = self.id, "pinned park on an unmounted thread");
            return;
        };
        let (event, op) = match timeout {
            None => (Event::Pin, BlockingOp::Park),
            Some(_) => (Event::TimedPin, BlockingOp::TimedPark),
        };
        let pinned = match timeout {
            None => State::Pinned,
            Some(_) => State::TimedPinned,
        };
        let start = Instant::now();
        let blocks = self
            .advance_owned(State::Running, event)
            .is_some_and(|step| step.action == Action::BlockCarrier);
        let compensated = self.scheduler.begin_compensated_block();
        if blocks && !self.park_permit.load(Ordering::SeqCst) {
            match timeout {
                None => carrier.parker().park(None),
                Some(nanos) if nanos > 0 => carrier.parker().park(Some(Duration::from_nanos(nanos))),
                Some(_) => {}
            }
        }
        self.scheduler.end_compensated_block(compensated);
        self.advance_owned(pinned, Event::Unpin);
        self.park_permit.store(false, Ordering::SeqCst);

        events::emit(RuntimeEvent::Pinned {
            thread_id: self.id,
            op,
            reason,
            blocked_for: start.elapsed(),
        });
    }

    /// Make the park permit available, resuming the thread if it is
    /// parked.
    ///
    /// Only the caller that wins the transition out of PARKED submits, so
    /// concurrent unparks resume the thread once. Fails only if the
    /// scheduler rejects the resumption.
    pub fn unpark(self: &Arc<Self>) -> Result<(), ThreadError> {
        if self.park_permit.swap(true, Ordering::SeqCst) || self.is_current() {
            return Ok(());
        }
        let s = self.state();
        match s {
            State::Parked | State::TimedParked => {
                if let Some(step) = self.advance(s, Event::Unpark) {
                    self.follow(step, SubmitMode::Normal)?;
                }
            }
            State::Pinned | State::TimedPinned => {
                let carrier = self.carrier.lock();
                if let Some(carrier) = carrier.as_ref() {
                    if matches!(self.state(), State::Pinned | State::TimedPinned) {
                        carrier.parker().unpark();
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn park_timeout_expired(self: &Arc<Self>) {
        // A stale expiry must not leave a permit for a later untimed park.
        if !matches!(self.state(), State::TimedParking | State::TimedParked) {
            return;
        }
        if self.park_permit.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(step) = self.advance(State::TimedParked, Event::Timeout) {
            self.resubmit(step, SubmitMode::Lazy);
        }
    }

    /// Grant the block permit, resuming the thread if it is BLOCKED.
    pub(crate) fn unblock(self: &Arc<Self>) {
        self.block_permit.store(true, Ordering::SeqCst);
        if self.state() != State::Blocked {
            return;
        }
        if let Some(step) = self.advance(State::Blocked, Event::Unblock) {
            self.resubmit(step, SubmitMode::Normal);
        }
    }

    /// Yield while contending a monitor. Must be called on this thread.
    /// Returns the pin reason if the continuation could not yield; the
    /// thread is RUNNING again in that case.
    pub(crate) fn yield_blocked(&self) -> Result<(), PinReason> {
        self.advance_owned(State::Running, Event::MonitorContended);
        continuation::yield_now().inspect_err(|_| {
            self.advance_owned(State::Blocking, Event::Unpin);
        })
    }

    pub(crate) fn prepare_wait(&self) {
        self.notified.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }

    /// Yield in a monitor wait. Must be called on this thread.
    pub(crate) fn yield_waiting(&self, timeout: Option<Duration>) -> Result<(), PinReason> {
        let (event, waiting) = match timeout {
            Some(t) => {
                self.timeout_nanos
                    .store(duration_nanos(t).max(1), Ordering::SeqCst);
                (Event::TimedWait, State::TimedWaiting)
            }
            None => (Event::Wait, State::Waiting),
        };
        self.interruptible_wait.store(true, Ordering::SeqCst);
        self.advance_owned(State::Running, event);
        let result = continuation::yield_now();
        if result.is_err() {
            self.advance_owned(waiting, Event::Unpin);
        }
        self.interruptible_wait.store(false, Ordering::SeqCst);
        result
    }

    /// Mark a monitor waiter notified; a settled waiter moves to BLOCKED
    /// and is resumed by the next monitor exit.
    pub(crate) fn notify(&self) {
        self.notified.store(true, Ordering::SeqCst);
        let s = self.state();
        if matches!(s, State::Wait | State::TimedWait) {
            self.advance(s, Event::Notify);
        }
    }

    fn wait_timeout_expired(self: &Arc<Self>, seq: u64) {
        let step = {
            let _guard = self.timed_wait_lock.lock();
            if seq != self.timed_wait_seq.load(Ordering::SeqCst) {
                return;
            }
            self.advance(State::TimedWait, Event::Timeout)
        };
        if let Some(step) = step {
            self.resubmit(step, SubmitMode::Normal);
        }
    }

    /// Give queued work a turn. Must be called on this thread.
    pub(crate) fn try_yield(&self) {
        self.advance_owned(State::Running, Event::Yield);
        if continuation::yield_now().is_err() {
            self.advance_owned(State::Yielding, Event::Unpin);
        }
    }

    /// Sleep for `duration`. Must be called on this thread.
    pub(crate) fn sleep(self: &Arc<Self>, duration: Duration) -> Result<(), ThreadError> {
        if self.take_interrupt() {
            return Err(ThreadError::Interrupted);
        }
        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= duration {
                return Ok(());
            }
            self.park_nanos(duration_nanos(duration - elapsed));
            if self.take_interrupt() {
                return Err(ThreadError::Interrupted);
            }
        }
    }

    /// Set the interrupt flag and wake the thread from park, wait or a
    /// blocking call on its carrier.
    pub fn interrupt(self: &Arc<Self>) -> Result<(), ThreadError> {
        {
            let carrier = self.carrier.lock();
            self.interrupted.store(true, Ordering::SeqCst);
            if let Some(carrier) = carrier.as_ref() {
                carrier.parker().interrupt();
            }
        }
        if self.is_current() {
            self.park_permit.store(true, Ordering::SeqCst);
        }
        self.unpark()?;

        let s = self.state();
        if matches!(s, State::Wait | State::TimedWait) {
            if let Some(step) = self.advance(s, Event::Interrupt) {
                self.follow(step, SubmitMode::Normal)?;
            }
        }
        Ok(())
    }

    /// Clear and return the interrupt flag. Only the thread itself may
    /// clear it.
    pub fn clear_interrupt(&self) -> Result<bool, ThreadError> {
        if !self.is_current() {
            return Err(ThreadError::StateConflict(
                "interrupt flag can only be cleared by the thread itself",
            ));
        }
        Ok(self.take_interrupt())
    }

    pub(crate) fn take_interrupt(&self) -> bool {
        if !self.interrupted.load(Ordering::SeqCst) {
            return false;
        }
        let carrier = self.carrier.lock();
        self.interrupted.store(false, Ordering::SeqCst);
        if let Some(carrier) = carrier.as_ref() {
            carrier.parker().clear_interrupt();
        }
        true
    }

    /// Wait for the thread to terminate; `None` waits forever.
    ///
    /// Returns whether termination was observed. An unstarted thread
    /// returns `Ok(false)` at once. A virtual caller that is interrupted
    /// gets `Err(Interrupted)`.
    pub fn join(&self, timeout: Option<Duration>) -> Result<bool, ThreadError> {
        match self.state() {
            State::Terminated => return Ok(true),
            State::New => return Ok(false),
            _ => {}
        }
        let latch = self
            .termination
            .get_or_init(|| Arc::new(CountDownLatch::new(1)))
            .clone();
        fence(Ordering::SeqCst);
        if self.state() == State::Terminated {
            return Ok(true);
        }
        latch.wait(timeout)
    }

    /// [`join`](Self::join) with a timeout in nanoseconds; 0 waits forever.
    pub fn join_nanos(&self, nanos: u64) -> Result<bool, ThreadError> {
        if nanos == 0 {
            self.join(None)
        } else {
            self.join(Some(Duration::from_nanos(nanos)))
        }
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        let state = self.state();
        ThreadSnapshot {
            id: self.id,
            name: self.name.clone(),
            state,
            thread_state: state.thread_state(),
            carrier: self.carrier().map(|c| c.name().to_string()),
            interrupted: self.is_interrupted(),
        }
    }
}

/// Let other work run. On an OS thread this is `std::thread::yield_now`.
pub fn yield_now() {
    match current() {
        Some(vt) => vt.try_yield(),
        None => std::thread::yield_now(),
    }
}

/// Sleep the current thread. A virtual thread unmounts while sleeping
/// and returns `Err(Interrupted)`, with the flag cleared, if it is
/// interrupted.
pub fn sleep(duration: Duration) -> Result<(), ThreadError> {
    match current() {
        Some(vt) => vt.sleep(duration),
        None => {
            std::thread::sleep(duration);
            Ok(())
        }
    }
}

/// Test and clear the current virtual thread's interrupt flag. Always
/// false on an OS thread.
pub fn interrupted() -> bool {
    current().is_some_and(|vt| vt.take_interrupt())
}

fn run_body(this: Weak<VirtualThread>, task: Body) {
    CURRENT.with(|c| *c.borrow_mut() = Some(this.clone()));
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
    CURRENT.with(|c| c.borrow_mut().take());

    if let Err(payload) = outcome {
        // Teardown of an abandoned continuation is not a task failure.
        if continuation::is_abandoned(payload.as_ref()) {
            return;
        }
        match this.upgrade() {
            Some(vt) => vt.dispatch_uncaught(payload.as_ref()),
            None => tracing::error!(
                panic = %panic_message(payload.as_ref()),
                "uncaught panic in released virtual thread"
            ),
        }
    }
}

/// Point-in-time view of a virtual thread.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ThreadSnapshot {
    pub id: u64,
    pub name: String,
    pub state: State,
    pub thread_state: ThreadState,
    /// Name of the carrier while mounted.
    pub carrier: Option<String>,
    pub interrupted: bool,
}

impl fmt::Display for VirtualThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualThread[#{}", self.id)?;
        if !self.name.is_empty() {
            write!(f, ",{}", self.name)?;
        }
        f.write_str("]/")?;
        match self.carrier() {
            Some(carrier) => write!(f, "{}@{}", carrier.state(), carrier.name()),
            None => write!(f, "{}", self.thread_state()),
        }
    }
}

impl fmt::Debug for VirtualThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
