// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reentrant monitor with wait/notify that unmounts virtual threads.
//!
//! Succession is competitive: the exiting owner wakes one thread from
//! the entry list and that thread contends again. A loser goes back to
//! the front of the list. Virtual threads are woken through the
//! unblocker; OS threads and pinned virtual threads through a parker.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::continuation::{self, PinReason};
use crate::error::ThreadError;
use crate::events::{self, BlockingOp, RuntimeEvent};
use crate::park::{os_parker, Waiter};
use crate::unblocker;
use crate::vthread::{self, VirtualThread};

/// First recheck interval for a pinned thread waiting to enter.
const PINNED_BACKOFF_START: Duration = Duration::from_millis(1);
const PINNED_BACKOFF_MAX: Duration = Duration::from_millis(1000);
const PINNED_BACKOFF_FACTOR: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Virtual(u64),
    Os(ThreadId),
}

impl Owner {
    fn current() -> Self {
        match vthread::current() {
            Some(vt) => Owner::Virtual(vt.id()),
            None => Owner::Os(thread::current().id()),
        }
    }
}

struct Node {
    waiter: Waiter,
    notified: AtomicBool,
}

impl Node {
    fn new(waiter: Waiter) -> Arc<Self> {
        Arc::new(Self {
            waiter,
            notified: AtomicBool::new(false),
        })
    }

    fn wake(&self) {
        match &self.waiter {
            Waiter::Virtual(vt) => unblocker::enqueue(vt.clone()),
            other => other.unpark(),
        }
    }
}

#[derive(Default)]
struct MonitorState {
    owner: Option<Owner>,
    recursions: usize,
    entry_list: VecDeque<Arc<Node>>,
    wait_set: VecDeque<Arc<Node>>,
}

impl MonitorState {
    fn try_take(&mut self, me: Owner, recursions: usize) -> bool {
        match self.owner {
            None => {
                self.owner = Some(me);
                self.recursions = recursions;
                true
            }
            Some(owner) if owner == me => {
                self.recursions += recursions;
                true
            }
            Some(_) => false,
        }
    }

    /// Queue `node` unless it is queued already. A node that was woken
    /// and lost the race goes back to the front.
    fn enqueue(&mut self, node: &Arc<Node>, woken: bool) {
        if self.entry_list.iter().any(|n| Arc::ptr_eq(n, node)) {
            return;
        }
        if woken {
            self.entry_list.push_front(node.clone());
        } else {
            self.entry_list.push_back(node.clone());
        }
    }

    fn unlink(list: &mut VecDeque<Arc<Node>>, node: &Arc<Node>) -> bool {
        match list.iter().position(|n| Arc::ptr_eq(n, node)) {
            Some(i) => {
                list.remove(i);
                true
            }
            None => false,
        }
    }
}

/// A data-less reentrant lock with a wait set.
#[derive(Default)]
pub struct Monitor {
    state: Mutex<MonitorState>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the monitor, blocking while another thread holds it.
    /// A virtual thread unmounts while blocked unless it is pinned.
    pub fn enter(&self) -> MonitorGuard<'_> {
        let me = Owner::current();
        if !self.state.lock().try_take(me, 1) {
            self.enter_contended(me, 1, None);
        }
        MonitorGuard::new(self)
    }

    pub fn try_enter(&self) -> Option<MonitorGuard<'_>> {
        let me = Owner::current();
        if self.state.lock().try_take(me, 1) {
            Some(MonitorGuard::new(self))
        } else {
            None
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(Owner::current())
    }

    /// Threads queued to enter.
    pub fn entry_count(&self) -> usize {
        self.state.lock().entry_list.len()
    }

    /// Threads in `wait` that have not been notified.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().wait_set.len()
    }

    fn exit(&self) {
        let successor = {
            let mut state = self.state.lock();
            debug_assert_eq!(state.owner, Some(Owner::current()));
            state.recursions = state.recursions.saturating_sub(1);
            if state.recursions > 0 {
                return;
            }
            state.owner = None;
            state.entry_list.pop_front()
        };
        if let Some(node) = successor {
            node.wake();
        }
    }

    fn enter_contended(&self, me: Owner, recursions: usize, node: Option<Arc<Node>>) {
        let vt = vthread::current();
        let node = node.unwrap_or_else(|| Node::new(waiter_for(vt.as_ref())));
        match (&vt, &node.waiter) {
            (Some(vt), Waiter::Virtual(_)) => self.enter_virtual(vt, &node, me, recursions),
            (Some(vt), Waiter::Carrier(_)) => self.enter_pinned(vt, &node, me, recursions),
            _ => self.enter_os(&node, me, recursions),
        }
    }

    /// Try once, queueing `node` on failure. True once owned.
    fn attempt(&self, node: &Arc<Node>, me: Owner, recursions: usize, woken: bool) -> bool {
        let mut state = self.state.lock();
        if state.try_take(me, recursions) {
            MonitorState::unlink(&mut state.entry_list, node);
            return true;
        }
        state.enqueue(node, woken);
        false
    }

    fn enter_virtual(
        &self,
        vt: &Arc<VirtualThread>,
        node: &Arc<Node>,
        me: Owner,
        recursions: usize,
    ) {
        let mut woken = false;
        while !self.attempt(node, me, recursions, woken) {
            if let Err(reason) = vt.yield_blocked() {
                // Cannot happen while pin state is unchanged; poll instead.
                tracing::debug!(thread_id = vt.id(), ?reason, "monitor enter could not yield");
                thread::sleep(PINNED_BACKOFF_START);
            }
            woken = true;
        }
    }

    fn enter_pinned(
        &self,
        vt: &Arc<VirtualThread>,
        node: &Arc<Node>,
        me: Owner,
        recursions: usize,
    ) {
        let Waiter::Carrier(carrier) = &node.waiter else {
            return self.enter_os(node, me, recursions);
        };
        let start = Instant::now();
        let compensated = vt.scheduler().begin_compensated_block();
        let mut backoff = PINNED_BACKOFF_START;
        let mut woken = false;
        while !self.attempt(node, me, recursions, woken) {
            carrier.parker().park_uninterruptibly(Some(backoff));
            backoff = (backoff * PINNED_BACKOFF_FACTOR).min(PINNED_BACKOFF_MAX);
            woken = true;
        }
        vt.scheduler().end_compensated_block(compensated);
        emit_pinned(vt, BlockingOp::MonitorEnter, start);
    }

    fn enter_os(&self, node: &Arc<Node>, me: Owner, recursions: usize) {
        let mut woken = false;
        while !self.attempt(node, me, recursions, woken) {
            node.waiter.park_os(None);
            woken = true;
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<(), ThreadError> {
        let me = Owner::current();
        let vt = vthread::current();
        let node = Node::new(waiter_for(vt.as_ref()));

        // Release completely, remembering the hold count.
        let (saved, successor) = {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                return Err(ThreadError::StateConflict(
                    "monitor not held by the current thread",
                ));
            }
            if let Some(vt) = &vt {
                if vt.take_interrupt() {
                    return Err(ThreadError::Interrupted);
                }
                vt.prepare_wait();
            }
            state.wait_set.push_back(node.clone());
            let saved = std::mem::take(&mut state.recursions);
            state.owner = None;
            (saved, state.entry_list.pop_front())
        };
        if let Some(successor) = successor {
            successor.wake();
        }

        match (&vt, &node.waiter) {
            (Some(vt), Waiter::Virtual(_)) => {
                // An unexpected pin is a spurious wakeup.
                let _ = vt.yield_waiting(timeout);
            }
            (Some(vt), Waiter::Carrier(_)) => {
                let start = Instant::now();
                let compensated = vt.scheduler().begin_compensated_block();
                self.block_in_wait(&node, Some(vt), timeout);
                vt.scheduler().end_compensated_block(compensated);
                emit_pinned(vt, BlockingOp::MonitorWait, start);
            }
            _ => self.block_in_wait(&node, None, timeout),
        }

        // Timed out, interrupted or spurious: leave the wait set.
        let notified = {
            let mut state = self.state.lock();
            let still_waiting = MonitorState::unlink(&mut state.wait_set, &node);
            !still_waiting && node.notified.load(Ordering::SeqCst)
        };

        let reacquired = {
            let mut state = self.state.lock();
            let taken = state.try_take(me, saved);
            if taken {
                MonitorState::unlink(&mut state.entry_list, &node);
            } else {
                state.enqueue(&node, true);
            }
            taken
        };
        if !reacquired {
            self.enter_contended(me, saved, Some(node));
        }

        match &vt {
            Some(vt) if !notified && vt.take_interrupt() => Err(ThreadError::Interrupted),
            _ => Ok(()),
        }
    }

    /// Park until notified, interrupted or timed out. Used by OS threads
    /// and pinned virtual threads.
    fn block_in_wait(
        &self,
        node: &Arc<Node>,
        vt: Option<&Arc<VirtualThread>>,
        timeout: Option<Duration>,
    ) {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            if node.notified.load(Ordering::SeqCst) {
                return;
            }
            if vt.is_some_and(|vt| vt.is_interrupted()) {
                return;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            match &node.waiter {
                // Interruptible: interrupt reaches the carrier's parker.
                Waiter::Carrier(carrier) => carrier.parker().park(remaining),
                other => other.park_os(remaining),
            }
        }
    }

    fn notify(&self, all: bool) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(Owner::current()));
        while let Some(node) = state.wait_set.pop_front() {
            node.notified.store(true, Ordering::SeqCst);
            if let Waiter::Virtual(vt) = &node.waiter {
                vt.notify();
            }
            // Woken by the owner's exit, in entry order.
            state.entry_list.push_back(node);
            if !all {
                break;
            }
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Monitor")
            .field("owner", &state.owner)
            .field("recursions", &state.recursions)
            .field("entry_list", &state.entry_list.len())
            .field("wait_set", &state.wait_set.len())
            .finish()
    }
}

/// How the calling thread waits for this monitor.
fn waiter_for(vt: Option<&Arc<VirtualThread>>) -> Waiter {
    match vt {
        Some(vt) => match (continuation::pin_reason(), vt.carrier()) {
            (None, _) => Waiter::Virtual(vt.clone()),
            (Some(_), Some(carrier)) => Waiter::Carrier(carrier),
            (Some(_), None) => Waiter::Os(os_parker()),
        },
        None => Waiter::Os(os_parker()),
    }
}

fn emit_pinned(vt: &VirtualThread, op: BlockingOp, start: Instant) {
    events::emit(RuntimeEvent::Pinned {
        thread_id: vt.id(),
        op,
        reason: continuation::pin_reason().unwrap_or(PinReason::CriticalSection),
        blocked_for: start.elapsed(),
    });
}

/// Proof of ownership of a [`Monitor`]. Exits on drop.
#[must_use = "the monitor is released as soon as the guard drops"]
pub struct MonitorGuard<'a> {
    monitor: &'a Monitor,
    _not_send: PhantomData<*const ()>,
}

impl<'a> MonitorGuard<'a> {
    fn new(monitor: &'a Monitor) -> Self {
        Self {
            monitor,
            _not_send: PhantomData,
        }
    }

    /// Release the monitor until notified, then re-acquire it.
    ///
    /// May return spuriously. A virtual thread interrupted before being
    /// notified gets `Err(Interrupted)` after re-acquiring, with its
    /// interrupt flag cleared.
    pub fn wait(&self) -> Result<(), ThreadError> {
        self.monitor.wait(None)
    }

    /// Like [`wait`](Self::wait), also returning once `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), ThreadError> {
        self.monitor.wait(Some(timeout))
    }

    /// Move one waiter to the entry list.
    pub fn notify(&self) {
        self.monitor.notify(false);
    }

    pub fn notify_all(&self) {
        self.monitor.notify(true);
    }
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        self.monitor.exit();
    }
}
