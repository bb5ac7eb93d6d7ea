// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Parking primitives shared by virtual threads and OS threads.
//!
//! [`Parker`] is a one-permit semaphore with an interrupt flag. Every
//! carrier owns one (pinned virtual threads block on it) and every OS
//! thread that waits on a latch or monitor gets one lazily.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::carrier::CarrierThread;
use crate::vthread::VirtualThread;

#[derive(Debug, Default)]
struct ParkerState {
    permit: bool,
    interrupted: bool,
    /// `Some(timed)` while a thread is blocked in `park`.
    blocked: Option<bool>,
}

/// Permit-based blocking for one OS thread.
#[derive(Debug, Default)]
pub struct Parker {
    state: Mutex<ParkerState>,
    cv: Condvar,
}

impl Parker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until unparked, interrupted, or `timeout` elapses.
    ///
    /// Returns immediately if a permit is available (consuming it) or the
    /// interrupt flag is set. The flag is left untouched.
    pub fn park(&self, timeout: Option<Duration>) {
        self.park_inner(timeout, true);
    }

    /// Like [`park`](Self::park) but ignores the interrupt flag.
    pub fn park_uninterruptibly(&self, timeout: Option<Duration>) {
        self.park_inner(timeout, false);
    }

    fn park_inner(&self, timeout: Option<Duration>, interruptible: bool) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        state.blocked = Some(deadline.is_some());
        loop {
            if state.permit {
                state.permit = false;
                break;
            }
            if interruptible && state.interrupted {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut state, deadline).timed_out() {
                        state.permit = false;
                        break;
                    }
                }
                None => self.cv.wait(&mut state),
            }
        }
        state.blocked = None;
    }

    /// Make a permit available, waking the parked thread if any.
    pub fn unpark(&self) {
        let mut state = self.state.lock();
        state.permit = true;
        self.cv.notify_all();
    }

    /// Set the interrupt flag and wake the parked thread if any.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.cv.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }

    /// Clear the interrupt flag, returning its previous value.
    pub fn clear_interrupt(&self) -> bool {
        std::mem::replace(&mut self.state.lock().interrupted, false)
    }

    /// `Some(timed)` while a thread is blocked in this parker.
    pub fn blocked(&self) -> Option<bool> {
        self.state.lock().blocked
    }
}

thread_local! {
    static OS_PARKER: Arc<Parker> = Arc::new(Parker::new());
}

/// The parker of the calling OS thread.
pub(crate) fn os_parker() -> Arc<Parker> {
    OS_PARKER.with(|p| p.clone())
}

/// A thread that can be parked and later woken.
#[derive(Clone)]
pub(crate) enum Waiter {
    Virtual(Arc<VirtualThread>),
    /// A pinned virtual thread, blocked on its carrier.
    Carrier(Arc<CarrierThread>),
    Os(Arc<Parker>),
}

impl Waiter {
    /// The calling thread: its virtual thread if it has one, else its
    /// OS thread parker.
    pub fn current() -> Self {
        match crate::vthread::current() {
            Some(vt) => Waiter::Virtual(vt),
            None => Waiter::Os(os_parker()),
        }
    }

    pub fn unpark(&self) {
        match self {
            Waiter::Virtual(vt) => {
                if let Err(err) = vt.unpark() {
                    tracing::warn!(thread_id = vt.id(), %err, "unpark failed");
                }
            }
            Waiter::Carrier(carrier) => carrier.parker().unpark(),
            Waiter::Os(parker) => parker.unpark(),
        }
    }

    /// Block an OS-level waiter. Virtual waiters park through their
    /// own thread and never get here.
    pub fn park_os(&self, timeout: Option<Duration>) {
        match self {
            Waiter::Os(parker) => parker.park_uninterruptibly(timeout),
            Waiter::Carrier(carrier) => carrier.parker().park_uninterruptibly(timeout),
            Waiter::Virtual(vt) => {
                tracing::error!(thread_id = vt.id(), "virtual waiter parked as an OS thread");
                std::thread::sleep(timeout.unwrap_or(Duration::from_millis(1)));
            }
        }
    }

    pub fn same_as(&self, other: &Waiter) -> bool {
        match (self, other) {
            (Waiter::Virtual(a), Waiter::Virtual(b)) => Arc::ptr_eq(a, b),
            (Waiter::Carrier(a), Waiter::Carrier(b)) => Arc::ptr_eq(a, b),
            (Waiter::Os(a), Waiter::Os(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Disable the current thread until unparked.
///
/// On a virtual thread this unmounts it from its carrier; on an OS thread
/// it blocks the thread. May return spuriously.
pub fn park() {
    match crate::vthread::current() {
        Some(vt) => vt.park(),
        None => os_parker().park(None),
    }
}

/// Like [`park`], giving up after `timeout`.
pub fn park_timeout(timeout: Duration) {
    match crate::vthread::current() {
        Some(vt) => vt.park_nanos(duration_nanos(timeout)),
        None => os_parker().park(Some(timeout)),
    }
}

pub(crate) fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn permit_granted_before_park_is_consumed() {
        let p = Parker::new();
        p.unpark();
        p.park(None);
        // Permit is gone: a timed park now times out.
        let start = Instant::now();
        p.park(Some(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn unpark_wakes_blocked_thread() {
        let p = Arc::new(Parker::new());
        let p2 = p.clone();
        let h = thread::spawn(move || p2.park(None));
        while p.blocked().is_none() {
            thread::yield_now();
        }
        assert_eq!(p.blocked(), Some(false));
        p.unpark();
        h.join().unwrap();
    }

    #[test]
    fn interrupt_wakes_and_stays_set() {
        let p = Arc::new(Parker::new());
        let p2 = p.clone();
        let h = thread::spawn(move || {
            p2.park(None);
            p2.is_interrupted()
        });
        while p.blocked().is_none() {
            thread::yield_now();
        }
        p.interrupt();
        assert!(h.join().unwrap());
        assert!(p.clear_interrupt());
        assert!(!p.is_interrupted());
    }

    #[test]
    fn uninterruptible_park_ignores_interrupt() {
        let p = Parker::new();
        p.interrupt();
        let start = Instant::now();
        p.park_uninterruptibly(Some(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
        // Interruptible park returns at once while the flag is set.
        p.park(None);
    }

    #[test]
    fn os_thread_park_timeout_returns() {
        let start = Instant::now();
        park_timeout(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
