// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Countdown latch that parks virtual threads instead of their carriers.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::ThreadError;
use crate::park::{duration_nanos, Waiter};

struct LatchState {
    count: usize,
    waiters: Vec<Waiter>,
}

/// Opens once `count_down` has been called `count` times.
pub struct CountDownLatch {
    state: Mutex<LatchState>,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(LatchState {
                count,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Decrement the count, waking every waiter when it reaches zero.
    /// No effect on an open latch.
    pub fn count_down(&self) {
        let waiters = {
            let mut state = self.state.lock();
            if state.count == 0 {
                return;
            }
            state.count -= 1;
            if state.count > 0 {
                return;
            }
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.unpark();
        }
    }

    /// Wait for the latch to open.
    ///
    /// `None` waits forever. Returns `Ok(false)` on timeout. A virtual
    /// thread that is interrupted gets `Err(Interrupted)` with its
    /// interrupt flag cleared.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, ThreadError> {
        let deadline = timeout.map(|t| Instant::now().checked_add(t));
        let me = Waiter::current();
        let mut registered = false;

        let result = loop {
            {
                let mut state = self.state.lock();
                if state.count == 0 {
                    break Ok(true);
                }
                if !registered {
                    state.waiters.push(me.clone());
                    registered = true;
                }
            }

            if let Waiter::Virtual(vt) = &me {
                if vt.is_interrupted() {
                    vt.take_interrupt();
                    break Err(ThreadError::Interrupted);
                }
            }

            let remaining = match deadline {
                None | Some(None) => None,
                Some(Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Ok(false);
                    }
                    Some(deadline - now)
                }
            };

            match (&me, remaining) {
                (Waiter::Virtual(vt), None) => vt.park(),
                (Waiter::Virtual(vt), Some(left)) => vt.park_nanos(duration_nanos(left)),
                (os, left) => os.park_os(left),
            }
        };

        if registered && !matches!(result, Ok(true)) {
            self.state.lock().waiters.retain(|w| !w.same_as(&me));
        }
        result
    }
}

impl std::fmt::Debug for CountDownLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountDownLatch")
            .field("count", &self.count())
            .finish()
    }
}
