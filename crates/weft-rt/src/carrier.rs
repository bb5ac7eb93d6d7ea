// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Carrier threads: the OS threads virtual threads are mounted on.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::park::Parker;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Ids for virtual threads and carriers come from one counter.
pub(crate) fn next_thread_id() -> u64 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<CarrierThread>>> = const { RefCell::new(None) };
}

/// Coarse state of a carrier, as shown in virtual thread diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierState {
    Runnable,
    Waiting,
    TimedWaiting,
}

impl fmt::Display for CarrierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CarrierState::Runnable => "runnable",
            CarrierState::Waiting => "waiting",
            CarrierState::TimedWaiting => "timed_waiting",
        })
    }
}

/// An OS thread that runs continuations.
///
/// Pool workers register one at startup. Threads of a foreign executor
/// get an ad-hoc carrier the first time they run a virtual thread.
pub struct CarrierThread {
    id: u64,
    name: String,
    /// `(pool id, queue slot)` for pool workers.
    slot: Option<(u64, usize)>,
    parker: Parker,
}

impl CarrierThread {
    pub(crate) fn new(name: String, slot: Option<(u64, usize)>) -> Arc<Self> {
        Arc::new(Self {
            id: next_thread_id(),
            name,
            slot,
            parker: Parker::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pinned virtual threads block here.
    pub fn parker(&self) -> &Parker {
        &self.parker
    }

    pub(crate) fn slot(&self) -> Option<(u64, usize)> {
        self.slot
    }

    pub fn state(&self) -> CarrierState {
        match self.parker.blocked() {
            None => CarrierState::Runnable,
            Some(false) => CarrierState::Waiting,
            Some(true) => CarrierState::TimedWaiting,
        }
    }

    /// The carrier hosting the caller: the OS thread itself if it is a
    /// carrier, else the carrier the current virtual thread is mounted on.
    pub fn current() -> Option<Arc<CarrierThread>> {
        CURRENT
            .with(|c| c.borrow().clone())
            .or_else(|| crate::vthread::current().and_then(|vt| vt.carrier()))
    }

    /// The carrier registered for this OS thread, registering an ad-hoc
    /// one if there is none.
    pub(crate) fn current_or_adhoc() -> Arc<CarrierThread> {
        CURRENT.with(|c| {
            let mut slot = c.borrow_mut();
            if let Some(carrier) = slot.as_ref() {
                return carrier.clone();
            }
            let thread = std::thread::current();
            let name = thread
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", thread.id()));
            let carrier = CarrierThread::new(name, None);
            tracing::debug!(carrier = carrier.id, name = %carrier.name, "ad-hoc carrier registered");
            *slot = Some(carrier.clone());
            carrier
        })
    }

    /// Register `carrier` for the calling OS thread until the guard drops.
    pub(crate) fn install(carrier: Arc<CarrierThread>) -> InstallGuard {
        let previous = CURRENT.with(|c| c.borrow_mut().replace(carrier));
        InstallGuard { previous }
    }
}

impl fmt::Debug for CarrierThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CarrierThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct InstallGuard {
    previous: Option<Arc<CarrierThread>>,
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}
