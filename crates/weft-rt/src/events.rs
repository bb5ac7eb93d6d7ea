// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime diagnostic events.
//!
//! Every event is logged through `tracing` and handed to any listeners
//! registered with [`add_listener`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{const_rwlock, RwLock};

use crate::continuation::PinReason;
use crate::error::SubmitError;

/// Blocking operation that could not unmount its virtual thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingOp {
    Park,
    TimedPark,
    MonitorEnter,
    MonitorWait,
}

#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A virtual thread blocked its carrier instead of unmounting.
    Pinned {
        thread_id: u64,
        op: BlockingOp,
        reason: PinReason,
        blocked_for: Duration,
    },
    /// A resumption task could not be handed to the scheduler.
    SubmitFailed { thread_id: u64, error: SubmitError },
}

type Listener = Arc<dyn Fn(&RuntimeEvent) + Send + Sync>;

static LISTENERS: RwLock<Vec<Listener>> = const_rwlock(Vec::new());

/// Register a process-wide listener. Listeners cannot be removed.
pub fn add_listener<F>(listener: F)
where
    F: Fn(&RuntimeEvent) + Send + Sync + 'static,
{
    LISTENERS.write().push(Arc::new(listener));
}

pub(crate) fn emit(event: RuntimeEvent) {
    match &event {
        RuntimeEvent::Pinned {
            thread_id,
            op,
            reason,
            blocked_for,
        } => tracing::warn!(
            thread_id,
            ?op,
            ?reason,
            blocked_us = blocked_for.as_micros() as u64,
            "virtual thread pinned its carrier"
        ),
        RuntimeEvent::SubmitFailed { thread_id, error } => {
            tracing::warn!(thread_id, %error, "failed to submit virtual thread")
        }
    }

    let listeners: Vec<Listener> = LISTENERS.read().clone();
    for listener in listeners {
        listener(&event);
    }
}
