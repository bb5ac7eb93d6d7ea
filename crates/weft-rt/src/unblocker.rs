// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Background thread that resumes virtual threads unblocked by a monitor
//! exit.
//!
//! Monitor exit only enqueues; the submission to the scheduler, which
//! may contend or retry, happens here. A per-thread flag keeps a thread
//! from being queued twice.

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::vthread::VirtualThread;

struct Unblocker {
    tx: Sender<Arc<VirtualThread>>,
}

fn unblocker() -> Option<&'static Unblocker> {
    static UNBLOCKER: OnceLock<Option<Unblocker>> = OnceLock::new();
    UNBLOCKER
        .get_or_init(|| {
            let (tx, rx) = unbounded();
            let spawned = thread::Builder::new()
                .name("weft-unblocker".to_string())
                .spawn(move || drain(rx));
            match spawned {
                Ok(_) => {
                    tracing::debug!("unblocker started");
                    Some(Unblocker { tx })
                }
                Err(err) => {
                    tracing::error!(%err, "failed to start unblocker, unblocking inline");
                    None
                }
            }
        })
        .as_ref()
}

fn drain(rx: Receiver<Arc<VirtualThread>>) {
    for vt in rx {
        vt.on_waiting_list.store(false, Ordering::SeqCst);
        vt.unblock();
    }
}

/// Queue `vt` to be unblocked. No effect if it is already queued.
pub(crate) fn enqueue(vt: Arc<VirtualThread>) {
    if vt.on_waiting_list.swap(true, Ordering::SeqCst) {
        return;
    }
    let Some(unblocker) = unblocker() else {
        vt.on_waiting_list.store(false, Ordering::SeqCst);
        vt.unblock();
        return;
    };
    if let Err(err) = unblocker.tx.send(vt) {
        // The receiver lives for the whole process; unblock here if not.
        let vt = err.into_inner();
        vt.on_waiting_list.store(false, Ordering::SeqCst);
        vt.unblock();
    }
}
