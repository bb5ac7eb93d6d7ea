// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Weft runtime: virtual threads on a work-stealing carrier pool.
//!
//! A virtual thread runs its body as a continuation mounted on a carrier
//! (an OS worker thread). Blocking in `park`, `sleep`, monitor enter or
//! monitor wait unmounts it and frees the carrier. When it cannot unmount
//! (pinned), it blocks the carrier instead and the pool may add a spare.
//!
//! Components:
//! - vthread: lifecycle state machine, park/unpark, interrupt, join
//! - pool: carrier pool and the `Executor` seam for custom schedulers
//! - timer: sharded delayed-task service for timed park and wait
//! - monitor: reentrant lock with wait/notify
//! - continuation: suspendable bodies and pinning
//! - container, latch, events: grouping, termination signals, pin reports

pub mod carrier;
pub mod config;
pub mod container;
pub mod continuation;
pub mod error;
pub mod events;
pub mod latch;
pub mod monitor;
pub mod park;
pub mod pool;
pub mod timer;
mod unblocker;
pub mod vthread;

pub use config::SchedulerConfig;
pub use container::ThreadContainer;
pub use error::{ConfigError, SubmitError, ThreadError};
pub use latch::CountDownLatch;
pub use monitor::{Monitor, MonitorGuard};
pub use park::{park, park_timeout};
pub use pool::{CarrierPool, Executor, Runnable};
pub use vthread::{
    current, interrupted, is_virtual, sleep, spawn, yield_now, Builder, State, ThreadSnapshot,
    ThreadState, VirtualThread,
};
