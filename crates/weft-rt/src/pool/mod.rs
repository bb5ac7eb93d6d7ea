// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Executors that run virtual thread resumption tasks.
//!
//! [`Executor`] is the seam between virtual threads and whatever runs
//! them. [`CarrierPool`] is the default: an M:N work-stealing pool whose
//! workers are carriers. Workers are spawned lazily up to the configured
//! parallelism. While a carrier is pinned the pool may add a spare so
//! enough carriers stay runnable; spares retire once idle.

pub(crate) mod queue;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::carrier::CarrierThread;
use crate::config::SchedulerConfig;
use crate::error::{SubmitError, ThreadError};
use queue::{InjectorQueue, LocalQueue};

/// A resumption task.
pub type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// Runs resumption tasks for virtual threads.
///
/// Only `execute` is required. The other methods let a pool that knows
/// about its own workers do better than the defaults.
pub trait Executor: Send + Sync {
    /// Submit a task. It must eventually run unless the executor is shut
    /// down, in which case `Err(Rejected)` is returned.
    fn execute(&self, task: Runnable) -> Result<(), SubmitError>;

    /// Submit from a worker of this executor, favouring the worker's own
    /// queue and skipping the wake-up of idle peers.
    fn lazy_execute(&self, task: Runnable) -> Result<(), SubmitError> {
        self.execute(task)
    }

    /// Submit to the shared queue, behind work already queued there.
    fn external_execute(&self, task: Runnable) -> Result<(), SubmitError> {
        self.execute(task)
    }

    /// Length of the caller's local queue when the caller is a worker
    /// of this executor (or a virtual thread mounted on one).
    fn current_carrier_queue_len(&self) -> Option<usize> {
        None
    }

    /// The calling carrier is about to block. Returns whether the block
    /// was accounted for; pass the result to `end_compensated_block`.
    fn begin_compensated_block(&self) -> bool {
        false
    }

    fn end_compensated_block(&self, _compensated: bool) {}
}

/// Idle time after which a carrier above the target parallelism exits.
const SPARE_KEEP_ALIVE: Duration = Duration::from_secs(1);

/// Upper bound on one idle wait; workers re-scan for steals afterwards.
const IDLE_WAIT: Duration = Duration::from_millis(5);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct Slot {
    queue: LocalQueue<Runnable>,
    in_use: AtomicBool,
}

struct PoolShared {
    id: u64,
    name: String,
    config: SchedulerConfig,
    /// One slot per possible carrier (`max_pool_size`).
    slots: Vec<Slot>,
    /// Highest slot index ever used, plus one. Bounds the victim search.
    slots_used: AtomicUsize,
    injector: InjectorQueue<Runnable>,
    workers: AtomicUsize,
    idle: AtomicUsize,
    /// Carriers currently blocked by a pinned virtual thread.
    blocked: AtomicUsize,
    shutdown: AtomicBool,
    work_available: (Mutex<bool>, Condvar),
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Work-stealing pool of carrier threads.
pub struct CarrierPool {
    shared: Arc<PoolShared>,
}

impl CarrierPool {
    /// Create a pool. No threads are started until work is submitted.
    pub fn new(name: &str, config: SchedulerConfig) -> Self {
        let slots = (0..config.max_pool_size)
            .map(|_| Slot {
                queue: LocalQueue::new(),
                in_use: AtomicBool::new(false),
            })
            .collect();
        let shared = Arc::new(PoolShared {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            config,
            slots,
            slots_used: AtomicUsize::new(0),
            injector: InjectorQueue::new(),
            workers: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            blocked: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            work_available: (Mutex::new(false), Condvar::new()),
            handles: Mutex::new(Vec::new()),
        });
        tracing::debug!(
            pool = %shared.name,
            parallelism = shared.config.parallelism,
            max_pool_size = shared.config.max_pool_size,
            "carrier pool created"
        );
        Self { shared }
    }

    /// A pool configured from the `WEFT_SCHEDULER_*` environment.
    pub fn from_env(name: &str) -> Result<Self, ThreadError> {
        Self::from_lookup(name, |var| std::env::var(var).ok())
    }

    /// A pool configured through `lookup`; see [`SchedulerConfig::from_lookup`].
    pub fn from_lookup<F>(name: &str, lookup: F) -> Result<Self, ThreadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = SchedulerConfig::from_lookup(lookup)?;
        Ok(Self::new(name, config))
    }

    /// A pool with `parallelism` carriers and default limits.
    pub fn with_parallelism(name: &str, parallelism: usize) -> Self {
        Self::new(name, SchedulerConfig::with_parallelism(parallelism))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Live carrier threads, spares included.
    pub fn worker_count(&self) -> usize {
        self.shared.workers.load(Ordering::Acquire)
    }

    /// Tasks waiting in any queue.
    pub fn queued_task_count(&self) -> usize {
        let local: usize = self.shared.slots[..self.shared.victim_bound()]
            .iter()
            .map(|s| s.queue.len())
            .sum();
        local + self.shared.injector.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work. Queued tasks still run; then workers exit.
    /// Waits for workers other than the calling thread.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(pool = %self.shared.name, "carrier pool shutting down");
        self.shared.notify_all();

        let me = thread::current().id();
        let handles: Vec<_> = self.shared.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }

    /// The caller's queue slot if the caller runs on one of our carriers.
    fn current_slot(&self) -> Option<usize> {
        let carrier = CarrierThread::current()?;
        match carrier.slot() {
            Some((pool, slot)) if pool == self.shared.id => Some(slot),
            _ => None,
        }
    }

    /// Make sure at least one worker exists before accepting work.
    fn ensure_worker(&self) -> Result<(), SubmitError> {
        if self.shared.workers.load(Ordering::Acquire) > 0 {
            return Ok(());
        }
        match PoolShared::spawn_worker(&self.shared, false) {
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::warn!(pool = %self.shared.name, %err, "failed to start carrier");
                if self.shared.workers.load(Ordering::Acquire) > 0 {
                    Ok(())
                } else {
                    Err(SubmitError::ResourceExhausted)
                }
            }
        }
    }

    fn check_open(&self) -> Result<(), SubmitError> {
        if self.is_shutdown() {
            Err(SubmitError::Rejected)
        } else {
            Ok(())
        }
    }
}

impl Executor for CarrierPool {
    fn execute(&self, task: Runnable) -> Result<(), SubmitError> {
        self.check_open()?;
        self.ensure_worker()?;
        match self.current_slot() {
            Some(slot) => {
                if let Err(task) = self.shared.slots[slot].queue.push(task) {
                    self.shared.injector.push(task);
                }
            }
            None => self.shared.injector.push(task),
        }
        self.shared.signal_work();
        Ok(())
    }

    fn lazy_execute(&self, task: Runnable) -> Result<(), SubmitError> {
        self.check_open()?;
        if let Some(slot) = self.current_slot() {
            let queue = &self.shared.slots[slot].queue;
            if queue.is_empty() {
                // The owning carrier picks it up as soon as it is free.
                return match queue.push(task) {
                    Ok(()) => Ok(()),
                    Err(task) => self.execute(task),
                };
            }
        }
        self.execute(task)
    }

    fn external_execute(&self, task: Runnable) -> Result<(), SubmitError> {
        self.check_open()?;
        self.ensure_worker()?;
        self.shared.injector.push(task);
        self.shared.signal_work();
        Ok(())
    }

    fn current_carrier_queue_len(&self) -> Option<usize> {
        self.current_slot()
            .map(|slot| self.shared.slots[slot].queue.len())
    }

    fn begin_compensated_block(&self) -> bool {
        if self.current_slot().is_none() {
            return false;
        }
        let shared = &self.shared;
        let blocked = shared.blocked.fetch_add(1, Ordering::AcqRel) + 1;
        let workers = shared.workers.load(Ordering::Acquire);
        let runnable = workers.saturating_sub(blocked);
        if runnable < shared.config.min_runnable && !shared.shutdown.load(Ordering::Acquire) {
            match PoolShared::spawn_worker(shared, true) {
                Ok(true) => tracing::debug!(pool = %shared.name, workers = workers + 1, "spare carrier added"),
                Ok(false) => tracing::debug!(pool = %shared.name, "pool at max size, no spare carrier"),
                Err(err) => tracing::warn!(pool = %shared.name, %err, "failed to add spare carrier"),
            }
        }
        true
    }

    fn end_compensated_block(&self, compensated: bool) {
        if compensated {
            self.shared.blocked.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for CarrierPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PoolShared {
    fn victim_bound(&self) -> usize {
        self.slots_used.load(Ordering::Acquire).min(self.slots.len())
    }

    /// Wake an idle worker, or start a new one while under parallelism.
    fn signal_work(self: &Arc<Self>) {
        let workers = self.workers.load(Ordering::Acquire);
        let active = workers.saturating_sub(self.blocked.load(Ordering::Acquire));
        if self.idle.load(Ordering::Acquire) == 0 && active < self.config.parallelism {
            if let Err(err) = PoolShared::spawn_worker(self, false) {
                tracing::warn!(pool = %self.name, %err, "failed to start carrier");
            }
        }
        let (lock, cvar) = &self.work_available;
        let mut ready = lock.lock();
        *ready = true;
        cvar.notify_one();
    }

    fn notify_all(&self) {
        let (lock, cvar) = &self.work_available;
        let mut ready = lock.lock();
        *ready = true;
        cvar.notify_all();
    }

    /// Claim a free slot and start a worker on it. `Ok(false)` if every
    /// slot is taken (or, for core workers, parallelism is reached).
    fn spawn_worker(this: &Arc<Self>, spare: bool) -> std::io::Result<bool> {
        let limit = if spare {
            this.config.max_pool_size
        } else {
            this.config.parallelism
        };
        let mut workers = this.workers.load(Ordering::Acquire);
        loop {
            if workers >= limit {
                return Ok(false);
            }
            match this.workers.compare_exchange(
                workers,
                workers + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => workers = actual,
            }
        }

        let Some(slot) = this.claim_slot() else {
            this.workers.fetch_sub(1, Ordering::AcqRel);
            return Ok(false);
        };

        let name = format!("{}-carrier-{}", this.name, slot);
        let carrier = CarrierThread::new(name.clone(), Some((this.id, slot)));
        let shared = this.clone();
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(shared, carrier, slot));
        match spawned {
            Ok(handle) => {
                this.handles.lock().push(handle);
                Ok(true)
            }
            Err(err) => {
                this.slots[slot].in_use.store(false, Ordering::Release);
                this.workers.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    fn claim_slot(&self) -> Option<usize> {
        let slot = self.slots.iter().position(|s| {
            s.in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })?;
        self.slots_used.fetch_max(slot + 1, Ordering::AcqRel);
        Some(slot)
    }

    /// Drop one worker if the pool is above its target size.
    fn try_retire(&self) -> bool {
        let mut workers = self.workers.load(Ordering::Acquire);
        loop {
            if workers <= self.config.parallelism + self.blocked.load(Ordering::Acquire) {
                return false;
            }
            match self.workers.compare_exchange(
                workers,
                workers - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => workers = actual,
            }
        }
    }

    fn find_task(&self, slot: usize, rng: &mut u64) -> Option<Runnable> {
        let local = &self.slots[slot].queue;
        if let Some(task) = local.pop() {
            return Some(task);
        }

        let bound = self.victim_bound();
        if bound > 1 {
            let victim = (xorshift64(rng) as usize) % bound;
            if victim != slot {
                let mut stolen = self.slots[victim].queue.steal_batch().into_iter();
                if let Some(first) = stolen.next() {
                    for task in stolen {
                        if let Err(task) = local.push(task) {
                            self.injector.push(task);
                        }
                    }
                    return Some(first);
                }
            }
        }

        self.injector.pop()
    }

    fn has_queued_work(&self, slot: usize) -> bool {
        !self.injector.is_empty() || !self.slots[slot].queue.is_empty()
    }
}

/// Simple xorshift64 for random victim selection.
fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn worker_loop(shared: Arc<PoolShared>, carrier: Arc<CarrierThread>, slot: usize) {
    tracing::debug!(pool = %shared.name, carrier = carrier.id(), slot, "carrier started");
    let _installed = CarrierThread::install(carrier.clone());
    let mut rng = (carrier.id()).wrapping_add(0x9E3779B97F4A7C15);
    let mut idle_since: Option<Instant> = None;

    loop {
        if let Some(task) = shared.find_task(slot, &mut rng) {
            idle_since = None;
            run_task(&shared, task);
            continue;
        }

        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let since = *idle_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= SPARE_KEEP_ALIVE && shared.try_retire() {
            retire(&shared, slot);
            tracing::debug!(pool = %shared.name, carrier = carrier.id(), "idle carrier retired");
            return;
        }

        let (lock, cvar) = &shared.work_available;
        let mut ready = lock.lock();
        // Re-check: work may have arrived between the scan and locking.
        if shared.has_queued_work(slot) || shared.shutdown.load(Ordering::Acquire) {
            continue;
        }
        shared.idle.fetch_add(1, Ordering::AcqRel);
        if !*ready {
            cvar.wait_for(&mut ready, IDLE_WAIT);
        }
        *ready = false;
        shared.idle.fetch_sub(1, Ordering::AcqRel);
    }

    shared.workers.fetch_sub(1, Ordering::AcqRel);
    retire(&shared, slot);
    tracing::debug!(pool = %shared.name, carrier = carrier.id(), "carrier stopped");
}

/// Hand leftover work back and free the slot.
fn retire(shared: &PoolShared, slot: usize) {
    let leftovers = shared.slots[slot].queue.drain_all();
    if !leftovers.is_empty() {
        shared.injector.push_batch(leftovers);
        shared.notify_all();
    }
    shared.slots[slot].in_use.store(false, Ordering::Release);
}

fn run_task(shared: &PoolShared, task: Runnable) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
        let msg = panic_message(payload.as_ref());
        tracing::error!(pool = %shared.name, panic = %msg, "resumption task panicked");
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

static DEFAULT_POOL: OnceLock<Arc<CarrierPool>> = OnceLock::new();

/// The process-wide pool, created from the environment on first use.
pub fn default_pool() -> Arc<CarrierPool> {
    DEFAULT_POOL
        .get_or_init(|| {
            let config = SchedulerConfig::from_env().unwrap_or_else(|err| {
                tracing::error!(%err, "invalid scheduler configuration, using defaults");
                SchedulerConfig::new()
            });
            Arc::new(CarrierPool::new("weft", config))
        })
        .clone()
}

/// [`default_pool`] as an executor handle.
pub fn default_scheduler() -> Arc<dyn Executor> {
    default_pool()
}
