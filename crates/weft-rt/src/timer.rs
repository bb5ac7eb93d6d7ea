// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Delayed callbacks for timed park and timed wait.
//!
//! A service owns a power-of-two number of shards. Each shard is one
//! thread sleeping on a deadline heap, started on first use. Cancellation
//! is best effort: a callback that already fired, or is firing, cannot be
//! recalled, and callers must tolerate that race. Cancelled entries are
//! purged from the heap once they make up more than half of it.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::SchedulerConfig;
use crate::pool::{panic_message, Runnable};

struct TimerTask {
    callback: Mutex<Option<Runnable>>,
    cancelled: AtomicBool,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    task: Arc<TimerTask>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct ShardState {
    heap: BinaryHeap<Reverse<Entry>>,
    /// Cancelled entries still in `heap`.
    cancelled: usize,
    next_seq: u64,
    started: bool,
    shutdown: bool,
}

struct Shard {
    index: usize,
    state: Mutex<ShardState>,
    cv: Condvar,
}

impl Shard {
    fn note_cancelled(&self) {
        let mut state = self.state.lock();
        state.cancelled += 1;
        if state.cancelled * 2 > state.heap.len() {
            state
                .heap
                .retain(|Reverse(e)| !e.task.cancelled.load(Ordering::Acquire));
            state.cancelled = 0;
        }
    }
}

/// Handle to a scheduled callback.
pub struct TimerHandle {
    task: Arc<TimerTask>,
    shard: Arc<Shard>,
}

impl TimerHandle {
    /// Prevent the callback from running. Returns false if it has already
    /// been taken for execution (or was cancelled before).
    pub fn cancel(&self) -> bool {
        self.task.cancelled.store(true, Ordering::Release);
        let taken = self.task.callback.lock().take().is_some();
        if taken {
            self.shard.note_cancelled();
        }
        taken
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Sharded timer threads.
pub struct TimerService {
    name: String,
    shards: Vec<Arc<Shard>>,
    round_robin: AtomicU64,
}

impl TimerService {
    /// `queues` is rounded down to a power of two (minimum 1).
    pub fn new(name: &str, queues: usize) -> Self {
        let queues = queues.max(1);
        let queues = 1 << (usize::BITS - 1 - queues.leading_zeros());
        let shards = (0..queues)
            .map(|index| {
                Arc::new(Shard {
                    index,
                    state: Mutex::new(ShardState::default()),
                    cv: Condvar::new(),
                })
            })
            .collect();
        Self {
            name: name.to_string(),
            shards,
            round_robin: AtomicU64::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Entries still queued across all shards, cancelled ones included
    /// until they are purged.
    pub fn queued(&self) -> usize {
        self.shards.iter().map(|s| s.state.lock().heap.len()).sum()
    }

    /// Shard used for `key`.
    pub fn shard_for(&self, key: u64) -> usize {
        (key as usize) & (self.shards.len() - 1)
    }

    /// Run `f` after `delay` on shard `shard_for(key)`.
    pub fn schedule_keyed<F>(&self, key: u64, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let shard = &self.shards[self.shard_for(key)];
        let task = Arc::new(TimerTask {
            callback: Mutex::new(Some(Box::new(f))),
            cancelled: AtomicBool::new(false),
        });
        let deadline = Instant::now()
            .checked_add(delay)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));

        let mut state = shard.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(Entry {
            deadline,
            seq,
            task: task.clone(),
        }));
        if !state.started {
            self.start_shard(shard, &mut state);
        }
        shard.cv.notify_one();
        TimerHandle {
            task,
            shard: shard.clone(),
        }
    }

    /// Run `f` after `delay`, spreading callbacks over the shards.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let key = self.round_robin.fetch_add(1, Ordering::Relaxed);
        self.schedule_keyed(key, delay, f)
    }

    fn start_shard(&self, shard: &Arc<Shard>, state: &mut ShardState) {
        let worker = shard.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.name, shard.index))
            .spawn(move || shard_loop(worker));
        match spawned {
            Ok(_) => {
                state.started = true;
                tracing::debug!(shard = shard.index, timers = %self.name, "timer shard started");
            }
            // The entry stays queued; the next schedule retries the spawn.
            Err(err) => tracing::error!(shard = shard.index, %err, "failed to start timer shard"),
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        for shard in &self.shards {
            shard.state.lock().shutdown = true;
            shard.cv.notify_all();
        }
    }
}

fn shard_loop(shard: Arc<Shard>) {
    let mut state = shard.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        let next = state.heap.peek().map(|Reverse(e)| e.deadline);
        match next {
            None => shard.cv.wait(&mut state),
            Some(deadline) if deadline > now => {
                shard.cv.wait_until(&mut state, deadline);
            }
            Some(_) => {
                let Some(Reverse(entry)) = state.heap.pop() else {
                    continue;
                };
                if entry.task.cancelled.load(Ordering::Acquire) {
                    state.cancelled = state.cancelled.saturating_sub(1);
                    continue;
                }
                drop(state);
                fire(&shard, entry.task);
                state = shard.state.lock();
            }
        }
    }
}

fn fire(shard: &Shard, task: Arc<TimerTask>) {
    if task.cancelled.load(Ordering::Acquire) {
        return;
    }
    let Some(callback) = task.callback.lock().take() else {
        return;
    };
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        tracing::error!(
            shard = shard.index,
            panic = %panic_message(payload.as_ref()),
            "timer callback panicked"
        );
    }
}

static DEFAULT_TIMERS: OnceLock<Arc<TimerService>> = OnceLock::new();

/// The process-wide timer service, sized from the environment.
pub fn default_timers() -> Arc<TimerService> {
    DEFAULT_TIMERS
        .get_or_init(|| {
            let queues = match SchedulerConfig::from_env() {
                Ok(config) => config.timer_queues,
                Err(err) => {
                    tracing::error!(%err, "invalid scheduler configuration, using defaults");
                    SchedulerConfig::new().timer_queues
                }
            };
            Arc::new(TimerService::new("weft-timer", queues))
        })
        .clone()
}
