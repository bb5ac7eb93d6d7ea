// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end scheduling scenarios: park/unpark, pinning, interrupts,
//! monitors and submission failures, each on its own carrier pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use weft_rt::continuation;
use weft_rt::events::{self, BlockingOp, RuntimeEvent};
use weft_rt::{
    Builder, CarrierPool, Executor, Monitor, Runnable, State, SubmitError, ThreadContainer,
    ThreadError, ThreadState, VirtualThread,
};

const LONG: Duration = Duration::from_secs(10);

fn pool(name: &str, parallelism: usize) -> Arc<CarrierPool> {
    Arc::new(CarrierPool::with_parallelism(name, parallelism))
}

/// Spin until `cond` holds, failing after a generous deadline.
fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + LONG;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn wait_for_state(vt: &VirtualThread, state: State) {
    wait_until(&format!("{state}"), || vt.state() == state);
}

/// Delegates to a pool, counting submissions.
struct Counting {
    inner: Arc<CarrierPool>,
    submitted: AtomicUsize,
}

impl Executor for Counting {
    fn execute(&self, task: Runnable) -> Result<(), SubmitError> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(task)
    }
}

/// Reports exhaustion for the first `failures` submissions.
struct Flaky {
    inner: Arc<CarrierPool>,
    failures: AtomicUsize,
}

impl Executor for Flaky {
    fn execute(&self, task: Runnable) -> Result<(), SubmitError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(SubmitError::ResourceExhausted);
        }
        self.inner.execute(task)
    }
}

#[test]
fn park_and_unpark() {
    let pool = pool("it-park", 2);
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let vt = Builder::new()
        .name("parker")
        .scheduler(pool.clone())
        .spawn(move || {
            weft_rt::park();
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

    wait_for_state(&vt, State::Parked);
    assert_eq!(vt.thread_state(), ThreadState::Waiting);
    assert!(vt.carrier().is_none());

    vt.unpark().unwrap();
    assert!(vt.join(Some(LONG)).unwrap());
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(vt.thread_state(), ThreadState::Terminated);
}

#[test]
fn timed_park_expires() {
    let pool = pool("it-timed-park", 1);
    let (tx, rx) = mpsc::channel();
    let vt = Builder::new()
        .scheduler(pool.clone())
        .spawn(move || {
            let start = Instant::now();
            weft_rt::park_timeout(Duration::from_millis(50));
            tx.send(start.elapsed()).unwrap();
        })
        .unwrap();

    let elapsed = rx.recv_timeout(LONG).unwrap();
    assert!(elapsed >= Duration::from_millis(45), "woke after {elapsed:?}");
    assert!(vt.join(Some(LONG)).unwrap());
}

#[test]
fn pinned_park_blocks_the_carrier_and_reports_it() {
    let pinned = Arc::new(Mutex::new(Vec::new()));
    let seen = pinned.clone();
    events::add_listener(move |event| {
        if let RuntimeEvent::Pinned { thread_id, op, .. } = event {
            seen.lock().push((*thread_id, *op));
        }
    });

    let pool = pool("it-pinned", 1);
    let vt = Builder::new()
        .scheduler(pool.clone())
        .spawn(|| {
            let _pin = continuation::pin();
            weft_rt::park();
        })
        .unwrap();

    wait_for_state(&vt, State::Pinned);
    assert_eq!(vt.thread_state(), ThreadState::Waiting);
    assert!(vt.carrier().is_some());

    vt.unpark().unwrap();
    assert!(vt.join(Some(LONG)).unwrap());
    assert!(pinned.lock().contains(&(vt.id(), BlockingOp::Park)));
}

#[test]
fn interrupt_wakes_a_pinned_park_and_stays_set() {
    let pool = pool("it-interrupt-pinned", 1);
    let (tx, rx) = mpsc::channel();
    let vt = Builder::new()
        .scheduler(pool.clone())
        .spawn(move || {
            let _pin = continuation::pin();
            weft_rt::park();
            let me = weft_rt::current().unwrap();
            tx.send(me.is_interrupted()).unwrap();
        })
        .unwrap();

    wait_for_state(&vt, State::Pinned);
    vt.interrupt().unwrap();
    assert!(rx.recv_timeout(LONG).unwrap());
    assert!(vt.join(Some(LONG)).unwrap());
}

#[test]
fn interrupt_resumes_a_parked_thread() {
    let pool = pool("it-interrupt-parked", 1);
    let (tx, rx) = mpsc::channel();
    let vt = Builder::new()
        .scheduler(pool.clone())
        .spawn(move || {
            weft_rt::park();
            // Test-and-clear.
            let first = weft_rt::interrupted();
            let second = weft_rt::interrupted();
            tx.send((first, second)).unwrap();
        })
        .unwrap();

    wait_for_state(&vt, State::Parked);
    vt.interrupt().unwrap();
    assert_eq!(rx.recv_timeout(LONG).unwrap(), (true, false));
    assert!(vt.join(Some(LONG)).unwrap());
}

#[test]
fn interrupted_sleep_returns_an_error() {
    let pool = pool("it-sleep", 1);
    let (tx, rx) = mpsc::channel();
    let vt = Builder::new()
        .scheduler(pool.clone())
        .spawn(move || {
            let result = weft_rt::sleep(Duration::from_secs(30));
            tx.send(matches!(result, Err(ThreadError::Interrupted))).unwrap();
        })
        .unwrap();

    wait_until("timed park", || vt.state() == State::TimedParked);
    vt.interrupt().unwrap();
    assert!(rx.recv_timeout(LONG).unwrap());
    assert!(vt.join(Some(LONG)).unwrap());
    assert!(!vt.is_interrupted());
}

#[test]
fn join_times_out_then_observes_termination() {
    let pool = pool("it-join", 1);
    let vt = Builder::new()
        .scheduler(pool.clone())
        .spawn(weft_rt::park)
        .unwrap();

    wait_for_state(&vt, State::Parked);
    assert!(!vt.join(Some(Duration::from_millis(20))).unwrap());
    vt.unpark().unwrap();
    assert!(vt.join(None).unwrap());
    // Terminated threads join at once, any number of times.
    assert!(vt.join(Some(Duration::ZERO)).unwrap());
    assert!(vt.join_nanos(0).unwrap());
    assert!(vt.join_nanos(1).unwrap());
}

#[test]
fn virtual_thread_can_join_another() {
    let pool = pool("it-join-virtual", 2);
    let target = Builder::new()
        .scheduler(pool.clone())
        .spawn(|| weft_rt::sleep(Duration::from_millis(20)).unwrap())
        .unwrap();
    let other = target.clone();
    let joiner = Builder::new()
        .scheduler(pool.clone())
        .spawn(move || assert!(other.join(None).unwrap()))
        .unwrap();
    assert!(joiner.join(Some(LONG)).unwrap());
    assert_eq!(target.state(), State::Terminated);
}

#[test]
fn concurrent_unparks_resume_once() {
    let exec = Arc::new(Counting {
        inner: pool("it-unpark-race", 2),
        submitted: AtomicUsize::new(0),
    });
    let vt = Builder::new()
        .scheduler(exec.clone())
        .spawn(weft_rt::park)
        .unwrap();

    wait_for_state(&vt, State::Parked);
    let unparkers: Vec<_> = (0..8)
        .map(|_| {
            let vt = vt.clone();
            thread::spawn(move || vt.unpark().unwrap())
        })
        .collect();
    for t in unparkers {
        t.join().unwrap();
    }
    assert!(vt.join(Some(LONG)).unwrap());
    // Start plus one resumption.
    assert_eq!(exec.submitted.load(Ordering::SeqCst), 2);
}

#[test]
fn yield_lets_the_thread_continue() {
    let pool = pool("it-yield", 1);
    let counter = Arc::new(AtomicUsize::new(0));
    let threads: Vec<_> = (0..2)
        .map(|_| {
            let counter = counter.clone();
            Builder::new()
                .scheduler(pool.clone())
                .spawn(move || {
                    assert!(weft_rt::is_virtual());
                    for _ in 0..50 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        weft_rt::yield_now();
                    }
                })
                .unwrap()
        })
        .collect();
    for vt in threads {
        assert!(vt.join(Some(LONG)).unwrap());
    }
    assert_eq!(counter.load(Ordering::SeqCst), 100);
    assert!(!weft_rt::is_virtual());
}

#[test]
fn monitor_excludes_contending_virtual_threads() {
    let pool = pool("it-monitor", 2);
    let monitor = Arc::new(Monitor::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));
    let container = Arc::new(ThreadContainer::new("it-monitor"));

    for _ in 0..8 {
        let monitor = monitor.clone();
        let inside = inside.clone();
        let total = total.clone();
        Builder::new()
            .scheduler(pool.clone())
            .container(container.clone())
            .spawn(move || {
                for i in 0..50 {
                    let _guard = monitor.enter();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    if i % 10 == 0 {
                        weft_rt::yield_now();
                    }
                    total.fetch_add(1, Ordering::SeqCst);
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .unwrap();
    }

    assert!(container.join_all(Some(LONG)).unwrap());
    assert_eq!(total.load(Ordering::SeqCst), 400);
    assert_eq!(monitor.entry_count(), 0);
}

#[test]
fn monitor_wait_and_notify_between_virtual_threads() {
    const ITEMS: usize = 50;
    let pool = pool("it-wait-notify", 2);
    let monitor = Arc::new(Monitor::new());
    let items = Arc::new(AtomicUsize::new(0));

    let consumer = {
        let monitor = monitor.clone();
        let items = items.clone();
        Builder::new()
            .name("consumer")
            .scheduler(pool.clone())
            .spawn(move || {
                for _ in 0..ITEMS {
                    let guard = monitor.enter();
                    while items.load(Ordering::SeqCst) == 0 {
                        guard.wait().unwrap();
                    }
                    items.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .unwrap()
    };
    let producer = {
        let monitor = monitor.clone();
        let items = items.clone();
        Builder::new()
            .name("producer")
            .scheduler(pool.clone())
            .spawn(move || {
                for _ in 0..ITEMS {
                    let guard = monitor.enter();
                    items.fetch_add(1, Ordering::SeqCst);
                    guard.notify_all();
                    drop(guard);
                    weft_rt::yield_now();
                }
            })
            .unwrap()
    };

    assert!(producer.join(Some(LONG)).unwrap());
    assert!(consumer.join(Some(LONG)).unwrap());
    assert_eq!(items.load(Ordering::SeqCst), 0);
}

#[test]
fn stale_wait_timeout_does_not_resume_the_thread() {
    let pool = pool("it-stale-timer", 1);
    let monitor = Arc::new(Monitor::new());
    let (tx, rx) = mpsc::channel();
    let m = monitor.clone();
    let vt = Builder::new()
        .scheduler(pool.clone())
        .spawn(move || {
            let guard = m.enter();
            guard.wait_timeout(Duration::from_millis(100)).unwrap();
            drop(guard);
            tx.send(()).unwrap();
            weft_rt::park();
        })
        .unwrap();

    wait_until("waiter", || monitor.waiter_count() == 1);
    {
        let guard = monitor.enter();
        guard.notify();
    }
    rx.recv_timeout(LONG).unwrap();
    wait_for_state(&vt, State::Parked);

    // Well past the original wait deadline.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(vt.state(), State::Parked);

    vt.unpark().unwrap();
    assert!(vt.join(Some(LONG)).unwrap());
}

#[test]
fn interrupted_monitor_wait_reacquires_then_fails() {
    let pool = pool("it-wait-interrupt", 1);
    let monitor = Arc::new(Monitor::new());
    let (tx, rx) = mpsc::channel();
    let m = monitor.clone();
    let vt = Builder::new()
        .scheduler(pool.clone())
        .spawn(move || {
            let guard = m.enter();
            let result = guard.wait();
            tx.send((
                matches!(result, Err(ThreadError::Interrupted)),
                m.is_held_by_current_thread(),
            ))
            .unwrap();
        })
        .unwrap();

    wait_for_state(&vt, State::Wait);
    vt.interrupt().unwrap();
    assert_eq!(rx.recv_timeout(LONG).unwrap(), (true, true));
    assert!(vt.join(Some(LONG)).unwrap());
    assert!(!vt.is_interrupted());
}

#[test]
fn exhausted_scheduler_is_retried() {
    let exec = Arc::new(Flaky {
        inner: pool("it-flaky", 1),
        failures: AtomicUsize::new(2),
    });
    let start = Instant::now();
    let vt = Builder::new().scheduler(exec.clone()).spawn(|| {}).unwrap();
    // Two backoffs before the third attempt is accepted.
    assert!(start.elapsed() >= Duration::from_millis(150));
    assert!(vt.join(Some(LONG)).unwrap());
}

#[test]
fn exhausted_scheduler_fails_when_retry_is_disabled() {
    let exec = Arc::new(Flaky {
        inner: pool("it-flaky-fail", 1),
        failures: AtomicUsize::new(1),
    });
    let vt = Builder::new()
        .scheduler(exec)
        .fail_on_exhaustion()
        .unstarted(|| {});
    assert!(matches!(vt.start(), Err(ThreadError::ResourceExhausted)));
    assert_eq!(vt.state(), State::Terminated);
}

#[cfg(feature = "serde")]
#[test]
fn snapshot_serializes() {
    let pool = pool("it-snapshot", 1);
    let vt = Builder::new()
        .name("snap")
        .scheduler(pool.clone())
        .spawn(weft_rt::park)
        .unwrap();
    wait_for_state(&vt, State::Parked);

    let json = serde_json::to_value(vt.snapshot()).unwrap();
    assert_eq!(json["name"], "snap");
    assert_eq!(json["state"], "Parked");
    assert_eq!(json["thread_state"], "waiting");

    vt.unpark().unwrap();
    assert!(vt.join(Some(LONG)).unwrap());
}
