// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thread containers: groups of started, unfinished virtual threads.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::ThreadError;
use crate::vthread::VirtualThread;

/// Tracks threads between `start` and termination.
///
/// Holds weak references: a container never keeps a thread alive.
pub struct ThreadContainer {
    name: String,
    threads: Mutex<HashMap<u64, Weak<VirtualThread>>>,
}

impl ThreadContainer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// The container used when none is given.
    pub fn root() -> Arc<ThreadContainer> {
        static ROOT: OnceLock<Arc<ThreadContainer>> = OnceLock::new();
        ROOT.get_or_init(|| Arc::new(ThreadContainer::new("root")))
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn on_start(&self, vt: &Arc<VirtualThread>) {
        self.threads.lock().insert(vt.id(), Arc::downgrade(vt));
    }

    pub(crate) fn on_exit(&self, vt: &VirtualThread) {
        self.threads.lock().remove(&vt.id());
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Live threads, in no particular order.
    pub fn threads(&self) -> Vec<Arc<VirtualThread>> {
        self.threads
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Join every thread in the container. `None` waits forever.
    /// Returns whether all of them terminated in time.
    pub fn join_all(&self, timeout: Option<Duration>) -> Result<bool, ThreadError> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        for vt in self.threads() {
            let remaining = match (timeout, deadline) {
                (None, _) | (Some(_), None) => None,
                (Some(_), Some(deadline)) => Some(deadline.saturating_duration_since(Instant::now())),
            };
            if !vt.join(remaining)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl std::fmt::Debug for ThreadContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContainer")
            .field("name", &self.name)
            .field("threads", &self.thread_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::CarrierPool;
    use crate::vthread::Builder;
    use std::sync::mpsc;

    #[test]
    fn tracks_threads_until_they_exit() {
        let pool = Arc::new(CarrierPool::with_parallelism("container-test", 2));
        let container = Arc::new(ThreadContainer::new("workers"));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(parking_lot::Mutex::new(release_rx));

        let threads: Vec<_> = (0..3)
            .map(|_| {
                let rx = release_rx.clone();
                Builder::new()
                    .scheduler(pool.clone())
                    .container(container.clone())
                    .spawn(move || {
                        let _ = rx.lock().recv();
                    })
                    .unwrap()
            })
            .collect();
        assert_eq!(container.thread_count(), 3);
        assert_eq!(container.threads().len(), 3);
        assert!(!container.join_all(Some(Duration::from_millis(20))).unwrap());

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        assert!(container.join_all(Some(Duration::from_secs(5))).unwrap());
        assert_eq!(container.thread_count(), 0);
        for vt in threads {
            assert!(!vt.is_alive());
        }
    }

    #[test]
    fn empty_container_joins_immediately() {
        let container = ThreadContainer::new("empty");
        assert!(container.join_all(None).unwrap());
        assert_eq!(container.name(), "empty");
    }
}
