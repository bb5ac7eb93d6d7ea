// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Creating virtual threads.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use crate::container::ThreadContainer;
use crate::continuation::{ContinuationFactory, ThreadBacked};
use crate::error::ThreadError;
use crate::pool::{default_pool, default_scheduler, Executor};
use crate::timer::{default_timers, TimerService};

use super::{current, Parts, UncaughtHandler, VirtualThread};

/// Configures and creates a [`VirtualThread`].
///
/// Anything left unset is inherited: the scheduler from the creating
/// virtual thread (or the default pool), the container from the root
/// container.
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    scheduler: Option<Arc<dyn Executor>>,
    container: Option<Arc<ThreadContainer>>,
    uncaught: Option<UncaughtHandler>,
    factory: Option<Arc<dyn ContinuationFactory>>,
    timers: Option<Arc<TimerService>>,
    no_retry: bool,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Executor>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn container(mut self, container: Arc<ThreadContainer>) -> Self {
        self.container = Some(container);
        self
    }

    pub fn uncaught_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&VirtualThread, &(dyn Any + Send)) + Send + Sync + 'static,
    {
        self.uncaught = Some(Arc::new(handler));
        self
    }

    /// Continuation implementation. Defaults to [`ThreadBacked`] with the
    /// configured stack size.
    pub fn continuations(mut self, factory: Arc<dyn ContinuationFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn timers(mut self, timers: Arc<TimerService>) -> Self {
        self.timers = Some(timers);
        self
    }

    /// When the scheduler reports resource exhaustion, fail instead of
    /// retrying with backoff.
    pub fn fail_on_exhaustion(mut self) -> Self {
        self.no_retry = true;
        self
    }

    /// Create the thread without starting it.
    pub fn unstarted<F>(self, task: F) -> Arc<VirtualThread>
    where
        F: FnOnce() + Send + 'static,
    {
        let scheduler = self.scheduler.unwrap_or_else(|| match current() {
            Some(parent) => parent.scheduler().clone(),
            None => default_scheduler(),
        });
        let parts = Parts {
            name: self.name.unwrap_or_default(),
            scheduler,
            timers: self.timers.unwrap_or_else(default_timers),
            container: self.container.unwrap_or_else(ThreadContainer::root),
            uncaught: self.uncaught,
            factory: self.factory.unwrap_or_else(default_factory),
            retry_on_exhaustion: !self.no_retry,
        };
        VirtualThread::new(parts, Box::new(task))
    }

    /// Create and start the thread.
    pub fn spawn<F>(self, task: F) -> Result<Arc<VirtualThread>, ThreadError>
    where
        F: FnOnce() + Send + 'static,
    {
        let vt = self.unstarted(task);
        vt.start()?;
        Ok(vt)
    }
}

/// Start a virtual thread with default settings.
pub fn spawn<F>(task: F) -> Result<Arc<VirtualThread>, ThreadError>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().spawn(task)
}

fn default_factory() -> Arc<dyn ContinuationFactory> {
    static FACTORY: OnceLock<Arc<ThreadBacked>> = OnceLock::new();
    FACTORY
        .get_or_init(|| Arc::new(ThreadBacked::new(default_pool().config().stack_size)))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::CarrierPool;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn child_inherits_scheduler_from_parent() {
        let pool: Arc<dyn Executor> = Arc::new(CarrierPool::with_parallelism("builder-inherit", 1));
        let (tx, rx) = mpsc::channel();
        let parent_pool = pool.clone();
        let parent = Builder::new()
            .scheduler(pool.clone())
            .spawn(move || {
                let child = Builder::new().unstarted(|| {});
                tx.send(Arc::ptr_eq(child.scheduler(), &parent_pool)).unwrap();
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(parent.join(Some(Duration::from_secs(5))).unwrap());
    }

    #[test]
    fn defaults_to_root_container_and_empty_name() {
        let vt = Builder::new().unstarted(|| {});
        assert_eq!(vt.name(), "");
        assert!(Arc::ptr_eq(vt.container(), &ThreadContainer::root()));
    }

    #[test]
    fn spawn_runs_on_the_default_pool() {
        let (tx, rx) = mpsc::channel();
        let vt = spawn(move || tx.send(crate::vthread::current().is_some()).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(vt.join(Some(Duration::from_secs(5))).unwrap());
    }
}
