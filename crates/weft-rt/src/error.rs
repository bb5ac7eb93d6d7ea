// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime errors.

use thiserror::Error;

/// Why an executor refused a resumption task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The executor has been shut down. Never retried.
    #[error("executor rejected the task: shut down")]
    Rejected,
    /// Transient shortage (no worker could be created, queue capacity, ...).
    /// Retried with backoff unless the caller opted out.
    #[error("executor out of resources")]
    ResourceExhausted,
}

/// Errors returned by virtual thread and monitor operations.
#[derive(Debug, Error)]
pub enum ThreadError {
    /// Operation not valid in the thread's current lifecycle state, or
    /// invoked from a thread other than the one it must run on.
    #[error("illegal thread state: {0}")]
    StateConflict(&'static str),

    /// The scheduler was shut down.
    #[error("submission rejected: scheduler is shut down")]
    Rejected,

    /// The scheduler could not accept work and retrying was disallowed.
    #[error("submission failed: scheduler out of resources")]
    ResourceExhausted,

    /// A blocking operation observed the interrupt flag. The flag has been
    /// cleared when this is returned.
    #[error("thread was interrupted")]
    Interrupted,

    /// An OS thread could not be created.
    #[error("failed to spawn OS thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<SubmitError> for ThreadError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Rejected => ThreadError::Rejected,
            SubmitError::ResourceExhausted => ThreadError::ResourceExhausted,
        }
    }
}

/// Invalid scheduler tunable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("`{var}` must be an unsigned integer, got `{value}`")]
    NotANumber { var: &'static str, value: String },

    #[error("`{var}` must be at least {min}, got {value}")]
    TooSmall {
        var: &'static str,
        min: usize,
        value: usize,
    },

    #[error("max pool size ({max_pool_size}) is smaller than parallelism ({parallelism})")]
    PoolSmallerThanParallelism {
        parallelism: usize,
        max_pool_size: usize,
    },
}
