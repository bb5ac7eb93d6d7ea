// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler tunables.
//!
//! Read once, when the default scheduler and timer service are first
//! used. Explicitly built pools take a `SchedulerConfig` directly.

use crate::error::ConfigError;

pub const PARALLELISM_VAR: &str = "WEFT_SCHEDULER_PARALLELISM";
pub const MAX_POOL_SIZE_VAR: &str = "WEFT_SCHEDULER_MAX_POOL_SIZE";
pub const MIN_RUNNABLE_VAR: &str = "WEFT_SCHEDULER_MIN_RUNNABLE";
pub const TIMER_QUEUES_VAR: &str = "WEFT_SCHEDULER_TIMER_QUEUES";
pub const STACK_SIZE_VAR: &str = "WEFT_STACK_SIZE";

/// Upper bound on carriers when the pool size is not configured.
const DEFAULT_MAX_POOL_SIZE: usize = 256;

/// Stack reserved for each continuation body.
const DEFAULT_STACK_SIZE: usize = 512 * 1024;

/// Tunables for a carrier pool and its timer service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SchedulerConfig {
    /// Target number of carrier threads.
    pub parallelism: usize,
    /// Hard cap on carriers, including compensation spares.
    pub max_pool_size: usize,
    /// Spares are added while fewer than this many carriers are runnable.
    pub min_runnable: usize,
    /// Number of timer shards. Always a power of two.
    pub timer_queues: usize,
    /// Stack size for continuation bodies, in bytes.
    pub stack_size: usize,
}

impl SchedulerConfig {
    /// Defaults derived from the machine's available parallelism.
    pub fn new() -> Self {
        Self::for_cpus(available_cpus())
    }

    fn for_cpus(ncpus: usize) -> Self {
        let parallelism = ncpus.max(1);
        Self {
            parallelism,
            max_pool_size: parallelism.max(DEFAULT_MAX_POOL_SIZE),
            min_runnable: (parallelism / 2).max(1),
            timer_queues: floor_pow2(ncpus / 4).max(1),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Read tunables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read tunables through `lookup`. Unset variables keep their default;
    /// `max_pool_size` and `min_runnable` defaults follow `parallelism`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ncpus = available_cpus();
        let parallelism = parse(&lookup, PARALLELISM_VAR)?.unwrap_or(ncpus);
        if parallelism == 0 {
            return Err(ConfigError::TooSmall {
                var: PARALLELISM_VAR,
                min: 1,
                value: 0,
            });
        }

        let mut config = Self::for_cpus(ncpus);
        config.parallelism = parallelism;
        config.max_pool_size = parse(&lookup, MAX_POOL_SIZE_VAR)?
            .unwrap_or_else(|| parallelism.max(DEFAULT_MAX_POOL_SIZE));
        config.min_runnable =
            parse(&lookup, MIN_RUNNABLE_VAR)?.unwrap_or_else(|| (parallelism / 2).max(1));
        if let Some(queues) = parse(&lookup, TIMER_QUEUES_VAR)? {
            config.timer_queues = queues;
        }
        if let Some(stack) = parse(&lookup, STACK_SIZE_VAR)? {
            config.stack_size = stack;
        }

        config.validate()
    }

    /// Check invariants and normalize `timer_queues` to a power of two.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::TooSmall {
                var: PARALLELISM_VAR,
                min: 1,
                value: 0,
            });
        }
        if self.max_pool_size < self.parallelism {
            return Err(ConfigError::PoolSmallerThanParallelism {
                parallelism: self.parallelism,
                max_pool_size: self.max_pool_size,
            });
        }
        if self.min_runnable == 0 {
            return Err(ConfigError::TooSmall {
                var: MIN_RUNNABLE_VAR,
                min: 1,
                value: 0,
            });
        }
        self.min_runnable = self.min_runnable.min(self.max_pool_size);
        if self.timer_queues == 0 {
            return Err(ConfigError::TooSmall {
                var: TIMER_QUEUES_VAR,
                min: 1,
                value: 0,
            });
        }
        self.timer_queues = floor_pow2(self.timer_queues);
        if self.stack_size < 16 * 1024 {
            return Err(ConfigError::TooSmall {
                var: STACK_SIZE_VAR,
                min: 16 * 1024,
                value: self.stack_size,
            });
        }
        Ok(self)
    }

    /// Shorthand for a pool with `n` carriers and otherwise default limits.
    pub fn with_parallelism(n: usize) -> Self {
        let mut config = Self::new();
        config.parallelism = n.max(1);
        config.max_pool_size = config.max_pool_size.max(config.parallelism);
        config.min_runnable = (config.parallelism / 2).max(1);
        config
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

fn parse<F>(lookup: &F, var: &'static str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ConfigError::NotANumber { var, value: raw }),
    }
}

/// Largest power of two not above `n`, or 0 for 0.
fn floor_pow2(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - n.leading_zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_follow_cpu_count() {
        let config = SchedulerConfig::for_cpus(16);
        assert_eq!(config.parallelism, 16);
        assert_eq!(config.max_pool_size, 256);
        assert_eq!(config.min_runnable, 8);
        assert_eq!(config.timer_queues, 4);
    }

    #[test]
    fn single_cpu_defaults() {
        let config = SchedulerConfig::for_cpus(1);
        assert_eq!(config.min_runnable, 1);
        assert_eq!(config.timer_queues, 1);
    }

    #[test]
    fn explicit_parallelism_drives_derived_defaults() {
        let config = SchedulerConfig::from_lookup(lookup(&[(PARALLELISM_VAR, "6")])).unwrap();
        assert_eq!(config.parallelism, 6);
        assert_eq!(config.min_runnable, 3);
        assert_eq!(config.max_pool_size, 256);
    }

    #[test]
    fn timer_queues_round_down_to_power_of_two() {
        let config =
            SchedulerConfig::from_lookup(lookup(&[(TIMER_QUEUES_VAR, "6")])).unwrap();
        assert_eq!(config.timer_queues, 4);
    }

    #[test]
    fn garbage_is_reported_with_the_variable_name() {
        let err = SchedulerConfig::from_lookup(lookup(&[(MAX_POOL_SIZE_VAR, "many")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::NotANumber {
                var: MAX_POOL_SIZE_VAR,
                value: "many".to_string()
            }
        );
    }

    #[test]
    fn pool_smaller_than_parallelism_is_rejected() {
        let err = SchedulerConfig::from_lookup(lookup(&[
            (PARALLELISM_VAR, "8"),
            (MAX_POOL_SIZE_VAR, "4"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::PoolSmallerThanParallelism { .. }));
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let err =
            SchedulerConfig::from_lookup(lookup(&[(PARALLELISM_VAR, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::TooSmall { var, .. } if var == PARALLELISM_VAR));
    }

    #[test]
    fn floor_pow2_values() {
        assert_eq!(floor_pow2(0), 0);
        assert_eq!(floor_pow2(1), 1);
        assert_eq!(floor_pow2(5), 4);
        assert_eq!(floor_pow2(64), 64);
    }
}
