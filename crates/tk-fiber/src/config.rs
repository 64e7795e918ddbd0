// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.
//!
//! Every pool is fixed-size and allocated up front. Sizes must cover the
//! worst case: spin-retry loops only make progress if a free slot can
//! eventually appear. As a rule of thumb `max_fibers` should exceed the
//! deepest chain of nested waits times the number of threads.

use std::thread;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Hard cap on worker threads, owned and acquired counted separately.
pub const MAX_THREADS: usize = 64;
pub const DEFAULT_MAX_FIBERS: usize = 256;
pub const DEFAULT_MAX_WORKLOADS: usize = 1024;
pub const DEFAULT_MAX_DISPATCHED_TASKS: usize = 4096;
pub const DEFAULT_FIBER_STACK_SIZE: usize = 256 * 1024;
pub const MIN_FIBER_STACK_SIZE: usize = 16 * 1024;

/// Capacities of the scheduler's pools.
///
/// Deserializable so it can sit in a host's config file:
///
/// ```toml
/// max_threads = 16
/// max_fibers = 512
/// fiber_stack_size = 131072
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Owned worker threads, and separately acquired threads.
    pub max_threads: usize,
    pub max_fibers: usize,
    /// Workloads in flight at once.
    pub max_workloads: usize,
    /// Dispatch queue capacity.
    pub max_dispatched_tasks: usize,
    pub fiber_stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_threads: MAX_THREADS,
            max_fibers: DEFAULT_MAX_FIBERS,
            max_workloads: DEFAULT_MAX_WORKLOADS,
            max_dispatched_tasks: DEFAULT_MAX_DISPATCHED_TASKS,
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn with_max_fibers(mut self, n: usize) -> Self {
        self.max_fibers = n;
        self
    }

    pub fn with_max_workloads(mut self, n: usize) -> Self {
        self.max_workloads = n;
        self
    }

    pub fn with_max_dispatched_tasks(mut self, n: usize) -> Self {
        self.max_dispatched_tasks = n;
        self
    }

    pub fn with_fiber_stack_size(mut self, bytes: usize) -> Self {
        self.fiber_stack_size = bytes;
        self
    }

    /// Parse from TOML; missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (what, value) in [
            ("max_threads", self.max_threads),
            ("max_fibers", self.max_fibers),
            ("max_workloads", self.max_workloads),
            ("max_dispatched_tasks", self.max_dispatched_tasks),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCapacity(what));
            }
        }

        if self.max_threads > MAX_THREADS {
            return Err(ConfigError::TooManyThreads {
                requested: self.max_threads,
                limit: MAX_THREADS,
            });
        }

        // u32::MAX is the null link.
        for (what, value) in [
            ("max_fibers", self.max_fibers),
            ("max_workloads", self.max_workloads),
        ] {
            if value >= u32::MAX as usize {
                return Err(ConfigError::IndexOverflow {
                    what,
                    requested: value,
                });
            }
        }

        if self.fiber_stack_size < MIN_FIBER_STACK_SIZE {
            return Err(ConfigError::StackTooSmall {
                requested: self.fiber_stack_size,
                minimum: MIN_FIBER_STACK_SIZE,
            });
        }

        Ok(())
    }
}

/// Arguments to [`Scheduler::init_thread_pool`](crate::Scheduler::init_thread_pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPoolParams {
    /// Scheduler-owned worker threads to spawn.
    pub thread_count: usize,
    /// Pin worker `i` to logical core `i`.
    pub core_lock: bool,
}

impl ThreadPoolParams {
    pub fn new(thread_count: usize, core_lock: bool) -> Self {
        Self {
            thread_count,
            core_lock,
        }
    }

    /// One worker per logical core, leaving one core to the caller, which
    /// is expected to acquire itself afterwards.
    pub fn optimal() -> Self {
        let cores = logical_core_count();
        Self {
            thread_count: cores.saturating_sub(1).max(1),
            core_lock: false,
        }
    }
}

pub(crate) fn logical_core_count() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}
