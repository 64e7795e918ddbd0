// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error types.
//!
//! Only setup and thread lifecycle can fail. Scheduling and waiting never
//! do: full queues are retried and stale handles count as finished.

use std::io;

use thiserror::Error;

/// A [`SchedulerConfig`](crate::SchedulerConfig) that cannot be built.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be at least 1")]
    ZeroCapacity(&'static str),

    #[error("max_threads is {requested}, the hard limit is {limit}")]
    TooManyThreads { requested: usize, limit: usize },

    #[error("{what} is {requested}, more than a 32-bit index can address")]
    IndexOverflow { what: &'static str, requested: usize },

    #[error("fiber_stack_size is {requested} bytes, the minimum is {minimum}")]
    StackTooSmall { requested: usize, minimum: usize },

    #[error("failed to parse scheduler configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid scheduler configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to allocate fiber stacks: {0}")]
    StackAllocation(#[source] io::Error),

    #[error("failed to spawn worker thread {index}: {source}")]
    ThreadSpawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("thread pool already running {0} threads")]
    PoolAlreadyInitialized(usize),

    #[error("scheduler has been stopped")]
    Stopped,

    #[error("all {0} acquired-thread records are in use")]
    AcquireCapacity(usize),

    #[error("this thread is already running a scheduler's worker loop")]
    NestedAcquire,
}
