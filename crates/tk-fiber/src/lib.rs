// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative fiber task scheduler.
//!
//! Work is submitted as batches of [`Task`]s, each batch tracked by a
//! [`WorkloadHandle`]. Worker threads (spawned by the scheduler or lent by
//! their owners) run tasks inside fibers with their own stacks, so a task
//! can wait for another workload without blocking its thread: the fiber is
//! parked on the workload's wait list and the thread picks up other work.
//!
//! Components:
//! - context: stackful execution contexts and the register-level switch
//! - fiber / workload: fixed pools with index-linked wait lists
//! - worker: the loop every worker thread runs
//! - acquire: threads lent to the scheduler and their release conditions
//! - scheduler: the public object tying it together
//!
//! Scheduling is strictly cooperative. A task runs until it returns or calls
//! [`Scheduler::wait_for_workload`]; nothing preempts it.

mod acquire;
mod config;
mod context;
mod error;
mod fiber;
mod queue;
mod scheduler;
mod task;
mod worker;
mod workload;

pub use acquire::{AcquiredThreadHandle, ReleaseCause, ReleaseCondition};
pub use config::{
    SchedulerConfig, ThreadPoolParams, DEFAULT_FIBER_STACK_SIZE, DEFAULT_MAX_DISPATCHED_TASKS,
    DEFAULT_MAX_FIBERS, DEFAULT_MAX_WORKLOADS, MAX_THREADS, MIN_FIBER_STACK_SIZE,
};
pub use error::{ConfigError, SchedulerError};
pub use queue::BoundedQueue;
pub use scheduler::Scheduler;
pub use task::Task;
pub use workload::WorkloadHandle;
