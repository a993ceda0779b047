//! Build job queue and worker pool
//!
//! This crate provides:
//! - [`WorkerPool`] - fixed-size pool consuming a FIFO job queue
//! - [`BuildExecutor`] - the seam to the external build executable
//! - [`RunningJobs`] - atomic count of builds currently executing
//!
//! # Architecture
//!
//! ```text
//! HTTP handlers ──submit──► [ FIFO queue ] ──► worker 0 ─┐
//!                                          ├──► worker 1 ─┼─► BuildExecutor (subprocess)
//!                                          └──► worker N ─┘
//!                                                   │
//!                                       RunningJobs (atomic, read by registrar)
//! ```

mod counter;
mod executor;
mod pool;

pub use counter::{RunningJobGuard, RunningJobs};
pub use executor::{collect_artifacts, BuildExecutor, ExecutionContext, ExecutionError, ScriptExecutor};
pub use pool::{
    WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus, DEFAULT_JOB_RETENTION,
};
