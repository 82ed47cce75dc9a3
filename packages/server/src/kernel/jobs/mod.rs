//! Job infrastructure for asynchronous research execution.
//!
//! This module provides the kernel-level machinery that makes research jobs
//! durable and observable:
//! - [`Job`] / [`JobStatus`] - the persisted model and its transition rules
//! - [`SqliteJobStore`] - durable rows, atomic leasing, the append-only
//!   event log
//! - [`JobManager`] - submission (with idempotency), status, events,
//!   cancellation, progress fan-out, TTL cleanup
//! - [`ResearchWorker`] - the long-running service that leases jobs and
//!   drives the orchestrator
//!
//! # Architecture
//!
//! ```text
//! Tool surface
//!     │  submit / status / cancel
//!     ▼
//! JobManager ──► SqliteJobStore (jobs + job_events tables)
//!     │  events             ▲
//!     ▼                     │ lease / heartbeat / complete / fail
//! StreamHub ◄── ResearchWorker ──► Orchestrator
//! ```
//!
//! Business logic stays in `domains::research`; this module only moves jobs
//! through their lifecycle.

pub mod events;
mod job;
pub mod manager;
mod store;
mod worker;

pub use events::{JobEvent, JobEventRecord, Phase};
pub use job::{Job, JobStatus};
pub use manager::{JobManager, SubmitOptions, SubmitOutcome};
pub use store::{CancelOutcome, FailOutcome, SqliteJobStore};
pub use worker::{ResearchWorker, WorkerConfig, RESEARCH_JOB_TYPE};
