//! reportq - database-coordinated worker scheduler for report-generation jobs.
//!
//! Workers coordinate exclusively through a shared PostgreSQL store: queued
//! requests are claimed with `FOR UPDATE SKIP LOCKED`, per-report mutual
//! exclusion rides on heartbeated lock rows, and outcomes resolve through a
//! bounded retry/failure state machine.

pub mod admission;
pub mod config;
pub mod db;
pub mod executor;
pub mod joblog;
pub mod outcome;
pub mod worker;

pub use admission::ActiveHours;
pub use config::Config;
pub use db::{
    Database, DbError, DbResult, Report, ReportId, ReportLock, Request, RequestId, RequestState,
};
pub use executor::{build_command, run_supervised, CommandSpec, ExecError, ExecutionResult};
pub use joblog::RequestLogWriter;
pub use outcome::{decide, RetryDecision};
pub use worker::Worker;
