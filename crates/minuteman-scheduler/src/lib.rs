//! `minuteman-scheduler`: cron-style job runner with per-job file locks.
//!
//! # Overview
//!
//! A [`engine::Scheduler`] holds the registered jobs. Each call to
//! [`engine::Scheduler::run`] evaluates every schedule against one fixed
//! reference minute and hands due jobs to a [`engine::Dispatcher`] without
//! waiting for them. A dispatched job is driven by a
//! [`executor::JobExecutor`]: skip checks, runtime ceiling, exclusive lock,
//! the work itself, failure reporting, release.
//!
//! # Dispatchers
//!
//! | Dispatcher          | Unit of execution                                  |
//! |---------------------|----------------------------------------------------|
//! | `TaskDispatcher`    | Tokio task on a captured runtime; joinable         |
//! | `ProcessDispatcher` | Detached OS process running the `exec-job` command |
//!
//! # Schedules
//!
//! | Form                          | Due when                                  |
//! |-------------------------------|-------------------------------------------|
//! | `*/5 * * * *`, `@daily`, ...  | The reference minute matches every field  |
//! | `2024-06-01 12:30[:00]`       | The reference falls in the same minute    |
//! | `Schedule::predicate(..)`     | The predicate returns `true`              |

pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handler;
pub mod launcher;
pub mod lock;
pub mod notify;
pub mod schedule;
pub mod types;

pub use context::{current_hostname, ExecEnv};
pub use engine::{
    DetachedJob, Dispatcher, Job, ProcessDispatcher, ScanReport, Scheduler, TaskDispatcher,
};
pub use error::{LockError, Result, ScheduleError, SchedulerError};
pub use executor::JobExecutor;
pub use handler::HandlerRegistry;
pub use launcher::{platform_launcher, Launcher, OutputTarget};
pub use lock::LockManager;
pub use notify::{MailTransport, Notifier};
pub use schedule::{Schedule, ScheduleChecker};
pub use types::{ExecutionOutcome, FailureKind, JobState, SkipReason};
