use std::{
    io::Write as _,
    path::PathBuf,
    process::{Command, Stdio},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::NaiveDateTime;
use minuteman_core::{JobConfig, JobOptions, MinutemanConfig};
use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    context::ExecEnv,
    error::{Result, SchedulerError},
    executor::JobExecutor,
    launcher::open_append,
    lock::{LockManager, LOCK_ATTEMPTS, LOCK_RETRY_DELAY},
    schedule::{Schedule, ScheduleChecker},
    types::{ExecutionOutcome, FailureKind},
};

/// Subcommand a [`ProcessDispatcher`] child is started with.
pub const EXEC_JOB_SUBCOMMAND: &str = "exec-job";
/// Diagnostics file of detached processes whose job has `debug` set.
pub const DEBUG_LOG_NAME: &str = "minuteman-debug.log";

/// A registered job: its schedule next to its resolved configuration.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub schedule: Schedule,
    pub config: JobConfig,
}

/// What a detached executor needs to run one job in another process.
///
/// The schedule is left behind; the job is already due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetachedJob {
    pub name: String,
    pub config: JobConfig,
}

impl DetachedJob {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Run the job to completion in the current process.
    pub async fn execute(self, env: ExecEnv) -> ExecutionOutcome {
        let mut executor = JobExecutor::new(self.name, self.config, env);
        executor.run().await
    }
}

impl From<&Job> for DetachedJob {
    fn from(job: &Job) -> Self {
        Self {
            name: job.name.clone(),
            config: job.config.clone(),
        }
    }
}

/// Hands a due job to a detached unit of execution without waiting for it.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: &Job) -> Result<()>;
}

/// Runs each job as a Tokio task on a captured runtime.
///
/// Join handles are retained so a host process can [`join`](Self::join)
/// before it exits. They are only dropped by `join`, so a long-lived host
/// that scans repeatedly should join between scans.
pub struct TaskDispatcher {
    runtime: Handle,
    env: ExecEnv,
    lock_retry: (u32, Duration),
    running: Mutex<Vec<(String, JoinHandle<ExecutionOutcome>)>>,
}

impl TaskDispatcher {
    /// Dispatcher bound to the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(env: ExecEnv) -> Self {
        Self::with_handle(Handle::current(), env)
    }

    pub fn with_handle(runtime: Handle, env: ExecEnv) -> Self {
        Self {
            runtime,
            env,
            lock_retry: (LOCK_ATTEMPTS, LOCK_RETRY_DELAY),
            running: Mutex::new(Vec::new()),
        }
    }

    /// Override the lock retry loop of every executor spawned from here.
    pub fn with_lock_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.lock_retry = (attempts, delay);
        self
    }

    /// Number of dispatched tasks not yet joined.
    pub fn pending(&self) -> usize {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Wait for every task dispatched so far and collect the outcomes.
    pub async fn join(&self) -> Vec<(String, ExecutionOutcome)> {
        let running = std::mem::take(&mut *self.running.lock().unwrap_or_else(|e| e.into_inner()));
        let mut outcomes = Vec::with_capacity(running.len());
        for (name, handle) in running {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(job = %name, error = %e, "executor task failed");
                    ExecutionOutcome::Failed {
                        kind: FailureKind::CommandFailure,
                        detail: format!("executor task failed: {e}"),
                    }
                }
            };
            outcomes.push((name, outcome));
        }
        outcomes
    }
}

impl Dispatcher for TaskDispatcher {
    fn dispatch(&self, job: &Job) -> Result<()> {
        let (attempts, delay) = self.lock_retry;
        let mut executor = JobExecutor::new(job.name.clone(), job.config.clone(), self.env.clone())
            .with_lock_manager(LockManager::with_retry(attempts, delay));
        let handle = self.runtime.spawn(async move { executor.run().await });
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((job.name.clone(), handle));
        Ok(())
    }
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("env", &self.env)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Runs each job in a fresh OS process that the scan never waits on.
///
/// A background thread reaps the child once it exits. The child is started as `<program> <args..>` and receives the
/// [`DetachedJob`] as JSON on stdin, keeping credentials off the command
/// line. On Unix it is placed in its own process group.
#[derive(Debug, Clone)]
pub struct ProcessDispatcher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessDispatcher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute the running binary with the `exec-job` subcommand.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            vec![EXEC_JOB_SUBCOMMAND.to_string()],
        ))
    }

    /// Path of the diagnostics file used when a job has `debug` set.
    pub fn debug_log_path() -> PathBuf {
        std::env::temp_dir().join(DEBUG_LOG_NAME)
    }
}

impl Dispatcher for ProcessDispatcher {
    fn dispatch(&self, job: &Job) -> Result<()> {
        let payload = DetachedJob::from(job).to_json()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::piped());
        if job.config.debug {
            let log = open_append(&Self::debug_log_path())?;
            cmd.stdout(log.try_clone()?).stderr(log);
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes())?;
        }
        let pid = child.id();
        debug!(job = %job.name, pid, "detached process started");

        // Reap off the scan path so a long-lived host does not collect zombies.
        let name = job.name.clone();
        std::thread::Builder::new()
            .name(format!("reap-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => debug!(job = %name, pid, %status, "detached process exited"),
                Err(e) => warn!(job = %name, pid, error = %e, "waiting for detached process failed"),
            })?;
        Ok(())
    }
}

/// Result of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub dispatched: Vec<String>,
    pub not_due: Vec<String>,
    /// Per-job evaluation or dispatch errors as `(job, message)`.
    pub errors: Vec<(String, String)>,
}

/// Registry of jobs plus the shared defaults they were merged over.
pub struct Scheduler {
    defaults: JobOptions,
    jobs: Vec<Job>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Scheduler {
    /// `config` is merged over the built-in [`JobOptions::defaults`].
    pub fn new(config: JobOptions, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            defaults: config.merged_over(&JobOptions::defaults()),
            jobs: Vec::new(),
            dispatcher,
        }
    }

    /// Registry with the `[defaults]` of a loaded file and every `[jobs.*]` entry added.
    pub fn from_config(config: &MinutemanConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        let mut scheduler = Self::new(config.defaults.clone(), dispatcher);
        for (name, options) in &config.jobs {
            scheduler.add(name.clone(), options.clone())?;
        }
        Ok(scheduler)
    }

    /// Register a job whose schedule is given in its options.
    pub fn add(&mut self, name: impl Into<String>, options: JobOptions) -> Result<&Job> {
        let name = name.into();
        let merged = options.merged_over(&self.defaults);
        let schedule = merged
            .schedule
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                SchedulerError::Config(format!("job '{name}': 'schedule' is required"))
            })?;
        self.register(name, Schedule::Expression(schedule), merged)
    }

    /// Register a job with an explicit schedule, e.g. a predicate.
    pub fn add_scheduled(
        &mut self,
        name: impl Into<String>,
        schedule: Schedule,
        options: JobOptions,
    ) -> Result<&Job> {
        let merged = options.merged_over(&self.defaults);
        self.register(name.into(), schedule, merged)
    }

    fn register(&mut self, name: String, schedule: Schedule, merged: JobOptions) -> Result<&Job> {
        let config = merged.into_config().map_err(|e| match e {
            minuteman_core::CoreError::Config(msg) => {
                SchedulerError::Config(format!("job '{name}': {msg}"))
            }
            other => other.into(),
        })?;
        debug!(job = %name, %schedule, work = %config.work, "job registered");
        let index = self.jobs.len();
        self.jobs.push(Job {
            name,
            schedule,
            config,
        });
        Ok(&self.jobs[index])
    }

    /// Scan once against the current local minute.
    pub fn run(&self) -> ScanReport {
        self.run_at(ScheduleChecker::now().reference())
    }

    /// Scan once against `reference`; every job sees the same instant.
    pub fn run_at(&self, reference: NaiveDateTime) -> ScanReport {
        let checker = ScheduleChecker::new(reference);
        let mut report = ScanReport::default();

        for job in &self.jobs {
            match checker.is_due(&job.schedule) {
                Ok(true) => match self.dispatcher.dispatch(job) {
                    Ok(()) => {
                        info!(job = %job.name, "job dispatched");
                        report.dispatched.push(job.name.clone());
                    }
                    Err(e) => {
                        error!(job = %job.name, error = %e, "dispatch failed");
                        report.errors.push((job.name.clone(), e.to_string()));
                    }
                },
                Ok(false) => report.not_due.push(job.name.clone()),
                Err(e) => {
                    warn!(job = %job.name, error = %e, "schedule evaluation failed");
                    report.errors.push((job.name.clone(), e.to_string()));
                }
            }
        }

        debug!(
            dispatched = report.dispatched.len(),
            not_due = report.not_due.len(),
            errors = report.errors.len(),
            "scan complete"
        );
        report
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Current shared defaults.
    pub fn config(&self) -> &JobOptions {
        &self.defaults
    }

    /// Merge `options` into the shared defaults. Jobs already added keep
    /// their resolved configuration.
    pub fn set_config(&mut self, options: JobOptions) {
        self.defaults = options.merged_over(&self.defaults);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("defaults", &self.defaults)
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recording(Mutex<Vec<String>>);

    impl Dispatcher for Recording {
        fn dispatch(&self, job: &Job) -> Result<()> {
            self.0.lock().unwrap().push(job.name.clone());
            Ok(())
        }
    }

    fn at(raw: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M").unwrap()
    }

    fn options(command: &str, schedule: &str) -> JobOptions {
        JobOptions {
            command: Some(command.to_string()),
            schedule: Some(schedule.to_string()),
            ..JobOptions::default()
        }
    }

    #[test]
    fn detached_job_round_trips_through_json() {
        let config = options("echo hi", "* * * * *").merged_over(&JobOptions::defaults());
        let job = DetachedJob {
            name: "hello".to_string(),
            config: config.into_config().unwrap(),
        };
        let back = DetachedJob::from_json(&job.to_json().unwrap()).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn scan_splits_due_and_not_due() {
        let recorder = Arc::new(Recording(Mutex::new(Vec::new())));
        let mut scheduler = Scheduler::new(JobOptions::default(), recorder.clone());
        scheduler.add("every", options("true", "* * * * *")).unwrap();
        scheduler.add("noon", options("true", "0 12 * * *")).unwrap();

        let report = scheduler.run_at(at("2024-03-01 08:15"));
        assert_eq!(report.dispatched, vec!["every"]);
        assert_eq!(report.not_due, vec!["noon"]);
        assert_eq!(*recorder.0.lock().unwrap(), vec!["every"]);
    }

    #[test]
    fn debug_log_lives_in_temp_dir() {
        assert_eq!(
            ProcessDispatcher::debug_log_path(),
            std::env::temp_dir().join("minuteman-debug.log")
        );
    }
}
