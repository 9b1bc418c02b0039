//! Per-job state machine.
//!
//! ```text
//! Pending -> SkipCheck -> Skipped
//!                      -> RuntimeCheck -> Failed(RuntimeExceeded)
//!                                      -> Locking -> LockBusy
//!                                                 -> Running -> Succeeded | Failed -> Released
//! ```
//!
//! Everything that goes wrong inside a run ends up in the returned
//! [`ExecutionOutcome`]; [`JobExecutor::run`] itself never fails.

use std::{fmt::Write as _, io::Write as _, path::PathBuf};

use chrono::{DateTime, Local};
use minuteman_core::{types::DEFAULT_DATE_FORMAT, JobConfig, Work};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    context::ExecEnv,
    error::LockError,
    launcher::OutputTarget,
    lock::{sanitize_name, LockManager},
    types::{ExecutionOutcome, FailureKind, JobState, SkipReason},
};

/// Runs one job once.
pub struct JobExecutor {
    name: String,
    config: JobConfig,
    env: ExecEnv,
    locks: LockManager,
    started_at: DateTime<Local>,
    state: JobState,
}

impl JobExecutor {
    pub fn new(name: impl Into<String>, config: JobConfig, env: ExecEnv) -> Self {
        Self {
            name: name.into(),
            config,
            env,
            locks: LockManager::new(),
            started_at: Local::now(),
            state: JobState::Pending,
        }
    }

    /// Replace the default lock manager, e.g. to shorten the retry loop.
    pub fn with_lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = locks;
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// `<lock_dir>/<sanitized name>.lck`
    pub fn lock_path(&self) -> PathBuf {
        self.config
            .lock_dir
            .join(format!("{}.lck", sanitize_name(&self.name)))
    }

    fn stdout_target(&self) -> OutputTarget {
        OutputTarget::from(self.config.stdout_path())
    }

    fn stderr_target(&self) -> OutputTarget {
        OutputTarget::from(self.config.stderr_path())
    }

    fn transition(&mut self, next: JobState) {
        debug!(job = %self.name, from = %self.state, to = %next, "state transition");
        self.state = next;
    }

    /// Drive the job through its state machine and report the outcome.
    pub async fn run(&mut self) -> ExecutionOutcome {
        self.started_at = Local::now();

        self.transition(JobState::SkipCheck);
        if let Some(reason) = self.skip_reason() {
            info!(job = %self.name, %reason, "job skipped");
            self.transition(JobState::Finished);
            return ExecutionOutcome::Skipped(reason);
        }

        let lock_path = self.lock_path();

        self.transition(JobState::RuntimeCheck);
        if let Some(detail) = self.runtime_exceeded(&lock_path) {
            self.report_failure(&detail).await;
            self.transition(JobState::Finished);
            return ExecutionOutcome::Failed {
                kind: FailureKind::RuntimeExceeded,
                detail,
            };
        }

        self.transition(JobState::Locking);
        match self.locks.acquire(&lock_path).await {
            Ok(()) => {}
            Err(busy @ LockError::Busy { .. }) => {
                warn!(job = %self.name, lock = %lock_path.display(), "job is still locked");
                self.write_line(&self.stdout_target(), &format!("INFO: {busy}"));
                self.transition(JobState::Finished);
                return ExecutionOutcome::LockBusy;
            }
            Err(e) => {
                let detail = e.to_string();
                self.report_failure(&detail).await;
                self.transition(JobState::Finished);
                return ExecutionOutcome::Failed {
                    kind: FailureKind::CommandFailure,
                    detail,
                };
            }
        }

        self.transition(JobState::Running);
        info!(job = %self.name, work = %self.config.work, "job started");
        let outcome = match self.execute().await {
            Ok(()) => ExecutionOutcome::Succeeded,
            Err(detail) => {
                self.report_failure(&detail).await;
                ExecutionOutcome::Failed {
                    kind: FailureKind::CommandFailure,
                    detail,
                }
            }
        };

        if let Err(e) = self.locks.release(&lock_path) {
            warn!(job = %self.name, error = %e, "failed to release lock");
        }
        self.transition(JobState::Released);

        let elapsed = (Local::now() - self.started_at).num_milliseconds();
        match &outcome {
            ExecutionOutcome::Succeeded => info!(job = %self.name, elapsed_ms = elapsed, "job succeeded"),
            other => warn!(job = %self.name, elapsed_ms = elapsed, outcome = %other, "job failed"),
        }
        outcome
    }

    /// First matching skip condition, if any. Performs no writes.
    fn skip_reason(&self) -> Option<SkipReason> {
        if !self.config.enabled {
            return Some(SkipReason::Disabled);
        }
        if let Some(expected) = &self.config.run_on_host {
            if *expected != self.env.hostname {
                return Some(SkipReason::HostMismatch {
                    expected: expected.clone(),
                });
            }
        }
        if let Some(dir) = &self.config.halt_dir {
            if dir.join(&self.name).exists() {
                return Some(SkipReason::Halted);
            }
        }
        None
    }

    /// Age check against the previous holder; must run before acquisition
    /// since a successful acquire rewrites the lock file.
    fn runtime_exceeded(&self, lock_path: &std::path::Path) -> Option<String> {
        let max = self.config.max_runtime?;
        let age = match LockManager::lock_age(lock_path) {
            Ok(age) => age,
            Err(e) => {
                warn!(job = %self.name, error = %e, "unable to read lock age");
                return None;
            }
        };
        (age > max).then(|| format!("MaxRuntime of {max} secs exceeded! Current runtime: {age} secs"))
    }

    async fn execute(&self) -> Result<(), String> {
        match &self.config.work {
            Work::Command(command) => self.run_command(command).await,
            Work::Handler(name) => self.run_handler(name).await,
        }
    }

    async fn run_command(&self, command: &str) -> Result<(), String> {
        let env: Vec<(String, String)> = self
            .config
            .environment
            .iter()
            .map(|value| ("APPLICATION_ENV".to_string(), value.clone()))
            .collect();

        let code = self
            .env
            .launcher
            .spawn(
                command,
                &self.stdout_target(),
                &self.stderr_target(),
                self.config.run_as.as_deref(),
                &env,
            )
            .await
            .map_err(|e| format!("Unable to launch job: {e}"))?;

        if code == 0 {
            Ok(())
        } else {
            Err(format!("Job exited with status '{code}'"))
        }
    }

    async fn run_handler(&self, name: &str) -> Result<(), String> {
        let handler = self
            .env
            .handlers
            .get(name)
            .ok_or_else(|| format!("No handler registered under '{name}'"))?;
        let target = self.stdout_target();

        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<Value> {
            let mut writer = target.open_writer()?;
            let value = handler(&mut *writer)?;
            writer.flush()?;
            Ok(value)
        })
        .await;

        match result {
            Ok(Ok(Value::Bool(true))) => Ok(()),
            Ok(Ok(other)) => Err(format!("Handler did not return true! Returned: {other}")),
            Ok(Err(e)) => Err(format!("Handler failed: {e:#}")),
            Err(e) if e.is_panic() => Err("Handler panicked".to_string()),
            Err(e) => Err(format!("Handler task failed: {e}")),
        }
    }

    /// Write the ERROR line and notify recipients. Mail problems are logged only.
    async fn report_failure(&self, detail: &str) {
        warn!(job = %self.name, detail, "job failure");
        self.write_line(&self.stderr_target(), &format!("ERROR: {detail}"));

        if self.config.recipients.is_empty() {
            return;
        }
        let notifier = self.env.notifier.clone();
        let name = self.name.clone();
        let config = self.config.clone();
        let detail = detail.to_string();
        match tokio::task::spawn_blocking(move || notifier.notify(&name, &config, &detail)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(job = %self.name, error = %e, "failed to send notification"),
            Err(e) => warn!(job = %self.name, error = %e, "notification task failed"),
        }
    }

    fn write_line(&self, target: &OutputTarget, message: &str) {
        let line = format!("[{}] {message}\n", self.timestamp());
        let written = target
            .open_writer()
            .and_then(|mut writer| writer.write_all(line.as_bytes()));
        if let Err(e) = written {
            warn!(job = %self.name, error = %e, "unable to write to job output");
        }
    }

    fn timestamp(&self) -> String {
        let now = Local::now();
        let mut stamp = String::new();
        if write!(stamp, "{}", now.format(&self.config.date_format)).is_err() {
            stamp.clear();
            let _ = write!(stamp, "{}", now.format(DEFAULT_DATE_FORMAT));
        }
        stamp
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}
