use serde::{Deserialize, Serialize};

/// Why a failed run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The previous holder of the lock outlived `max_runtime`.
    RuntimeExceeded,
    /// Nonzero exit, non-true handler return, or the work could not start.
    CommandFailure,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::RuntimeExceeded => "runtime exceeded",
            FailureKind::CommandFailure => "command failure",
        };
        write!(f, "{s}")
    }
}

/// Why a due job did not run at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// `enabled = false`.
    Disabled,
    /// `run_on_host` names another machine.
    HostMismatch { expected: String },
    /// A marker file named after the job exists in `halt_dir`.
    Halted,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "disabled"),
            SkipReason::HostMismatch { expected } => write!(f, "restricted to host '{expected}'"),
            SkipReason::Halted => write!(f, "halted"),
        }
    }
}

/// Final result of one executor run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed { kind: FailureKind, detail: String },
    Skipped(SkipReason),
    /// Another holder kept the lock through every attempt.
    LockBusy,
}

impl ExecutionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionOutcome::Failed { .. })
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionOutcome::Succeeded => write!(f, "succeeded"),
            ExecutionOutcome::Failed { kind, detail } => write!(f, "failed ({kind}): {detail}"),
            ExecutionOutcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            ExecutionOutcome::LockBusy => write!(f, "lock busy"),
        }
    }
}

/// Position of an executor in its per-run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    SkipCheck,
    RuntimeCheck,
    Locking,
    Running,
    /// The lock was released after running.
    Released,
    /// Ended without ever holding the lock.
    Finished,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::SkipCheck => "skip_check",
            JobState::RuntimeCheck => "runtime_check",
            JobState::Locking => "locking",
            JobState::Running => "running",
            JobState::Released => "released",
            JobState::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_display() {
        let failed = ExecutionOutcome::Failed {
            kind: FailureKind::CommandFailure,
            detail: "Job exited with status '3'".to_string(),
        };
        assert_eq!(
            failed.to_string(),
            "failed (command failure): Job exited with status '3'"
        );
        assert!(failed.is_failure());
        assert!(!ExecutionOutcome::LockBusy.is_failure());
        assert_eq!(
            ExecutionOutcome::Skipped(SkipReason::Halted).to_string(),
            "skipped (halted)"
        );
    }

    #[test]
    fn outcome_serializes_tagged() {
        let json = serde_json::to_value(ExecutionOutcome::Skipped(SkipReason::HostMismatch {
            expected: "db01".to_string(),
        }))
        .unwrap();
        assert_eq!(json["outcome"], "skipped");
    }
}
