// End-to-end behaviour of a single job run: skips, output routing, failure
// reporting, lock contention and the runtime ceiling.

use std::{
    fs,
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use minuteman_core::{JobConfig, JobOptions};
use minuteman_scheduler::{
    notify::Message, ExecEnv, ExecutionOutcome, FailureKind, HandlerRegistry, JobExecutor,
    LockManager, MailTransport, SkipReason,
};
use serde_json::Value;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<Message>>,
}

impl RecordingTransport {
    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl MailTransport for RecordingTransport {
    fn send(&self, message: &Message) -> minuteman_scheduler::Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("ok", |out| {
            writeln!(out, "handler ran")?;
            Ok(Value::Bool(true))
        })
        .register("falsy", |_out| Ok(Value::Bool(false)))
        .register("stringy", |_out| Ok(Value::String("done".to_string())))
        .register("broken", |_out| Err(anyhow::anyhow!("database unreachable")));
    registry
}

fn env(mail: &Arc<RecordingTransport>) -> ExecEnv {
    ExecEnv::new(handlers())
        .with_hostname("test-host")
        .with_transport(mail.clone())
}

fn options(dir: &Path) -> JobOptions {
    JobOptions {
        lock_dir: Some(dir.join("locks")),
        output: Some(dir.join("job.log")),
        ..JobOptions::defaults()
    }
}

fn command(dir: &Path, cmd: &str) -> JobOptions {
    JobOptions {
        command: Some(cmd.to_string()),
        ..options(dir)
    }
}

fn handler(dir: &Path, name: &str) -> JobOptions {
    JobOptions {
        handler: Some(name.to_string()),
        ..options(dir)
    }
}

async fn run(name: &str, config: JobConfig, env: ExecEnv) -> ExecutionOutcome {
    let mut executor = JobExecutor::new(name, config, env)
        .with_lock_manager(LockManager::with_retry(2, Duration::from_millis(10)));
    executor.run().await
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

#[tokio::test]
async fn disabled_job_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = JobOptions {
        enabled: Some(false),
        ..command(dir.path(), "echo hi")
    }
    .into_config()
    .unwrap();

    let outcome = run("disabled", config, env(&mail)).await;
    assert_eq!(outcome, ExecutionOutcome::Skipped(SkipReason::Disabled));
    assert!(!dir.path().join("job.log").exists());
    assert!(!dir.path().join("locks").exists());
}

#[tokio::test]
async fn other_host_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = JobOptions {
        run_on_host: Some("db01".to_string()),
        ..command(dir.path(), "echo hi")
    }
    .into_config()
    .unwrap();

    let outcome = run("pinned", config, env(&mail)).await;
    assert!(matches!(
        outcome,
        ExecutionOutcome::Skipped(SkipReason::HostMismatch { .. })
    ));
    assert!(!dir.path().join("job.log").exists());
}

#[tokio::test]
async fn halt_marker_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let halt = dir.path().join("halt");
    fs::create_dir_all(&halt).unwrap();
    fs::write(halt.join("halted"), "").unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = JobOptions {
        halt_dir: Some(halt),
        ..command(dir.path(), "echo hi")
    }
    .into_config()
    .unwrap();

    let outcome = run("halted", config, env(&mail)).await;
    assert_eq!(outcome, ExecutionOutcome::Skipped(SkipReason::Halted));
    assert!(!dir.path().join("job.log").exists());
}

#[tokio::test]
async fn handler_returning_true_has_no_error_line() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = handler(dir.path(), "ok").into_config().unwrap();

    let outcome = run("handler", config, env(&mail)).await;
    assert_eq!(outcome, ExecutionOutcome::Succeeded);
    assert_eq!(read(&dir.path().join("job.log")), "handler ran\n");
}

#[tokio::test]
async fn handler_returning_false_reports_the_value() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = handler(dir.path(), "falsy").into_config().unwrap();

    let outcome = run("handler", config, env(&mail)).await;
    assert!(outcome.is_failure());
    let log = read(&dir.path().join("job.log"));
    assert!(log.contains("ERROR: Handler did not return true! Returned: false"), "{log}");
}

#[tokio::test]
async fn handler_returning_a_string_is_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = handler(dir.path(), "stringy").into_config().unwrap();

    run("handler", config, env(&mail)).await;
    assert!(read(&dir.path().join("job.log")).contains("Returned: \"done\""));
}

#[tokio::test]
async fn handler_error_and_unknown_handler_are_failures() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());

    let broken = handler(dir.path(), "broken").into_config().unwrap();
    let outcome = run("broken", broken, env(&mail)).await;
    assert_eq!(
        outcome,
        ExecutionOutcome::Failed {
            kind: FailureKind::CommandFailure,
            detail: "Handler failed: database unreachable".to_string(),
        }
    );

    let missing = handler(dir.path(), "nope").into_config().unwrap();
    let outcome = run("missing", missing, env(&mail)).await;
    assert!(outcome.to_string().contains("No handler registered under 'nope'"));
}

#[cfg(unix)]
#[tokio::test]
async fn nonzero_exit_is_reported_with_status() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = command(dir.path(), "exit 3").into_config().unwrap();

    let outcome = run("exit", config, env(&mail)).await;
    assert_eq!(
        outcome,
        ExecutionOutcome::Failed {
            kind: FailureKind::CommandFailure,
            detail: "Job exited with status '3'".to_string(),
        }
    );
    let log = read(&dir.path().join("job.log"));
    assert!(log.contains("ERROR: Job exited with status '3'"), "{log}");
}

#[cfg(unix)]
#[tokio::test]
async fn split_outputs_receive_their_streams() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let out = dir.path().join("out/stdout.log");
    let err = dir.path().join("err/stderr.log");
    let config = JobOptions {
        output: None,
        output_stdout: Some(out.clone()),
        output_stderr: Some(err.clone()),
        ..command(dir.path(), "echo to-out; echo to-err 1>&2")
    }
    .into_config()
    .unwrap();

    assert_eq!(run("split", config, env(&mail)).await, ExecutionOutcome::Succeeded);
    assert_eq!(read(&out), "to-out\n");
    assert_eq!(read(&err), "to-err\n");
}

#[cfg(unix)]
#[tokio::test]
async fn missing_output_directories_are_created() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let log = dir.path().join("a/b/c/job.log");
    let config = JobOptions {
        output: Some(log.clone()),
        ..command(dir.path(), "echo nested")
    }
    .into_config()
    .unwrap();

    run("nested", config, env(&mail)).await;
    assert_eq!(read(&log), "nested\n");
}

#[cfg(unix)]
#[tokio::test]
async fn absent_output_discards() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = JobOptions {
        output: None,
        ..command(dir.path(), "echo gone; exit 1")
    }
    .into_config()
    .unwrap();

    assert!(run("discard", config, env(&mail)).await.is_failure());
    let entries: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec!["locks"]);
}

#[cfg(unix)]
#[tokio::test]
async fn environment_is_exported_to_commands() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = JobOptions {
        environment: Some("production".to_string()),
        ..command(dir.path(), "printf %s \"$APPLICATION_ENV\"")
    }
    .into_config()
    .unwrap();

    run("env", config, env(&mail)).await;
    assert_eq!(read(&dir.path().join("job.log")), "production");
}

#[cfg(unix)]
#[tokio::test]
async fn overlapping_run_is_busy_and_silent() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = JobOptions {
        recipients: Some("ops@example.com".to_string()),
        ..command(dir.path(), "echo second")
    }
    .into_config()
    .unwrap();

    let executor = JobExecutor::new("overlap", config.clone(), env(&mail));
    let mut first = LockManager::new();
    first.acquire(&executor.lock_path()).await.unwrap();

    let outcome = run("overlap", config, env(&mail)).await;
    assert_eq!(outcome, ExecutionOutcome::LockBusy);

    let log = read(&dir.path().join("job.log"));
    assert!(log.contains("INFO: Job is still locked (lockfile: "), "{log}");
    assert!(!log.contains("second"));
    assert!(!log.contains("ERROR"));
    assert_eq!(mail.count(), 0);

    first.release(&executor.lock_path()).unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn exceeded_runtime_is_reported_and_mailed() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = JobOptions {
        max_runtime: Some(1),
        recipients: Some("ops@example.com".to_string()),
        ..command(dir.path(), "echo body")
    }
    .into_config()
    .unwrap();

    let lock = JobExecutor::new("slow", config.clone(), env(&mail)).lock_path();
    fs::create_dir_all(lock.parent().unwrap()).unwrap();
    fs::write(&lock, std::process::id().to_string()).unwrap();
    fs::File::options()
        .write(true)
        .open(&lock)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(2))
        .unwrap();

    let outcome = run("slow", config, env(&mail)).await;
    assert!(matches!(
        outcome,
        ExecutionOutcome::Failed {
            kind: FailureKind::RuntimeExceeded,
            ..
        }
    ));

    let log = read(&dir.path().join("job.log"));
    assert!(
        log.contains("MaxRuntime of 1 secs exceeded! Current runtime: 2 secs"),
        "{log}"
    );
    assert!(!log.contains("body"));
    assert_eq!(mail.count(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn empty_lock_does_not_trip_runtime_check() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = JobOptions {
        max_runtime: Some(1),
        ..command(dir.path(), "echo body")
    }
    .into_config()
    .unwrap();

    let lock = JobExecutor::new("idle", config.clone(), env(&mail)).lock_path();
    fs::create_dir_all(lock.parent().unwrap()).unwrap();
    fs::write(&lock, "").unwrap();

    assert_eq!(run("idle", config, env(&mail)).await, ExecutionOutcome::Succeeded);
    let log = read(&dir.path().join("job.log"));
    assert_eq!(log, "body\n");
}

#[cfg(unix)]
#[tokio::test]
async fn failure_mails_every_recipient() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = JobOptions {
        recipients: Some("ops@example.com, dev@example.com".to_string()),
        ..command(dir.path(), "exit 2")
    }
    .into_config()
    .unwrap();

    run("mailer", config, env(&mail)).await;
    let sent = mail.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].envelope().to().len(), 2);
    let raw = String::from_utf8(sent[0].formatted()).unwrap();
    assert!(raw.contains("[test-host] 'mailer' needs some attention!"));
}

#[cfg(unix)]
#[tokio::test]
async fn failure_without_recipients_sends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = JobOptions {
        recipients: Some(" ".to_string()),
        ..command(dir.path(), "exit 2")
    }
    .into_config()
    .unwrap();

    assert!(run("quiet", config, env(&mail)).await.is_failure());
    assert_eq!(mail.count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn success_sends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(RecordingTransport::default());
    let config = JobOptions {
        recipients: Some("ops@example.com".to_string()),
        ..command(dir.path(), "true")
    }
    .into_config()
    .unwrap();

    assert_eq!(run("fine", config, env(&mail)).await, ExecutionOutcome::Succeeded);
    assert_eq!(mail.count(), 0);
}
