//! Process launching behind one platform-neutral contract.
//!
//! [`ShellLauncher`] runs commands through `sh -c` (optionally under
//! `sudo -u <user>`); [`CmdLauncher`] through `cmd /C`. Use
//! [`platform_launcher`] to get the right one for the build target.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Where a stream of job output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// The platform null device.
    Discard,
    /// Appended to a file; parent directories are created on first use.
    File(PathBuf),
}

impl OutputTarget {
    /// Open the target for appending, or a sink when discarding.
    pub fn open_writer(&self) -> io::Result<Box<dyn Write + Send>> {
        match self {
            OutputTarget::Discard => Ok(Box::new(io::sink())),
            OutputTarget::File(path) => Ok(Box::new(open_append(path)?)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            OutputTarget::Discard => None,
            OutputTarget::File(path) => Some(path),
        }
    }
}

impl From<Option<&Path>> for OutputTarget {
    fn from(path: Option<&Path>) -> Self {
        match path {
            Some(path) => OutputTarget::File(path.to_path_buf()),
            None => OutputTarget::Discard,
        }
    }
}

/// Path of the platform null device.
pub fn null_device() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

/// Open `path` for appending, creating missing parent directories first.
pub fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Spawns a shell command and waits for its exit code.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Run `command` with stdout/stderr routed to the given targets.
    ///
    /// `run_as` names the OS user to run under where the platform supports
    /// it; `env` is added to the child's environment. Returns the exit code.
    async fn spawn(
        &self,
        command: &str,
        stdout: &OutputTarget,
        stderr: &OutputTarget,
        run_as: Option<&str>,
        env: &[(String, String)],
    ) -> io::Result<i32>;
}

/// The launcher for the current build target.
pub fn platform_launcher() -> Arc<dyn Launcher> {
    if cfg!(windows) {
        Arc::new(CmdLauncher)
    } else {
        Arc::new(ShellLauncher)
    }
}

/// Unix launcher: `sh -c`, with `sudo -n -u <user>` for privilege changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellLauncher;

#[async_trait]
impl Launcher for ShellLauncher {
    async fn spawn(
        &self,
        command: &str,
        stdout: &OutputTarget,
        stderr: &OutputTarget,
        run_as: Option<&str>,
        env: &[(String, String)],
    ) -> io::Result<i32> {
        let mut cmd = match run_as {
            Some(user) => {
                let mut cmd = Command::new("sudo");
                cmd.args(["-n", "-u", user, "sh", "-c", command]);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
        };
        debug!(command, run_as, "launching shell command");
        run(cmd, stdout, stderr, env).await
    }
}

/// Windows launcher: `cmd /C`. Switching users is not supported.
#[derive(Debug, Clone, Copy, Default)]
pub struct CmdLauncher;

#[async_trait]
impl Launcher for CmdLauncher {
    async fn spawn(
        &self,
        command: &str,
        stdout: &OutputTarget,
        stderr: &OutputTarget,
        run_as: Option<&str>,
        env: &[(String, String)],
    ) -> io::Result<i32> {
        if let Some(user) = run_as {
            warn!(user, "run_as is not supported by the cmd launcher; running as current user");
        }
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        debug!(command, "launching cmd command");
        run(cmd, stdout, stderr, env).await
    }
}

async fn run(
    mut cmd: Command,
    stdout: &OutputTarget,
    stderr: &OutputTarget,
    env: &[(String, String)],
) -> io::Result<i32> {
    let (out, err) = stdio_pair(stdout, stderr)?;
    cmd.stdin(Stdio::null()).stdout(out).stderr(err);
    for (key, value) in env {
        cmd.env(key, value);
    }
    let status = cmd.spawn()?.wait().await?;
    Ok(exit_code(status))
}

/// Build the child's stdout/stderr; a shared file is opened once.
fn stdio_pair(stdout: &OutputTarget, stderr: &OutputTarget) -> io::Result<(Stdio, Stdio)> {
    match (stdout, stderr) {
        (OutputTarget::File(out), OutputTarget::File(err)) if out == err => {
            let file = open_append(out)?;
            let clone = file.try_clone()?;
            Ok((Stdio::from(file), Stdio::from(clone)))
        }
        _ => Ok((stdio_for(stdout)?, stdio_for(stderr)?)),
    }
}

fn stdio_for(target: &OutputTarget) -> io::Result<Stdio> {
    match target {
        OutputTarget::Discard => Ok(Stdio::null()),
        OutputTarget::File(path) => Ok(Stdio::from(open_append(path)?)),
    }
}

/// Exit code of a finished child; signal deaths map to `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
