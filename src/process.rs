//! Child process execution with graceful termination.
//!
//! Every external invocation runs through here: stderr is captured, a
//! cancellation of the supplied token sends SIGTERM, and a child that ignores
//! it is killed after a grace period. The captured stderr travels inside the
//! error chain so the top-level reporter can dump it on request.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How long a child may linger between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(30);

/// A child process exited with a failure status.
///
/// Carries the captured stderr so the end-of-run error report can surface it
/// without re-running anything.
#[derive(Debug)]
pub struct CommandError {
    pub argv: Vec<String>,
    pub status: ExitStatus,
    pub stderr: Vec<u8>,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` failed: {}", self.argv.join(" "), self.status)
    }
}

impl std::error::Error for CommandError {}

/// Metadata record written next to an action's stderr log.
#[derive(Debug, Serialize)]
struct ExecResultMeta {
    exit_code: i32,
}

/// Where a command's stderr (and optionally its exit code) are persisted.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub stderr_path: PathBuf,
    pub meta_path: Option<PathBuf>,
}

impl OutputPaths {
    pub fn stderr_only(stderr_path: PathBuf) -> Self {
        Self {
            stderr_path,
            meta_path: None,
        }
    }
}

/// Run a command to completion, capturing stderr.
///
/// On token cancellation the child receives SIGTERM, then SIGKILL after the
/// grace period. A non-zero exit becomes a [`CommandError`].
pub async fn run_cmd(
    argv: &[String],
    cmd: Command,
    token: &CancellationToken,
) -> Result<()> {
    run_cmd_inner(argv, cmd, token).await.map(|_| ())
}

/// Like [`run_cmd`], but also writes the captured stderr to
/// `paths.stderr_path` and, when set, the exit code to `paths.meta_path`.
///
/// A failure to write the logs replaces the child's result only when the
/// child itself succeeded; otherwise the child error wins and the write
/// failure is logged.
pub async fn run_cmd_with_logs(
    argv: &[String],
    cmd: Command,
    token: &CancellationToken,
    paths: &OutputPaths,
) -> Result<()> {
    let (result, stderr, exit_code) = match run_cmd_inner(argv, cmd, token).await {
        Ok(stderr) => (Ok(()), stderr, 0),
        Err(err) => {
            let (stderr, code) = match err.downcast_ref::<CommandError>() {
                Some(cmd_err) => (cmd_err.stderr.clone(), cmd_err.status.code().unwrap_or(-1)),
                None => (Vec::new(), -1),
            };
            (Err(err), stderr, code)
        }
    };

    let write_result = write_outputs(paths, &stderr, exit_code);
    match (result, write_result) {
        (Err(err), Err(write_err)) => {
            error!("failed to write command logs, keeping original error: {write_err:#}");
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
        (Ok(()), Err(write_err)) => Err(write_err),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn write_outputs(paths: &OutputPaths, stderr: &[u8], exit_code: i32) -> Result<()> {
    let dir = paths
        .stderr_path
        .parent()
        .ok_or_else(|| anyhow!("stderr path {} has no parent", paths.stderr_path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    std::fs::write(&paths.stderr_path, stderr)
        .with_context(|| format!("write {}", paths.stderr_path.display()))?;

    if let Some(meta_path) = &paths.meta_path {
        if let Some(meta_dir) = meta_path.parent() {
            std::fs::create_dir_all(meta_dir)
                .with_context(|| format!("create {}", meta_dir.display()))?;
        }
        let meta = serde_json::to_vec(&ExecResultMeta { exit_code }).context("serialize meta")?;
        std::fs::write(meta_path, meta)
            .with_context(|| format!("write {}", meta_path.display()))?;
    }
    Ok(())
}

/// Run a command capturing stdout and stderr into one buffer.
///
/// The combined output is returned in both cases: directly on success, and
/// inside the [`CommandError`] on failure, so the caller can persist the
/// in-VM log either way.
pub async fn run_cmd_combined(
    argv: &[String],
    mut cmd: Command,
    token: &CancellationToken,
) -> (Result<()>, Vec<u8>) {
    debug!(command = %argv.join(" "), "EXECUTING");

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = match cmd
        .spawn()
        .with_context(|| format!("spawn {}", argv.join(" ")))
    {
        Ok(child) => child,
        Err(err) => return (Err(err), Vec::new()),
    };

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let stdout_reader = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stderr_reader = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let status = wait_term(&mut child, token).await;
    let mut output = stdout_reader.await.unwrap_or_default();
    output.extend(stderr_reader.await.unwrap_or_default());

    let result = match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(CommandError {
            argv: argv.to_vec(),
            status,
            stderr: output.clone(),
        }
        .into()),
        Err(err) => {
            Err(anyhow::Error::from(err).context(format!("wait for {}", argv.join(" "))))
        }
    };
    (result, output)
}

/// Run the command and return the captured stderr bytes on success.
async fn run_cmd_inner(
    argv: &[String],
    mut cmd: Command,
    token: &CancellationToken,
) -> Result<Vec<u8>> {
    debug!(command = %argv.join(" "), "EXECUTING");

    cmd.stdin(Stdio::null()).stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", argv.join(" ")))?;

    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stderr_reader = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let status = wait_term(&mut child, token)
        .await
        .with_context(|| format!("wait for {}", argv.join(" ")))?;
    let stderr = stderr_reader.await.unwrap_or_default();

    if !status.success() {
        return Err(CommandError {
            argv: argv.to_vec(),
            status,
            stderr,
        }
        .into());
    }
    Ok(stderr)
}

/// Wait for the child, terminating it gracefully when the token fires.
///
/// The watcher is inlined in the select: when cancellation wins the race, the
/// child gets SIGTERM, and SIGKILL if it has not exited after the grace
/// period. The child is always reaped before returning.
async fn wait_term(
    child: &mut tokio::process::Child,
    token: &CancellationToken,
) -> std::io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        _ = token.cancelled() => {
            warn!("TERMINATING: sending SIGTERM");
            send_sigterm(child);
            match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    error!("TERMINATING: sending SIGKILL");
                    child.start_kill()?;
                    child.wait().await
                }
            }
        }
    }
}

fn send_sigterm(child: &tokio::process::Child) {
    let Some(pid) = child.id() else {
        return; // already exited
    };
    if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if err != nix::errno::Errno::ESRCH {
            warn!(pid, "SIGTERM failed: {err}");
        }
    }
}

/// A token that additionally cancels itself after `timeout`.
///
/// Used to layer per-test and per-provisioning deadlines on the suite-wide
/// cancellation: the caller distinguishes timeout from cancellation by
/// checking whether the parent fired.
pub fn deadline_token(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn command(parts: &[&str]) -> Command {
        let mut cmd = Command::new(parts[0]);
        cmd.args(&parts[1..]);
        cmd
    }

    #[tokio::test]
    async fn successful_command_returns_ok() {
        let token = CancellationToken::new();
        run_cmd(&argv(&["true"]), command(&["true"]), &token)
            .await
            .expect("true succeeds");
    }

    #[tokio::test]
    async fn failing_command_carries_stderr() {
        let token = CancellationToken::new();
        let parts = ["sh", "-c", "echo boom >&2; exit 3"];
        let err = run_cmd(&argv(&parts), command(&parts), &token)
            .await
            .expect_err("non-zero exit");
        let cmd_err = err
            .downcast_ref::<CommandError>()
            .expect("CommandError in chain");
        assert_eq!(cmd_err.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&cmd_err.stderr).trim(), "boom");
    }

    #[tokio::test]
    async fn cancellation_terminates_the_child() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let parts = ["sleep", "30"];
        let start = std::time::Instant::now();
        let err = run_cmd(&argv(&parts), command(&parts), &token)
            .await
            .expect_err("terminated by signal");
        assert!(start.elapsed() < Duration::from_secs(10));
        let cmd_err = err
            .downcast_ref::<CommandError>()
            .expect("CommandError in chain");
        assert!(!cmd_err.status.success());
    }

    #[tokio::test]
    async fn logs_are_written_for_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = OutputPaths {
            stderr_path: temp.path().join("nested/action.log"),
            meta_path: Some(temp.path().join("nested/action-meta.json")),
        };
        let token = CancellationToken::new();
        let parts = ["sh", "-c", "echo oops >&2; exit 7"];
        let err = run_cmd_with_logs(&argv(&parts), command(&parts), &token, &paths)
            .await
            .expect_err("non-zero exit");
        assert!(err.downcast_ref::<CommandError>().is_some());

        let stderr = std::fs::read_to_string(&paths.stderr_path).expect("stderr log");
        assert_eq!(stderr.trim(), "oops");
        let meta = std::fs::read_to_string(paths.meta_path.as_ref().expect("meta path"))
            .expect("meta file");
        assert!(meta.contains("\"exit_code\":7"));
    }

    #[tokio::test]
    async fn deadline_token_fires_without_parent() {
        let parent = CancellationToken::new();
        let token = deadline_token(&parent, Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("deadline fired");
        assert!(!parent.is_cancelled());
    }
}
