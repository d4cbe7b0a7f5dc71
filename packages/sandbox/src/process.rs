use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use which::which;

use crate::errors::{SandboxError, SandboxResult};
use crate::models::{ExecOutput, MIN_EXEC_TIMEOUT};

pub fn find_binary(name: &str) -> SandboxResult<PathBuf> {
    which(name).map_err(|_| SandboxError::MissingBinary(name.to_owned()))
}

/// Exit status coreutils `timeout` reports when it had to stop the command.
pub const REMOTE_TIMEOUT_EXIT: i32 = 124;
/// Extra time a transport gets beyond the remote deadline before giving up locally.
pub const TRANSPORT_GRACE: Duration = Duration::from_secs(5);

/// Prefix `argv` with coreutils `timeout` so the remote side enforces the deadline itself.
pub fn with_remote_timeout(argv: Vec<String>, timeout: Duration) -> Vec<String> {
    let mut wrapped = vec![
        "timeout".to_string(),
        "--kill-after=2".to_string(),
        format!("{}s", timeout.max(MIN_EXEC_TIMEOUT).as_secs_f64()),
    ];
    wrapped.extend(argv);
    wrapped
}

/// Turn a wrapped command's result into `ExecTimeout` when the remote deadline hit.
///
/// Exit 124 alone is not enough: the command may return it by itself. It only counts as a
/// timeout once `elapsed` has reached the deadline.
pub fn classify_remote_exit(
    output: ExecOutput,
    timeout: Duration,
    elapsed: Duration,
) -> SandboxResult<ExecOutput> {
    if output.exit_code == REMOTE_TIMEOUT_EXIT && elapsed >= timeout.max(MIN_EXEC_TIMEOUT) {
        return Err(SandboxError::ExecTimeout {
            timeout,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    Ok(output)
}

type SharedBuf = Arc<Mutex<Vec<u8>>>;

fn drain<R>(reader: Option<R>, buf: SharedBuf) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.lock().extend_from_slice(&chunk[..n]),
            }
        }
    })
}

fn snapshot(buf: &SharedBuf) -> String {
    String::from_utf8_lossy(&buf.lock()).into_owned()
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// Run `command` to completion or until `timeout`, whichever comes first.
///
/// Output is collected incrementally, so a timeout still reports whatever the process had
/// written. The child is killed on timeout and the call returns without waiting for any
/// grandchildren that may still hold the pipes.
pub async fn run_with_timeout(
    mut command: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
) -> SandboxResult<ExecOutput> {
    let deadline = Instant::now() + timeout;
    command
        .kill_on_drop(true)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;
    let stdout_buf = SharedBuf::default();
    let stderr_buf = SharedBuf::default();
    let stdout_task = drain(child.stdout.take(), stdout_buf.clone());
    let stderr_task = drain(child.stderr.take(), stderr_buf.clone());

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            let _ = pipe.write_all(&input).await;
            let _ = pipe.shutdown().await;
        });
    }

    match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(status) => {
            let status = status?;
            let readers = async {
                let _ = stdout_task.await;
                let _ = stderr_task.await;
            };
            // Pipes may be inherited by background children; don't wait past the deadline.
            let _ = tokio::time::timeout_at(deadline, readers).await;
            Ok(ExecOutput {
                exit_code: exit_code(status),
                stdout: snapshot(&stdout_buf),
                stderr: snapshot(&stderr_buf),
            })
        }
        Err(_) => {
            if let Err(error) = child.start_kill() {
                tracing::warn!(%error, "failed to kill timed out process");
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
            stdout_task.abort();
            stderr_task.abort();
            Err(SandboxError::ExecTimeout {
                timeout,
                stdout: snapshot(&stdout_buf),
                stderr: snapshot(&stderr_buf),
            })
        }
    }
}

/// Run a command that is expected to succeed and return its stdout.
pub async fn run_checked(command: Command, timeout: Duration) -> SandboxResult<String> {
    let description = format!("{:?}", command.as_std());
    let output = run_with_timeout(command, None, timeout).await?;
    if !output.success() {
        return Err(SandboxError::CommandFailed {
            command: description,
            message: format!("exit {}: {}", output.exit_code, output.stderr.trim()),
        });
    }
    Ok(output.stdout)
}
