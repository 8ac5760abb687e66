//! Process runner (C1): launch a subprocess in its own process group, relay
//! combined output, and enforce cancellation.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

const KILL_GRACE_PERIOD: Duration = Duration::from_millis(1500);

/// Outcome of a subprocess run: combined stdout+stderr bytes and the
/// process's exit status, if it ran to completion.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Interleaved stdout and stderr, in the order each stream was read.
    pub combined: Vec<u8>,
    /// `true` if the process exited with status zero.
    pub success: bool,
}

#[cfg(unix)]
fn prepare_command(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn prepare_command(_cmd: &mut Command) {}

#[cfg(unix)]
async fn terminate(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let pgid = Pid::from_raw(pid as i32);

    let _ = killpg(pgid, Signal::SIGTERM);
    let grace = tokio::time::sleep(KILL_GRACE_PERIOD);
    tokio::select! {
        _ = child.wait() => return,
        () = grace => {}
    }
    let _ = killpg(pgid, Signal::SIGKILL);
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Run `name args…` in `dir`, merging stdout and stderr into one buffer.
///
/// If `cancel` is already triggered before spawn, returns
/// `AppError::Canceled` and never spawns a process. If `cancel` triggers
/// while the child is running, the process group is sent `SIGTERM`, given
/// [`KILL_GRACE_PERIOD`] to exit, then `SIGKILL`'d; the partial output
/// collected so far is discarded in favor of `AppError::Canceled` (callers
/// that need the partial transcript should read it from the run's own
/// buffered stream writer, which flushes independently of this return path).
///
/// # Errors
///
/// Returns `AppError::Canceled` if canceled before or during the run, and
/// `AppError::Subprocess` if the child fails to spawn or its I/O pipes
/// cannot be read.
pub async fn run(
    cancel: &CancellationToken,
    dir: &Path,
    name: &str,
    args: &[&str],
) -> Result<RunOutput> {
    if cancel.is_cancelled() {
        return Err(AppError::Canceled);
    }

    let mut command = Command::new(name);
    command
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    prepare_command(&mut command);

    debug!(name, ?args, dir = %dir.display(), "spawning subprocess");

    let mut child = command
        .spawn()
        .map_err(|err| AppError::Subprocess(format!("failed to spawn {name}: {err}")))?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut combined = Vec::new();

    let wait_fut = async {
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        if let Some(mut out) = stdout.take() {
            let _ = out.read_to_end(&mut stdout_buf).await;
        }
        if let Some(mut err) = stderr.take() {
            let _ = err.read_to_end(&mut stderr_buf).await;
        }
        let status = child.wait().await;
        (stdout_buf, stderr_buf, status)
    };

    tokio::select! {
        () = cancel.cancelled() => {
            warn!(name, "subprocess canceled; escalating signals");
            terminate(&mut child).await;
            Err(AppError::Canceled)
        }
        (stdout_buf, stderr_buf, status) = wait_fut => {
            combined.extend_from_slice(&stdout_buf);
            combined.extend_from_slice(&stderr_buf);
            let status = status.map_err(|err| {
                AppError::Subprocess(format!("failed to wait for {name}: {err}"))
            })?;
            Ok(RunOutput { combined, success: status.success() })
        }
    }
}

/// Run `name args…` in `dir`, invoking `on_line` for each complete line
/// read from stdout as it arrives (stderr is collected but not forwarded
/// line-by-line — tool adapters treat it as diagnostic noise unless the
/// process exits non-zero). Used by the tool adapter layer (C2) to drive
/// its `executeStream` contract.
///
/// # Errors
///
/// Same as [`run`].
pub async fn run_streaming<F>(
    cancel: &CancellationToken,
    dir: &Path,
    name: &str,
    args: &[&str],
    mut on_line: F,
) -> Result<RunOutput>
where
    F: FnMut(&str) + Send,
{
    if cancel.is_cancelled() {
        return Err(AppError::Canceled);
    }

    let mut command = Command::new(name);
    command
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    prepare_command(&mut command);

    debug!(name, ?args, dir = %dir.display(), "spawning streaming subprocess");

    let mut child = command
        .spawn()
        .map_err(|err| AppError::Subprocess(format!("failed to spawn {name}: {err}")))?;

    let stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let drain_fut = async {
        let mut combined = Vec::new();
        if let Some(out) = stdout {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                on_line(&line);
                combined.extend_from_slice(line.as_bytes());
                combined.push(b'\n');
            }
        }
        if let Some(mut err) = stderr.take() {
            let mut err_buf = Vec::new();
            let _ = err.read_to_end(&mut err_buf).await;
            combined.extend_from_slice(&err_buf);
        }
        let status = child.wait().await;
        (combined, status)
    };

    tokio::select! {
        () = cancel.cancelled() => {
            warn!(name, "streaming subprocess canceled; escalating signals");
            terminate(&mut child).await;
            Err(AppError::Canceled)
        }
        (combined, status) = drain_fut => {
            let status = status.map_err(|err| {
                AppError::Subprocess(format!("failed to wait for {name}: {err}"))
            })?;
            Ok(RunOutput { combined, success: status.success() })
        }
    }
}

/// Run `sh -c <cmd>` via [`run`], used for setup/validate commands.
///
/// # Errors
///
/// Same as [`run`].
pub async fn run_shell(cancel: &CancellationToken, dir: &Path, cmd: &str) -> Result<RunOutput> {
    run(cancel, dir, "sh", &["-c", cmd]).await
}

/// Truncate `bytes` to the last `max` bytes for inclusion in an error
/// message, annotating with an ellipsis marker if truncation occurred.
#[must_use]
pub fn tail_for_error(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max {
        return text.into_owned();
    }
    let start = text.len() - max;
    let mut boundary = start;
    while !text.is_char_boundary(boundary) {
        boundary += 1;
    }
    format!("…{}", &text[boundary..])
}
