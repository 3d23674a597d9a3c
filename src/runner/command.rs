//! Spawning external programs on behalf of the backends.

use std::io::ErrorKind;
use std::process::{Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::RunnerError;
use crate::utils::cmdline;

/// Printable form of a command, program and arguments.
pub(crate) fn render(command: &Command) -> String {
    let program = command.get_program().to_string_lossy();
    let args = command.get_args().map(|arg| arg.to_string_lossy());
    cmdline(std::iter::once(program).chain(args))
}

/// Shell convention for programs that could not be started.
fn spawn_rc(err: &std::io::Error) -> i32 {
    match err.kind() {
        ErrorKind::NotFound => 127,
        ErrorKind::PermissionDenied => 126,
        _ => 1,
    }
}

pub(crate) fn spawn_failed(command: &Command, err: std::io::Error) -> RunnerError {
    RunnerError::Submission {
        cmd: render(command),
        rc: spawn_rc(&err),
        message: err.to_string(),
    }
}

/// Run a submission command to completion, failing on a nonzero exit.
pub(crate) fn submit(command: &mut Command) -> Result<Output, RunnerError> {
    tracing::debug!("submitting: {}", render(command));

    let output = command
        .stdin(Stdio::null())
        .output()
        .map_err(|e| spawn_failed(command, e))?;

    if !output.status.success() {
        return Err(RunnerError::Submission {
            cmd: render(command),
            rc: output.status.code().unwrap_or(-1),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output)
}

/// Run a status query. Only a command that cannot be started is an error,
/// the exit status is left to the caller.
pub(crate) fn query(command: &mut Command) -> Result<Output, RunnerError> {
    command
        .stdin(Stdio::null())
        .output()
        .map_err(|e| RunnerError::Poll {
            cmd: render(command),
            message: e.to_string(),
        })
}

/// Run a command to completion and ignore how it went.
pub(crate) fn fire(command: &mut Command) {
    tracing::debug!("running: {}", render(command));

    let result = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    if let Err(e) = result {
        tracing::warn!("{}: {e}", render(command));
    }
}

/// Bounds the SSH liveness check: run a command, killing it if it does not
/// exit within `timeout`. `None` means it timed out. Checks every 20 ms, so
/// it only suits short checks.
pub(crate) fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }

        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }

        thread::sleep(Duration::from_millis(20));
    }
}

/// First whitespace separated token made only of digits, scanning from the
/// end when `last` is set.
pub(crate) fn find_id(text: &str, last: bool) -> Option<String> {
    let is_id = |token: &&str| !token.is_empty() && token.chars().all(|c| c.is_ascii_digit());
    let mut tokens = text.split_whitespace();

    let found = if last {
        tokens.rfind(is_id)
    } else {
        tokens.find(is_id)
    };
    found.map(str::to_string)
}
