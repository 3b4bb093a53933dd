//! Bounded external-command execution shared by the system managers.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::trace;

use super::SystemError;

/// Run a command to completion with a timeout, returning stdout.
///
/// Stdin is fed `input` when given. A non-zero exit becomes
/// [`SystemError::Command`] carrying trimmed stderr; exceeding the timeout
/// kills the child and becomes [`SystemError::Timeout`].
pub(crate) async fn run(
    program: &str,
    args: &[&str],
    input: Option<&[u8]>,
    limit: Duration,
) -> Result<String, SystemError> {
    trace!(program, ?args, "exec");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(payload) = input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload).await?;
            // Dropping closes the pipe so the child sees EOF.
        }
    }

    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            } else {
                Err(SystemError::Command {
                    program: program.to_string(),
                    code: output.status.code().unwrap_or(-1),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        }
        Ok(Err(e)) => Err(SystemError::Io(e)),
        Err(_) => Err(SystemError::Timeout {
            program: program.to_string(),
            timeout_secs: limit.as_secs(),
        }),
    }
}
