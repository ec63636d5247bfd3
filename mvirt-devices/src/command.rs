//! External command execution with a deadline.

use crate::error::KernelError;
use std::time::Duration;
use tokio::process::Command;

/// Upper bound for a single `tc` or `bpftool` invocation.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `cmd` and return its stdout.
///
/// The child is killed if it does not exit within `timeout`.
pub(crate) async fn run(
    mut cmd: Command,
    name: &'static str,
    timeout: Duration,
) -> Result<Vec<u8>, KernelError> {
    cmd.kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| KernelError::CommandTimeout(name, timeout))?
        .map_err(|e| KernelError::Command(name, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(KernelError::CommandFailed(name, stderr.trim().to_string()));
    }
    Ok(output.stdout)
}
