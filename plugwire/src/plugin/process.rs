//! Child process glue.

use tokio::process::{Child, Command};

use super::{BoxReader, BoxWriter};
use crate::error::{Error, Result};

/// Spawn the plugin and take its piped stdout (our reader) and stdin (our writer).
pub(super) fn spawn(mut command: Command) -> Result<(Child, BoxReader, BoxWriter)> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let mut child = command
        .spawn()
        .map_err(|e| Error::Spawn(format!("{program}: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Spawn(format!("{program}: stdout is not piped")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Spawn(format!("{program}: stdin is not piped")))?;
    Ok((child, Box::new(stdout), Box::new(stdin)))
}

/// Ask the child to shut down: SIGINT on Unix, a forced kill elsewhere.
#[cfg(unix)]
pub(super) fn interrupt(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        tracing::debug!("Plugin process already exited");
        return;
    };
    tracing::info!(pid, "Sending SIGINT to plugin process");
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        tracing::warn!(pid, error = %e, "Failed to signal plugin process");
    }
}

#[cfg(not(unix))]
pub(super) fn interrupt(child: &mut Child) {
    tracing::info!(pid = ?child.id(), "Killing plugin process");
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to kill plugin process");
    }
}
