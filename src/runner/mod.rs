//! Child process wrapper
//!
//! Spawns the wrapped command with piped output, mirrors its stdout
//! through the [`StreamSplitter`] and its stderr untouched, forwards
//! SIGINT/SIGTERM to the child, and reports its exit status.

use crate::error::{Error, Result};
use crate::stream::StreamSplitter;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use tokio::io::AsyncWrite;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, warn};

/// Result of one wrapped run.
#[derive(Debug)]
pub struct RunnerOutcome {
    /// The child's exit code, `-1` when it was killed by a signal.
    pub exit_code: i32,
    /// Bytes mirrored from the child's stdout to the destination.
    pub bytes_mirrored: u64,
}

/// Run `program` with `args`, mirroring its stdout into `destination`
/// through `splitter` and its stderr straight to the host's stderr.
/// Returns once the child has exited and both output streams are drained.
pub async fn run_wrapped<W>(
    program: &str,
    args: &[String],
    splitter: &StreamSplitter,
    destination: W,
) -> Result<RunnerOutcome>
where
    W: AsyncWrite + Unpin,
{
    debug!(program, ?args, "spawning wrapped command");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let forwarder = spawn_signal_forwarder(child.id())?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Other("failed to capture child stdout".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Other("failed to capture child stderr".to_string()))?;

    // Stderr is mirrored as-is; it never enters the processing path.
    let stderr_task = tokio::spawn(async move {
        let mut host_stderr = tokio::io::stderr();
        if let Err(err) = tokio::io::copy(&mut stderr, &mut host_stderr).await {
            warn!(error = %err, "stderr mirroring ended early");
        }
    });

    let bytes_mirrored = splitter.run(stdout, destination).await?;
    let status = child.wait().await?;
    let _ = stderr_task.await;
    forwarder.abort();

    let exit_code = status.code().unwrap_or(-1);
    debug!(exit_code, bytes_mirrored, "wrapped command finished");
    Ok(RunnerOutcome {
        exit_code,
        bytes_mirrored,
    })
}

/// Forward SIGINT and SIGTERM to the child so interactive interrupts reach
/// the wrapped tool instead of only the wrapper.
fn spawn_signal_forwarder(child_id: Option<u32>) -> Result<tokio::task::JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        loop {
            let forwarded = tokio::select! {
                _ = sigint.recv() => Signal::SIGINT,
                _ = sigterm.recv() => Signal::SIGTERM,
            };
            if let Some(pid) = child_id {
                debug!(?forwarded, pid, "forwarding signal to child");
                if let Err(err) = kill(Pid::from_raw(pid as i32), forwarded) {
                    warn!(error = %err, "failed to forward signal");
                }
            }
        }
    }))
}
