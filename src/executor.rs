//! Cancellable execution of external conversion commands.

use crate::error::ConversionError;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a cancelled process group gets to exit after SIGTERM.
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Runs external commands and captures their standard output.
///
/// Every command is started as the leader of a new process group. When the
/// cancellation token fires the whole group is terminated, so helpers
/// spawned by the tool (browsers, renderers) never outlive the job.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    kill_grace: Duration,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Sets how long to wait between SIGTERM and SIGKILL on cancellation.
    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    /// Runs `argv` to completion or until `cancel` fires.
    ///
    /// # Errors
    ///
    /// - [`ConversionError::Cancelled`] if the token fired first. The
    ///   process group has been killed by the time this returns.
    /// - [`ConversionError::ProcessFailed`] if the command is empty, cannot
    ///   be spawned, or exits with a non-zero status.
    pub async fn run(
        &self,
        argv: &[String],
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, ConversionError> {
        let (program, args) = argv.split_first().ok_or_else(|| ConversionError::ProcessFailed {
            command: String::new(),
            status: None,
            stderr: "empty command".to_string(),
        })?;

        if cancel.is_cancelled() {
            return Err(ConversionError::Cancelled);
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| ConversionError::spawn_failed(program, e))?;
        let pid = child.id();
        debug!(program = %program, pid = ?pid, "Spawned conversion process");

        let finished = tokio::select! {
            res = collect_output(&mut child, pid) => Some(res),
            _ = cancel.cancelled() => None,
        };

        match finished {
            Some(Ok((status, stdout, stderr))) => {
                if !status.success() {
                    return Err(ConversionError::ProcessFailed {
                        command: program.clone(),
                        status: status.code(),
                        stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
                    });
                }
                debug!(program = %program, bytes = stdout.len(), "Conversion process finished");
                Ok(stdout)
            }
            Some(Err(e)) => {
                self.terminate(&mut child, pid).await;
                Err(ConversionError::output_failed(program, e))
            }
            None => {
                warn!(program = %program, pid = ?pid, "Cancelling conversion process group");
                self.terminate(&mut child, pid).await;
                Err(ConversionError::Cancelled)
            }
        }
    }

    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        signal_group(pid, GroupSignal::Term);
        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
            debug!(pid = ?pid, "Process ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(pid = ?pid, error = %e, "Failed to kill conversion process");
            }
        }
        signal_group(pid, GroupSignal::Kill);
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for exit while draining both pipes, so a chatty process can't
/// block on a full pipe buffer.
///
/// Anything the tool left running in its group is killed before the leader
/// is reaped, while the leader still pins the process group id.
async fn collect_output(
    child: &mut Child,
    pid: Option<u32>,
) -> io::Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let read_stdout = async {
        if let Some(pipe) = stdout_pipe.as_mut() {
            pipe.read_to_end(&mut stdout).await?;
        }
        Ok::<_, io::Error>(())
    };
    let read_stderr = async {
        if let Some(pipe) = stderr_pipe.as_mut() {
            pipe.read_to_end(&mut stderr).await?;
        }
        Ok::<_, io::Error>(())
    };

    let (reaped, _, _) = tokio::try_join!(leader_exited(child, pid), read_stdout, read_stderr)?;
    signal_group(pid, GroupSignal::Kill);
    let status = match reaped {
        Some(status) => status,
        None => child.wait().await?,
    };
    Ok((status, stdout, stderr))
}

/// Resolves once the leader has exited but leaves it a zombie. Returns
/// `None` since nothing was reaped.
#[cfg(target_os = "linux")]
async fn leader_exited(_child: &mut Child, pid: Option<u32>) -> io::Result<Option<ExitStatus>> {
    use nix::errno::Errno;
    use nix::sys::wait::{waitid, Id, WaitPidFlag};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return Ok(None) };
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT;
    tokio::task::spawn_blocking(move || loop {
        match waitid(Id::Pid(Pid::from_raw(pid as i32)), flags) {
            Err(Errno::EINTR) => continue,
            Ok(_) | Err(Errno::ECHILD) => return Ok(None),
            Err(e) => return Err(io::Error::from(e)),
        }
    })
    .await
    .map_err(io::Error::other)?
}

/// Without `waitid(WNOWAIT)` the leader is reaped first. The group kill that
/// follows can then only misfire if its pid was recycled in between.
#[cfg(not(target_os = "linux"))]
async fn leader_exited(child: &mut Child, _pid: Option<u32>) -> io::Result<Option<ExitStatus>> {
    child.wait().await.map(Some)
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    let signal = match signal {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pid, signal = ?signal, error = %e, "Failed to signal process group"),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) {}
