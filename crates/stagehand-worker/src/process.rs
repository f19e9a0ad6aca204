//! Worker process handles.
//!
//! A [`ProcessHandle`] owns exactly one child process. In attached mode the
//! child's stdout and stderr are piped and merged into a single line stream
//! ([`OutputStream`]); in detached mode the child gets its own terminal and
//! only its pid and exit status are observable.
//!
//! Termination never fails observably: errors are logged and the handle
//! falls back to a forced kill.

use crate::launcher::LaunchSpec;
use stagehand_core::config::ExecutionMode;
use stagehand_core::types::SlotId;
use stagehand_core::{Result, StagehandError};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Lines buffered between the pipe readers and the monitor.
const OUTPUT_BUFFER: usize = 256;

/// Line stream of an attached process. Ends when both pipes close.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::Receiver<String>,
}

impl OutputStream {
    /// Next line, or `None` at end of output.
    pub async fn read_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Handle to one spawned worker process.
#[derive(Debug)]
pub struct ProcessHandle {
    slot_id: SlotId,
    child: Child,
    pid: Option<u32>,
    output: Option<OutputStream>,
    mode: ExecutionMode,
    exit_status: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Spawn the process described by `spec`.
    ///
    /// Fails with `ScriptMissing` when the launch target does not exist and
    /// with `Spawn` on OS-level failure.
    #[instrument(level = "debug", skip(spec), fields(slot = %spec.slot_id))]
    pub fn spawn(spec: &LaunchSpec) -> Result<Self> {
        if !spec.target.exists() {
            return Err(StagehandError::ScriptMissing {
                slot_id: spec.slot_id.clone(),
                path: spec.target.clone(),
            });
        }

        let line = spec.command_line();
        let (program, args) = line
            .split_first()
            .ok_or_else(|| StagehandError::spawn(&spec.slot_id, "empty command line"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match spec.mode {
            ExecutionMode::Attached => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            ExecutionMode::Detached => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
                #[cfg(windows)]
                if spec.terminal_prefix.is_empty() {
                    const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
                    cmd.creation_flags(CREATE_NEW_CONSOLE);
                }
            }
        }

        debug!(command = ?line, cwd = %spec.cwd.display(), "spawning worker");

        let mut child = cmd
            .spawn()
            .map_err(|e| StagehandError::spawn(&spec.slot_id, e.to_string()))?;
        let pid = child.id();

        let output = match spec.mode {
            ExecutionMode::Attached => {
                let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
                if let Some(stdout) = child.stdout.take() {
                    tokio::spawn(pump_lines(stdout, tx.clone()));
                }
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(pump_lines(stderr, tx));
                }
                Some(OutputStream { rx })
            }
            ExecutionMode::Detached => None,
        };

        info!(slot = %spec.slot_id, pid, mode = ?spec.mode, "worker process spawned");

        Ok(Self {
            slot_id: spec.slot_id.clone(),
            child,
            pid,
            output,
            mode: spec.mode,
            exit_status: None,
        })
    }

    /// OS process id.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether this handle produces an output stream.
    pub fn supports_output_stream(&self) -> bool {
        self.mode == ExecutionMode::Attached
    }

    /// Take the output stream. Returns `None` after the first call and in
    /// detached mode.
    pub fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    /// Poll the process without blocking.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(slot = %self.slot_id, error = %e, "failed to poll worker process");
                false
            }
        }
    }

    /// Exit status, once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Ask the process to exit, then force it after `grace`.
    #[instrument(level = "debug", skip(self), fields(slot = %self.slot_id, pid = ?self.pid))]
    pub async fn terminate(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }

        self.signal_terminate();

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "worker exited after terminate");
                self.exit_status = Some(status);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "waiting for worker failed, killing");
                self.kill().await;
            }
            Err(_) => {
                warn!(grace = ?grace, "worker did not exit within grace period, killing");
                self.kill().await;
            }
        }
    }

    /// Forcefully kill the process and reap it.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(slot = %self.slot_id, error = %e, "failed to kill worker process");
            return;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            self.exit_status = Some(status);
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return;
        };
        // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs
        // to a child we have not reaped yet, so it cannot have been recycled.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            warn!(
                slot = %self.slot_id,
                error = %std::io::Error::last_os_error(),
                "failed to send SIGTERM"
            );
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(slot = %self.slot_id, error = %e, "failed to stop worker process");
        }
    }
}

/// Forward lines from one pipe until it closes or the receiver goes away.
async fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "worker output pipe closed");
                break;
            }
        }
    }
}
