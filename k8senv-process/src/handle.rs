//! Spawn/observe/stop a single external process.
//!
//! Grounded on the process-group shutdown pattern in `local-deployment`'s
//! `command.rs` (graceful signal, then escalate to a forced kill after a
//! grace period) and the spawn/stderr-capture/reaper shape of
//! `ferrex-server`'s transcoding worker, generalized to a named, reusable
//! handle instead of an ffmpeg-specific helper.

use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::fs::File as AsyncFile;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Give the reaper this long to report back after we've already sent
/// SIGKILL, to guarantee `stop` always returns in finite time even if the
/// kernel is pathologically slow to reap a zombie.
const HARD_DRAIN_BOUND: Duration = Duration::from_secs(5);

/// A command to spawn, independent of any particular shell.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Snafu)]
pub enum ProcessError {
    #[snafu(display("process '{name}' is already started"))]
    AlreadyStarted { name: String },

    #[snafu(display("failed to create log file {path:?} for process '{name}': {source}"))]
    LogFile {
        name: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to spawn process '{name}' ({program}): {source}"))]
    Spawn {
        name: String,
        program: String,
        source: std::io::Error,
    },

    #[snafu(display("process '{name}' exited before it could be reaped: {source}"))]
    Wait { name: String, source: std::io::Error },

    #[snafu(display("reaper for process '{name}' was dropped without reporting an exit status"))]
    ReaperDropped { name: String },

    #[snafu(display("timed out after {timeout:?} stopping process '{name}'"))]
    StopTimeout { name: String, timeout: Duration },
}

enum State {
    NotStarted,
    Running(Running),
    Stopped,
}

struct Running {
    pid: u32,
    reaper_result: oneshot::Receiver<std::io::Result<ExitStatus>>,
    exited_rx: watch::Receiver<bool>,
    reaper_handle: tokio::task::JoinHandle<()>,
}

/// Handle to one spawned external process.
///
/// Not `Clone`: ownership of the reaper and the ability to call `stop` is
/// exclusive to whoever created the handle (the owning `Stack`), which
/// serializes calls the same way the stack itself is not safe for
/// concurrent use.
pub struct ProcessHandle {
    name: String,
    state: Mutex<State>,
}

impl ProcessHandle {
    /// Create a handle that has not yet been started.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::NotStarted),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the child with stdout/stderr redirected to
    /// `<working_dir>/<name>-stdout.log` and `<working_dir>/<name>-stderr.log`,
    /// and launch exactly one reaper task for it.
    pub async fn start(
        &self,
        command: ProcessCommand,
        working_dir: &Path,
    ) -> Result<(), ProcessError> {
        let mut state = self.state.lock().await;
        if matches!(&*state, State::Running(_)) {
            return AlreadyStartedSnafu {
                name: self.name.clone(),
            }
            .fail();
        }

        let stdout_path = working_dir.join(format!("{}-stdout.log", self.name));
        let stderr_path = working_dir.join(format!("{}-stderr.log", self.name));
        let stdout_file = open_log_file(&self.name, &stdout_path).await?;
        let stderr_file = open_log_file(&self.name, &stderr_path).await?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout_file.into_std().await)
            .stderr(stderr_file.into_std().await)
            .kill_on_drop(true);
        configure_parent_death_signal(&mut cmd);

        let mut child: Child = cmd.spawn().context(SpawnSnafu {
            name: self.name.clone(),
            program: command.program.clone(),
        })?;
        let pid = child
            .id()
            .expect("just-spawned child always has a pid before it is waited on");

        let (reaper_tx, reaper_result) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let name = self.name.clone();
        let reaper_handle = tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exited_tx.send(true);
            if reaper_tx.send(status).is_err() {
                debug!(process = %name, "reaper result dropped, nobody was listening");
            }
        });

        info!(process = %self.name, pid, "process started");
        *state = State::Running(Running {
            pid,
            reaper_result,
            exited_rx,
            reaper_handle,
        });
        Ok(())
    }

    /// A receiver that reports whether the process has exited. Safe for any
    /// number of concurrent readers; a reader created after exit immediately
    /// observes `true`.
    pub async fn exited(&self) -> Option<watch::Receiver<bool>> {
        match &*self.state.lock().await {
            State::Running(running) => Some(running.exited_rx.clone()),
            State::NotStarted | State::Stopped => None,
        }
    }

    /// Stop the process: send the graceful signal, escalate to a forced
    /// kill if it hasn't exited within `min(grace, timeout)`, and wait for
    /// the reaper with a hard upper bound so this always returns.
    ///
    /// Idempotent: stopping a never-started or already-stopped handle
    /// succeeds immediately.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ProcessError> {
        self.stop_with_grace(timeout, Duration::from_secs(5)).await
    }

    async fn stop_with_grace(
        &self,
        timeout: Duration,
        grace: Duration,
    ) -> Result<(), ProcessError> {
        let mut state = self.state.lock().await;
        let running = match std::mem::replace(&mut *state, State::Stopped) {
            State::Running(running) => running,
            State::NotStarted | State::Stopped => return Ok(()),
        };

        let Running {
            pid,
            mut reaper_result,
            reaper_handle,
            ..
        } = running;

        if let Err(err) = send_signal(pid, Signal::Terminate) {
            warn!(process = %self.name, pid, %err, "failed to send graceful signal, process may already be gone");
        }

        let escalate_after = grace.min(timeout);
        let escalate_deadline = Instant::now() + escalate_after;
        let hard_deadline = Instant::now() + timeout;
        let mut escalated = false;

        let status = loop {
            tokio::select! {
                res = &mut reaper_result => break res,
                _ = tokio::time::sleep_until(escalate_deadline), if !escalated => {
                    escalated = true;
                    if let Err(err) = send_signal(pid, Signal::Kill) {
                        warn!(process = %self.name, pid, %err, "failed to send forced kill signal");
                    }
                }
                _ = tokio::time::sleep_until(hard_deadline) => {
                    break match tokio::time::timeout(HARD_DRAIN_BOUND, &mut reaper_result).await {
                        Ok(res) => res,
                        Err(_) => {
                            return StopTimeoutSnafu {
                                name: self.name.clone(),
                                timeout,
                            }
                            .fail();
                        }
                    };
                }
            }
        };

        // The reaper task itself only ever awaits `child.wait()`; once the
        // oneshot has fired the task is effectively done, so join it to
        // avoid leaking it, but don't let a slow-to-schedule join block us.
        let _ = tokio::time::timeout(Duration::from_millis(500), reaper_handle).await;

        match status {
            Ok(Ok(exit_status)) => {
                if exit_status.success() || escalated || signal_terminated(exit_status) {
                    Ok(())
                } else {
                    debug!(process = %self.name, ?exit_status, "process exited with non-zero status during stop");
                    Ok(())
                }
            }
            Ok(Err(source)) => WaitSnafu {
                name: self.name.clone(),
            }
            .fail::<()>()
            .map_err(|_| ProcessError::Wait {
                name: self.name.clone(),
                source,
            }),
            Err(_recv_error) => ReaperDroppedSnafu {
                name: self.name.clone(),
            }
            .fail(),
        }
    }

    /// Release log files. If the process is still running this auto-stops
    /// it first (logging a warning), matching the "don't leak children"
    /// discipline the owning `Stack` relies on.
    pub async fn close(&self) {
        let running = matches!(&*self.state.lock().await, State::Running(_));
        if running {
            warn!(process = %self.name, "closing handle without prior stop, auto-stopping");
            if let Err(err) = self.stop(Duration::from_secs(10)).await {
                warn!(process = %self.name, %err, "auto-stop on close failed");
            }
        }
    }
}

async fn open_log_file(name: &str, path: &Path) -> Result<AsyncFile, ProcessError> {
    AsyncFile::create(path).await.context(LogFileSnafu {
        name: name.to_string(),
        path: path.to_path_buf(),
    })
}

#[derive(Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::errno::Errno> {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        Signal::Terminate => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    match kill(Pid::from_raw(pid as i32), nix_signal) {
        // Already gone: treat as success, the reaper will pick up the exit.
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        other => other,
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) -> Result<(), std::io::Error> {
    // No portable graceful-termination API outside unix signals; escalate
    // straight to a forced kill via the platform tool, best effort.
    if matches!(signal, Signal::Terminate) {
        return Ok(());
    }
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .status()
        .map(|_| ())
}

#[cfg(unix)]
fn signal_terminated(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn signal_terminated(_status: ExitStatus) -> bool {
    false
}

/// Best-effort: ask the kernel to deliver `SIGTERM` to the child if this
/// process dies first, so an abrupt parent kill doesn't orphan it. Linux
/// only; other platforms silently omit this.
#[cfg(target_os = "linux")]
fn configure_parent_death_signal(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            let ret = libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
            if ret != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn configure_parent_death_signal(_cmd: &mut Command) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_stop_a_process() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ProcessHandle::new("sleeper");
        let command = ProcessCommand::new("sleep").arg("30");
        handle.start(command, dir.path()).await.unwrap();

        let exited = handle.exited().await.unwrap();
        assert!(!*exited.borrow());

        handle.stop(Duration::from_secs(5)).await.unwrap();
        assert!(*exited.borrow());
    }

    #[tokio::test]
    async fn stop_on_never_started_handle_succeeds() {
        let handle = ProcessHandle::new("never-started");
        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_twice_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ProcessHandle::new("double-stop");
        handle
            .start(ProcessCommand::new("sleep").arg("30"), dir.path())
            .await
            .unwrap();
        handle.stop(Duration::from_secs(5)).await.unwrap();
        handle.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn log_files_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ProcessHandle::new("echoer");
        handle
            .start(ProcessCommand::new("echo").arg("hi"), dir.path())
            .await
            .unwrap();
        handle.stop(Duration::from_secs(5)).await.unwrap();
        assert!(dir.path().join("echoer-stdout.log").exists());
        assert!(dir.path().join("echoer-stderr.log").exists());
    }

    #[tokio::test]
    async fn process_dying_before_stop_is_observed_via_exited() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ProcessHandle::new("quick-exit");
        handle
            .start(ProcessCommand::new("true"), dir.path())
            .await
            .unwrap();
        let mut exited = handle.exited().await.unwrap();
        exited.changed().await.unwrap();
        assert!(*exited.borrow());
        handle.stop(Duration::from_secs(5)).await.unwrap();
    }
}
