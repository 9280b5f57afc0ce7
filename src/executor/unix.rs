//! Unix implementation of the executor port. Sets each child's process
//! group to a fresh group (so a signal to the group reaches the whole
//! tree it may have forked), resolves optional user/group credentials by
//! name, and redirects stdout/stderr to file sinks when configured.

use super::{ExecutorError, ExitResult, SignalKind, StartedProcess};
use crate::config::ProcessSpec;
use crate::event::channel::bounded_pub_sub;
use crate::reaper::PidRegistry;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Spawns processes and reports their exit through a per-process
/// one-shot channel. Shares a [`PidRegistry`] with the reaper so the two
/// independent reaping paths (this executor's per-child `wait()`, and
/// the reaper's PID-1-only `waitpid(-1, ..)` drain) never both try to
/// consume the same exit — see `spec.md` §4.2.
#[derive(Debug, Clone)]
pub struct UnixExecutor {
    registry: Arc<PidRegistry>,
}

impl UnixExecutor {
    pub fn new(registry: Arc<PidRegistry>) -> Self {
        Self { registry }
    }

    fn build_command(spec: &ProcessSpec) -> Result<Command, ExecutorError> {
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args);
        cmd.envs(&spec.env);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdout(sink(&spec.stdout)?);
        cmd.stderr(sink(&spec.stderr)?);

        if let Some(name) = &spec.user {
            let user = users::get_user_by_name(name)
                .ok_or_else(|| ExecutorError::SpawnError(format!("unknown user `{name}`")))?;
            cmd.uid(user.uid());
        }
        if let Some(name) = &spec.group {
            let group = users::get_group_by_name(name)
                .ok_or_else(|| ExecutorError::SpawnError(format!("unknown group `{name}`")))?;
            cmd.gid(group.gid());
        }

        // Detach into a new process group so signals sent to the group
        // reach every descendant the child itself may spawn.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map(|_| ()).map_err(std::io::Error::from)
            });
        }

        Ok(cmd)
    }
}

fn sink(path: &Option<std::path::PathBuf>) -> Result<Stdio, ExecutorError> {
    match path {
        None => Ok(Stdio::null()),
        Some(path) => std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(Stdio::from)
            .map_err(|err| ExecutorError::IoError(err.to_string())),
    }
}

impl super::Executor for UnixExecutor {
    fn start(&self, spec: &ProcessSpec) -> Result<StartedProcess, ExecutorError> {
        let mut cmd = Self::build_command(spec)?;
        let mut child = cmd.spawn().map_err(|err| ExecutorError::SpawnError(err.to_string()))?;
        let pid = child.id();

        let (publisher, consumer) = bounded_pub_sub(1);
        self.registry.register(pid, publisher.clone());
        let registry = Arc::clone(&self.registry);
        std::thread::Builder::new()
            .name(format!("exit-wait-{pid}"))
            .spawn(move || {
                let result = match child.wait() {
                    Ok(status) => Some(ExitResult {
                        code: status.code().or_else(|| status.signal()).unwrap_or(0),
                        error: None,
                    }),
                    Err(err) if err.raw_os_error() == Some(libc::ECHILD) => {
                        // The reaper (running as pid 1) won the race on this
                        // pid and already forwarded its exit through the
                        // registry below — spec.md §4.2.
                        None
                    }
                    Err(err) => Some(ExitResult { code: 0, error: Some(err.to_string()) }),
                };
                // Either we won the race (registry entry never consulted by
                // the reaper) or the reaper already took it; either way the
                // registration must not outlive this pid.
                registry.take(pid);
                if let Some(result) = result {
                    let _ = publisher.publish(result);
                }
            })
            .expect("thread spawn should succeed");

        Ok(StartedProcess { pid, exit_channel: consumer })
    }

    fn stop(&self, pid: u32, timeout: Duration) -> Result<(), ExecutorError> {
        match send_to_group(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(ExecutorError::ProcessNotFound) => return Ok(()),
            Err(err) => return Err(err),
        }

        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if !process_alive(pid) {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        if process_alive(pid) {
            warn!(pid, "process did not exit within timeout, sending SIGKILL");
            match send_to_group(pid, Signal::SIGKILL) {
                Ok(()) | Err(ExecutorError::ProcessNotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn signal(&self, pid: u32, signal: SignalKind) -> Result<(), ExecutorError> {
        let sig = match signal {
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Interrupt => Signal::SIGINT,
            SignalKind::Hangup => Signal::SIGHUP,
            SignalKind::Kill => Signal::SIGKILL,
        };
        send_to_group(pid, sig)
    }
}

/// Sends `sig` to the process group rooted at `pid` (negative pid targets
/// the group). `ProcessNotFound` is treated by callers as "already gone".
fn send_to_group(pid: u32, sig: Signal) -> Result<(), ExecutorError> {
    let pgid = Pid::from_raw(-(pid as i32));
    match signal::kill(pgid, sig) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Err(ExecutorError::ProcessNotFound),
        Err(nix::errno::Errno::EPERM) => {
            Err(ExecutorError::PermissionDenied(format!("cannot signal pid {pid}")))
        }
        Err(err) => {
            error!(pid, %err, "failed to signal process group");
            Err(ExecutorError::IoError(err.to_string()))
        }
    }
}

fn process_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}
