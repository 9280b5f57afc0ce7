//! The reaper (C2): active only when the daemon's own PID is 1. Drains
//! terminated descendants re-parented to init that the executor's own
//! exit channels never see. See `spec.md` §4.2.

use crate::context::Context;
use crate::executor::ExitResult;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Returns whether this process is running as PID 1 — the only case in
/// which the kernel re-parents orphans to it.
pub fn is_pid1() -> bool {
    nix::unistd::getpid().as_raw() == 1
}

/// Registry of pids whose exit belongs to an executor's one-shot exit
/// channel (`spec.md` §4.1), shared between the executor and the reaper.
///
/// `waitpid(-1, WNOHANG)` and a specific-pid `wait()` can both be racing
/// to reap the same child when running as PID 1: whichever syscall the
/// kernel services first consumes the zombie and returns the real exit
/// status; the other gets `ECHILD`. Rather than let the reaper silently
/// steal a direct child's exit (`spec.md` §4.2), the executor registers
/// the pid's publisher here before waiting on it; if the reaper wins the
/// race it forwards the status through the same publisher instead of
/// just logging it as an orphan.
#[derive(Default)]
pub struct PidRegistry {
    owners: Mutex<HashMap<u32, crate::event::channel::EventPublisher<ExitResult>>>,
}

impl PidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `pid` as owned by an executor's exit channel.
    pub fn register(&self, pid: u32, publisher: crate::event::channel::EventPublisher<ExitResult>) {
        self.owners.lock().unwrap().insert(pid, publisher);
    }

    /// Removes and returns `pid`'s owner, if one is registered. Idempotent:
    /// called by whichever side (executor or reaper) wins the reap race,
    /// and a no-op for the other.
    pub fn take(&self, pid: u32) -> Option<crate::event::channel::EventPublisher<ExitResult>> {
        self.owners.lock().unwrap().remove(&pid)
    }
}

fn exit_result_from_status(status: &WaitStatus) -> ExitResult {
    match status {
        WaitStatus::Exited(_, code) => ExitResult { code: *code, error: None },
        WaitStatus::Signaled(_, signal, _) => ExitResult { code: *signal as i32, error: None },
        other => ExitResult { code: 0, error: Some(format!("unexpected wait status: {other:?}")) },
    }
}

pub struct Reaper {
    registry: Arc<PidRegistry>,
    ctx: Context<bool>,
    handle: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Reaper {
    pub fn new(registry: Arc<PidRegistry>) -> Self {
        Self { registry, ctx: Context::new(), handle: std::sync::Mutex::new(None) }
    }

    /// Drains every currently-waitable terminated child with non-blocking
    /// `waitpid(-1, WNOHANG)`, looping until "no more terminated children"
    /// or an error. Returns the number reaped. Callable on demand and by
    /// the background drain loop alike.
    ///
    /// A reaped pid that the executor has registered is **not** a genuine
    /// orphan — it is this reaper winning a race against the executor's
    /// own wait on that pid. Its result is forwarded through the
    /// registered publisher rather than dropped, satisfying `spec.md`
    /// §4.2's guarantee that a direct child's exit is always delivered
    /// through its executor exit channel.
    pub fn reap_once(&self) -> usize {
        let mut count = 0;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    count += 1;
                    let pid = status.pid().map(|p| p.as_raw() as u32);
                    match pid.and_then(|pid| self.registry.take(pid).map(|publisher| (pid, publisher))) {
                        Some((pid, publisher)) => {
                            trace!(pid, ?status, "reaper won race against executor wait, forwarding exit");
                            let _ = publisher.publish(exit_result_from_status(&status));
                        }
                        None => trace!(?status, "reaped orphaned descendant"),
                    }
                }
                Err(nix::errno::Errno::ECHILD) => break,
                Err(err) => {
                    warn!(%err, "waitpid failed during reap");
                    break;
                }
            }
        }
        count
    }

    /// Spawns the background drain loop: polls for terminated children at
    /// `POLL_INTERVAL` (a simple, portable stand-in for a `SIGCHLD`-driven
    /// wakeup that composes cleanly with the cooperative cancellation
    /// token every other background task uses).
    pub fn start(self: &Arc<Self>) {
        if !is_pid1() {
            debug!("not running as pid 1, reaper stays idle");
            return;
        }
        let this = Arc::clone(self);
        let ctx = self.ctx.clone();
        let handle = std::thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || {
                while !ctx.wait_timeout(POLL_INTERVAL) {
                    this.reap_once();
                }
            })
            .expect("thread spawn should succeed");
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Cancels the drain loop, performs one final drain, and joins.
    pub fn stop(&self) {
        self.ctx.cancel_all(true).ok();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.reap_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::channel::pub_sub;

    fn reaper() -> Reaper {
        Reaper::new(Arc::new(PidRegistry::new()))
    }

    #[test]
    fn reap_once_drains_a_known_child() {
        // spawned and forgotten: once it exits it becomes a zombie only
        // `waitpid(-1, ..)` (not a held `Child` handle) can reap.
        std::mem::forget(std::process::Command::new("/bin/true").spawn().unwrap());
        std::thread::sleep(Duration::from_millis(50));
        let reaped = reaper().reap_once();
        assert!(reaped >= 1);
    }

    #[test]
    fn reap_once_on_empty_process_tree_does_not_block() {
        // A second immediate call finds nothing left to drain.
        let r = reaper();
        r.reap_once();
        let reaped = r.reap_once();
        assert_eq!(reaped, 0);
    }

    #[test]
    fn start_stop_is_idempotent_when_not_pid1() {
        let reaper = Arc::new(reaper());
        reaper.start();
        reaper.stop();
        reaper.stop();
    }

    /// A pid registered as owned by an executor's exit channel must have
    /// its exit forwarded through that channel, not merely logged as a
    /// drained orphan — `spec.md` §4.2.
    #[test]
    fn reap_once_forwards_registered_pid_instead_of_dropping_it() {
        let registry = Arc::new(PidRegistry::new());
        let child = std::process::Command::new("/bin/sh").args(["-c", "exit 9"]).spawn().unwrap();
        let pid = child.id();
        std::mem::forget(child);
        let (publisher, consumer) = pub_sub();
        registry.register(pid, publisher);
        std::thread::sleep(Duration::from_millis(50));

        let r = Reaper::new(Arc::clone(&registry));
        r.reap_once();

        let result = consumer.try_recv().expect("registered pid's exit must be forwarded");
        assert_eq!(result.code, 9);
        assert!(registry.take(pid).is_none(), "registration must be consumed");
    }
}
