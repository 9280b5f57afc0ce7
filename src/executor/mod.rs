//! The executor port (C1): start a process from a spec, signal it, stop it
//! with timeout-escalating signals. See `spec.md` §4.1.

pub mod unix;

use crate::config::ProcessSpec;
use crate::event::channel::EventConsumer;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn process: {0}")]
    SpawnError(String),
    #[error("process not found")]
    ProcessNotFound,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("i/o error: {0}")]
    IoError(String),
}

/// The single message delivered on a process's exit channel. `error` is
/// set only when waiting itself failed, per `spec.md` §3 (`LifecycleEvent`)
/// and §7 ("Runtime exit").
#[derive(Debug, Clone)]
pub struct ExitResult {
    pub code: i32,
    pub error: Option<String>,
}

/// A signal kind that can be delivered to a process group, independent of
/// the OS's native signal numbering. See `spec.md` §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Terminate,
    Interrupt,
    Hangup,
    Kill,
}

pub struct StartedProcess {
    pub pid: u32,
    pub exit_channel: EventConsumer<ExitResult>,
}

/// A port the core consumes; see `spec.md` §4.1 and §9 ("Dynamic
/// dispatch"). Implementations are injected at construction.
pub trait Executor: Send + Sync {
    /// Launches a process per `spec`. Does not return until the child has
    /// been forked and the PID is known; a failed spawn produces no
    /// exit-channel event.
    fn start(&self, spec: &ProcessSpec) -> Result<StartedProcess, ExecutorError>;

    /// Sends the graceful termination signal to the process group; if
    /// still alive after `timeout`, escalates to the forcible-kill
    /// signal. Idempotent with respect to an already-exited process.
    fn stop(&self, pid: u32, timeout: Duration) -> Result<(), ExecutorError>;

    /// Delivers `signal` to the process group rooted at `pid`.
    fn signal(&self, pid: u32, signal: SignalKind) -> Result<(), ExecutorError>;
}
