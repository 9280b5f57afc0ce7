//! The service manager (C5): a per-service finite-state machine with one
//! concurrent monitor task. See `spec.md` §4.4.

use crate::config::ServiceConfig;
use crate::context::Context;
use crate::event::channel::{EventConsumer, EventPublisher};
use crate::event::{LifecycleEvent, LifecycleEventKind, ServiceStatsSnapshot};
use crate::executor::{Executor, ExitResult, SignalKind};
use crate::restart::RestartTracker;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service is already running")]
    AlreadyRunning,
    #[error("executor error: {0}")]
    ExecutorError(String),
}

/// Read-only view of a service manager's state, used by
/// `Supervisor::service_snapshots`.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub name: String,
    pub state: ServiceState,
    pub pid: u32,
    pub stats: ServiceStatsSnapshot,
    pub healthy: bool,
}

struct Inner {
    state: ServiceState,
    pid: u32,
    started_at: Option<Instant>,
    stats: ServiceStatsSnapshot,
    healthy: bool,
    tracker: RestartTracker,
}

/// Owns one child process at a time and the state machine driving it.
/// `start`/`stop` are callable from any thread; the monitor task spawned
/// by `start` is the sole writer of `inner` while it runs.
pub struct ServiceManager {
    name: String,
    config: Mutex<ServiceConfig>,
    executor: Arc<dyn Executor>,
    events: EventPublisher<(String, LifecycleEvent)>,
    inner: Mutex<Inner>,
    exit_channel: Mutex<Option<EventConsumer<ExitResult>>>,
    monitor_ctx: Context<bool>,
    monitor_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ServiceManager {
    pub fn new(
        config: ServiceConfig,
        executor: Arc<dyn Executor>,
        events: EventPublisher<(String, LifecycleEvent)>,
    ) -> Self {
        let tracker = RestartTracker::new(&config.restart);
        Self {
            name: config.name.clone(),
            config: Mutex::new(config),
            executor,
            events,
            inner: Mutex::new(Inner {
                state: ServiceState::Stopped,
                pid: 0,
                started_at: None,
                stats: ServiceStatsSnapshot::default(),
                healthy: true,
                tracker,
            }),
            exit_channel: Mutex::new(None),
            monitor_ctx: Context::new(),
            monitor_handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        self.inner.lock().unwrap().state
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        let inner = self.inner.lock().unwrap();
        ServiceSnapshot {
            name: self.name.clone(),
            state: inner.state,
            pid: inner.pid,
            stats: inner.stats,
            healthy: inner.healthy,
        }
    }

    /// The spec this manager currently runs: consulted on `reload` diffing.
    pub fn spec_snapshot(&self) -> ServiceConfig {
        self.config.lock().unwrap().clone()
    }

    fn emit(&self, kind: LifecycleEventKind, pid: u32, exit_code: i32, error: Option<String>, stats: ServiceStatsSnapshot) {
        let mut event = LifecycleEvent::new(kind, self.name.clone(), stats).with_pid(pid).with_exit_code(exit_code);
        if let Some(error) = error {
            event = event.with_error(error);
        }
        let _ = self.events.publish((self.name.clone(), event));
    }

    /// `stopped -> starting`: spawns the process and its monitor task.
    /// Returns `AlreadyRunning` if a monitor is already active.
    pub fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        {
            let inner = self.inner.lock().unwrap();
            if !matches!(inner.state, ServiceState::Stopped | ServiceState::Failed) {
                return Err(ServiceError::AlreadyRunning);
            }
        }
        self.monitor_ctx.reset().ok();
        self.spawn_once()?;

        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("monitor-{}", self.name))
            .spawn(move || this.monitor_loop())
            .expect("thread spawn should succeed");
        *self.monitor_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Launches the child and transitions `starting -> running` or
    /// `starting -> failed` depending on whether the spawn itself
    /// succeeded. Does not start the monitor thread.
    fn spawn_once(self: &Arc<Self>) -> Result<(), ServiceError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ServiceState::Starting;
        }
        let spec = self.config.lock().unwrap().process.clone();
        match self.executor.start(&spec) {
            Ok(started) => {
                let mut inner = self.inner.lock().unwrap();
                inner.state = ServiceState::Running;
                inner.pid = started.pid;
                inner.started_at = Some(Instant::now());
                inner.healthy = true;
                let stats = inner.stats;
                drop(inner);
                self.emit(LifecycleEventKind::Started, started.pid, 0, None, stats);
                self.exit_channel.lock().unwrap().replace(started.exit_channel);
                Ok(())
            }
            Err(err) => {
                let mut inner = self.inner.lock().unwrap();
                inner.state = ServiceState::Failed;
                let stats = inner.stats;
                drop(inner);
                self.emit(LifecycleEventKind::Failed, 0, 0, Some(err.to_string()), stats);
                Err(ServiceError::ExecutorError(err.to_string()))
            }
        }
    }

    fn monitor_loop(self: Arc<Self>) {
        loop {
            let exit_channel = match self.exit_channel.lock().unwrap().take() {
                Some(rx) => rx,
                None => return,
            };

            let exit = loop {
                if self.monitor_ctx.is_cancelled() {
                    return;
                }
                match exit_channel.recv_timeout(Duration::from_millis(200)) {
                    Ok(result) => break result,
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
                        break crate::executor::ExitResult { code: 0, error: Some("exit channel closed unexpectedly".into()) };
                    }
                }
            };

            let was_stopping = self.inner.lock().unwrap().state == ServiceState::Stopping;
            if was_stopping {
                let mut inner = self.inner.lock().unwrap();
                inner.state = ServiceState::Stopped;
                inner.pid = 0;
                let stats = inner.stats;
                drop(inner);
                self.emit(LifecycleEventKind::Stopped, 0, exit.code, exit.error, stats);
                return;
            }

            let uptime = self.inner.lock().unwrap().started_at.map(|t| t.elapsed()).unwrap_or_default();
            let (should_restart, exhausted) = {
                let mut inner = self.inner.lock().unwrap();
                inner.tracker.maybe_reset(uptime);
                let should = inner.tracker.should_restart(exit.code);
                (should, inner.tracker.is_exhausted())
            };

            if exit.error.is_some() {
                warn!(service = %self.name, error = ?exit.error, "exit channel reported a wait error");
            }

            if should_restart {
                let mut inner = self.inner.lock().unwrap();
                inner.pid = 0;
                let stats = inner.stats;
                drop(inner);
                self.emit(
                    if exit.code == 0 { LifecycleEventKind::Stopped } else { LifecycleEventKind::Failed },
                    0,
                    exit.code,
                    exit.error.clone(),
                    stats,
                );
                let (delay, stats) = {
                    let inner = self.inner.lock().unwrap();
                    (inner.tracker.next_delay(), inner.stats)
                };
                self.emit(LifecycleEventKind::Restarting, 0, exit.code, None, stats);
                if self.monitor_ctx.wait_timeout(delay) {
                    return;
                }
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.tracker.record_attempt();
                    inner.stats.restart_count += 1;
                    if exit.code != 0 {
                        inner.stats.fail_count += 1;
                    }
                }
                if self.spawn_once().is_err() {
                    return;
                }
                continue;
            }

            let mut inner = self.inner.lock().unwrap();
            inner.pid = 0;
            if exit.code != 0 {
                inner.stats.fail_count += 1;
            }
            let stats = inner.stats;
            inner.state = if exhausted { ServiceState::Failed } else if exit.code == 0 { ServiceState::Stopped } else { ServiceState::Failed };
            drop(inner);

            if exhausted {
                self.emit(LifecycleEventKind::Exhausted, 0, exit.code, exit.error, stats);
            } else if exit.code == 0 {
                self.emit(LifecycleEventKind::Stopped, 0, exit.code, exit.error, stats);
            } else {
                self.emit(LifecycleEventKind::Failed, 0, exit.code, exit.error, stats);
            }
            return;
        }
    }

    /// `running/starting -> stopping`, then the monitor thread completes
    /// the transition to `stopped` once the exit channel fires. A `stop`
    /// while already `stopped`/`failed` is a no-op success.
    pub fn stop(&self, timeout: Duration) -> Result<(), ServiceError> {
        let pid = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ServiceState::Stopped | ServiceState::Failed => return Ok(()),
                _ => {
                    inner.state = ServiceState::Stopping;
                    inner.pid
                }
            }
        };

        if pid != 0 {
            if let Err(err) = self.executor.stop(pid, timeout) {
                if !matches!(err, crate::executor::ExecutorError::ProcessNotFound) {
                    return Err(ServiceError::ExecutorError(err.to_string()));
                }
            }
        }

        self.monitor_ctx.cancel_all(true).ok();
        if let Some(handle) = self.monitor_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        let mut inner = self.inner.lock().unwrap();
        inner.state = ServiceState::Stopped;
        inner.pid = 0;
        Ok(())
    }

    /// Delivers a named signal without altering the state machine.
    pub fn signal(&self, signal: SignalKind) -> Result<(), ServiceError> {
        let pid = self.inner.lock().unwrap().pid;
        if pid == 0 {
            return Ok(());
        }
        self.executor.signal(pid, signal).map_err(|err| ServiceError::ExecutorError(err.to_string()))
    }

    /// Records a health probe outcome. No state-machine transition, per
    /// `spec.md` §4.4's "any -> (no state change)" row.
    pub fn update_health(&self, healthy: bool) {
        let mut inner = self.inner.lock().unwrap();
        let changed = inner.healthy != healthy;
        inner.healthy = healthy;
        let stats = inner.stats;
        drop(inner);
        if changed {
            self.emit(
                if healthy { LifecycleEventKind::Healthy } else { LifecycleEventKind::Unhealthy },
                0,
                0,
                None,
                stats,
            );
        }
    }
}
