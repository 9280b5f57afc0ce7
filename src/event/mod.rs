//! Lifecycle events emitted by service managers and dispatched upward by
//! the supervisor to a single external event handler.

pub mod channel;

use std::time::SystemTime;

/// The reason a [`LifecycleEvent`] was emitted. See `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEventKind {
    Started,
    Stopped,
    Failed,
    Restarting,
    Healthy,
    Unhealthy,
    Exhausted,
}

/// A point-in-time snapshot of a service's cumulative counters, carried on
/// every [`LifecycleEvent`] so subscribers never need to pull a second
/// query to render restart/failure counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStatsSnapshot {
    pub restart_count: u64,
    pub fail_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub service_name: String,
    pub pid: u32,
    pub exit_code: i32,
    pub timestamp: SystemTime,
    pub error: Option<String>,
    pub stats: ServiceStatsSnapshot,
}

impl LifecycleEvent {
    pub fn new(kind: LifecycleEventKind, service_name: impl Into<String>, stats: ServiceStatsSnapshot) -> Self {
        Self {
            kind,
            service_name: service_name.into(),
            pid: 0,
            exit_code: 0,
            timestamp: SystemTime::now(),
            error: None,
            stats,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// The single external sink registered on the supervisor via
/// `set_event_handler`. Implementations must be non-blocking or
/// internally buffered — `spec.md` §6.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &LifecycleEvent);
}

/// Default handler: logs every event through `tracing`. Used when no
/// external sink has been registered, and as a sane baseline otherwise.
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn handle(&self, event: &LifecycleEvent) {
        use tracing::{info, warn};
        match event.kind {
            LifecycleEventKind::Failed | LifecycleEventKind::Exhausted | LifecycleEventKind::Unhealthy => {
                warn!(
                    service = %event.service_name,
                    kind = ?event.kind,
                    pid = event.pid,
                    exit_code = event.exit_code,
                    error = ?event.error,
                    "service lifecycle event"
                );
            }
            _ => {
                info!(
                    service = %event.service_name,
                    kind = ?event.kind,
                    pid = event.pid,
                    "service lifecycle event"
                );
            }
        }
    }
}

/// Forwards every event onto an unbounded channel for an external
/// consumer (e.g. a future TUI) to drain at its own pace.
pub struct ChannelEventHandler(channel::EventPublisher<LifecycleEvent>);

impl ChannelEventHandler {
    pub fn new() -> (Self, channel::EventConsumer<LifecycleEvent>) {
        let (publisher, consumer) = channel::pub_sub();
        (Self(publisher), consumer)
    }
}

impl EventHandler for ChannelEventHandler {
    fn handle(&self, event: &LifecycleEvent) {
        let _ = self.0.publish(event.clone());
    }
}
