//! The metrics tracker (C6): a bounded registry of tracked services plus
//! a periodic sampler and a bounded-buffer fan-out bus. See `spec.md`
//! §4.6.

use super::{cpu_percent, CollectCtx, CpuSample, MetricsCollector};
use crate::context::Context;
use crate::event::channel::{bounded_pub_sub, EventConsumer, EventPublisher};
use crate::service::ServiceState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

const SUBSCRIBER_BUFFER_CAPACITY: usize = 64;
const MAX_SUBSCRIBERS: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuBlock {
    pub user_jiffies: u64,
    pub system_jiffies: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBlock {
    pub rss: u64,
    pub vms: u64,
    pub swap: u64,
}

#[derive(Debug, Clone)]
pub struct ProcessMetrics {
    pub service_name: String,
    pub pid: u32,
    pub state: ServiceState,
    pub healthy: bool,
    pub cpu: CpuBlock,
    pub memory: MemoryBlock,
    pub uptime: Duration,
    pub start_time: SystemTime,
    pub restart_count: u64,
    pub last_error: Option<String>,
    pub timestamp: SystemTime,
}

impl ProcessMetrics {
    fn empty(service_name: &str, state: ServiceState, healthy: bool) -> Self {
        Self {
            service_name: service_name.to_string(),
            pid: 0,
            state,
            healthy,
            cpu: CpuBlock::default(),
            memory: MemoryBlock::default(),
            uptime: Duration::ZERO,
            start_time: SystemTime::now(),
            restart_count: 0,
            last_error: None,
            timestamp: SystemTime::now(),
        }
    }
}

struct TrackedProcess {
    pid: u32,
    state: ServiceState,
    healthy: bool,
    start_time: SystemTime,
    restart_count: u64,
    last_error: Option<String>,
    last_metrics: ProcessMetrics,
    prev_cpu: Option<CpuSample>,
    prev_cpu_time: Option<Instant>,
}

impl TrackedProcess {
    fn new(name: &str, pid: u32) -> Self {
        Self {
            pid,
            state: ServiceState::Running,
            healthy: true,
            start_time: SystemTime::now(),
            restart_count: 0,
            last_error: None,
            last_metrics: ProcessMetrics::empty(name, ServiceState::Running, true),
            prev_cpu: None,
            prev_cpu_time: None,
        }
    }
}

/// Handle returned by [`MetricsTracker::subscribe`], needed to identify
/// the slot to release again on [`MetricsTracker::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    publisher: EventPublisher<ProcessMetrics>,
}

/// Registered metrics subscribers, behind their own lock — separate from
/// the tracked-process registry per `spec.md` §5, since the two are
/// updated by different callers (subscribe/unsubscribe vs. the sampler)
/// and fan-out must not contend with state bookkeeping.
struct Subscribers {
    list: Vec<Subscriber>,
    next_id: u64,
}

/// Orchestrates periodic sampling across tracked services, computes CPU
/// percent between snapshots, and fans out updates with bounded-buffer
/// backpressure (never blocks the sampler).
pub struct MetricsTracker {
    collector: Arc<dyn MetricsCollector>,
    interval: Duration,
    tracked: Mutex<HashMap<String, TrackedProcess>>,
    subscribers: Mutex<Subscribers>,
    ctx: Context<bool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MetricsTracker {
    pub fn new(collector: Arc<dyn MetricsCollector>, interval: Duration) -> Self {
        Self {
            collector,
            interval,
            tracked: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Subscribers { list: Vec::new(), next_id: 0 }),
            ctx: Context::new(),
            handle: Mutex::new(None),
        }
    }

    /// Insert-or-restart semantics, per `spec.md` §4.6 / §3 ("Lifecycles").
    pub fn track(&self, name: &str, pid: u32) {
        let mut tracked = self.tracked.lock().unwrap();
        match tracked.get_mut(name) {
            None => {
                tracked.insert(name.to_string(), TrackedProcess::new(name, pid));
            }
            Some(existing) => {
                existing.pid = pid;
                existing.start_time = SystemTime::now();
                existing.restart_count += 1;
                existing.last_error = None;
                existing.prev_cpu = None;
                existing.prev_cpu_time = None;
                existing.state = ServiceState::Running;
                existing.last_metrics = ProcessMetrics::empty(name, ServiceState::Running, existing.healthy);
            }
        }
    }

    pub fn untrack(&self, name: &str) {
        self.tracked.lock().unwrap().remove(name);
    }

    pub fn update_state(&self, name: &str, state: ServiceState, last_error: Option<String>) {
        let mut tracked = self.tracked.lock().unwrap();
        if let Some(entry) = tracked.get_mut(name) {
            entry.state = state;
            entry.last_error = last_error;
            if matches!(state, ServiceState::Stopped | ServiceState::Failed) {
                entry.pid = 0;
            }
        }
    }

    pub fn update_health(&self, name: &str, healthy: bool) {
        let mut tracked = self.tracked.lock().unwrap();
        if let Some(entry) = tracked.get_mut(name) {
            entry.healthy = healthy;
        }
    }

    pub fn get(&self, name: &str) -> Option<ProcessMetrics> {
        self.tracked.lock().unwrap().get(name).map(|t| t.last_metrics.clone())
    }

    pub fn all(&self) -> Vec<ProcessMetrics> {
        self.tracked.lock().unwrap().values().map(|t| t.last_metrics.clone()).collect()
    }

    /// Allocates a bounded subscriber buffer, or `None` once
    /// `MAX_SUBSCRIBERS` has been reached — callers must handle this.
    pub fn subscribe(&self) -> Option<(SubscriptionId, EventConsumer<ProcessMetrics>)> {
        let mut subscribers = self.subscribers.lock().unwrap();
        if subscribers.list.len() >= MAX_SUBSCRIBERS {
            return None;
        }
        let id = SubscriptionId(subscribers.next_id);
        subscribers.next_id += 1;
        let (publisher, consumer) = bounded_pub_sub(SUBSCRIBER_BUFFER_CAPACITY);
        subscribers.list.push(Subscriber { id, publisher });
        Some((id, consumer))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().unwrap().list.retain(|s| s.id != id);
    }

    fn publish(&self, metrics: ProcessMetrics) {
        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in &subscribers.list {
            if subscriber.publisher.try_publish(metrics.clone()).is_err() {
                debug!(service = %metrics.service_name, "subscriber buffer full, dropping sample");
            }
        }
    }

    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let ctx = self.ctx.clone();
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("metrics-sampler".to_string())
            .spawn(move || {
                while !ctx.wait_timeout(interval) {
                    this.tick(interval / 2);
                }
            })
            .expect("thread spawn should succeed");
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.ctx.cancel_all(true).ok();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn tick(&self, deadline: Duration) {
        let names: Vec<String> = self.tracked.lock().unwrap().keys().cloned().collect();
        for name in names {
            self.collect_process(&name, deadline);
        }
    }

    /// Samples one tracked record, bounding both collector calls by a
    /// shared deadline of `interval / 2` — `spec.md` §4.6 and §5's
    /// suspension-point (iv). If both collector calls fail, infers the
    /// process has exited and transitions it to `failed`. See `spec.md`
    /// §4.6 ("collect_process") and §8 scenario 6.
    fn collect_process(&self, name: &str, deadline: Duration) {
        let (pid, state, healthy, start_time, restart_count, prev_cpu, prev_cpu_time) = {
            let tracked = self.tracked.lock().unwrap();
            match tracked.get(name) {
                Some(t) => (t.pid, t.state, t.healthy, t.start_time, t.restart_count, t.prev_cpu, t.prev_cpu_time),
                None => return,
            }
        };

        if pid == 0 {
            self.publish(ProcessMetrics::empty(name, state, healthy));
            return;
        }

        let ctx = CollectCtx::with_timeout(deadline);
        let cpu = self.collector.collect_cpu(&ctx, pid as i32);
        let memory = self.collector.collect_memory(&ctx, pid as i32);

        if cpu.is_err() && memory.is_err() {
            warn!(service = name, "both cpu and memory collection failed, marking process gone");
            let mut tracked = self.tracked.lock().unwrap();
            if let Some(entry) = tracked.get_mut(name) {
                entry.state = ServiceState::Failed;
                entry.last_error = Some("process not found".to_string());
                entry.pid = 0;
            }
            drop(tracked);
            self.publish(ProcessMetrics {
                last_error: Some("process not found".to_string()),
                ..ProcessMetrics::empty(name, ServiceState::Failed, healthy)
            });
            return;
        }

        let now = Instant::now();
        let cpu_sample = cpu.unwrap_or_default();
        let percent = match (prev_cpu, prev_cpu_time) {
            (Some(prev), Some(prev_time)) => cpu_percent(prev, cpu_sample, now.duration_since(prev_time)),
            _ => 0.0,
        };
        let memory_sample = memory.unwrap_or_default();

        let metrics = ProcessMetrics {
            service_name: name.to_string(),
            pid,
            state,
            healthy,
            cpu: CpuBlock { user_jiffies: cpu_sample.user, system_jiffies: cpu_sample.system, percent },
            memory: MemoryBlock { rss: memory_sample.rss, vms: memory_sample.vms, swap: memory_sample.swap },
            uptime: start_time.elapsed().unwrap_or_default(),
            start_time,
            restart_count,
            last_error: None,
            timestamp: SystemTime::now(),
        };

        {
            let mut tracked = self.tracked.lock().unwrap();
            if let Some(entry) = tracked.get_mut(name) {
                entry.prev_cpu = Some(cpu_sample);
                entry.prev_cpu_time = Some(now);
                entry.last_metrics = metrics.clone();
            }
        }
        self.publish(metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MemorySample, MetricsError};
    use mockall::mock;
    use tracing_test::internal::logs_with_scope_contain;
    use tracing_test::traced_test;

    mock! {
        pub Collector {}

        impl MetricsCollector for Collector {
            fn collect_cpu(&self, ctx: &CollectCtx, pid: i32) -> Result<CpuSample, MetricsError>;
            fn collect_memory(&self, ctx: &CollectCtx, pid: i32) -> Result<MemorySample, MetricsError>;
        }
    }

    struct FixedCollector {
        cpu: Mutex<Vec<Result<CpuSample, MetricsError>>>,
        memory: Mutex<Vec<Result<MemorySample, MetricsError>>>,
    }

    impl FixedCollector {
        fn new(cpu: Vec<Result<CpuSample, MetricsError>>, memory: Vec<Result<MemorySample, MetricsError>>) -> Self {
            Self { cpu: Mutex::new(cpu), memory: Mutex::new(memory) }
        }
    }

    impl MetricsCollector for FixedCollector {
        fn collect_cpu(&self, _ctx: &CollectCtx, _pid: i32) -> Result<CpuSample, MetricsError> {
            let mut queue = self.cpu.lock().unwrap();
            if queue.is_empty() { Err(MetricsError::ProcessNotFound) } else { queue.remove(0) }
        }

        fn collect_memory(&self, _ctx: &CollectCtx, _pid: i32) -> Result<MemorySample, MetricsError> {
            let mut queue = self.memory.lock().unwrap();
            if queue.is_empty() { Err(MetricsError::ProcessNotFound) } else { queue.remove(0) }
        }
    }

    #[test]
    fn track_then_untrack_then_get_reports_not_found() {
        let collector = Arc::new(FixedCollector::new(vec![], vec![]));
        let tracker = MetricsTracker::new(collector, Duration::from_secs(5));
        tracker.track("web", 123);
        assert!(tracker.get("web").is_some());
        tracker.untrack("web");
        assert!(tracker.get("web").is_none());
    }

    #[traced_test]
    #[test]
    fn both_collectors_failing_marks_process_failed() {
        let collector = Arc::new(FixedCollector::new(vec![Err(MetricsError::ProcessNotFound)], vec![Err(MetricsError::ProcessNotFound)]));
        let tracker = MetricsTracker::new(collector, Duration::from_secs(5));
        tracker.track("web", 123);
        tracker.collect_process("web", Duration::from_secs(1));
        let metrics = tracker.get("web").unwrap();
        assert_eq!(metrics.state, ServiceState::Failed);
        assert_eq!(metrics.last_error.as_deref(), Some("process not found"));
        assert!(logs_with_scope_contain(
            "both_collectors_failing_marks_process_failed",
            "both cpu and memory collection failed, marking process gone"
        ));
    }

    /// A single collector call failing (the other succeeding) is
    /// transient per `spec.md` §7: the sample is skipped, but the
    /// process is not marked gone.
    #[test]
    fn single_collector_failure_does_not_mark_process_failed() {
        let mut collector = MockCollector::new();
        collector.expect_collect_cpu().returning(|_, _| Err(MetricsError::Other("transient".to_string())));
        collector.expect_collect_memory().returning(|_, _| Ok(MemorySample { rss: 4096, vms: 8192, swap: 0 }));

        let tracker = MetricsTracker::new(Arc::new(collector), Duration::from_secs(5));
        tracker.track("web", 123);
        tracker.collect_process("web", Duration::from_secs(1));

        let metrics = tracker.get("web").unwrap();
        assert_eq!(metrics.state, ServiceState::Running);
        assert_eq!(metrics.memory.rss, 4096);
    }

    #[test]
    fn subscribe_respects_capacity_and_drops_silently_when_full() {
        let reps = SUBSCRIBER_BUFFER_CAPACITY + 5;
        let cpu_samples = (0..reps).map(|_| Ok(CpuSample { user: 0, system: 0 })).collect();
        let memory_samples = (0..reps).map(|_| Ok(MemorySample::default())).collect();
        let collector = Arc::new(FixedCollector::new(cpu_samples, memory_samples));
        let tracker = MetricsTracker::new(collector, Duration::from_secs(5));
        tracker.track("web", 123);
        let (_id, consumer) = tracker.subscribe().unwrap();

        for _ in 0..(SUBSCRIBER_BUFFER_CAPACITY + 5) {
            tracker.collect_process("web", Duration::from_secs(1));
        }

        // never blocks, never panics: draining finds at most capacity items
        let mut drained = 0;
        while consumer.try_recv().is_ok() {
            drained += 1;
        }
        assert!(drained <= SUBSCRIBER_BUFFER_CAPACITY);
    }

    #[test]
    fn subscribe_returns_none_once_at_capacity() {
        let collector = Arc::new(FixedCollector::new(vec![], vec![]));
        let tracker = MetricsTracker::new(collector, Duration::from_secs(5));
        let mut held = Vec::new();
        for _ in 0..MAX_SUBSCRIBERS {
            held.push(tracker.subscribe().unwrap());
        }
        assert!(tracker.subscribe().is_none());
    }

    #[test]
    fn subscribe_then_unsubscribe_then_subscribe_succeeds() {
        let collector = Arc::new(FixedCollector::new(vec![], vec![]));
        let tracker = MetricsTracker::new(collector, Duration::from_secs(5));
        let (id, consumer) = tracker.subscribe().unwrap();
        drop(consumer);
        tracker.unsubscribe(id);
        assert!(tracker.subscribe().is_some());
    }
}
