//! The supervisor (C7): owns all service managers, starts/stops/reloads
//! the set, fans lifecycle events out to one external handler, and owns
//! the reaper and metrics tracker lifecycles. See `spec.md` §4.5.

use crate::config::{Config, ConfigError, ConfigLoader, ServiceConfig};
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::event::{EventHandler, LifecycleEvent, LifecycleEventKind, LoggingEventHandler};
use crate::executor::Executor;
use crate::metrics::tracker::MetricsTracker;
use crate::metrics::MetricsCollector;
use crate::reaper::{PidRegistry, Reaper};
use crate::service::{ServiceError, ServiceManager, ServiceSnapshot, ServiceState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorState {
    Stopped,
    Running,
}

#[derive(Debug, Error)]
pub enum SupervisorStarterError {
    #[error("service `{0}` failed to start: {1}")]
    ServiceStart(String, String),
}

#[derive(Debug, Error)]
pub enum SupervisorStopperError {
    #[error("service `{0}` failed to stop cleanly: {1}")]
    ServiceStop(String, String),
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("supervisor is not running")]
    NotRunning,
    #[error("failed to reload configuration: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ServiceOpError {
    #[error("no such service `{0}`")]
    NotFound(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Owns the collection of service managers plus the shared reaper,
/// metrics tracker, and event dispatch. Public methods may be invoked
/// from any thread; structural changes (`reload`, `start`, `stop`) take
/// the write lock on the service map, lookups the read lock — event
/// dispatch never happens under either.
pub struct Supervisor {
    config_path: PathBuf,
    config_loader: Arc<dyn ConfigLoader>,
    executor: Arc<dyn Executor>,
    reaper: Arc<Reaper>,
    metrics: Arc<MetricsTracker>,
    services: RwLock<HashMap<String, Arc<ServiceManager>>>,
    events_publisher: EventPublisher<(String, LifecycleEvent)>,
    events_consumer: EventConsumer<(String, LifecycleEvent)>,
    event_handler: Mutex<Arc<dyn EventHandler>>,
    dispatcher_ctx: crate::context::Context<bool>,
    dispatcher_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    state: Mutex<SupervisorState>,
    stop_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        config_path: PathBuf,
        config: Config,
        config_loader: Arc<dyn ConfigLoader>,
        executor: Arc<dyn Executor>,
        pid_registry: Arc<PidRegistry>,
        metrics_collector: Arc<dyn MetricsCollector>,
        stop_timeout: Duration,
    ) -> Self {
        let (events_publisher, events_consumer) = pub_sub();
        let metrics = Arc::new(MetricsTracker::new(metrics_collector, config.metrics_interval));
        let mut services = HashMap::new();
        for service_config in config.services {
            let name = service_config.name.clone();
            let manager = Arc::new(ServiceManager::new(service_config, Arc::clone(&executor), events_publisher.clone()));
            services.insert(name, manager);
        }
        Self {
            config_path,
            config_loader,
            executor,
            reaper: Arc::new(Reaper::new(pid_registry)),
            metrics,
            services: RwLock::new(services),
            events_publisher,
            events_consumer,
            event_handler: Mutex::new(Arc::new(LoggingEventHandler)),
            dispatcher_ctx: crate::context::Context::new(),
            dispatcher_handle: Mutex::new(None),
            state: Mutex::new(SupervisorState::Stopped),
            stop_timeout,
        }
    }

    /// Registers the single external sink for lifecycle events. There is
    /// exactly one handler at a time; setting replaces it. Never held
    /// during dispatch, per `spec.md` §5.
    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.event_handler.lock().unwrap() = handler;
    }

    /// Idempotent: a no-op if already running. Starts the reaper (a
    /// no-op unless the daemon is PID 1), the metrics tracker, the event
    /// dispatcher, then every service manager. If any service fails to
    /// start, the ones already started are stopped and the first error
    /// is returned.
    pub fn start(self: &Arc<Self>) -> Result<(), SupervisorStarterError> {
        let mut state = self.state.lock().unwrap();
        if *state == SupervisorState::Running {
            return Ok(());
        }

        self.reaper.start();
        self.metrics.start();
        self.spawn_dispatcher();

        let services = self.services.read().unwrap();
        let mut started: Vec<Arc<ServiceManager>> = Vec::with_capacity(services.len());
        for (name, manager) in services.iter() {
            match manager.start() {
                Ok(()) => started.push(Arc::clone(manager)),
                Err(err) => {
                    for manager in &started {
                        let _ = manager.stop(self.stop_timeout);
                    }
                    self.stop_dispatcher();
                    self.metrics.stop();
                    self.reaper.stop();
                    return Err(SupervisorStarterError::ServiceStart(name.clone(), err.to_string()));
                }
            }
        }
        drop(services);

        *state = SupervisorState::Running;
        info!("supervisor started");
        Ok(())
    }

    /// Idempotent: a no-op if already stopped. Stops every service
    /// manager concurrently, joins them, then stops the reaper, the
    /// metrics tracker, and the event dispatcher.
    pub fn stop(&self) -> Result<(), SupervisorStopperError> {
        let mut state = self.state.lock().unwrap();
        if *state == SupervisorState::Stopped {
            return Ok(());
        }

        let managers: Vec<(String, Arc<ServiceManager>)> =
            self.services.read().unwrap().iter().map(|(name, m)| (name.clone(), Arc::clone(m))).collect();
        let timeout = self.stop_timeout;
        let handles: Vec<_> = managers
            .into_iter()
            .map(|(name, manager)| {
                std::thread::Builder::new()
                    .name(format!("stop-{name}"))
                    .spawn(move || (name, manager.stop(timeout)))
                    .expect("thread spawn should succeed")
            })
            .collect();

        let mut first_error = None;
        for handle in handles {
            let (name, result) = handle.join().expect("stop thread should not panic");
            if let Err(err) = result {
                warn!(service = %name, %err, "error while stopping service");
                first_error.get_or_insert((name, err));
            }
        }

        self.metrics.stop();
        self.reaper.stop();
        self.stop_dispatcher();
        *state = SupervisorState::Stopped;
        info!("supervisor stopped");

        match first_error {
            Some((name, err)) => Err(SupervisorStopperError::ServiceStop(name, err.to_string())),
            None => Ok(()),
        }
    }

    /// Re-reads configuration and applies the diff: added services are
    /// created and started, removed services are stopped and dropped,
    /// modified services (spec differs by value-equality) are stopped
    /// and restarted with the new spec. Unaffected managers are left
    /// untouched. On a malformed reload, current state is left intact —
    /// all-or-nothing, per `spec.md` §9's Open Question resolution.
    pub fn reload(&self) -> Result<(), ReloadError> {
        {
            let state = self.state.lock().unwrap();
            if *state != SupervisorState::Running {
                return Err(ReloadError::NotRunning);
            }
        }

        let new_config = self.config_loader.load(&self.config_path)?;
        let mut desired: HashMap<String, ServiceConfig> =
            new_config.services.into_iter().map(|c| (c.name.clone(), c)).collect();

        let mut services = self.services.write().unwrap();

        let removed: Vec<String> = services.keys().filter(|name| !desired.contains_key(*name)).cloned().collect();
        for name in removed {
            if let Some(manager) = services.remove(&name) {
                let _ = manager.stop(self.stop_timeout);
                self.metrics.untrack(&name);
                info!(service = %name, "removed by reload");
            }
        }

        for (name, config) in desired.drain() {
            match services.get(&name) {
                None => {
                    let manager = Arc::new(ServiceManager::new(config, Arc::clone(&self.executor), self.events_publisher.clone()));
                    let _ = manager.start();
                    services.insert(name.clone(), manager);
                    info!(service = %name, "added by reload");
                }
                Some(existing) => {
                    if existing.spec_snapshot() != config {
                        let _ = existing.stop(self.stop_timeout);
                        let manager = Arc::new(ServiceManager::new(config, Arc::clone(&self.executor), self.events_publisher.clone()));
                        let _ = manager.start();
                        services.insert(name.clone(), manager);
                        info!(service = %name, "restarted with modified spec by reload");
                    }
                }
            }
        }

        Ok(())
    }

    pub fn service_snapshots(&self) -> Vec<ServiceSnapshot> {
        self.services.read().unwrap().values().map(|m| m.snapshot()).collect()
    }

    pub fn start_service(&self, name: &str) -> Result<(), ServiceOpError> {
        self.lookup(name)?.start().map_err(ServiceOpError::from)
    }

    pub fn stop_service(&self, name: &str) -> Result<(), ServiceOpError> {
        self.lookup(name)?.stop(self.stop_timeout).map_err(ServiceOpError::from)
    }

    pub fn restart_service(&self, name: &str) -> Result<(), ServiceOpError> {
        let manager = self.lookup(name)?;
        manager.stop(self.stop_timeout)?;
        manager.start().map_err(ServiceOpError::from)
    }

    fn lookup(&self, name: &str) -> Result<Arc<ServiceManager>, ServiceOpError> {
        self.services
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceOpError::NotFound(name.to_string()))
    }

    /// Drains lifecycle events and forwards each to the registered
    /// handler, then folds it into the metrics tracker's per-service
    /// state (`track` on `started`, `update_state`/`update_health`
    /// otherwise) — see `spec.md` §4.6's `Track`/`Untrack` lifecycle.
    fn spawn_dispatcher(&self) {
        self.dispatcher_ctx.reset().ok();
        let ctx = self.dispatcher_ctx.clone();
        let consumer = self.events_consumer.clone();
        let metrics = Arc::clone(&self.metrics);
        let event_handler = Arc::clone(&self.event_handler);

        let handle = std::thread::Builder::new()
            .name("event-dispatcher".to_string())
            .spawn(move || loop {
                if ctx.is_cancelled() {
                    return;
                }
                match consumer.recv_timeout(Duration::from_millis(200)) {
                    Ok((name, event)) => {
                        let handler = event_handler.lock().unwrap().clone();
                        handler.handle(&event);
                        match event.kind {
                            LifecycleEventKind::Started => metrics.track(&name, event.pid),
                            LifecycleEventKind::Healthy => metrics.update_health(&name, true),
                            LifecycleEventKind::Unhealthy => metrics.update_health(&name, false),
                            LifecycleEventKind::Stopped => metrics.update_state(&name, ServiceState::Stopped, None),
                            LifecycleEventKind::Failed | LifecycleEventKind::Exhausted => {
                                metrics.update_state(&name, ServiceState::Failed, event.error.clone())
                            }
                            LifecycleEventKind::Restarting => {}
                        }
                    }
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
                }
            })
            .expect("thread spawn should succeed");
        *self.dispatcher_handle.lock().unwrap() = Some(handle);
    }

    fn stop_dispatcher(&self) {
        self.dispatcher_ctx.cancel_all(true).ok();
        if let Some(handle) = self.dispatcher_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessSpec, RestartConfig, RestartPolicyKind};
    use crate::event::ChannelEventHandler;
    use assert_matches::assert_matches;
    use crate::executor::{ExecutorError, ExitResult, SignalKind, StartedProcess};
    use crate::metrics::{CpuSample, MemorySample, MetricsError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct ScriptedExecutor {
        next_pid: AtomicU32,
        fail_names: Vec<String>,
        exit_delay: Duration,
    }

    impl ScriptedExecutor {
        fn new(exit_delay: Duration) -> Self {
            Self { next_pid: AtomicU32::new(2000), fail_names: vec![], exit_delay }
        }

        fn failing(mut self, name: impl Into<String>) -> Self {
            self.fail_names.push(name.into());
            self
        }
    }

    impl Executor for ScriptedExecutor {
        fn start(&self, spec: &ProcessSpec) -> Result<StartedProcess, ExecutorError> {
            let exe = spec.executable.to_string_lossy().to_string();
            if self.fail_names.iter().any(|n| n == &exe) {
                return Err(ExecutorError::SpawnError("scripted failure".into()));
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            let (publisher, consumer) = crate::event::channel::bounded_pub_sub(1);
            let delay = self.exit_delay;
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                let _ = publisher.publish(ExitResult { code: 0, error: None });
            });
            Ok(StartedProcess { pid, exit_channel: consumer })
        }

        fn stop(&self, _pid: u32, _timeout: Duration) -> Result<(), ExecutorError> {
            Ok(())
        }

        fn signal(&self, _pid: u32, _signal: SignalKind) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    struct NoopCollector;
    impl MetricsCollector for NoopCollector {
        fn collect_cpu(&self, _ctx: &crate::metrics::CollectCtx, _pid: i32) -> Result<CpuSample, MetricsError> {
            Ok(CpuSample::default())
        }
        fn collect_memory(&self, _ctx: &crate::metrics::CollectCtx, _pid: i32) -> Result<MemorySample, MetricsError> {
            Ok(MemorySample::default())
        }
    }

    fn service(name: &str, executable: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            process: ProcessSpec::new(executable),
            restart: RestartConfig {
                policy: RestartPolicyKind::Never,
                max_retries: 0,
                delay: Duration::from_millis(5),
                delay_max: Some(Duration::from_millis(20)),
                stability_window: Duration::from_secs(300),
            },
            health_probes: vec![],
            listeners: vec![],
        }
    }

    fn config(services: Vec<ServiceConfig>) -> Config {
        Config { services, log_level: None, metrics_interval: Duration::from_secs(5), pid_file: None }
    }

    struct NoopLoader;
    impl ConfigLoader for NoopLoader {
        fn load(&self, _path: &std::path::Path) -> Result<Config, ConfigError> {
            Ok(config(vec![]))
        }
    }

    fn supervisor(services: Vec<ServiceConfig>, executor: Arc<dyn Executor>) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(
            PathBuf::from("/dev/null"),
            config(services),
            Arc::new(NoopLoader),
            executor,
            Arc::new(PidRegistry::new()),
            Arc::new(NoopCollector),
            Duration::from_millis(200),
        ))
    }

    #[test]
    fn start_is_idempotent() {
        let executor = Arc::new(ScriptedExecutor::new(Duration::from_secs(5)));
        let sup = supervisor(vec![service("a", "/bin/a")], executor);
        sup.start().unwrap();
        sup.start().unwrap();
        assert_eq!(sup.service_snapshots().len(), 1);
        sup.stop().unwrap();
    }

    #[test]
    fn stop_is_idempotent() {
        let executor = Arc::new(ScriptedExecutor::new(Duration::from_secs(5)));
        let sup = supervisor(vec![service("a", "/bin/a")], executor);
        sup.start().unwrap();
        sup.stop().unwrap();
        sup.stop().unwrap();
    }

    #[test]
    fn start_failure_rolls_back_already_started_services() {
        let executor = Arc::new(ScriptedExecutor::new(Duration::from_secs(5)).failing("/bin/bad"));
        let sup = supervisor(vec![service("good", "/bin/good"), service("bad", "/bin/bad")], executor);
        let err = sup.start().unwrap_err();
        assert_matches!(err, SupervisorStarterError::ServiceStart(_, _));
        for snapshot in sup.service_snapshots() {
            assert_ne!(snapshot.state, ServiceState::Running);
        }
    }

    #[test]
    fn reload_adds_removes_and_restarts_modified_services() {
        struct DiffLoader;
        impl ConfigLoader for DiffLoader {
            fn load(&self, _path: &std::path::Path) -> Result<Config, ConfigError> {
                Ok(config(vec![service("a", "/bin/a-modified"), service("c", "/bin/c")]))
            }
        }

        let executor = Arc::new(ScriptedExecutor::new(Duration::from_secs(5)));
        let sup = Arc::new(Supervisor::new(
            PathBuf::from("/dev/null"),
            config(vec![service("a", "/bin/a"), service("b", "/bin/b")]),
            Arc::new(DiffLoader),
            executor,
            Arc::new(PidRegistry::new()),
            Arc::new(NoopCollector),
            Duration::from_millis(200),
        ));
        sup.start().unwrap();
        sup.reload().unwrap();

        let names: Vec<String> = sup.service_snapshots().into_iter().map(|s| s.name).collect();
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"c".to_string()));
        assert!(!names.contains(&"b".to_string()));

        sup.stop().unwrap();
    }

    #[test]
    fn reload_while_not_running_is_an_error() {
        let executor = Arc::new(ScriptedExecutor::new(Duration::from_secs(5)));
        let sup = supervisor(vec![], executor);
        assert_matches!(sup.reload().unwrap_err(), ReloadError::NotRunning);
    }

    #[test]
    fn events_reach_the_registered_handler() {
        let executor = Arc::new(ScriptedExecutor::new(Duration::from_millis(20)));
        let sup = supervisor(vec![service("a", "/bin/a")], executor);
        let (handler, consumer) = ChannelEventHandler::new();
        sup.set_event_handler(Arc::new(handler));
        sup.start().unwrap();

        let event = consumer.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.kind, LifecycleEventKind::Started);

        sup.stop().unwrap();
    }
}
