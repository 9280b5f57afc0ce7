//! CLI entry point (C10). Flags exactly as `spec.md` §6: `--config`,
//! `--version`, `--tui`, `--probe`. Exit codes: `0` success/clean
//! shutdown, `1` initialization or fatal error.

use clap::Parser;
use procd::config::{Config, ConfigLoader, YamlConfigLoader, DEFAULT_CONFIG_PATH};
use procd::executor::unix::UnixExecutor;
use procd::metrics::procfs_collector::ProcFsCollector;
use procd::metrics::{CollectCtx, MetricsCollector};
use procd::pid_cache::PidCache;
use procd::reaper;
use procd::signal::SignalLoop;
use procd::supervisor::Supervisor;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// The default per-service graceful-stop timeout before escalating to
/// `SIGKILL`; not yet exposed as a config knob (`spec.md` leaves the
/// executor's stop timeout as a caller-supplied parameter).
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "procd", author, version, about = "A Unix process supervisor daemon", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print version and exit.
    #[arg(long)]
    version: bool,

    /// Enable interactive mode. Absent implies raw mode: a banner then
    /// signal-wait. The terminal UI itself is out of scope for this crate.
    #[arg(long)]
    tui: bool,

    /// One-shot: initialize collectors, emit aggregated system metrics as
    /// JSON to stdout, exit.
    #[arg(long)]
    probe: bool,
}

fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("procd {}", env!("CARGO_PKG_VERSION"));
        exit(0);
    }

    if cli.probe {
        match run_probe() {
            Ok(()) => exit(0),
            Err(err) => {
                eprintln!("probe failed: {err}");
                exit(1);
            }
        }
    }

    let _log_guard = procd::logging::init(None, None);

    if let Err(err) = run_daemon(cli) {
        error!(%err, "procd exited with a fatal error");
        exit(1);
    }
}

/// Samples every `/proc`-discoverable PID and emits an aggregated JSON
/// summary (process count, total RSS, total CPU jiffies) to stdout. Per
/// `spec.md` §6: initializes collectors fresh, does not touch the
/// running daemon or any configuration.
fn run_probe() -> Result<(), Box<dyn std::error::Error>> {
    let collector = ProcFsCollector;
    let mut process_count: u64 = 0;
    let mut total_rss: u64 = 0;
    let mut total_user_jiffies: u64 = 0;
    let mut total_system_jiffies: u64 = 0;

    for process in procfs::process::all_processes()? {
        let Ok(process) = process else { continue };
        let pid = process.pid;
        process_count += 1;
        let ctx = CollectCtx::with_timeout(Duration::from_millis(100));
        if let Ok(cpu) = collector.collect_cpu(&ctx, pid) {
            total_user_jiffies += cpu.user;
            total_system_jiffies += cpu.system;
        }
        if let Ok(memory) = collector.collect_memory(&ctx, pid) {
            total_rss += memory.rss;
        }
    }

    let summary = serde_json::json!({
        "process_count": process_count,
        "total_rss_bytes": total_rss,
        "total_user_jiffies": total_user_jiffies,
        "total_system_jiffies": total_system_jiffies,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// The actual main function, separated so fatal errors are logged once
/// (by `main`) rather than both here and via an unwound `Result`.
fn run_daemon(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_loader: Arc<dyn ConfigLoader> = Arc::new(YamlConfigLoader);
    let config: Config = config_loader.load(&cli.config)?;

    #[cfg(all(unix, not(feature = "multiple-instances")))]
    if !reaper::is_pid1() {
        let pid_cache = match &config.pid_file {
            Some(path) => PidCache::new(path.clone()),
            None => PidCache::default(),
        };
        pid_cache.store(std::process::id())?;
    }

    if !cli.tui {
        println!("procd starting (raw mode) — {} service(s) configured", config.services.len());
    }

    let pid_registry = Arc::new(procd::reaper::PidRegistry::new());
    let executor = Arc::new(UnixExecutor::new(Arc::clone(&pid_registry)));
    let collector = Arc::new(ProcFsCollector);

    let supervisor = Arc::new(Supervisor::new(
        cli.config.clone(),
        config,
        config_loader,
        executor,
        pid_registry,
        collector,
        DEFAULT_STOP_TIMEOUT,
    ));

    supervisor.start()?;
    info!("procd started");

    let signal_loop = SignalLoop::spawn(Arc::clone(&supervisor))?;
    signal_loop.join();

    info!("exiting gracefully");
    Ok(())
}
