//! The signal loop (C8): translates process-level OS signals into
//! supervisor actions. See `spec.md` §6 and §8's "signal loop" row.
//!
//! `SIGTERM`/`SIGINT` trigger a graceful shutdown; `SIGHUP` triggers a
//! reload whose failure is logged but never propagated — reload errors
//! must never kill the daemon, per `spec.md` §7. `SIGCHLD` is left
//! unregistered here: it is consumed by the [`crate::reaper::Reaper`]
//! when the daemon is PID 1.

use crate::supervisor::Supervisor;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

pub struct SignalLoop {
    handle: JoinHandle<()>,
}

impl SignalLoop {
    /// Spawns the background thread that owns the `SIGTERM`/`SIGINT`/
    /// `SIGHUP` subscription for the lifetime of the daemon. The
    /// subscription itself is a scoped acquisition released when
    /// [`SignalLoop::join`] returns, per `spec.md` §5.
    pub fn spawn(supervisor: Arc<Supervisor>) -> std::io::Result<Self> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
        let handle = std::thread::Builder::new()
            .name("signal-loop".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    match signal {
                        SIGTERM | SIGINT => {
                            info!(signal, "received shutdown signal, stopping services");
                            if let Err(err) = supervisor.stop() {
                                error!(%err, "error while stopping supervisor");
                            }
                            break;
                        }
                        SIGHUP => {
                            info!("received SIGHUP, reloading configuration");
                            if let Err(err) = supervisor.reload() {
                                warn!(%err, "reload failed, keeping current configuration");
                            }
                        }
                        other => {
                            warn!(signal = other, "received unhandled signal");
                        }
                    }
                }
            })?;
        Ok(Self { handle })
    }

    /// Blocks until the loop has observed a shutdown signal and finished
    /// stopping the supervisor.
    pub fn join(self) {
        let _ = self.handle.join();
    }
}
