//! Single-instance guard (C12): on Unix, when not running as PID 1,
//! refuses to start a second daemon instance by checking/writing a PID
//! file. Grounded on the teacher's `PIDCache`/`multiple-instances`
//! escape hatch (`agent-control/src/bin/main.rs`): `PIDCache::default().store(pid)`
//! is called once at startup and treated as fatal on failure.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_PID_FILE: &str = "/var/run/procd.pid";

#[derive(Debug, Error)]
pub enum PidCacheError {
    #[error("another instance is already running with pid {0}")]
    AlreadyRunning(u32),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct PidCache {
    path: PathBuf,
}

impl Default for PidCache {
    fn default() -> Self {
        Self { path: PathBuf::from(DEFAULT_PID_FILE) }
    }
}

impl PidCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checks for a live holder of the PID file and, finding none (or a
    /// stale, non-running entry), overwrites it with `pid`.
    pub fn store(&self, pid: u32) -> Result<(), PidCacheError> {
        if let Some(existing) = self.read_existing() {
            if existing != pid && process_alive(existing) {
                return Err(PidCacheError::AlreadyRunning(existing));
            }
        }
        let mut file = std::fs::File::create(&self.path)?;
        write!(file, "{pid}")?;
        Ok(())
    }

    fn read_existing(&self) -> Option<u32> {
        std::fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }
}

fn process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_pid_when_no_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PidCache::new(dir.path().join("procd.pid"));
        cache.store(std::process::id()).unwrap();
        assert_eq!(cache.read_existing(), Some(std::process::id()));
    }

    #[test]
    fn overwrites_a_stale_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procd.pid");
        std::fs::write(&path, "999999999").unwrap();
        let cache = PidCache::new(&path);
        cache.store(std::process::id()).unwrap();
        assert_eq!(cache.read_existing(), Some(std::process::id()));
    }

    #[test]
    fn rejects_when_a_live_process_already_holds_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procd.pid");
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        let cache = PidCache::new(&path);
        let err = cache.store(std::process::id().wrapping_add(1)).unwrap_err();
        assert!(matches!(err, PidCacheError::AlreadyRunning(_)));
    }
}
