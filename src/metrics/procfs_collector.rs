//! A Linux `/proc/<pid>` implementation of the metrics collector port,
//! using the `procfs` crate. Grounded on the CPU/memory sampling pattern
//! found across the retrieval pack's process-monitoring code: `Process::new(pid)`,
//! `.stat()` for utime/stime, `.statm().resident` for RSS.

use super::{CollectCtx, CpuSample, MemorySample, MetricsCollector, MetricsError};
use procfs::process::Process;

/// `statm` reports resident/virtual sizes in pages, not bytes; 4096 is
/// the page size on every architecture this daemon targets.
const PAGE_SIZE_BYTES: u64 = 4096;

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFsCollector;

impl MetricsCollector for ProcFsCollector {
    fn collect_cpu(&self, ctx: &CollectCtx, pid: i32) -> Result<CpuSample, MetricsError> {
        if ctx.is_expired() {
            return Err(MetricsError::Other("deadline exceeded".to_string()));
        }
        let process = Process::new(pid).map_err(|_| MetricsError::ProcessNotFound)?;
        let stat = process.stat().map_err(|err| MetricsError::Other(err.to_string()))?;
        Ok(CpuSample { user: stat.utime, system: stat.stime })
    }

    fn collect_memory(&self, ctx: &CollectCtx, pid: i32) -> Result<MemorySample, MetricsError> {
        if ctx.is_expired() {
            return Err(MetricsError::Other("deadline exceeded".to_string()));
        }
        let process = Process::new(pid).map_err(|_| MetricsError::ProcessNotFound)?;
        let statm = process.statm().map_err(|err| MetricsError::Other(err.to_string()))?;
        Ok(MemorySample {
            rss: statm.resident * PAGE_SIZE_BYTES,
            vms: statm.size * PAGE_SIZE_BYTES,
            swap: 0,
        })
    }
}
