// Resource monitor - periodic process memory logging

use async_trait::async_trait;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use std::time::Duration;

use crate::constants::MEMORY_LOG_INTERVAL_SECS;

/// Logs resident/virtual memory once a minute for capacity debugging.
pub struct MemoryMonitor;

/// (VmRSS, VmSize) in KiB from procfs, when available.
fn memory_kib() -> Option<(u64, u64)> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let mut rss = None;
    let mut size = None;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss = rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("VmSize:") {
            size = rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok();
        }
    }
    Some((rss?, size?))
}

#[async_trait]
impl BackgroundService for MemoryMonitor {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let mut interval = tokio::time::interval(Duration::from_secs(MEMORY_LOG_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = interval.tick() => {
                    match memory_kib() {
                        Some((rss, size)) => tracing::info!(
                            rss_mib = rss / 1024,
                            vsize_mib = size / 1024,
                            "process memory"
                        ),
                        None => tracing::debug!("memory statistics unavailable on this platform"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_kib_reads_procfs() {
        let (rss, size) = memory_kib().expect("procfs available on linux");
        assert!(rss > 0);
        assert!(size >= rss);
    }
}
