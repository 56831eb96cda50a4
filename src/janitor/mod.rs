//! Cache janitor
//!
//! Size-bounded background eviction: every tick, each cache root is
//! walked and its oldest files (by mtime) are deleted until the root
//! fits under the configured cap. Roots are treated independently; a
//! missing root is not an error.
//!
//! Also schedules the delayed removal of freshly downloaded raw files
//! once a response has been served.

use async_trait::async_trait;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::constants::{JANITOR_INTERVAL_SECS, RAW_CLEANUP_DELAY_SECS};

/// Total size of all files under `root`, recursively.
pub fn dir_size(root: &Path) -> std::io::Result<u64> {
    if !root.exists() {
        return Ok(0);
    }
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// The single oldest file under `root` by modification time.
fn oldest_file(root: &Path) -> Option<PathBuf> {
    let mut oldest: Option<(PathBuf, SystemTime)> = None;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(path = %dir.display(), error = %e, "error walking cache root");
                continue;
            }
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push(entry.path());
                continue;
            }
            let Ok(modified) = meta.modified() else { continue };
            match &oldest {
                Some((_, oldest_time)) if modified >= *oldest_time => {}
                _ => oldest = Some((entry.path(), modified)),
            }
        }
    }
    oldest.map(|(path, _)| path)
}

/// Delete oldest-first until the root's total size is within `cap_bytes`.
pub fn enforce_cap(root: &Path, cap_bytes: u64) -> std::io::Result<()> {
    let mut total = dir_size(root)?;
    while total > cap_bytes {
        let Some(victim) = oldest_file(root) else {
            break;
        };
        std::fs::remove_file(&victim)?;
        tracing::info!(path = %victim.display(), "evicted oldest cache file");
        total = dir_size(root)?;
    }
    Ok(())
}

/// Long-lived eviction service owned by the server lifecycle.
pub struct CacheJanitor {
    roots: Vec<PathBuf>,
    cap_bytes: u64,
}

impl CacheJanitor {
    /// `max_cache_size` is in MiB; the caller only constructs the
    /// janitor when it is non-zero.
    pub fn new(roots: Vec<PathBuf>, max_cache_size_mib: u64) -> Self {
        Self {
            roots,
            cap_bytes: max_cache_size_mib * 1024 * 1024,
        }
    }

    async fn tick(&self) {
        for root in &self.roots {
            let root = root.clone();
            let cap = self.cap_bytes;
            let result = tokio::task::spawn_blocking(move || enforce_cap(&root, cap)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "cache eviction pass failed"),
                Err(e) => tracing::error!(error = %e, "cache eviction task panicked"),
            }
        }
    }
}

#[async_trait]
impl BackgroundService for CacheJanitor {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        tracing::info!(
            cap_bytes = self.cap_bytes,
            roots = self.roots.len(),
            "cache janitor started"
        );
        let mut interval = tokio::time::interval(Duration::from_secs(JANITOR_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("cache janitor shutting down");
                    return;
                }
                _ = interval.tick() => self.tick().await,
            }
        }
    }
}

/// Delay, then unlink a freshly downloaded raw file. Fire and forget.
pub fn schedule_cleanup(raw: PathBuf) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(RAW_CLEANUP_DELAY_SECS)).await;
        match tokio::fs::remove_file(&raw).await {
            Ok(()) => tracing::info!(path = %raw.display(), "removed served raw file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %raw.display(), error = %e, "raw cleanup failed"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, FileTimes};
    use tempfile::TempDir;

    fn write_with_age(dir: &Path, name: &str, len: usize, age_secs: u64) {
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; len]).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        let file = File::options().write(true).open(&path).unwrap();
        file.set_times(FileTimes::new().set_modified(mtime)).unwrap();
    }

    #[test]
    fn test_dir_size_counts_recursively() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_size(dir.path()).unwrap(), 150);
    }

    #[test]
    fn test_missing_root_is_empty_not_error() {
        assert_eq!(dir_size(Path::new("/definitely/not/here")).unwrap(), 0);
        assert!(enforce_cap(Path::new("/definitely/not/here"), 10).is_ok());
    }

    #[test]
    fn test_eviction_removes_oldest_until_under_cap() {
        let dir = TempDir::new().unwrap();
        // Ten 300 KiB files with ascending mtimes; cap of 1 MiB keeps the
        // newest three.
        for i in 0..10u64 {
            write_with_age(dir.path(), &format!("f{}", i), 300 * 1024, 1000 - i * 10);
        }

        enforce_cap(dir.path(), 1024 * 1024).unwrap();

        let remaining: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining.len(), 3);
        for name in ["f7", "f8", "f9"] {
            assert!(remaining.contains(&name.to_string()), "missing {}", name);
        }
        assert!(dir_size(dir.path()).unwrap() <= 1024 * 1024);
    }

    #[test]
    fn test_under_cap_deletes_nothing() {
        let dir = TempDir::new().unwrap();
        write_with_age(dir.path(), "keep", 1024, 100);
        enforce_cap(dir.path(), 10 * 1024 * 1024).unwrap();
        assert!(dir.path().join("keep").exists());
    }

    #[tokio::test]
    async fn test_janitor_tick_enforces_each_root() {
        let dir = TempDir::new().unwrap();
        let root_a = dir.path().join("a");
        let root_b = dir.path().join("b");
        std::fs::create_dir_all(&root_a).unwrap();
        std::fs::create_dir_all(&root_b).unwrap();
        write_with_age(&root_a, "old", 2 * 1024 * 1024, 100);
        write_with_age(&root_a, "new", 512 * 1024, 10);
        write_with_age(&root_b, "only", 512 * 1024, 10);

        let janitor = CacheJanitor::new(vec![root_a.clone(), root_b.clone()], 1);
        janitor.tick().await;

        assert!(!root_a.join("old").exists());
        assert!(root_a.join("new").exists());
        assert!(root_b.join("only").exists());
    }
}
