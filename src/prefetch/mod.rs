//! Prefetcher
//!
//! Optional startup walk of the local source tree that pushes every
//! allowed file through the convert filter with an all-formats capability
//! map, bounded by a worker pool of `jobs` permits. Progress is shown on
//! a terminal progress bar.

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::constants::LOCAL_SUBDIR;
use crate::convert::{ConvertFilter, ConvertTargets};
use crate::fingerprint::{self, ResizeParams};
use crate::metadata::{MetadataStore, SourceKind};
use crate::negotiate::ClientSupport;

pub struct Prefetcher {
    img_path: String,
    exhaust_path: String,
    jobs: usize,
    allowed_types: Vec<String>,
    proxy_mode: bool,
    metadata: MetadataStore,
    filter: ConvertFilter,
}

impl Prefetcher {
    pub fn new(config: &Config, metadata: MetadataStore, filter: ConvertFilter) -> Self {
        Self {
            img_path: config.img_path.clone(),
            exhaust_path: config.exhaust_path.clone(),
            jobs: config.jobs,
            allowed_types: config.effective_allowed_types(),
            proxy_mode: config.proxy_mode,
            metadata,
            filter,
        }
    }

    pub async fn run(&self) {
        let started = Instant::now();
        tracing::info!(jobs = self.jobs, root = %self.img_path, "prefetching source tree");

        let root = PathBuf::from(&self.img_path);
        let allowed = self.allowed_types.clone();
        let files = match tokio::task::spawn_blocking(move || collect_files(&root, &allowed)).await
        {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(error = %e, "prefetch walk failed");
                return;
            }
        };

        let bar = ProgressBar::new(files.len() as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message("Prefetching...");

        let pool = Arc::new(Semaphore::new(self.jobs));
        let mut handles = Vec::with_capacity(files.len());

        for file in files {
            let permit = match Arc::clone(&pool).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let metadata = self.metadata.clone();
            let filter = self.filter.clone();
            let exhaust_path = self.exhaust_path.clone();
            let proxy_mode = self.proxy_mode;
            let bar = bar.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let locator = file.to_string_lossy().to_string();
                let resize = ResizeParams::default();
                let id = fingerprint::fingerprint(&locator, &resize, proxy_mode);

                let kind = SourceKind::Local {
                    source: file.clone(),
                };
                metadata.read(&id, &locator, LOCAL_SUBDIR, &kind).await;

                let targets = ConvertTargets {
                    raw: file,
                    webp: fingerprint::exhaust_path(&exhaust_path, LOCAL_SUBDIR, &id, "webp"),
                    avif: fingerprint::exhaust_path(&exhaust_path, LOCAL_SUBDIR, &id, "avif"),
                    jxl: fingerprint::exhaust_path(&exhaust_path, LOCAL_SUBDIR, &id, "jxl"),
                };
                filter.run(&targets, resize, ClientSupport::all(), None).await;
                bar.inc(1);
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        bar.finish_and_clear();
        tracing::info!(elapsed = ?started.elapsed(), "prefetch complete");
    }
}

#[async_trait]
impl BackgroundService for Prefetcher {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = self.run() => {}
        }
    }
}

/// Recursively collect files with allowed extensions under `root`.
fn collect_files(root: &Path, allowed: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "cannot read directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .unwrap_or_default();
            if allowed.iter().any(|a| a == &ext) {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CropGravity;
    use crate::negotiate::EnabledFormats;
    use crate::processor::Processor;
    use image::ImageFormat;
    use tempfile::TempDir;

    fn write_png(path: &Path) {
        let img = image::RgbaImage::from_fn(80, 60, |x, y| {
            image::Rgba([(x * 3) as u8, (y * 4) as u8, 9, 255])
        });
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        std::fs::write(path, buf.into_inner()).unwrap();
    }

    #[test]
    fn test_collect_files_filters_by_extension() {
        let dir = TempDir::new().unwrap();
        write_png(&dir.path().join("a.png"));
        write_png(&dir.path().join("sub/b.png"));
        std::fs::write(dir.path().join("notes.txt"), b"hi").unwrap();

        let files = collect_files(dir.path(), &["png".to_string()]);
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn test_prefetch_builds_enabled_artifacts() {
        let dir = TempDir::new().unwrap();
        let img_root = dir.path().join("pics");
        write_png(&img_root.join("one.png"));
        write_png(&img_root.join("nested/two.png"));

        let mut config = Config::default();
        config.img_path = img_root.to_string_lossy().to_string();
        config.exhaust_path = dir.path().join("exhaust").to_string_lossy().to_string();
        config.metadata_path = dir.path().join("metadata").to_string_lossy().to_string();
        config.jobs = 2;
        config.enable_webp = true;

        let metadata = MetadataStore::new(config.metadata_path.clone());
        let processor = Arc::new(Processor::new(75, true, false, CropGravity::Attention));
        let filter = ConvertFilter::new(
            processor,
            EnabledFormats {
                webp: true,
                avif: false,
                jxl: false,
            },
        );

        let prefetcher = Prefetcher::new(&config, metadata, filter);
        prefetcher.run().await;

        let exhaust = dir.path().join("exhaust").join(LOCAL_SUBDIR);
        let artifacts: Vec<_> = std::fs::read_dir(&exhaust).unwrap().flatten().collect();
        let webp_count = artifacts
            .iter()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".webp"))
            .count();
        assert_eq!(webp_count, 2);

        // Metadata sidecars were produced alongside.
        let sidecars = std::fs::read_dir(dir.path().join("metadata").join(LOCAL_SUBDIR))
            .unwrap()
            .flatten()
            .count();
        assert_eq!(sidecars, 2);
    }
}
