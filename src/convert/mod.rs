//! Convert-filter fan-out
//!
//! For one source, builds the modern-format artifacts that are missing,
//! under the per-source convert lock. A branch only runs when the server
//! has the encoder enabled, the client accepts the format, and the
//! artifact is not already on disk. Branch failures are logged and do not
//! cancel siblings.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::coalescing::KeyedLock;
use crate::fingerprint::ResizeParams;
use crate::metadata::artifact_exists;
use crate::negotiate::{ClientSupport, EnabledFormats};
use crate::processor::codec::TargetFormat;
use crate::processor::Processor;

/// The raw source and its three artifact paths.
#[derive(Debug, Clone)]
pub struct ConvertTargets {
    pub raw: PathBuf,
    pub webp: PathBuf,
    pub avif: PathBuf,
    pub jxl: PathBuf,
}

impl ConvertTargets {
    pub fn path_for(&self, format: TargetFormat) -> &PathBuf {
        match format {
            TargetFormat::Webp => &self.webp,
            TargetFormat::Avif => &self.avif,
            TargetFormat::Jxl => &self.jxl,
        }
    }
}

#[derive(Clone)]
pub struct ConvertFilter {
    lock: KeyedLock,
    processor: Arc<Processor>,
    enabled: EnabledFormats,
}

impl ConvertFilter {
    pub fn new(processor: Arc<Processor>, enabled: EnabledFormats) -> Self {
        Self {
            lock: KeyedLock::new(),
            processor,
            enabled,
        }
    }

    /// Build every missing, enabled, client-supported artifact for this
    /// source, then optionally signal `done`.
    pub async fn run(
        &self,
        targets: &ConvertTargets,
        resize: ResizeParams,
        support: ClientSupport,
        done: Option<oneshot::Sender<()>>,
    ) {
        let raw_key = targets.raw.to_string_lossy().to_string();
        let _guard = self.lock.acquire(&raw_key).await;

        let branches = [
            (TargetFormat::Avif, self.enabled.avif && support.avif),
            (TargetFormat::Webp, self.enabled.webp && support.webp),
            (TargetFormat::Jxl, self.enabled.jxl && support.jxl),
        ];

        let mut handles = Vec::new();
        for (format, wanted) in branches {
            if !wanted {
                continue;
            }
            let dst = targets.path_for(format).clone();
            if artifact_exists(&dst).await {
                continue;
            }

            let processor = Arc::clone(&self.processor);
            let raw = targets.raw.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                processor.process(&raw, &dst, format, &resize)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "convert branch failed"),
                Err(e) => tracing::error!(error = %e, "convert branch panicked"),
            }
        }

        drop(_guard);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    /// The shared convert lock, exposed so tests can observe it.
    pub fn lock(&self) -> &KeyedLock {
        &self.lock
    }
}
