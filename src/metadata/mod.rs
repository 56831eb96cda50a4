//! Metadata sidecar store
//!
//! One JSON document per source fingerprint under
//! `metadata_dir/<subdir>/<id>.json`. A record that is missing or fails to
//! parse is treated as absent and rewritten; a failed write logs and
//! returns the in-memory record so callers never see a read error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fingerprint;

/// Per-source sidecar record.
///
/// `checksum` is a content hash of the file for local sources and a hash
/// of the upstream ETag (or its fallbacks) for remote sources. Unknown
/// keys in the document are ignored on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub id: String,
    pub path: String,
    pub checksum: String,
}

/// How the checksum for a source is derived.
#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Local file: checksum is the content hash of the file.
    Local { source: PathBuf },
    /// Remote origin: checksum is the hash of the validator string
    /// (ETag, Last-Modified or Content-Length, first non-empty).
    Remote { etag: String },
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: String,
}

impl MetadataStore {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    fn sidecar_path(&self, subdir: &str, id: &str) -> PathBuf {
        fingerprint::metadata_path(&self.root, subdir, id)
    }

    /// Read the record for `id`, rebuilding it when the document is
    /// missing or corrupt.
    pub async fn read(
        &self,
        id: &str,
        locator: &str,
        subdir: &str,
        kind: &SourceKind,
    ) -> MetaRecord {
        let path = self.sidecar_path(subdir, id);
        match tokio::fs::read(&path).await {
            Ok(buf) => match serde_json::from_slice::<MetaRecord>(&buf) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "metadata document corrupt, rebuilding"
                    );
                    self.write(id, locator, subdir, kind).await
                }
            },
            Err(_) => self.write(id, locator, subdir, kind).await,
        }
    }

    /// Write (or overwrite) the record for `id` and return it.
    pub async fn write(
        &self,
        id: &str,
        locator: &str,
        subdir: &str,
        kind: &SourceKind,
    ) -> MetaRecord {
        let checksum = match kind {
            SourceKind::Remote { etag } => fingerprint::hash_string(etag),
            SourceKind::Local { source } => {
                let source = source.clone();
                tokio::task::spawn_blocking(move || fingerprint::hash_file(&source))
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .unwrap_or_default()
            }
        };

        let record = MetaRecord {
            id: id.to_string(),
            path: locator.to_string(),
            checksum,
        };

        if let Err(e) = self.persist(subdir, &record).await {
            tracing::error!(
                id = %record.id,
                error = %e,
                "failed to persist metadata, continuing with in-memory record"
            );
        }
        record
    }

    async fn persist(&self, subdir: &str, record: &MetaRecord) -> std::io::Result<()> {
        let path = self.sidecar_path(subdir, &record.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Temp file + rename keeps half-written documents unobservable.
        let temp = path.with_extension("json.tmp");
        let buf = serde_json::to_vec(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&temp, &buf).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    /// Best-effort removal of the sidecar document.
    pub async fn delete(&self, id: &str, subdir: &str) {
        let path = self.sidecar_path(subdir, id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete metadata");
            }
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }
}

/// `true` when the path exists with a non-zero size.
pub async fn artifact_exists(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}
