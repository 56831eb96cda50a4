//! Remote fetch subsystem
//!
//! Learns upstream freshness with HEAD pings (ETag, then Last-Modified,
//! then Content-Length), caches validators in a TTL map, and re-downloads
//! the raw source only when the upstream actually changed. Downloads
//! stream into a temp file under a per-path write lock and are renamed
//! into place, so a concurrent reader never sees a partial body.

use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::coalescing::KeyedLock;
use crate::constants::{ETAG_CACHE_CAPACITY, ETAG_CACHE_TTL_SECS, REMOTE_TIMEOUT_SECS};
use crate::error::GatewayError;
use crate::fingerprint::{self, ResizeParams};
use crate::metadata::{MetaRecord, MetadataStore, SourceKind};

/// What a HEAD ping learned about the upstream object. All fields are
/// zero/empty when the upstream could not be reached.
#[derive(Debug, Clone, Default)]
pub struct UpstreamProbe {
    pub etag: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct RemoteFetcher {
    client: reqwest::Client,
    etag_cache: moka::future::Cache<String, String>,
    write_lock: KeyedLock,
    metadata: MetadataStore,
    raw_root: String,
    exhaust_root: String,
    proxy_mode: bool,
}

impl RemoteFetcher {
    pub fn new(
        metadata: MetadataStore,
        raw_root: impl Into<String>,
        exhaust_root: impl Into<String>,
        proxy_mode: bool,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REMOTE_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::config(format!("failed to create HTTP client: {}", e)))?;

        let etag_cache = moka::future::Cache::builder()
            .max_capacity(ETAG_CACHE_CAPACITY)
            .time_to_live(std::time::Duration::from_secs(ETAG_CACHE_TTL_SECS))
            .build();

        Ok(Self {
            client,
            etag_cache,
            write_lock: KeyedLock::new(),
            metadata,
            raw_root: raw_root.into(),
            exhaust_root: exhaust_root.into(),
            proxy_mode,
        })
    }

    /// HEAD the upstream. Transport errors and non-success statuses
    /// produce a zeroed probe rather than an error.
    pub async fn ping(&self, url: &str) -> UpstreamProbe {
        let response = match self.client.head(url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(url, error = %e, "HEAD ping failed");
                return UpstreamProbe::default();
            }
        };

        if !response.status().is_success() {
            tracing::warn!(url, status = %response.status(), "unexpected status pinging upstream");
            return UpstreamProbe::default();
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };

        let size = header("content-length").parse::<u64>().unwrap_or(0);
        let last_modified_raw = header("last-modified");
        let last_modified = DateTime::parse_from_rfc2822(&last_modified_raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));

        let mut etag = header("etag");
        if etag.is_empty() {
            tracing::warn!(url, "upstream has no ETag, falling back to Last-Modified");
            etag = last_modified_raw;
        }
        if etag.is_empty() && last_modified.is_none() {
            tracing::warn!(url, "no validators at all, falling back to Content-Length");
            etag = header("content-length");
        }

        UpstreamProbe {
            etag,
            size,
            last_modified,
        }
    }

    /// Ensure the raw file for `url` is on disk and fresh. Returns the
    /// metadata record and whether a download happened.
    pub async fn fetch(
        &self,
        url: &str,
        subdir: &str,
        resize: &ResizeParams,
    ) -> Result<(MetaRecord, bool), GatewayError> {
        let cache_key = format!("{}:{}", subdir, fingerprint::hash_string(url));

        let probe = match self.etag_cache.get(&cache_key).await {
            Some(etag) => {
                tracing::debug!(url, "using cached ETag for upstream");
                UpstreamProbe {
                    etag,
                    ..Default::default()
                }
            }
            None => {
                tracing::info!(url, "pinging upstream for validators");
                let probe = self.ping(url).await;
                if !probe.etag.is_empty() {
                    self.etag_cache
                        .insert(cache_key.clone(), probe.etag.clone())
                        .await;
                }
                probe
            }
        };

        let id = fingerprint::fingerprint(url, resize, self.proxy_mode);
        let kind = SourceKind::Remote {
            etag: probe.etag.clone(),
        };
        let record = self.metadata.read(&id, url, subdir, &kind).await;

        let raw = fingerprint::raw_path(&self.raw_root, subdir, &id);
        let needs_update = self.needs_update(&raw, &probe, &record).await;

        if !needs_update {
            return Ok((record, false));
        }

        self.purge_derivatives(subdir, &id).await;
        self.metadata.delete(&id, subdir).await;
        let record = self.metadata.write(&id, url, subdir, &kind).await;
        self.download(url, &raw).await?;

        Ok((record, true))
    }

    async fn needs_update(
        &self,
        raw: &Path,
        probe: &UpstreamProbe,
        record: &MetaRecord,
    ) -> bool {
        let local = match tokio::fs::metadata(raw).await {
            Ok(meta) => meta,
            Err(_) => {
                tracing::info!(raw = %raw.display(), "raw file missing, fetching");
                return true;
            }
        };

        if probe.size > 0 && probe.size != local.len() {
            tracing::info!(raw = %raw.display(), "upstream size changed, updating");
            return true;
        }

        if let Some(remote_modified) = probe.last_modified {
            let local_modified = local
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC);
            if remote_modified > local_modified {
                tracing::info!(raw = %raw.display(), "upstream is newer, updating");
                return true;
            }
        }

        if record.checksum != fingerprint::hash_string(&probe.etag) {
            tracing::info!(raw = %raw.display(), "upstream validator changed, updating");
            return true;
        }

        false
    }

    /// Remove every `exhaust/<subdir>/<id>*` derivative.
    async fn purge_derivatives(&self, subdir: &str, id: &str) {
        let dir = Path::new(&self.exhaust_root).join(subdir);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(id) {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    tracing::warn!(path = %entry.path().display(), error = %e, "failed to purge derivative");
                }
            }
        }
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), GatewayError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::upstream_with_url(e.to_string(), url))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::source_missing(url));
        }
        if !response.status().is_success() {
            return Err(GatewayError::upstream_with_url(
                format!("upstream returned {}", response.status()),
                url,
            ));
        }

        // Hold the write lock for the whole body copy so readers of the
        // destination path wait instead of seeing a short file.
        let dest_key = dest.to_string_lossy().to_string();
        let _guard = self.write_lock.acquire(&dest_key).await;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                GatewayError::io_with_operation(e.to_string(), "create raw directory")
            })?;
        }

        let mut temp_name = dest.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp = std::path::PathBuf::from(temp_name);

        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| GatewayError::io_with_operation(e.to_string(), "create raw temp"))?;

        let mut response = response;
        let mut sniffed = false;
        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| GatewayError::upstream_with_url(e.to_string(), url))?
        {
            if !sniffed {
                if image::guess_format(&chunk).is_err() {
                    let _ = tokio::fs::remove_file(&temp).await;
                    return Err(GatewayError::upstream_with_url(
                        "remote payload is not an image",
                        url,
                    ));
                }
                sniffed = true;
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| GatewayError::io_with_operation(e.to_string(), "write raw body"))?;
            written += chunk.len() as u64;
        }

        if written == 0 {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(GatewayError::upstream_with_url("empty response body", url));
        }

        file.flush()
            .await
            .map_err(|e| GatewayError::io_with_operation(e.to_string(), "flush raw body"))?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o600)).await;
        }

        tokio::fs::rename(&temp, dest)
            .await
            .map_err(|e| GatewayError::io_with_operation(e.to_string(), "rename raw temp"))?;

        tracing::info!(url, dest = %dest.display(), bytes = written, "downloaded remote image");
        Ok(())
    }
}
