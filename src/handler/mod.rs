//! Request handler
//!
//! Framework-agnostic request orchestration: resolve the image-map
//! prefix, refresh metadata, fetch remote sources, negotiate formats,
//! fan out conversions and describe the response. The HTTP layer only
//! parses the request into [`RequestParts`] and streams the [`Reply`]
//! back, which keeps the whole pipeline testable without a socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::constants::LOCAL_SUBDIR;
use crate::convert::{ConvertFilter, ConvertTargets};
use crate::error::GatewayError;
use crate::fetch::RemoteFetcher;
use crate::fingerprint::{self, ResizeParams};
use crate::janitor;
use crate::metadata::{artifact_exists, MetadataStore, SourceKind};
use crate::negotiate::{self, ClientSupport, EnabledFormats};
use crate::picker;
use crate::processor::Processor;

/// The parts of an HTTP request the pipeline consumes.
#[derive(Debug, Clone, Default)]
pub struct RequestParts {
    /// URL path, percent-encoded as received.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: String,
    pub accept: Option<String>,
    pub user_agent: Option<String>,
}

/// Response body variants the HTTP layer knows how to send.
#[derive(Debug, Clone)]
pub enum ReplyBody {
    Empty,
    Text(String),
    /// Stream this file from disk.
    File(PathBuf),
}

/// A fully described response.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub content_type: Option<String>,
    pub compression_rate: Option<String>,
    pub location: Option<String>,
    pub body: ReplyBody,
}

impl Reply {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: Some("text/plain; charset=utf-8".to_string()),
            compression_rate: None,
            location: None,
            body: ReplyBody::Text(body.into()),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            compression_rate: None,
            location: None,
            body: ReplyBody::Empty,
        }
    }

    pub fn file(path: PathBuf, content_type: &str) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            compression_rate: None,
            location: None,
            body: ReplyBody::File(path),
        }
    }

    pub fn redirect(location: String) -> Self {
        Self {
            status: 302,
            content_type: None,
            compression_rate: None,
            location: Some(location),
            body: ReplyBody::Empty,
        }
    }
}

/// The assembled pipeline, injected into the HTTP layer.
pub struct Gateway {
    config: Arc<Config>,
    allowed_types: Vec<String>,
    metadata: MetadataStore,
    fetcher: RemoteFetcher,
    filter: ConvertFilter,
    processor: Arc<Processor>,
}

impl Gateway {
    pub fn new(config: Arc<Config>) -> Result<Self, GatewayError> {
        let metadata = MetadataStore::new(config.metadata_path.clone());
        let fetcher = RemoteFetcher::new(
            metadata.clone(),
            config.remote_raw_path.clone(),
            config.exhaust_path.clone(),
            config.proxy_mode,
        )?;
        let processor = Arc::new(Processor::from_config(&config));
        let filter = ConvertFilter::new(Arc::clone(&processor), enabled_formats(&config));

        Ok(Self {
            allowed_types: config.effective_allowed_types(),
            metadata,
            fetcher,
            filter,
            processor,
            config,
        })
    }

    pub fn convert_filter(&self) -> &ConvertFilter {
        &self.filter
    }

    pub fn metadata_store(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Serve one request.
    pub async fn handle(&self, request: RequestParts) -> Reply {
        let decoded = urlencoding::decode(&request.path)
            .map(|c| c.to_string())
            .unwrap_or_else(|_| request.path.clone());
        let req_uri = fingerprint::clean_path(&decoded);

        if req_uri == "/" {
            return Reply::text(200, "Welcome to Pixelgate");
        }

        let filename = req_uri.rsplit('/').next().unwrap_or("").to_string();
        let extension = fingerprint::extension_of(&filename).unwrap_or_default();

        // Requests outside the configured source types never enter the
        // pipeline; they redirect to the origin or stream as-is.
        if extension.is_empty() || !self.allowed_types.contains(&extension) {
            return self.handle_non_image(&req_uri).await;
        }

        if !self.allowed_types.contains(&extension) {
            let err = GatewayError::extension_not_allowed(&filename);
            tracing::warn!(path = %req_uri, "{}", err);
            return Reply::text(err.to_http_status(), err.to_string());
        }

        let resize = parse_resize_params(&request.query);
        let support = negotiate::negotiate(
            request.accept.as_deref(),
            request.user_agent.as_deref(),
            enabled_formats(&self.config),
        );

        let Some((prefix, target)) = self.matching_prefix(&req_uri) else {
            tracing::warn!(path = %req_uri, "request matches no image-map prefix");
            return Reply::status(404);
        };

        let result = if Config::target_is_local(&target) {
            self.serve_local(&target, &prefix, &req_uri, &resize, support)
                .await
        } else {
            self.serve_remote(&target, &prefix, &req_uri, &request.query, &resize, support)
                .await
        };

        match result {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!(path = %req_uri, error = %err, "request failed");
                map_error(err)
            }
        }
    }

    fn matching_prefix(&self, req_uri: &str) -> Option<(String, String)> {
        self.config
            .sorted_prefixes()
            .into_iter()
            .find(|(prefix, _)| req_uri.starts_with(prefix))
            .map(|(prefix, target)| (prefix.to_string(), target.to_string()))
    }

    async fn serve_local(
        &self,
        target: &str,
        prefix: &str,
        req_uri: &str,
        resize: &ResizeParams,
        support: ClientSupport,
    ) -> Result<Reply, GatewayError> {
        let rest = req_uri.strip_prefix(prefix).unwrap_or(req_uri);
        let src = Path::new(target).join(rest.trim_start_matches('/'));
        let locator = src.to_string_lossy().to_string();
        let id = fingerprint::fingerprint(&locator, resize, self.config.proxy_mode);

        if !artifact_exists(&src).await {
            self.metadata.delete(&id, LOCAL_SUBDIR).await;
            return Err(GatewayError::source_missing(locator));
        }

        let kind = SourceKind::Local { source: src.clone() };
        let record = self.metadata.read(&id, &locator, LOCAL_SUBDIR, &kind).await;

        // Freshness: a changed source invalidates every derivative
        // before anything is served.
        let current = {
            let src = src.clone();
            tokio::task::spawn_blocking(move || fingerprint::hash_file(&src))
                .await
                .map_err(|e| GatewayError::io(e.to_string()))??
        };
        if record.checksum != current {
            tracing::info!(src = %src.display(), "local source changed, purging derivatives");
            self.purge_exhaust(LOCAL_SUBDIR, &id).await;
            self.metadata.delete(&id, LOCAL_SUBDIR).await;
            self.metadata.write(&id, &locator, LOCAL_SUBDIR, &kind).await;
        }

        self.convert_and_pick(&src, LOCAL_SUBDIR, &id, resize, support)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn serve_remote(
        &self,
        target: &str,
        prefix: &str,
        req_uri: &str,
        query: &str,
        resize: &ResizeParams,
        support: ClientSupport,
    ) -> Result<Reply, GatewayError> {
        let target_url = reqwest::Url::parse(target)
            .map_err(|e| GatewayError::config(format!("invalid image_map target {}: {}", target, e)))?;
        let host = target_url.host_str().unwrap_or("remote").to_string();

        let remote_url = build_remote_url(&target_url, prefix, req_uri, query);

        let (record, fresh_download) = match self.fetcher.fetch(&remote_url, &host, resize).await {
            Ok(result) => result,
            Err(GatewayError::SourceMissing { path }) => {
                let id = fingerprint::fingerprint(&remote_url, resize, self.config.proxy_mode);
                self.metadata.delete(&id, &host).await;
                return Err(GatewayError::SourceMissing { path });
            }
            Err(err) => return Err(err),
        };

        let raw = fingerprint::raw_path(&self.config.remote_raw_path, &host, &record.id);
        let reply = self
            .convert_and_pick(&raw, &host, &record.id, resize, support)
            .await?;

        if fresh_download {
            janitor::schedule_cleanup(raw);
        }
        Ok(reply)
    }

    /// Shared tail of both source modes: raw-only short-circuit, convert
    /// fan-out, smallest-artifact pick.
    async fn convert_and_pick(
        &self,
        raw: &Path,
        subdir: &str,
        id: &str,
        resize: &ResizeParams,
        support: ClientSupport,
    ) -> Result<Reply, GatewayError> {
        let exhaust = &self.config.exhaust_path;

        if support.modern_is_empty() {
            return self.serve_raw_variant(raw, subdir, id, resize).await;
        }

        let targets = ConvertTargets {
            raw: raw.to_path_buf(),
            webp: fingerprint::exhaust_path(exhaust, subdir, id, "webp"),
            avif: fingerprint::exhaust_path(exhaust, subdir, id, "avif"),
            jxl: fingerprint::exhaust_path(exhaust, subdir, id, "jxl"),
        };

        self.filter.run(&targets, *resize, support, None).await;

        let enabled = enabled_formats(&self.config);
        let mut candidates = Vec::new();
        if enabled.webp && support.webp {
            candidates.push(targets.webp.clone());
        }
        if enabled.avif && support.avif {
            candidates.push(targets.avif.clone());
        }
        if enabled.jxl && support.jxl {
            candidates.push(targets.jxl.clone());
        }

        let picked = picker::pick_smallest(raw, &candidates)
            .await
            .ok_or_else(|| GatewayError::source_missing(raw.to_string_lossy()))?;

        tracing::info!(
            served = %picked.path.display(),
            size = picked.size,
            rate = %picked.compression_rate,
            "serving artifact"
        );

        let mut reply = Reply::file(picked.path, picked.content_type);
        reply.compression_rate = Some(picked.compression_rate);
        Ok(reply)
    }

    /// Raw-only clients get a preprocessed same-format artifact.
    async fn serve_raw_variant(
        &self,
        raw: &Path,
        subdir: &str,
        id: &str,
        resize: &ResizeParams,
    ) -> Result<Reply, GatewayError> {
        let ext = raw
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_else(|| "bin".to_string());
        let dst = fingerprint::exhaust_path(&self.config.exhaust_path, subdir, id, &ext);

        if !artifact_exists(&dst).await {
            let _guard = self
                .filter
                .lock()
                .acquire(&dst.to_string_lossy())
                .await;
            if !artifact_exists(&dst).await {
                let processor = Arc::clone(&self.processor);
                let raw = raw.to_path_buf();
                let dst = dst.clone();
                let resize = *resize;
                tokio::task::spawn_blocking(move || {
                    processor.produce_native(&raw, &dst, &resize)
                })
                .await
                .map_err(|e| GatewayError::io(e.to_string()))??;
            }
        }

        let picked = picker::pick_smallest(raw, &[dst])
            .await
            .ok_or_else(|| GatewayError::source_missing(raw.to_string_lossy()))?;
        let mut reply = Reply::file(picked.path, picked.content_type);
        reply.compression_rate = Some(picked.compression_rate);
        Ok(reply)
    }

    /// Non-image requests: redirect to the mapped origin, stream a mapped
    /// local file, or fall back to `img_path`.
    async fn handle_non_image(&self, req_uri: &str) -> Reply {
        for (prefix, target) in self.config.sorted_prefixes() {
            if !req_uri.starts_with(prefix) {
                continue;
            }
            let trailing = req_uri.strip_prefix(prefix).unwrap_or("");
            if target.starts_with("http://") || target.starts_with("https://") {
                let location = format!("{}{}", target.trim_end_matches('/'), trailing);
                tracing::info!(location = %location, "redirecting non-image request");
                return Reply::redirect(location);
            }
            let local = Path::new(target).join(trailing.trim_start_matches('/'));
            if artifact_exists(&local).await {
                let content_type = picker::content_type_for(&local);
                return Reply::file(local, content_type);
            }
            return Reply::status(404);
        }

        let fallback = Path::new(&self.config.img_path).join(req_uri.trim_start_matches('/'));
        if artifact_exists(&fallback).await {
            let content_type = picker::content_type_for(&fallback);
            return Reply::file(fallback, content_type);
        }
        Reply::status(404)
    }

    async fn purge_exhaust(&self, subdir: &str, id: &str) {
        let dir = Path::new(&self.config.exhaust_path).join(subdir);
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(id) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}

fn enabled_formats(config: &Config) -> EnabledFormats {
    EnabledFormats {
        webp: config.enable_webp,
        avif: config.enable_avif,
        jxl: config.enable_jxl,
    }
}

/// Parse `width`/`height`/`max_width`/`max_height` query parameters;
/// anything missing or malformed is 0.
pub fn parse_resize_params(query: &str) -> ResizeParams {
    let mut map: HashMap<&str, u32> = HashMap::new();
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            let decoded = urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_default();
            if let Ok(parsed) = decoded.parse::<u32>() {
                map.insert(key, parsed);
            }
        }
    }
    ResizeParams {
        width: map.get("width").copied().unwrap_or(0),
        height: map.get("height").copied().unwrap_or(0),
        max_width: map.get("max_width").copied().unwrap_or(0),
        max_height: map.get("max_height").copied().unwrap_or(0),
    }
}

/// Swap the matched prefix for the target's path and attach it to the
/// target host. The query travels with the upstream URL so proxy-mode
/// variants stay distinct.
fn build_remote_url(target: &reqwest::Url, prefix: &str, req_uri: &str, query: &str) -> String {
    let trailing = req_uri.strip_prefix(prefix).unwrap_or(req_uri);
    let base = format!(
        "{}://{}{}",
        target.scheme(),
        target.host_str().unwrap_or_default(),
        target
            .port()
            .map(|p| format!(":{}", p))
            .unwrap_or_default()
    );
    let mut path = format!(
        "{}/{}",
        target.path().trim_end_matches('/'),
        trailing.trim_start_matches('/')
    );
    if !query.is_empty() {
        path = format!("{}?{}", path, query);
    }
    format!("{}{}", base, path)
}

fn map_error(err: GatewayError) -> Reply {
    match &err {
        GatewayError::SourceMissing { .. } => Reply::status(404),
        GatewayError::Upstream { .. } => Reply::text(500, "无法获取远程图像"),
        GatewayError::Config { .. } => Reply::text(500, "服务器配置错误"),
        GatewayError::RouteMiss => Reply::status(404),
        GatewayError::ExtensionNotAllowed { .. } => Reply::text(400, err.to_string()),
        GatewayError::Io { .. } => Reply::text(500, "处理图像时出错"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resize_params() {
        let params = parse_resize_params("width=200&height=&max_width=50&foo=bar");
        assert_eq!(params.width, 200);
        assert_eq!(params.height, 0);
        assert_eq!(params.max_width, 50);
        assert_eq!(params.max_height, 0);
    }

    #[test]
    fn test_parse_resize_params_empty_query() {
        assert!(parse_resize_params("").is_noop());
    }

    #[test]
    fn test_parse_resize_params_rejects_garbage() {
        let params = parse_resize_params("width=abc&height=-3");
        assert!(params.is_noop());
    }

    #[test]
    fn test_build_remote_url_swaps_prefix() {
        let target = reqwest::Url::parse("https://cdn.example.com/").unwrap();
        let url = build_remote_url(&target, "/r", "/r/pics/a.png", "");
        assert_eq!(url, "https://cdn.example.com/pics/a.png");
    }

    #[test]
    fn test_build_remote_url_keeps_target_path_and_query() {
        let target = reqwest::Url::parse("https://cdn.example.com/base/").unwrap();
        let url = build_remote_url(&target, "/r", "/r/a.png", "width=100");
        assert_eq!(url, "https://cdn.example.com/base/a.png?width=100");
    }

    #[test]
    fn test_build_remote_url_with_port() {
        let target = reqwest::Url::parse("http://origin:8080/imgs").unwrap();
        let url = build_remote_url(&target, "/r", "/r/b.jpg", "");
        assert_eq!(url, "http://origin:8080/imgs/b.jpg");
    }

    #[test]
    fn test_map_error_statuses() {
        assert_eq!(map_error(GatewayError::source_missing("x")).status, 404);
        let upstream = map_error(GatewayError::upstream("boom"));
        assert_eq!(upstream.status, 500);
        match upstream.body {
            ReplyBody::Text(text) => assert_eq!(text, "无法获取远程图像"),
            _ => panic!("expected text body"),
        }
        let config = map_error(GatewayError::config("bad url"));
        match config.body {
            ReplyBody::Text(text) => assert_eq!(text, "服务器配置错误"),
            _ => panic!("expected text body"),
        }
    }

    #[test]
    fn test_reply_constructors() {
        let redirect = Reply::redirect("https://cdn.example.com/x".to_string());
        assert_eq!(redirect.status, 302);
        assert_eq!(
            redirect.location.as_deref(),
            Some("https://cdn.example.com/x")
        );

        let text = Reply::text(400, "nope");
        assert_eq!(text.status, 400);
    }
}
