//! Artifact picker
//!
//! Given the raw source and the artifact candidates a request may be
//! served from, picks the smallest file on disk. Ties go to the raw path
//! so a copied-original artifact never wins over the original it clones
//! (and never misreports its content type through the artifact
//! extension).

use std::path::{Path, PathBuf};

/// The selected response file with its headers.
#[derive(Debug, Clone)]
pub struct Picked {
    pub path: PathBuf,
    pub size: u64,
    pub content_type: &'static str,
    /// `X-Compression-Rate` value: chosen size over raw size.
    pub compression_rate: String,
}

/// Stat the raw path and every candidate, returning the smallest.
///
/// `raw` is always a candidate. Missing files are skipped; `None` means
/// nothing on disk is servable.
pub async fn pick_smallest(raw: &Path, candidates: &[PathBuf]) -> Option<Picked> {
    let mut best: Option<(PathBuf, u64)> = None;
    let raw_size = file_size(raw).await;

    if let Some(size) = raw_size {
        best = Some((raw.to_path_buf(), size));
    }

    for candidate in candidates {
        if let Some(size) = file_size(candidate).await {
            match &best {
                Some((_, best_size)) if size >= *best_size => {}
                _ => best = Some((candidate.clone(), size)),
            }
        }
    }

    let (path, size) = best?;
    let rate = match raw_size {
        Some(raw_size) if raw_size > 0 => size as f32 / raw_size as f32 * 100.0,
        _ => 100.0,
    };

    Some(Picked {
        content_type: content_type_for(&path),
        compression_rate: format!("{:.2}%", rate),
        path,
        size,
    })
}

async fn file_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(meta.len()),
        _ => None,
    }
}

/// Content type derived from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "webp" => "image/webp",
        "avif" => "image/avif",
        "jxl" => "image/jxl",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "heic" => "image/heic",
        "nef" => "image/x-nikon-nef",
        _ => "application/octet-stream",
    }
}
