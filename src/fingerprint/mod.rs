//! Source fingerprinting and path utilities
//!
//! A request is identified by a stable hash of its canonical locator plus
//! the resize tuple; identical inputs hash identically across processes.
//! Cache layout helpers for the raw, exhaust and metadata roots live here
//! so every component derives the same on-disk paths.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::constants::COPY_BUFFER_SIZE;

/// Resize parameters carried by a request. Zero means "not requested".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResizeParams {
    pub width: u32,
    pub height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl ResizeParams {
    pub fn is_noop(&self) -> bool {
        self.width == 0 && self.height == 0 && self.max_width == 0 && self.max_height == 0
    }

    /// Query-string rendering embedded in the pre-hash string. Zero values
    /// render empty so an absent parameter and an explicit `0` coincide.
    pub fn query_suffix(&self) -> String {
        fn part(v: u32) -> String {
            if v == 0 {
                String::new()
            } else {
                v.to_string()
            }
        }
        format!(
            "?width={}&height={}&max_width={}&max_height={}",
            part(self.width),
            part(self.height),
            part(self.max_width),
            part(self.max_height)
        )
    }
}

/// SHA-256 of a string, full-width lowercase hex.
pub fn hash_string(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a file's contents via a streaming reader.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute the source fingerprint for a locator and resize tuple.
///
/// In proxy mode the id is the hash of the locator alone (the full remote
/// URL already distinguishes variants upstream).
pub fn fingerprint(locator: &str, resize: &ResizeParams, proxy_mode: bool) -> String {
    if proxy_mode {
        return hash_string(locator);
    }
    hash_string(&format!("{}{}", locator, resize.query_suffix()))
}

/// Lexically clean an absolute request path: collapse repeated slashes,
/// drop `.` segments and resolve `..` without ever escaping the root.
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// `raw_dir/<subdir>/<id>`
pub fn raw_path(root: &str, subdir: &str, id: &str) -> PathBuf {
    Path::new(root).join(subdir).join(id)
}

/// `exhaust_dir/<subdir>/<id>.<ext>`
pub fn exhaust_path(root: &str, subdir: &str, id: &str, ext: &str) -> PathBuf {
    Path::new(root).join(subdir).join(format!("{}.{}", id, ext))
}

/// `metadata_dir/<subdir>/<id>.json`
pub fn metadata_path(root: &str, subdir: &str, id: &str) -> PathBuf {
    Path::new(root)
        .join(subdir)
        .join(format!("{}.json", id))
}

/// Lowercased extension of a path, without the dot.
pub fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}
