// Configuration module
//
// YAML configuration with serde defaults sourced from `crate::constants`.
// The image map routes URL prefixes to either a local directory (target
// starts with `./` or `/`) or an upstream origin (`http://` / `https://`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::constants::{
    DEFAULT_ALLOWED_TYPES, DEFAULT_EXHAUST_PATH, DEFAULT_HEADER_TIMEOUT_SECS, DEFAULT_HOST,
    DEFAULT_IMG_PATH, DEFAULT_METADATA_PATH, DEFAULT_PORT, DEFAULT_QUALITY,
    DEFAULT_READ_TIMEOUT_SECS, DEFAULT_REMOTE_RAW_PATH, DEFAULT_WRITE_TIMEOUT_SECS,
};
use crate::error::GatewayError;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_img_path() -> String {
    DEFAULT_IMG_PATH.to_string()
}

fn default_exhaust_path() -> String {
    DEFAULT_EXHAUST_PATH.to_string()
}

fn default_remote_raw_path() -> String {
    DEFAULT_REMOTE_RAW_PATH.to_string()
}

fn default_metadata_path() -> String {
    DEFAULT_METADATA_PATH.to_string()
}

fn default_allowed_types() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_quality() -> u8 {
    DEFAULT_QUALITY
}

fn default_true() -> bool {
    true
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_read_timeout() -> u64 {
    DEFAULT_READ_TIMEOUT_SECS
}

fn default_write_timeout() -> u64 {
    DEFAULT_WRITE_TIMEOUT_SECS
}

fn default_header_timeout() -> u64 {
    DEFAULT_HEADER_TIMEOUT_SECS
}

/// Crop strategy applied when both `width` and `height` are requested.
///
/// Mirrors the libvips "interesting" vocabulary the original options used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CropGravity {
    #[serde(rename = "InterestingNone")]
    None,
    #[serde(rename = "InterestingCentre")]
    Centre,
    #[serde(rename = "InterestingEntropy")]
    Entropy,
    #[default]
    #[serde(rename = "InterestingAttention")]
    Attention,
    #[serde(rename = "InterestingLow")]
    Low,
    #[serde(rename = "InterestingHigh")]
    High,
    #[serde(rename = "InterestingAll")]
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Local source root, also the fallback for non-image requests
    #[serde(default = "default_img_path")]
    pub img_path: String,
    /// Root for converted artifacts
    #[serde(default = "default_exhaust_path")]
    pub exhaust_path: String,
    /// Root for downloaded upstream originals
    #[serde(default = "default_remote_raw_path")]
    pub remote_raw_path: String,
    /// Root for metadata sidecar documents
    #[serde(default = "default_metadata_path")]
    pub metadata_path: String,

    /// URL prefix → local path or upstream URL
    #[serde(default)]
    pub image_map: HashMap<String, String>,

    /// Source extensions served through the pipeline; `["*"]` means the
    /// built-in image defaults
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,

    #[serde(default = "default_true")]
    pub enable_webp: bool,
    #[serde(default)]
    pub enable_avif: bool,
    #[serde(default)]
    pub enable_jxl: bool,

    /// 0..=100; 100 selects the lossless path in every encoder
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default = "default_true")]
    pub strip_metadata: bool,

    /// Gates the width/height/max_width/max_height query parameters
    #[serde(default)]
    pub enable_extra_params: bool,
    #[serde(default)]
    pub extra_params_crop_interesting: CropGravity,

    /// Per-root cache cap in MiB; 0 disables the janitor
    #[serde(default)]
    pub max_cache_size: u64,

    /// Prefetch worker pool size
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default)]
    pub prefetch: bool,

    /// Hash the full remote URL as the source id, without the resize tuple
    #[serde(default)]
    pub proxy_mode: bool,

    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_header_timeout")]
    pub header_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default config deserializes")
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| GatewayError::config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.quality > 100 {
            return Err(GatewayError::config(format!(
                "quality must be 0..=100, got {}",
                self.quality
            )));
        }
        if self.port == 0 {
            return Err(GatewayError::config("port must be non-zero"));
        }
        if self.jobs == 0 {
            return Err(GatewayError::config("jobs must be at least 1"));
        }
        for (prefix, target) in &self.image_map {
            if !prefix.starts_with('/') {
                return Err(GatewayError::config(format!(
                    "image_map prefix must start with '/': {}",
                    prefix
                )));
            }
            if target.is_empty() {
                return Err(GatewayError::config(format!(
                    "image_map target for {} is empty",
                    prefix
                )));
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Allowed extensions with the `"*"` wildcard expanded to the
    /// built-in image defaults. Lowercase.
    pub fn effective_allowed_types(&self) -> Vec<String> {
        if self.allowed_types.len() == 1 && self.allowed_types[0] == "*" {
            DEFAULT_ALLOWED_TYPES.iter().map(|s| s.to_string()).collect()
        } else {
            self.allowed_types
                .iter()
                .map(|s| s.to_lowercase())
                .collect()
        }
    }

    /// Image-map entries ordered longest-prefix-first so overlapping
    /// prefixes resolve deterministically.
    pub fn sorted_prefixes(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .image_map
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
        entries
    }

    /// Whether a mapped target points at the local filesystem.
    pub fn target_is_local(target: &str) -> bool {
        target.starts_with("./") || target.starts_with('/')
    }

    /// YAML rendering of the default configuration for `--dump-config`.
    pub fn sample_yaml() -> String {
        let mut sample = Config::default();
        sample.image_map.insert("/i".to_string(), "./pics".to_string());
        serde_yaml::to_string(&sample).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.quality, DEFAULT_QUALITY);
        assert!(config.enable_webp);
        assert!(!config.enable_avif);
        assert!(config.strip_metadata);
    }

    #[test]
    fn test_wildcard_allowed_types_expands_to_defaults() {
        let config = Config::default();
        let types = config.effective_allowed_types();
        assert!(types.contains(&"jpg".to_string()));
        assert!(types.contains(&"nef".to_string()));
        assert!(!types.contains(&"*".to_string()));
    }

    #[test]
    fn test_explicit_allowed_types_are_lowercased() {
        let mut config = Config::default();
        config.allowed_types = vec!["JPG".to_string(), "png".to_string()];
        assert_eq!(config.effective_allowed_types(), vec!["jpg", "png"]);
    }

    #[test]
    fn test_quality_above_100_rejected() {
        let mut config = Config::default();
        config.quality = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prefixes_sorted_longest_first() {
        let mut config = Config::default();
        config.image_map.insert("/p".to_string(), "./a".to_string());
        config
            .image_map
            .insert("/p/deep".to_string(), "./b".to_string());
        let sorted = config.sorted_prefixes();
        assert_eq!(sorted[0].0, "/p/deep");
        assert_eq!(sorted[1].0, "/p");
    }

    #[test]
    fn test_target_is_local() {
        assert!(Config::target_is_local("./pics"));
        assert!(Config::target_is_local("/srv/images"));
        assert!(!Config::target_is_local("https://cdn.example.com"));
    }

    #[test]
    fn test_crop_gravity_deserializes_vips_names() {
        let g: CropGravity = serde_yaml::from_str("InterestingEntropy").unwrap();
        assert_eq!(g, CropGravity::Entropy);
        let d: CropGravity = serde_yaml::from_str("InterestingAttention").unwrap();
        assert_eq!(d, CropGravity::Attention);
    }

    #[test]
    fn test_yaml_roundtrip_keeps_image_map() {
        let yaml = r#"
host: "127.0.0.1"
port: 8080
image_map:
  "/p": "./src"
  "/r": "https://cdn.example.com/"
enable_avif: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.image_map.len(), 2);
        assert!(config.enable_avif);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sample_yaml_parses_back() {
        let sample = Config::sample_yaml();
        let parsed: Config = serde_yaml::from_str(&sample).unwrap();
        assert!(parsed.validate().is_ok());
    }
}
