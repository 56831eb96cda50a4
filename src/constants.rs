// Constants module - centralized default values for configuration
//
// All tunable defaults live here so the serde default functions in the
// config module and the hard limits in the pipeline share one source.

// =============================================================================
// Server defaults
// =============================================================================

/// Default listen host
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default listen port
pub const DEFAULT_PORT: u16 = 3333;

/// Default socket read timeout in seconds
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Default socket write timeout in seconds
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 30;

/// Default request header timeout in seconds
pub const DEFAULT_HEADER_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Cache layout defaults
// =============================================================================

/// Default local image source root
pub const DEFAULT_IMG_PATH: &str = "./pics";

/// Default root for converted artifacts
pub const DEFAULT_EXHAUST_PATH: &str = "./exhaust";

/// Default root for downloaded upstream originals
pub const DEFAULT_REMOTE_RAW_PATH: &str = "./remote-raw";

/// Default root for metadata sidecar documents
pub const DEFAULT_METADATA_PATH: &str = "./metadata";

/// Subdirectory alias used for local-mode sources
pub const LOCAL_SUBDIR: &str = "local";

// =============================================================================
// Encoding defaults and limits
// =============================================================================

/// Default encode quality; 100 switches every encoder to lossless
pub const DEFAULT_QUALITY: u8 = 80;

/// WebP refuses dimensions above this (libwebp 14-bit limit)
pub const WEBP_MAX_DIMENSION: u32 = 16383;

/// AVIF dimension cap
pub const AVIF_MAX_DIMENSION: u32 = 65536;

/// Highest WebP reduction effort tried when the encoder reports an
/// unencodable frame at lower efforts
pub const WEBP_MAX_REDUCTION_EFFORT: i32 = 6;

/// JPEG-XL decoding-speed tier
pub const JXL_TIER: i64 = 4;

/// JPEG-XL Butteraugli distance for lossy encodes
pub const JXL_DISTANCE: f32 = 1.0;

/// Extensions treated as image sources when `allowed_types` is `"*"`
pub const DEFAULT_ALLOWED_TYPES: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "svg", "heic", "nef", "webp",
];

// =============================================================================
// Remote fetch defaults
// =============================================================================

/// Copy buffer size for streaming downloads and file hashing
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// HTTP client timeout for HEAD pings and GET downloads, in seconds
pub const REMOTE_TIMEOUT_SECS: u64 = 30;

/// TTL of the in-memory remote ETag cache, in seconds
pub const ETAG_CACHE_TTL_SECS: u64 = 3600;

/// Capacity of the in-memory remote ETag cache
pub const ETAG_CACHE_CAPACITY: u64 = 10_000;

// =============================================================================
// Maintenance defaults
// =============================================================================

/// Cache janitor tick interval in seconds
pub const JANITOR_INTERVAL_SECS: u64 = 60;

/// Memory statistics log interval in seconds
pub const MEMORY_LOG_INTERVAL_SECS: u64 = 60;

/// Delay before a freshly downloaded raw file is unlinked after serving,
/// in seconds. Long enough for sibling encodes to finish reading it.
pub const RAW_CLEANUP_DELAY_SECS: u64 = 300;
