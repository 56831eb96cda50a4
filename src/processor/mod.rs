//! Image processor
//!
//! Turns a raw source file into an encoded artifact on disk:
//! load → EXIF auto-rotate → optional resize → encode → atomic rename.
//!
//! Degradation policy: any decode, preprocess or encode failure copies the
//! original to the artifact path and reports success, so a request is
//! never failed by a codec. The same applies when the encoded output is
//! larger than the source (no-regression guard). Only real I/O failures
//! propagate.

pub mod codec;
pub mod raw;
pub mod resize;

use image::io::Reader as ImageReader;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::config::{Config, CropGravity};
use crate::constants::{AVIF_MAX_DIMENSION, WEBP_MAX_DIMENSION};
use crate::fingerprint::ResizeParams;
use codec::TargetFormat;

/// How an artifact ended up on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The artifact is a fresh encode of the source.
    Encoded,
    /// The original bytes were copied instead (policy skip, encoder
    /// failure or size regression).
    CopiedOriginal,
}

/// Per-format input policy: dimension cap and source formats the encoder
/// should not be fed.
struct FormatPolicy {
    max_dimension: u32,
    ignored_inputs: &'static [ImageFormat],
}

fn policy_for(format: TargetFormat) -> FormatPolicy {
    match format {
        TargetFormat::Webp => FormatPolicy {
            max_dimension: WEBP_MAX_DIMENSION,
            ignored_inputs: &[ImageFormat::Avif],
        },
        TargetFormat::Avif => FormatPolicy {
            max_dimension: AVIF_MAX_DIMENSION,
            ignored_inputs: &[ImageFormat::Avif, ImageFormat::Gif],
        },
        TargetFormat::Jxl => FormatPolicy {
            max_dimension: u32::MAX,
            ignored_inputs: &[],
        },
    }
}

/// Deletes an intermediate file when dropped.
struct Intermediate(PathBuf);

impl Drop for Intermediate {
    fn drop(&mut self) {
        tracing::info!(path = %self.0.display(), "removing intermediate conversion file");
        if let Err(e) = std::fs::remove_file(&self.0) {
            tracing::warn!(path = %self.0.display(), error = %e, "failed to delete intermediate");
        }
    }
}

#[derive(Debug, Clone)]
pub struct Processor {
    quality: u8,
    strip_metadata: bool,
    enable_extra_params: bool,
    crop_gravity: CropGravity,
}

impl Processor {
    pub fn new(
        quality: u8,
        strip_metadata: bool,
        enable_extra_params: bool,
        crop_gravity: CropGravity,
    ) -> Self {
        Self {
            quality,
            strip_metadata,
            enable_extra_params,
            crop_gravity,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.quality,
            config.strip_metadata,
            config.enable_extra_params,
            config.extra_params_crop_interesting,
        )
    }

    /// Encode `src` into `dst` as `format`. Blocking; run under
    /// `spawn_blocking` from async contexts.
    pub fn process(
        &self,
        src: &Path,
        dst: &Path,
        format: TargetFormat,
        resize_params: &ResizeParams,
    ) -> std::io::Result<ProcessOutcome> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let original_size = std::fs::metadata(src)?.len();

        // NEF sources go through the embedded-preview extraction first;
        // the intermediate is removed when this function returns.
        let mut effective = src.to_path_buf();
        let mut _intermediate: Option<Intermediate> = None;
        if raw::is_nef(src) {
            let workdir = dst.parent().unwrap_or_else(|| Path::new("."));
            if let Some(preview) = raw::extract_preview_jpeg(src, workdir) {
                effective = preview.clone();
                _intermediate = Some(Intermediate(preview));
            }
        }

        let bytes = std::fs::read(&effective)?;

        let reader = match ImageReader::new(Cursor::new(&bytes)).with_guessed_format() {
            Ok(reader) => reader,
            Err(e) => {
                tracing::warn!(src = %src.display(), error = %e, "cannot sniff source format");
                return self.copy_original(&effective, dst);
            }
        };
        let src_format = reader.format();

        let policy = policy_for(format);
        match src_format {
            None => {
                tracing::info!(src = %src.display(), "unrecognized input type, copying original");
                return self.copy_original(&effective, dst);
            }
            Some(fmt) if policy.ignored_inputs.contains(&fmt) => {
                tracing::info!(
                    src = %src.display(),
                    input = ?fmt,
                    target = ?format,
                    "encoder ignores this input type, copying original"
                );
                return self.copy_original(&effective, dst);
            }
            Some(_) => {}
        }

        let img = match reader.decode() {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(src = %src.display(), error = %e, "cannot decode source image");
                return self.copy_original(&effective, dst);
            }
        };

        if img.width() > policy.max_dimension || img.height() > policy.max_dimension {
            tracing::warn!(
                width = img.width(),
                height = img.height(),
                limit = policy.max_dimension,
                target = ?format,
                "image too large for encoder, copying original"
            );
            return self.copy_original(&effective, dst);
        }

        let img = apply_orientation(img, orientation_from(&bytes));

        let img = if self.enable_extra_params && !resize_params.is_noop() {
            match resize::apply_resize(img, resize_params, self.crop_gravity) {
                Ok(img) => img,
                Err(e) => {
                    tracing::warn!(src = %src.display(), error = %e, "resize failed");
                    return self.copy_original(&effective, dst);
                }
            }
        } else {
            img
        };

        let source_exif = if self.strip_metadata {
            None
        } else {
            exif_block(&bytes)
        };

        let encoded = match codec::encode(
            &img,
            format,
            self.quality,
            self.strip_metadata,
            source_exif.as_deref(),
        ) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(src = %src.display(), error = %e, "encode failed, copying original");
                return self.copy_original(&effective, dst);
            }
        };

        if encoded.len() as u64 > original_size {
            tracing::info!(
                src = %src.display(),
                encoded = encoded.len(),
                original = original_size,
                "converted file larger than original, serving original"
            );
            return self.copy_original(&effective, dst);
        }

        write_atomic(dst, &encoded)?;
        log_conversion(format.extension(), src, dst, self.quality, original_size, encoded.len());
        Ok(ProcessOutcome::Encoded)
    }

    /// Raw-only path: preprocess and re-export in the source's own
    /// format. When no preprocessing applies the original is copied
    /// verbatim, keeping its metadata.
    pub fn produce_native(
        &self,
        src: &Path,
        dst: &Path,
        resize_params: &ResizeParams,
    ) -> std::io::Result<ProcessOutcome> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let original_size = std::fs::metadata(src)?.len();

        let bytes = std::fs::read(src)?;
        let orientation = orientation_from(&bytes);
        let wants_resize = self.enable_extra_params && !resize_params.is_noop();

        if !wants_resize && orientation <= 1 && !self.strip_metadata {
            return self.copy_original(src, dst);
        }

        let reader = match ImageReader::new(Cursor::new(&bytes)).with_guessed_format() {
            Ok(reader) => reader,
            Err(_) => return self.copy_original(src, dst),
        };
        let src_format = reader.format();
        let img = match reader.decode() {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(src = %src.display(), error = %e, "cannot decode for native export");
                return self.copy_original(src, dst);
            }
        };

        let img = apply_orientation(img, orientation);
        let img = if wants_resize {
            match resize::apply_resize(img, resize_params, self.crop_gravity) {
                Ok(img) => img,
                Err(_) => return self.copy_original(src, dst),
            }
        } else {
            img
        };

        let out = match export_native(&img, src_format, self.quality) {
            Some(out) => out,
            None => return self.copy_original(src, dst),
        };

        if out.len() as u64 > original_size {
            return self.copy_original(src, dst);
        }

        write_atomic(dst, &out)?;
        Ok(ProcessOutcome::Encoded)
    }

    fn copy_original(&self, src: &Path, dst: &Path) -> std::io::Result<ProcessOutcome> {
        let bytes = std::fs::read(src)?;
        write_atomic(dst, &bytes)?;
        Ok(ProcessOutcome::CopiedOriginal)
    }
}

/// Re-encode in the source's own format. JPEG honors the configured
/// quality; formats the codec layer cannot write return `None`.
fn export_native(img: &DynamicImage, format: Option<ImageFormat>, quality: u8) -> Option<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    match format {
        Some(ImageFormat::Jpeg) => {
            use image::ImageEncoder as _;
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                &mut cursor,
                quality.clamp(1, 100),
            );
            let rgb = img.to_rgb8();
            encoder
                .write_image(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    image::ColorType::Rgb8,
                )
                .ok()?;
        }
        Some(ImageFormat::Png) => {
            img.write_to(&mut cursor, ImageFormat::Png).ok()?;
        }
        Some(ImageFormat::Bmp) => {
            img.write_to(&mut cursor, ImageFormat::Bmp).ok()?;
        }
        _ => return None,
    }
    Some(cursor.into_inner())
}

/// Serialized source EXIF block for carrying into artifacts, with the
/// orientation tag reset to upright since rotation is baked into the
/// pixels before encoding.
fn exif_block(bytes: &[u8]) -> Option<Vec<u8>> {
    let exif = rexif::parse_buffer_quiet(bytes).0.ok()?;
    let mut serialized = exif.serialize().ok()?;
    normalize_exif_orientation(&mut serialized);
    Some(serialized)
}

/// Patch the TIFF orientation entry (tag 0x0112) to 1 in a serialized
/// EXIF block, with or without the `Exif\0\0` prefix.
fn normalize_exif_orientation(exif: &mut [u8]) {
    let base = if exif.starts_with(b"Exif\0\0") { 6 } else { 0 };
    if exif.len() < base + 8 {
        return;
    }
    let le = match &exif[base..base + 2] {
        b"II" => true,
        b"MM" => false,
        _ => return,
    };
    let ifd_offset = read_exif_u32(&exif[base + 4..base + 8], le) as usize;
    let mut pos = base + ifd_offset;
    if pos + 2 > exif.len() {
        return;
    }
    let entries = read_exif_u16(&exif[pos..pos + 2], le) as usize;
    pos += 2;
    for _ in 0..entries {
        if pos + 12 > exif.len() {
            return;
        }
        if read_exif_u16(&exif[pos..pos + 2], le) == 0x0112 {
            let value = pos + 8;
            if value + 2 > exif.len() {
                return;
            }
            if le {
                exif[value] = 1;
                exif[value + 1] = 0;
            } else {
                exif[value] = 0;
                exif[value + 1] = 1;
            }
            return;
        }
        pos += 12;
    }
}

fn read_exif_u16(bytes: &[u8], le: bool) -> u16 {
    if le {
        u16::from_le_bytes([bytes[0], bytes[1]])
    } else {
        u16::from_be_bytes([bytes[0], bytes[1]])
    }
}

fn read_exif_u32(bytes: &[u8], le: bool) -> u32 {
    if le {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    } else {
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

/// EXIF orientation tag value, defaulting to 1 (upright).
fn orientation_from(bytes: &[u8]) -> u16 {
    let exif = match rexif::parse_buffer_quiet(bytes).0 {
        Ok(exif) => exif,
        Err(_) => return 1,
    };
    exif.entries
        .iter()
        .find(|entry| entry.tag == rexif::ExifTag::Orientation)
        .and_then(|entry| match &entry.value {
            rexif::TagValue::U16(values) => values.first().copied(),
            rexif::TagValue::U32(values) => values.first().map(|v| *v as u16),
            _ => None,
        })
        .unwrap_or(1)
}

fn apply_orientation(image: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Temp-file write and rename with mode 0600, so a reader only ever sees
/// a complete artifact.
fn write_atomic(dst: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut temp = dst.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    std::fs::write(&temp, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&temp, dst)?;
    Ok(())
}

fn log_conversion(
    kind: &str,
    src: &Path,
    dst: &Path,
    quality: u8,
    original: u64,
    converted: usize,
) {
    let rate = converted as f32 / original.max(1) as f32 * 100.0;
    tracing::info!(
        kind,
        quality,
        src = %src.display(),
        dst = %dst.display(),
        original_bytes = original,
        converted_bytes = converted,
        rate = format!("{:.2}%", rate),
        "image converted"
    );
}
