//! Target-format encoders
//!
//! One entry point per modern format over a decoded `DynamicImage`.
//! WebP failures carry a typed discriminant so the caller's retry loop is
//! driven by the error class instead of message matching: only the
//! `Unencodable` class is worth retrying at a higher reduction effort.

use image::DynamicImage;

use crate::constants::{JXL_DISTANCE, JXL_TIER, WEBP_MAX_REDUCTION_EFFORT};

/// The three modern output encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Webp,
    Avif,
    Jxl,
}

impl TargetFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::Webp => "webp",
            TargetFormat::Avif => "avif",
            TargetFormat::Jxl => "jxl",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            TargetFormat::Webp => "image/webp",
            TargetFormat::Avif => "image/avif",
            TargetFormat::Jxl => "image/jxl",
        }
    }
}

/// Encoder failure, classified.
#[derive(Debug, Clone)]
pub enum CodecError {
    /// The codec could not represent this frame at the current settings;
    /// retrying with different tuning may succeed.
    Unencodable { format: &'static str, message: String },
    /// Anything else; retrying is pointless.
    Hard { format: &'static str, message: String },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Unencodable { format, message } => {
                write!(f, "{} encoder: unable to encode: {}", format, message)
            }
            CodecError::Hard { format, message } => {
                write!(f, "{} encoder: {}", format, message)
            }
        }
    }
}

impl std::error::Error for CodecError {}

impl CodecError {
    pub fn is_unencodable(&self) -> bool {
        matches!(self, CodecError::Unencodable { .. })
    }
}

/// Encode `img` to `format`. `quality >= 100` selects the lossless path
/// of every encoder.
///
/// `source_exif` is the source's serialized EXIF block; when
/// `strip_metadata` is false, encoders whose container supports it carry
/// the block into the output.
pub fn encode(
    img: &DynamicImage,
    format: TargetFormat,
    quality: u8,
    strip_metadata: bool,
    source_exif: Option<&[u8]>,
) -> Result<Vec<u8>, CodecError> {
    match format {
        TargetFormat::Webp => encode_webp(img, quality, strip_metadata, source_exif),
        TargetFormat::Avif => encode_avif(img, quality, strip_metadata, source_exif),
        TargetFormat::Jxl => encode_jxl(img, quality),
    }
}

fn encode_webp(
    img: &DynamicImage,
    quality: u8,
    strip_metadata: bool,
    source_exif: Option<&[u8]>,
) -> Result<Vec<u8>, CodecError> {
    let rgba = img.to_rgba8();
    let encoder = webp::Encoder::from_rgba(&rgba, img.width(), img.height());

    let data = if quality >= 100 {
        // Lossless mode does not hit the partition-size limits the lossy
        // encoder can run into, so no retry ladder is needed.
        encoder.encode_lossless().to_vec()
    } else {
        lossy_webp(&encoder, quality)?
    };

    if !strip_metadata {
        if let Some(exif) = source_exif.filter(|e| !e.is_empty()) {
            return Ok(embed_webp_exif(&data, exif, img.width(), img.height()));
        }
    }
    Ok(data)
}

fn lossy_webp(encoder: &webp::Encoder<'_>, quality: u8) -> Result<Vec<u8>, CodecError> {
    let mut config = webp::WebPConfig::new().map_err(|_| CodecError::Hard {
        format: "webp",
        message: "failed to create encoder config".to_string(),
    })?;
    config.quality = quality as f32;
    config.lossless = 0;

    // Some frames fail at low reduction efforts but encode fine at higher
    // ones; walk the ladder and keep the first success.
    let mut last: Option<CodecError> = None;
    for effort in 0..=WEBP_MAX_REDUCTION_EFFORT {
        config.method = effort;
        match encoder.encode_advanced(&config) {
            Ok(mem) => return Ok(mem.to_vec()),
            Err(err) => {
                let classified = classify_webp_error(err);
                if classified.is_unencodable() {
                    tracing::warn!(
                        effort,
                        error = %classified,
                        "WebP encode failed, retrying at higher reduction effort"
                    );
                    last = Some(classified);
                } else {
                    return Err(classified);
                }
            }
        }
    }

    Err(last.unwrap_or(CodecError::Unencodable {
        format: "webp",
        message: "exhausted reduction efforts".to_string(),
    }))
}

const RIFF_HEADER_LEN: usize = 12;
const VP8X_EXIF_FLAG: u8 = 0x08;
const VP8X_ALPHA_FLAG: u8 = 0x10;

/// Append an EXIF chunk to a WebP container, inserting the VP8X
/// extended-format header when the encoder produced a plain VP8/VP8L
/// file. Chunk order per the container spec: VP8X, image data, EXIF.
fn embed_webp_exif(webp: &[u8], exif: &[u8], width: u32, height: u32) -> Vec<u8> {
    if webp.len() < RIFF_HEADER_LEN || &webp[0..4] != b"RIFF" || &webp[8..12] != b"WEBP" {
        return webp.to_vec();
    }
    let body = &webp[RIFF_HEADER_LEN..];

    let mut out = Vec::with_capacity(webp.len() + exif.len() + 30);
    out.extend_from_slice(&webp[0..RIFF_HEADER_LEN]);

    if body.len() >= 9 && &body[0..4] == b"VP8X" {
        out.extend_from_slice(body);
        // Flags byte sits right after the 8-byte chunk header.
        out[RIFF_HEADER_LEN + 8] |= VP8X_EXIF_FLAG;
    } else {
        let mut flags = VP8X_EXIF_FLAG;
        if lossless_has_alpha(body) {
            flags |= VP8X_ALPHA_FLAG;
        }
        out.extend_from_slice(b"VP8X");
        out.extend_from_slice(&10u32.to_le_bytes());
        out.push(flags);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&(width.saturating_sub(1)).to_le_bytes()[0..3]);
        out.extend_from_slice(&(height.saturating_sub(1)).to_le_bytes()[0..3]);
        out.extend_from_slice(body);
    }

    out.extend_from_slice(b"EXIF");
    out.extend_from_slice(&(exif.len() as u32).to_le_bytes());
    out.extend_from_slice(exif);
    if exif.len() % 2 == 1 {
        out.push(0);
    }

    let riff_size = (out.len() - 8) as u32;
    out[4..8].copy_from_slice(&riff_size.to_le_bytes());
    out
}

/// Alpha-used bit of a VP8L bitstream header.
fn lossless_has_alpha(body: &[u8]) -> bool {
    if body.len() >= 13 && &body[0..4] == b"VP8L" && body[8] == 0x2F {
        let header = u32::from_le_bytes([body[9], body[10], body[11], body[12]]);
        (header >> 28) & 1 == 1
    } else {
        false
    }
}

fn classify_webp_error(err: webp::WebPEncodingError) -> CodecError {
    use webp::WebPEncodingError::*;
    match err {
        // Bitstream-size failures are the cases a higher reduction
        // effort can rescue.
        VP8_ENC_ERROR_PARTITION0_OVERFLOW
        | VP8_ENC_ERROR_PARTITION_OVERFLOW
        | VP8_ENC_ERROR_FILE_TOO_BIG => CodecError::Unencodable {
            format: "webp",
            message: format!("{:?}", err),
        },
        other => CodecError::Hard {
            format: "webp",
            message: format!("{:?}", other),
        },
    }
}

fn encode_avif(
    img: &DynamicImage,
    quality: u8,
    strip_metadata: bool,
    source_exif: Option<&[u8]>,
) -> Result<Vec<u8>, CodecError> {
    if !strip_metadata && source_exif.is_some() {
        // The AV1 serializer writes no metadata boxes, so AVIF output is
        // pixels-only; a preserve request degrades to a stripped file.
        tracing::debug!("AVIF output cannot carry source metadata");
    }

    let rgba = img.to_rgba8();
    let pixels: Vec<rgb::RGBA<u8>> = rgba
        .chunks_exact(4)
        .map(|c| rgb::RGBA::new(c[0], c[1], c[2], c[3]))
        .collect();
    let img_ref = imgref::Img::new(
        pixels.as_slice(),
        img.width() as usize,
        img.height() as usize,
    );

    let effective = if quality >= 100 { 100.0 } else { quality as f32 };
    let encoder = ravif::Encoder::new()
        .with_quality(effective)
        .with_alpha_quality(effective)
        .with_speed(6);

    let result = encoder.encode_rgba(img_ref).map_err(|e| CodecError::Hard {
        format: "avif",
        message: e.to_string(),
    })?;
    Ok(result.avif_file)
}

fn encode_jxl(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, CodecError> {
    use jpegxl_rs::encode::EncoderSpeed;

    let rgb = img.to_rgb8();
    let lossless = quality >= 100;

    // Lightning is effort 1, the fastest encode tier.
    let mut encoder = jpegxl_rs::encoder_builder()
        .speed(EncoderSpeed::Lightning)
        .decoding_speed(JXL_TIER)
        .quality(JXL_DISTANCE)
        .lossless(lossless)
        .build()
        .map_err(|e| CodecError::Hard {
            format: "jxl",
            message: e.to_string(),
        })?;

    let result = encoder
        .encode::<u8, u8>(rgb.as_raw(), img.width(), img.height())
        .map_err(|e| CodecError::Hard {
            format: "jxl",
            message: e.to_string(),
        })?;

    Ok(result.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x * 7 % 256) as u8, (y * 13 % 256) as u8, 128, 255])
        });
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn test_webp_lossy_produces_riff_container() {
        let data = encode(&gradient(32, 32), TargetFormat::Webp, 80, true, None).unwrap();
        assert_eq!(&data[0..4], b"RIFF");
        assert_eq!(&data[8..12], b"WEBP");
    }

    #[test]
    fn test_webp_quality_100_takes_lossless_path() {
        let lossless = encode(&gradient(32, 32), TargetFormat::Webp, 100, true, None).unwrap();
        assert_eq!(&lossless[0..4], b"RIFF");
        // VP8L chunk marks the lossless bitstream.
        assert_eq!(&lossless[12..16], b"VP8L");
    }

    #[test]
    fn test_avif_produces_ftyp_box() {
        let data = encode(&gradient(16, 16), TargetFormat::Avif, 70, true, None).unwrap();
        assert!(data.len() > 12);
        assert_eq!(&data[4..8], b"ftyp");
    }

    #[test]
    fn test_jxl_produces_output() {
        let data = encode(&gradient(16, 16), TargetFormat::Jxl, 80, true, None).unwrap();
        assert!(!data.is_empty());
    }

    #[test]
    fn test_lossy_webp_smaller_than_lossless_on_photographic_input() {
        let img = gradient(128, 128);
        let lossy = encode(&img, TargetFormat::Webp, 50, true, None).unwrap();
        let lossless = encode(&img, TargetFormat::Webp, 100, true, None).unwrap();
        assert!(lossy.len() < lossless.len());
    }

    fn find_chunk<'a>(webp: &'a [u8], fourcc: &[u8; 4]) -> Option<&'a [u8]> {
        let mut pos = 12;
        while pos + 8 <= webp.len() {
            let size = u32::from_le_bytes([
                webp[pos + 4],
                webp[pos + 5],
                webp[pos + 6],
                webp[pos + 7],
            ]) as usize;
            if &webp[pos..pos + 4] == fourcc {
                return Some(&webp[pos + 8..pos + 8 + size]);
            }
            pos += 8 + size + (size % 2);
        }
        None
    }

    #[test]
    fn test_webp_carries_exif_when_preserving() {
        let exif = b"II*\0preserved-block".to_vec();
        let data = encode(&gradient(32, 32), TargetFormat::Webp, 80, false, Some(&exif)).unwrap();

        // Extended container with the EXIF flag set and the block intact.
        assert_eq!(&data[12..16], b"VP8X");
        assert_ne!(data[20] & VP8X_EXIF_FLAG, 0);
        assert_eq!(find_chunk(&data, b"EXIF").unwrap(), exif.as_slice());

        // RIFF size field accounts for the appended chunks.
        let riff_size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        assert_eq!(riff_size, data.len() - 8);
    }

    #[test]
    fn test_webp_strip_metadata_omits_exif_chunk() {
        let exif = b"II*\0to-be-dropped".to_vec();
        let data = encode(&gradient(32, 32), TargetFormat::Webp, 80, true, Some(&exif)).unwrap();
        assert!(find_chunk(&data, b"EXIF").is_none());
        assert!(find_chunk(&data, b"VP8X").is_none());
    }

    #[test]
    fn test_webp_lossless_carries_exif_too() {
        let exif = b"II*\0lossless".to_vec();
        let data = encode(&gradient(32, 32), TargetFormat::Webp, 100, false, Some(&exif)).unwrap();
        assert_eq!(&data[12..16], b"VP8X");
        assert_eq!(find_chunk(&data, b"EXIF").unwrap(), exif.as_slice());
    }

    #[test]
    fn test_embed_pads_odd_exif_payload() {
        let plain = encode(&gradient(16, 16), TargetFormat::Webp, 80, true, None).unwrap();
        let odd = b"II*\0odd".to_vec();
        assert_eq!(odd.len() % 2, 1);

        let data = embed_webp_exif(&plain, &odd, 16, 16);
        assert_eq!(data.len() % 2, 0);
        assert_eq!(find_chunk(&data, b"EXIF").unwrap(), odd.as_slice());
    }

    #[test]
    fn test_embed_leaves_non_riff_input_alone() {
        let garbage = b"not a webp at all".to_vec();
        assert_eq!(embed_webp_exif(&garbage, b"II*\0", 1, 1), garbage);
    }

    #[test]
    fn test_codec_error_classes() {
        let retryable = CodecError::Unencodable {
            format: "webp",
            message: "partition overflow".to_string(),
        };
        let hard = CodecError::Hard {
            format: "avif",
            message: "boom".to_string(),
        };
        assert!(retryable.is_unencodable());
        assert!(!hard.is_unencodable());
        assert!(retryable.to_string().contains("unable to encode"));
    }

    #[test]
    fn test_target_format_metadata() {
        assert_eq!(TargetFormat::Webp.extension(), "webp");
        assert_eq!(TargetFormat::Avif.content_type(), "image/avif");
        assert_eq!(TargetFormat::Jxl.extension(), "jxl");
    }
}
