//! NEF intermediate conversion
//!
//! NEF files are TIFF containers that carry full-size JPEG previews. The
//! gateway does not demosaic raw sensor data; it extracts the largest
//! embedded JPEG and feeds that to the encoders instead. The intermediate
//! file is deleted by the processor once the encode finishes.

use std::path::{Path, PathBuf};

/// Smallest embedded stream worth treating as a preview.
const MIN_PREVIEW_BYTES: usize = 128;

pub fn is_nef(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("nef"))
        .unwrap_or(false)
}

/// Extract the largest embedded JPEG from `raw` into `workdir`.
///
/// Returns the intermediate path, or `None` when no preview is found; the
/// caller then continues with the original file.
pub fn extract_preview_jpeg(raw: &Path, workdir: &Path) -> Option<PathBuf> {
    let bytes = std::fs::read(raw).ok()?;
    let preview = largest_jpeg_stream(&bytes)?;

    let stem = raw.file_stem()?.to_string_lossy();
    let out = workdir.join(format!("{}_preview.jpg", stem));
    std::fs::create_dir_all(workdir).ok()?;
    std::fs::write(&out, preview).ok()?;

    tracing::info!(
        raw = %raw.display(),
        preview = %out.display(),
        bytes = preview.len(),
        "extracted embedded NEF preview"
    );
    Some(out)
}

/// Largest SOI..EOI span in the buffer.
fn largest_jpeg_stream(bytes: &[u8]) -> Option<&[u8]> {
    let mut best: Option<&[u8]> = None;

    let mut i = 0;
    while i + 3 < bytes.len() {
        // SOI followed by another marker byte.
        if bytes[i] == 0xFF && bytes[i + 1] == 0xD8 && bytes[i + 2] == 0xFF {
            if let Some(end) = find_eoi(bytes, i + 2) {
                let candidate = &bytes[i..end + 2];
                if candidate.len() >= MIN_PREVIEW_BYTES
                    && best.map(|b| candidate.len() > b.len()).unwrap_or(true)
                {
                    best = Some(candidate);
                }
                i = end + 2;
                continue;
            }
        }
        i += 1;
    }

    best
}

fn find_eoi(bytes: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < bytes.len() {
        if bytes[i] == 0xFF && bytes[i + 1] == 0xD9 {
            return Some(i);
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tiny_jpeg() -> Vec<u8> {
        let img = image::RgbaImage::from_fn(16, 16, |x, y| {
            image::Rgba([(x * 16) as u8, (y * 16) as u8, 77, 255])
        });
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, image::ImageFormat::Jpeg)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_is_nef_case_insensitive() {
        assert!(is_nef(Path::new("/x/shot.NEF")));
        assert!(is_nef(Path::new("/x/shot.nef")));
        assert!(!is_nef(Path::new("/x/shot.jpg")));
    }

    #[test]
    fn test_extracts_embedded_jpeg_from_padding() {
        let dir = TempDir::new().unwrap();
        let jpeg = tiny_jpeg();

        // Fake NEF: TIFF-ish header, padding, embedded JPEG, trailer.
        let mut container = Vec::new();
        container.extend_from_slice(b"II*\x00");
        container.extend(std::iter::repeat(0u8).take(512));
        container.extend_from_slice(&jpeg);
        container.extend(std::iter::repeat(0xEEu8).take(256));

        let raw = dir.path().join("shot.nef");
        std::fs::write(&raw, &container).unwrap();

        let preview = extract_preview_jpeg(&raw, dir.path()).expect("preview extracted");
        let decoded = image::open(&preview).expect("preview decodes");
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[test]
    fn test_picks_largest_of_multiple_streams() {
        let small = tiny_jpeg();
        let large = {
            let img = image::RgbaImage::from_fn(64, 64, |x, y| {
                image::Rgba([(x * 4) as u8, (y * 4) as u8, 3, 255])
            });
            let mut buf = std::io::Cursor::new(Vec::new());
            image::DynamicImage::ImageRgba8(img)
                .write_to(&mut buf, image::ImageFormat::Jpeg)
                .unwrap();
            buf.into_inner()
        };

        let mut container = Vec::new();
        container.extend_from_slice(&small);
        container.extend(std::iter::repeat(0u8).take(64));
        container.extend_from_slice(&large);

        let best = largest_jpeg_stream(&container).unwrap();
        assert_eq!(best.len(), large.len());
    }

    #[test]
    fn test_no_preview_in_garbage() {
        assert!(largest_jpeg_stream(&[0u8; 1024]).is_none());
    }
}
