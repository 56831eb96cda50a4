//! Resize policy
//!
//! Applies the request's resize tuple to a decoded image:
//! - `max_width`/`max_height` only shrink, preserving aspect ratio, along
//!   the more-exceeded axis when both are set;
//! - `width` + `height` together thumbnail with the configured crop
//!   gravity;
//! - a single `width` or `height` fits that axis, preserving ratio.
//!
//! Scaling goes through fast-image-resize with a Lanczos3 filter.

use fast_image_resize::{FilterType, Image, PixelType, ResizeAlg, Resizer};
use image::DynamicImage;
use std::num::NonZeroU32;

use crate::config::CropGravity;
use crate::fingerprint::ResizeParams;
use crate::processor::codec::CodecError;

fn resize_error(message: impl Into<String>) -> CodecError {
    CodecError::Hard {
        format: "resize",
        message: message.into(),
    }
}

/// Apply the resize policy. A no-op tuple returns the image unchanged.
pub fn apply_resize(
    img: DynamicImage,
    params: &ResizeParams,
    gravity: CropGravity,
) -> Result<DynamicImage, CodecError> {
    if params.is_noop() {
        return Ok(img);
    }

    let src_width = img.width();
    let src_height = img.height();
    let ratio = src_height as f32 / src_width as f32;
    let mut img = img;

    if params.max_height > 0 && params.max_width > 0 {
        if src_height > params.max_height || src_width > params.max_width {
            let height_exceed = src_height as f32 / params.max_height as f32;
            let width_exceed = src_width as f32 / params.max_width as f32;
            if height_exceed > width_exceed {
                let new_width = ((params.max_height as f32 / ratio) as u32).max(1);
                img = scale_to(&img, new_width, params.max_height)?;
            } else {
                let new_height = ((params.max_width as f32 * ratio) as u32).max(1);
                img = scale_to(&img, params.max_width, new_height)?;
            }
        }
    }

    if params.max_height > 0 && src_height > params.max_height && params.max_width == 0 {
        let new_width = ((params.max_height as f32 / ratio) as u32).max(1);
        img = scale_to(&img, new_width, params.max_height)?;
    }

    if params.max_width > 0 && src_width > params.max_width && params.max_height == 0 {
        let new_height = ((params.max_width as f32 * ratio) as u32).max(1);
        img = scale_to(&img, params.max_width, new_height)?;
    }

    if params.width > 0 && params.height > 0 {
        img = thumbnail_with_gravity(&img, params.width, params.height, gravity)?;
    }

    if params.width > 0 && params.height == 0 {
        let new_height = ((params.width as f32 * ratio) as u32).max(1);
        img = scale_to(&img, params.width, new_height)?;
    }

    if params.height > 0 && params.width == 0 {
        let new_width = ((params.height as f32 / ratio) as u32).max(1);
        img = scale_to(&img, new_width, params.height)?;
    }

    Ok(img)
}

/// Exact scale through fast-image-resize (Lanczos3).
fn scale_to(img: &DynamicImage, target_w: u32, target_h: u32) -> Result<DynamicImage, CodecError> {
    if img.width() == target_w && img.height() == target_h {
        return Ok(img.clone());
    }

    let src_width = NonZeroU32::new(img.width()).ok_or_else(|| resize_error("source width is 0"))?;
    let src_height =
        NonZeroU32::new(img.height()).ok_or_else(|| resize_error("source height is 0"))?;
    let dst_width = NonZeroU32::new(target_w).ok_or_else(|| resize_error("target width is 0"))?;
    let dst_height = NonZeroU32::new(target_h).ok_or_else(|| resize_error("target height is 0"))?;

    let src_image = Image::from_vec_u8(
        src_width,
        src_height,
        img.to_rgba8().into_raw(),
        PixelType::U8x4,
    )
    .map_err(|e| resize_error(format!("source buffer: {:?}", e)))?;

    let mut dst_image = Image::new(dst_width, dst_height, PixelType::U8x4);
    let mut resizer = Resizer::new(ResizeAlg::Convolution(FilterType::Lanczos3));
    resizer
        .resize(&src_image.view(), &mut dst_image.view_mut())
        .map_err(|e| resize_error(format!("resize failed: {:?}", e)))?;

    let rgba = image::RgbaImage::from_raw(target_w, target_h, dst_image.into_vec())
        .ok_or_else(|| resize_error("output buffer size mismatch"))?;
    Ok(DynamicImage::ImageRgba8(rgba))
}

/// Thumbnail to exactly `target_w` x `target_h`, cropping per gravity.
fn thumbnail_with_gravity(
    img: &DynamicImage,
    target_w: u32,
    target_h: u32,
    gravity: CropGravity,
) -> Result<DynamicImage, CodecError> {
    match gravity {
        // No cropping: fit the whole image inside the box, ratio kept.
        CropGravity::None => {
            let (fit_w, fit_h) = contain_dimensions(img.width(), img.height(), target_w, target_h);
            scale_to(img, fit_w, fit_h)
        }
        // Squeeze the whole image into the box.
        CropGravity::All => scale_to(img, target_w, target_h),
        _ => {
            let (cover_w, cover_h) =
                cover_dimensions(img.width(), img.height(), target_w, target_h);
            let scaled = scale_to(img, cover_w, cover_h)?;
            let max_x = cover_w.saturating_sub(target_w);
            let max_y = cover_h.saturating_sub(target_h);
            let (crop_x, crop_y) = match gravity {
                CropGravity::Centre => (max_x / 2, max_y / 2),
                CropGravity::Low => (0, 0),
                CropGravity::High => (max_x, max_y),
                CropGravity::Entropy => {
                    scan_crop_offset(&scaled, target_w, target_h, region_variance)
                }
                // Attention biases the entropy score toward the middle of
                // the frame, approximating saliency.
                _ => scan_crop_offset(&scaled, target_w, target_h, region_attention),
            };
            Ok(scaled.crop_imm(crop_x, crop_y, target_w, target_h))
        }
    }
}

fn contain_dimensions(src_w: u32, src_h: u32, target_w: u32, target_h: u32) -> (u32, u32) {
    let src_aspect = src_w as f32 / src_h as f32;
    let target_aspect = target_w as f32 / target_h as f32;
    if src_aspect > target_aspect {
        (target_w.max(1), ((target_w as f32 / src_aspect) as u32).max(1))
    } else {
        (((target_h as f32 * src_aspect) as u32).max(1), target_h.max(1))
    }
}

fn cover_dimensions(src_w: u32, src_h: u32, target_w: u32, target_h: u32) -> (u32, u32) {
    let src_aspect = src_w as f32 / src_h as f32;
    let target_aspect = target_w as f32 / target_h as f32;
    if src_aspect > target_aspect {
        (
            ((target_h as f32 * src_aspect).ceil() as u32).max(target_w),
            target_h.max(1),
        )
    } else {
        (
            target_w.max(1),
            ((target_w as f32 / src_aspect).ceil() as u32).max(target_h),
        )
    }
}

type RegionScore = fn(&image::RgbaImage, u32, u32, u32, u32) -> f32;

/// Slide a sampling grid over possible crop origins and keep the window
/// with the best score.
fn scan_crop_offset(
    img: &DynamicImage,
    target_w: u32,
    target_h: u32,
    score: RegionScore,
) -> (u32, u32) {
    let src_w = img.width();
    let src_h = img.height();
    if src_w <= target_w && src_h <= target_h {
        return (0, 0);
    }

    let rgba = img.to_rgba8();
    let max_x = src_w.saturating_sub(target_w);
    let max_y = src_h.saturating_sub(target_h);
    let step_x = (max_x / 5).max(1);
    let step_y = (max_y / 5).max(1);

    let mut best_offset = (max_x / 2, max_y / 2);
    let mut best_score = f32::MIN;

    let mut x = 0;
    while x <= max_x {
        let mut y = 0;
        while y <= max_y {
            let s = score(&rgba, x, y, target_w, target_h);
            if s > best_score {
                best_score = s;
                best_offset = (x, y);
            }
            y += step_y;
        }
        x += step_x;
    }

    best_offset
}

/// Per-channel variance over a sparsely sampled window; a cheap entropy
/// proxy, higher means more detail.
fn region_variance(img: &image::RgbaImage, x: u32, y: u32, width: u32, height: u32) -> f32 {
    let sample_step = 4;
    let mut sum = [0u64; 3];
    let mut sum_sq = [0u64; 3];
    let mut count = 0u64;

    let mut py = y;
    while py < y + height && py < img.height() {
        let mut px = x;
        while px < x + width && px < img.width() {
            let pixel = img.get_pixel(px, py);
            for c in 0..3 {
                let v = pixel[c] as u64;
                sum[c] += v;
                sum_sq[c] += v * v;
            }
            count += 1;
            px += sample_step;
        }
        py += sample_step;
    }

    if count == 0 {
        return 0.0;
    }

    (0..3)
        .map(|c| {
            (sum_sq[c] as f32 / count as f32) - (sum[c] as f32 / count as f32).powi(2)
        })
        .sum()
}

/// Variance weighted by distance from the image center.
fn region_attention(img: &image::RgbaImage, x: u32, y: u32, width: u32, height: u32) -> f32 {
    let variance = region_variance(img, x, y, width, height);

    let window_cx = x as f32 + width as f32 / 2.0;
    let window_cy = y as f32 + height as f32 / 2.0;
    let img_cx = img.width() as f32 / 2.0;
    let img_cy = img.height() as f32 / 2.0;

    let dx = (window_cx - img_cx) / img.width().max(1) as f32;
    let dy = (window_cy - img_cy) / img.height().max(1) as f32;
    let centrality = 1.0 / (1.0 + dx * dx + dy * dy);

    variance * centrality
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(width: u32, height: u32) -> DynamicImage {
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                image::Rgba([255, 255, 255, 255])
            } else {
                image::Rgba([0, 0, 0, 255])
            }
        });
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn test_noop_params_leave_dimensions() {
        let img = checkerboard(100, 50);
        let out = apply_resize(img, &ResizeParams::default(), CropGravity::Attention).unwrap();
        assert_eq!((out.width(), out.height()), (100, 50));
    }

    #[test]
    fn test_both_max_bounds_scale_by_more_exceeded_axis() {
        // 400x200 into max 100x100: width exceeds 4x, height 2x -> fit width.
        let img = checkerboard(400, 200);
        let params = ResizeParams {
            max_width: 100,
            max_height: 100,
            ..Default::default()
        };
        let out = apply_resize(img, &params, CropGravity::Centre).unwrap();
        assert_eq!(out.width(), 100);
        assert_eq!(out.height(), 50);
    }

    #[test]
    fn test_max_bounds_do_not_enlarge() {
        let img = checkerboard(80, 40);
        let params = ResizeParams {
            max_width: 200,
            max_height: 200,
            ..Default::default()
        };
        let out = apply_resize(img, &params, CropGravity::Centre).unwrap();
        assert_eq!((out.width(), out.height()), (80, 40));
    }

    #[test]
    fn test_max_height_alone_fits_height() {
        let img = checkerboard(100, 200);
        let params = ResizeParams {
            max_height: 50,
            ..Default::default()
        };
        let out = apply_resize(img, &params, CropGravity::Centre).unwrap();
        assert_eq!(out.height(), 50);
        assert_eq!(out.width(), 25);
    }

    #[test]
    fn test_width_and_height_thumbnail_exact() {
        let img = checkerboard(300, 200);
        let params = ResizeParams {
            width: 64,
            height: 64,
            ..Default::default()
        };
        for gravity in [
            CropGravity::Centre,
            CropGravity::Entropy,
            CropGravity::Attention,
            CropGravity::Low,
            CropGravity::High,
            CropGravity::All,
        ] {
            let out = apply_resize(img.clone(), &params, gravity).unwrap();
            assert_eq!((out.width(), out.height()), (64, 64), "{:?}", gravity);
        }
    }

    #[test]
    fn test_gravity_none_fits_without_crop() {
        let img = checkerboard(300, 200);
        let params = ResizeParams {
            width: 60,
            height: 60,
            ..Default::default()
        };
        let out = apply_resize(img, &params, CropGravity::None).unwrap();
        // Whole image preserved: 300x200 contained in 60x60 is 60x40.
        assert_eq!((out.width(), out.height()), (60, 40));
    }

    #[test]
    fn test_single_width_keeps_ratio() {
        let img = checkerboard(200, 100);
        let params = ResizeParams {
            width: 50,
            ..Default::default()
        };
        let out = apply_resize(img, &params, CropGravity::Centre).unwrap();
        assert_eq!((out.width(), out.height()), (50, 25));
    }

    #[test]
    fn test_single_height_keeps_ratio() {
        let img = checkerboard(200, 100);
        let params = ResizeParams {
            height: 50,
            ..Default::default()
        };
        let out = apply_resize(img, &params, CropGravity::Centre).unwrap();
        assert_eq!((out.width(), out.height()), (100, 50));
    }

    #[test]
    fn test_entropy_scan_prefers_detailed_region() {
        // Flat image with a detailed band on the right side.
        let img = image::RgbaImage::from_fn(300, 100, |x, y| {
            if x >= 200 && (x + y) % 2 == 0 {
                image::Rgba([255, 255, 255, 255])
            } else {
                image::Rgba([10, 10, 10, 255])
            }
        });
        let dynamic = DynamicImage::ImageRgba8(img);
        let (x, _) = scan_crop_offset(&dynamic, 100, 100, region_variance);
        assert!(x >= 160, "expected crop pulled right, got x={}", x);
    }
}
