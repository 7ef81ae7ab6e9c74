// src/engine/analysis.rs
//
// Content analysis: saliency-driven smart crop and uniform-border detection.

use crate::engine::color::convert_colorspace;
use crate::engine::handle::{ImageHandle, Interpretation};
use crate::engine::raster::Raster;
use crate::engine::resize::box_resize;
use crate::engine::transform::{background_bands, extract_area};
use crate::error::PixformError;
use crate::ops::Color;
use image::{DynamicImage, GrayImage, RgbImage};
use tracing::debug;

type AnalysisResult<T> = std::result::Result<T, PixformError>;

/// Longest side of the saliency map; larger images are box-reduced first.
const SALIENCY_MAX_SIDE: u32 = 256;

/// Bounding box of non-background content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TrimBox {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl TrimBox {
    /// True when no content was found.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Display colours for scoring; ink, Lab, XYZ and linear rasters go through sRGB first.
fn display_rgb(handle: &ImageHandle) -> AnalysisResult<RgbImage> {
    match handle.interpretation() {
        Interpretation::Srgb
        | Interpretation::Rgb16
        | Interpretation::BW
        | Interpretation::Grey16
        | Interpretation::Multiband => Ok(handle.pixels().to_rgb8()),
        _ => Ok(convert_colorspace(handle.clone(), Interpretation::Srgb)?
            .pixels()
            .to_rgb8()),
    }
}

/// Crops to `width`x`height` around the most salient region.
///
/// Saliency combines edge strength, local contrast and colour saturation. Among
/// equally scored windows the one closest to the image centre wins, so the
/// result is deterministic.
pub fn smart_crop(handle: ImageHandle, width: u32, height: u32) -> AnalysisResult<ImageHandle> {
    if width == 0 || height == 0 {
        return Err(PixformError::invalid_argument(
            "smart_crop",
            "size",
            format!("{width}x{height}"),
            "crop dimensions must be positive",
        ));
    }
    let (src_w, src_h) = handle.dimensions();
    if width > src_w || height > src_h {
        return Err(PixformError::out_of_bounds(
            "smart_crop",
            (0, 0),
            (width, height),
            (src_w, src_h),
        ));
    }
    if (width, height) == (src_w, src_h) {
        return Ok(handle);
    }

    let scale = src_w.max(src_h).div_ceil(SALIENCY_MAX_SIDE).max(1);
    let small_w = src_w.div_ceil(scale);
    let small_h = src_h.div_ceil(scale);
    let small = box_resize(&DynamicImage::ImageRgb8(display_rgb(&handle)?), small_w, small_h)?
        .to_rgb8();
    let table = SummedArea::new(&saliency_map(&small), small_w, small_h);

    let win_w = ((width as f64 / scale as f64).round() as u32).clamp(1, small_w);
    let win_h = ((height as f64 / scale as f64).round() as u32).clamp(1, small_h);
    let centre = (small_w as f64 / 2.0, small_h as f64 / 2.0);

    let mut best = (f64::NEG_INFINITY, f64::INFINITY, 0u32, 0u32);
    for y in 0..=small_h - win_h {
        for x in 0..=small_w - win_w {
            let score = table.sum(x, y, win_w, win_h);
            let dx = x as f64 + win_w as f64 / 2.0 - centre.0;
            let dy = y as f64 + win_h as f64 / 2.0 - centre.1;
            let distance = dx * dx + dy * dy;
            let eps = if best.0.is_finite() { 1e-9 * best.0.abs().max(1.0) } else { 0.0 };
            if score > best.0 + eps || ((score - best.0).abs() <= eps && distance < best.1) {
                best = (score, distance, x, y);
            }
        }
    }

    let left = (best.2 * scale).min(src_w - width);
    let top = (best.3 * scale).min(src_h - height);
    debug!(target: "pixform::pipeline", left, top, width, height, score = best.0, "smart_crop");
    extract_area(handle, left, top, width, height)
}

/// Per-pixel interest: gradient magnitude, 3x3 standard deviation and saturation.
fn saliency_map(rgb: &RgbImage) -> Vec<f64> {
    let (w, h) = rgb.dimensions();
    let luma = GrayImage::from_fn(w, h, |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        image::Luma([(0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8])
    });
    let at = |x: i64, y: i64| -> f64 {
        let x = x.clamp(0, w as i64 - 1) as u32;
        let y = y.clamp(0, h as i64 - 1) as u32;
        luma.get_pixel(x, y).0[0] as f64
    };

    let mut map = Vec::with_capacity(w as usize * h as usize);
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let gx = at(x + 1, y) - at(x - 1, y);
            let gy = at(x, y + 1) - at(x, y - 1);
            let edge = (gx * gx + gy * gy).sqrt();

            let (mut sum, mut sum_sq) = (0.0, 0.0);
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let v = at(x + dx, y + dy);
                    sum += v;
                    sum_sq += v * v;
                }
            }
            let mean = sum / 9.0;
            let deviation = (sum_sq / 9.0 - mean * mean).max(0.0).sqrt();

            let [r, g, b] = rgb.get_pixel(x as u32, y as u32).0;
            let saturation = (r.max(g).max(b) - r.min(g).min(b)) as f64;

            map.push(edge * 0.6 + deviation * 0.4 + saturation * 0.2);
        }
    }
    map
}

/// Summed-area table for O(1) window sums.
struct SummedArea {
    stride: usize,
    sums: Vec<f64>,
}

impl SummedArea {
    fn new(values: &[f64], width: u32, height: u32) -> Self {
        let stride = width as usize + 1;
        let mut sums = vec![0.0; stride * (height as usize + 1)];
        for y in 0..height as usize {
            let mut row = 0.0;
            for x in 0..width as usize {
                row += values[y * width as usize + x];
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Self { stride, sums }
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> f64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        self.sums[y1 * self.stride + x1] - self.sums[y0 * self.stride + x1]
            - self.sums[y1 * self.stride + x0]
            + self.sums[y0 * self.stride + x0]
    }
}

/// Finds the bounding box of pixels that differ from `background` by more than
/// `threshold` (8-bit units, per band) after compositing any alpha onto it.
///
/// An image that is background everywhere yields an empty box at the origin.
pub fn find_trim(handle: &ImageHandle, background: Color, threshold: f64) -> AnalysisResult<TrimBox> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(PixformError::invalid_argument(
            "find_trim",
            "threshold",
            threshold,
            "threshold must be a non-negative number",
        ));
    }

    let raster = Raster::from_image(handle.pixels());
    let max = raster.max_value();
    let colour_bands = if handle.has_alpha() { raster.bands - 1 } else { raster.bands };
    let bg = background_bands(handle.interpretation(), colour_bands, max, background);
    let limit = threshold as f32 * max / 255.0;

    let is_content = |px: &[f32]| {
        let alpha = if colour_bands < px.len() {
            (px[colour_bands] / max).clamp(0.0, 1.0)
        } else {
            1.0
        };
        px[..colour_bands]
            .iter()
            .zip(&bg)
            .any(|(&v, &b)| ((v * alpha + b * (1.0 - alpha)) - b).abs() > limit)
    };

    let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0, 0);
    for y in 0..raster.height {
        for x in 0..raster.width {
            if is_content(raster.pixel(x, y)) {
                min_x = min_x.min(x);
                max_x = max_x.max(x);
                min_y = min_y.min(y);
                max_y = max_y.max(y);
            }
        }
    }

    if min_x == u32::MAX {
        return Ok(TrimBox::default());
    }
    Ok(TrimBox {
        left: min_x,
        top: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    })
}

/// Crops away a uniform border. An all-background image is returned unchanged.
pub fn trim(handle: ImageHandle, background: Color, threshold: f64) -> AnalysisResult<ImageHandle> {
    let bounds = find_trim(&handle, background, threshold)?;
    if bounds.is_empty() {
        debug!(target: "pixform::pipeline", "trim found no content");
        return Ok(handle);
    }
    extract_area(handle, bounds.left, bounds.top, bounds.width, bounds.height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::FormatTag;
    use image::{GrayAlphaImage, LumaA, Rgb, Rgba, RgbaImage};

    fn bordered(width: u32, height: u32, inner: (u32, u32, u32, u32)) -> ImageHandle {
        let (l, t, w, h) = inner;
        ImageHandle::from_image(DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            if x >= l && x < l + w && y >= t && y < t + h {
                Rgb([200, 30, 30])
            } else {
                Rgb([250, 250, 250])
            }
        })))
    }

    mod trim_tests {
        use super::*;

        #[test]
        fn finds_content_box() {
            let img = bordered(20, 10, (3, 2, 5, 4));
            let found = find_trim(&img, Color::new(255, 255, 255), 10.0).unwrap();
            assert_eq!(found, TrimBox { left: 3, top: 2, width: 5, height: 4 });
        }

        #[test]
        fn threshold_controls_sensitivity() {
            let img = bordered(20, 10, (3, 2, 5, 4));
            // Border differs from pure white by 5; below threshold 10 it is background,
            // above threshold 2 it is content.
            let strict = find_trim(&img, Color::WHITE, 2.0).unwrap();
            assert_eq!(strict, TrimBox { left: 0, top: 0, width: 20, height: 10 });
        }

        #[test]
        fn trim_then_find_trim_is_idempotent() {
            let img = bordered(30, 20, (4, 5, 10, 6));
            let trimmed = trim(img, Color::WHITE, 10.0).unwrap();
            assert_eq!(trimmed.dimensions(), (10, 6));
            let again = find_trim(&trimmed, Color::WHITE, 10.0).unwrap();
            assert_eq!(again, TrimBox { left: 0, top: 0, width: 10, height: 6 });
        }

        #[test]
        fn all_background_is_empty() {
            let img = bordered(8, 8, (0, 0, 0, 0));
            let found = find_trim(&img, Color::WHITE, 10.0).unwrap();
            assert!(found.is_empty());
            assert_eq!(trim(img, Color::WHITE, 10.0).unwrap().dimensions(), (8, 8));
        }

        #[test]
        fn transparent_pixels_count_as_background() {
            let img = ImageHandle::from_image(DynamicImage::ImageRgba8(RgbaImage::from_fn(6, 6, |x, y| {
                if (2..4).contains(&x) && (1..3).contains(&y) {
                    Rgba([0, 0, 0, 255])
                } else {
                    Rgba([0, 0, 0, 0])
                }
            })));
            let found = find_trim(&img, Color::WHITE, 5.0).unwrap();
            assert_eq!(found, TrimBox { left: 2, top: 1, width: 2, height: 2 });
        }

        #[test]
        fn grey_alpha_compares_against_luma() {
            let img = ImageHandle::from_image(DynamicImage::ImageLumaA8(GrayAlphaImage::from_fn(4, 1, |x, _| {
                LumaA([if x == 3 { 0 } else { 255 }, 255])
            })));
            let found = find_trim(&img, Color::WHITE, 1.0).unwrap();
            assert_eq!(found, TrimBox { left: 3, top: 0, width: 1, height: 1 });
        }

        #[test]
        fn negative_threshold_is_invalid() {
            let img = bordered(4, 4, (1, 1, 1, 1));
            assert!(matches!(
                find_trim(&img, Color::WHITE, -1.0),
                Err(PixformError::InvalidArgument { .. })
            ));
        }
    }

    mod smart_crop_tests {
        use super::*;

        fn patterned() -> ImageHandle {
            ImageHandle::from_image(DynamicImage::ImageRgb8(RgbImage::from_fn(200, 100, |x, y| {
                if (150..190).contains(&x) && (30..70).contains(&y) {
                    if (x / 2 + y / 2) % 2 == 0 {
                        Rgb([0, 0, 0])
                    } else {
                        Rgb([255, 255, 255])
                    }
                } else {
                    Rgb([128, 128, 128])
                }
            })))
        }

        #[test]
        fn crop_follows_detail() {
            let out = smart_crop(patterned(), 50, 50).unwrap();
            assert_eq!(out.dimensions(), (50, 50));
            let detail = out
                .pixels()
                .to_rgb8()
                .pixels()
                .filter(|p| p.0 != [128, 128, 128])
                .count();
            assert_eq!(detail, 40 * 40);
        }

        #[test]
        fn cmyk_detail_in_black_ink_is_found() {
            // Only the K band carries structure; C/M/Y are flat everywhere.
            let ink = RgbaImage::from_fn(200, 100, |x, y| {
                let k = if (150..190).contains(&x) && (30..70).contains(&y) {
                    if (x / 2 + y / 2) % 2 == 0 { 255 } else { 0 }
                } else {
                    128
                };
                Rgba([0, 0, 0, k])
            });
            let handle = ImageHandle::from_decoded_as(
                DynamicImage::ImageRgba8(ink),
                Interpretation::Cmyk,
                FormatTag::Jpeg,
                None,
                None,
                1,
            );
            let out = smart_crop(handle, 50, 50).unwrap();
            assert_eq!(out.interpretation(), Interpretation::Cmyk);
            let detail = out.pixels().to_rgba8().pixels().filter(|p| p.0[3] != 128).count();
            assert_eq!(detail, 40 * 40);
        }

        #[test]
        fn crop_is_deterministic() {
            let a = smart_crop(patterned(), 60, 40).unwrap();
            let b = smart_crop(patterned(), 60, 40).unwrap();
            assert_eq!(a.pixels(), b.pixels());
        }

        #[test]
        fn featureless_image_crops_centre() {
            // Uniform colour everywhere; only alpha (ignored by saliency) varies, so
            // every window ties and the one nearest the centre wins.
            let img = ImageHandle::from_image(DynamicImage::ImageRgba8(RgbaImage::from_fn(10, 10, |x, y| {
                Rgba([5, 5, 5, (x * 10 + y) as u8])
            })));
            let out = smart_crop(img, 4, 4).unwrap();
            assert_eq!(out.dimensions(), (4, 4));
            assert_eq!(out.pixels().to_rgba8().get_pixel(0, 0).0, [5, 5, 5, 33]);
        }

        #[test]
        fn same_size_and_oversize() {
            let img = bordered(10, 10, (2, 2, 2, 2));
            assert_eq!(smart_crop(img.clone(), 10, 10).unwrap().pixels(), img.pixels());
            assert!(matches!(
                smart_crop(img, 11, 5),
                Err(PixformError::OutOfBounds { .. })
            ));
        }
    }
}
