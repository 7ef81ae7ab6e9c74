// src/engine/watermark.rs
//
// Watermark Compositor: tiled text watermarks and image overlays.

use crate::engine::color::convert_colorspace;
use crate::engine::handle::{BitDepth, ImageHandle, Interpretation};
use crate::engine::raster::Raster;
use crate::engine::text::{GlyphRenderer, SvgGlyphRenderer};
use crate::engine::transform::background_bands;
use crate::error::PixformError;
use crate::ops::Color;
use image::GrayImage;
use rayon::prelude::*;
use tracing::debug;

type WatermarkResult<T> = std::result::Result<T, PixformError>;

/// Text and font of a text watermark.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkText {
    text: String,
    font: String,
}

impl WatermarkText {
    pub const DEFAULT_FONT: &'static str = "sans 10";

    /// `font` uses the `"family [style] size"` convention; empty means `sans 10`.
    pub fn new(text: impl Into<String>, font: impl Into<String>) -> WatermarkResult<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(PixformError::invalid_argument(
                "text_watermark",
                "text",
                "",
                "watermark text must not be empty",
            ));
        }
        let font = font.into();
        let font = if font.trim().is_empty() {
            Self::DEFAULT_FONT.to_string()
        } else {
            font
        };
        Ok(Self { text, font })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn font(&self) -> &str {
        &self.font
    }
}

/// Placement and blending of a text watermark. Validated on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkLayout {
    width: u32,
    dpi: u32,
    margin: u32,
    no_replicate: bool,
    opacity: f32,
    background: Color,
}

impl WatermarkLayout {
    /// `width` is the wrap width of the text in pixels; `background` is the ink
    /// colour the text is drawn in.
    pub fn new(
        width: u32,
        dpi: u32,
        margin: u32,
        no_replicate: bool,
        opacity: f32,
        background: Color,
    ) -> WatermarkResult<Self> {
        if width == 0 {
            return Err(PixformError::invalid_argument(
                "text_watermark",
                "width",
                width,
                "width must be positive",
            ));
        }
        if dpi == 0 {
            return Err(PixformError::invalid_argument(
                "text_watermark",
                "dpi",
                dpi,
                "dpi must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&opacity) {
            return Err(PixformError::invalid_argument(
                "text_watermark",
                "opacity",
                opacity,
                "opacity must be within 0..=1",
            ));
        }
        Ok(Self {
            width,
            dpi,
            margin,
            no_replicate,
            opacity,
            background,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    pub fn margin(&self) -> u32 {
        self.margin
    }

    pub fn no_replicate(&self) -> bool {
        self.no_replicate
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn background(&self) -> Color {
        self.background
    }
}

/// Position and opacity of an image overlay.
///
/// Negative offsets anchor from the opposite edge: `left = -10` leaves ten
/// pixels between the overlay and the right border.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatermarkImageSpec {
    left: i32,
    top: i32,
    opacity: f32,
}

impl WatermarkImageSpec {
    pub fn new(left: i32, top: i32, opacity: f32) -> WatermarkResult<Self> {
        if !(0.0..=1.0).contains(&opacity) {
            return Err(PixformError::invalid_argument(
                "image_watermark",
                "opacity",
                opacity,
                "opacity must be within 0..=1",
            ));
        }
        Ok(Self { left, top, opacity })
    }

    pub fn left(&self) -> i32 {
        self.left
    }

    pub fn top(&self) -> i32 {
        self.top
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }
}

/// Brings an image into a space the compositor blends in directly.
fn blendable(handle: ImageHandle) -> WatermarkResult<ImageHandle> {
    match handle.interpretation() {
        Interpretation::Srgb | Interpretation::Rgb16 | Interpretation::BW | Interpretation::Grey16 => {
            Ok(handle)
        }
        _ => convert_colorspace(handle, Interpretation::Srgb),
    }
}

/// Renders `text` with the system fonts and blends it over the image.
pub fn apply_text_watermark(
    handle: ImageHandle,
    text: &WatermarkText,
    layout: &WatermarkLayout,
) -> WatermarkResult<ImageHandle> {
    apply_text_watermark_with(handle, text, layout, &SvgGlyphRenderer)
}

/// Same as [`apply_text_watermark`] with a caller-supplied glyph renderer.
pub fn apply_text_watermark_with(
    handle: ImageHandle,
    text: &WatermarkText,
    layout: &WatermarkLayout,
    renderer: &dyn GlyphRenderer,
) -> WatermarkResult<ImageHandle> {
    let handle = blendable(handle)?;
    let mask = renderer.render(text.text(), text.font(), layout.width, layout.dpi)?;
    let margin = layout.margin;
    let tile_w = mask.width().saturating_add(margin).max(1);
    let tile_h = mask.height().saturating_add(margin).max(1);

    let mut raster = Raster::from_image(handle.pixels());
    let max = raster.max_value();
    let colour_bands = if handle.has_alpha() { raster.bands - 1 } else { raster.bands };
    let ink = background_bands(handle.interpretation(), colour_bands, max, layout.background);
    let (width, bands) = (raster.width, raster.bands);
    let opacity = layout.opacity;
    let replicate = !layout.no_replicate;

    raster
        .data
        .par_chunks_mut(width as usize * bands)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as u32;
            for (x, px) in row.chunks_exact_mut(bands).enumerate() {
                let coverage = tile_coverage(&mask, x as u32, y, tile_w, tile_h, margin, replicate);
                if coverage == 0 {
                    continue;
                }
                let alpha = coverage as f32 / 255.0 * opacity;
                for (v, &i) in px[..colour_bands].iter_mut().zip(&ink) {
                    *v = *v * (1.0 - alpha) + i * alpha;
                }
            }
        });

    debug!(
        target: "pixform::pipeline",
        mask_width = mask.width(),
        mask_height = mask.height(),
        margin,
        replicate,
        opacity,
        "text watermark"
    );
    let img = raster.into_image()?;
    Ok(handle.with_pixels(img, "text_watermark"))
}

fn tile_coverage(
    mask: &GrayImage,
    x: u32,
    y: u32,
    tile_w: u32,
    tile_h: u32,
    margin: u32,
    replicate: bool,
) -> u8 {
    let (tx, ty) = if replicate {
        (x % tile_w, y % tile_h)
    } else {
        (x, y)
    };
    if tx < margin || ty < margin {
        return 0;
    }
    let (mx, my) = (tx - margin, ty - margin);
    if mx >= mask.width() || my >= mask.height() {
        return 0;
    }
    mask.get_pixel(mx, my).0[0]
}

/// Composites `overlay` over the image at the placement's offset.
///
/// The overlay is converted to the base interpretation first. Fails with
/// `OutOfBounds` when it does not fit inside the base.
pub fn apply_image_watermark(
    handle: ImageHandle,
    overlay: &ImageHandle,
    spec: &WatermarkImageSpec,
) -> WatermarkResult<ImageHandle> {
    let handle = blendable(handle)?;
    let (base_w, base_h) = handle.dimensions();
    let (over_w, over_h) = overlay.dimensions();
    let anchor = |offset: i32, base: u32, size: u32| -> i64 {
        if offset < 0 {
            base as i64 - size as i64 + offset as i64
        } else {
            offset as i64
        }
    };
    let left = anchor(spec.left, base_w, over_w);
    let top = anchor(spec.top, base_h, over_h);
    if left < 0
        || top < 0
        || left + over_w as i64 > base_w as i64
        || top + over_h as i64 > base_h as i64
    {
        return Err(PixformError::out_of_bounds(
            "image_watermark",
            (left, top),
            (over_w, over_h),
            (base_w, base_h),
        ));
    }

    let target = match (handle.interpretation().is_grey(), handle.bit_depth()) {
        (true, BitDepth::Sixteen) => Interpretation::Grey16,
        (true, _) => Interpretation::BW,
        (false, BitDepth::Sixteen) => Interpretation::Rgb16,
        (false, _) => Interpretation::Srgb,
    };
    let overlay = convert_colorspace(blendable(overlay.clone())?, target)?;
    let over_alpha = overlay.has_alpha();
    let src = Raster::from_image(overlay.pixels());

    let mut dst = Raster::from_image(handle.pixels());
    let max = dst.max_value();
    let base_alpha = handle.has_alpha();
    let colour_bands = if base_alpha { dst.bands - 1 } else { dst.bands };
    let opacity = spec.opacity;
    let (left, top) = (left as u32, top as u32);

    for y in 0..over_h {
        for x in 0..over_w {
            let o = src.pixel(x, y);
            let a = if over_alpha { o[src.bands - 1] / max } else { 1.0 } * opacity;
            if a <= 0.0 {
                continue;
            }
            let b = dst.pixel_mut(left + x, top + y);
            if base_alpha {
                let ab = b[colour_bands] / max;
                let out_a = a + ab * (1.0 - a);
                for c in 0..colour_bands {
                    b[c] = if out_a > 0.0 {
                        (o[c] * a + b[c] * ab * (1.0 - a)) / out_a
                    } else {
                        0.0
                    };
                }
                b[colour_bands] = out_a * max;
            } else {
                for c in 0..colour_bands {
                    b[c] = o[c] * a + b[c] * (1.0 - a);
                }
            }
        }
    }

    debug!(
        target: "pixform::pipeline",
        left,
        top,
        width = over_w,
        height = over_h,
        opacity,
        "image watermark"
    );
    let img = dst.into_image()?;
    Ok(handle.with_pixels(img, "image_watermark"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

    /// Solid block of full coverage; deterministic without system fonts.
    struct BlockRenderer {
        width: u32,
        height: u32,
    }

    impl GlyphRenderer for BlockRenderer {
        fn render(&self, _: &str, _: &str, _: u32, _: u32) -> WatermarkResult<GrayImage> {
            Ok(GrayImage::from_pixel(self.width, self.height, Luma([255])))
        }
    }

    fn solid(width: u32, height: u32, value: u8) -> ImageHandle {
        ImageHandle::from_image(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            Rgb([value; 3]),
        )))
    }

    mod spec_tests {
        use super::*;

        #[test]
        fn value_objects_validate() {
            assert!(WatermarkText::new("  ", "sans 10").is_err());
            assert_eq!(WatermarkText::new("hi", "").unwrap().font(), "sans 10");
            assert!(WatermarkLayout::new(0, 72, 0, false, 0.5, Color::WHITE).is_err());
            assert!(WatermarkLayout::new(10, 0, 0, false, 0.5, Color::WHITE).is_err());
            assert!(WatermarkLayout::new(10, 72, 0, false, 1.5, Color::WHITE).is_err());
            assert!(WatermarkImageSpec::new(0, 0, -0.1).is_err());
            let layout = WatermarkLayout::new(10, 72, 4, true, 0.5, Color::WHITE).unwrap();
            assert_eq!((layout.width(), layout.margin(), layout.no_replicate()), (10, 4, true));
        }
    }

    mod text_tests {
        use super::*;

        #[test]
        fn single_block_blends_at_half_opacity() {
            let renderer = BlockRenderer { width: 4, height: 3 };
            let text = WatermarkText::new("mark", "sans 10").unwrap();
            let layout = WatermarkLayout::new(50, 72, 2, true, 0.5, Color::WHITE).unwrap();
            let out = apply_text_watermark_with(solid(20, 20, 100), &text, &layout, &renderer)
                .unwrap()
                .into_pixels()
                .to_rgb8();

            // 100 * 0.5 + 255 * 0.5
            assert_eq!(out.get_pixel(2, 2).0, [178, 178, 178]);
            assert_eq!(out.get_pixel(5, 4).0, [178, 178, 178]);
            assert_eq!(out.get_pixel(1, 2).0, [100, 100, 100]);
            assert_eq!(out.get_pixel(6, 2).0, [100, 100, 100]);
            // No replication.
            assert_eq!(out.get_pixel(8, 7).0, [100, 100, 100]);
        }

        #[test]
        fn replicated_tiles_repeat_with_margin_spacing() {
            let renderer = BlockRenderer { width: 2, height: 2 };
            let text = WatermarkText::new("mark", "").unwrap();
            let layout = WatermarkLayout::new(50, 72, 1, false, 1.0, Color::BLACK).unwrap();
            let out = apply_text_watermark_with(solid(9, 9, 200), &text, &layout, &renderer)
                .unwrap()
                .into_pixels()
                .to_rgb8();
            // Tile is 3x3 with ink at (1..3, 1..3).
            for (x, y) in [(1, 1), (2, 2), (4, 4), (7, 8)] {
                assert_eq!(out.get_pixel(x, y).0, [0, 0, 0], "({x},{y})");
            }
            for (x, y) in [(0, 0), (3, 1), (6, 6)] {
                assert_eq!(out.get_pixel(x, y).0, [200, 200, 200], "({x},{y})");
            }
        }

        #[test]
        fn grey_and_alpha_images() {
            let renderer = BlockRenderer { width: 1, height: 1 };
            let text = WatermarkText::new("x", "").unwrap();
            let layout = WatermarkLayout::new(5, 72, 0, true, 1.0, Color::new(255, 0, 0)).unwrap();

            let grey = ImageHandle::from_image(DynamicImage::ImageLuma8(GrayImage::new(2, 2)));
            let out = apply_text_watermark_with(grey, &text, &layout, &renderer).unwrap();
            assert_eq!(out.pixels().to_luma8().get_pixel(0, 0).0, [76]);

            let rgba = ImageHandle::from_image(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                2,
                2,
                Rgba([0, 0, 0, 10]),
            )));
            let out = apply_text_watermark_with(rgba, &text, &layout, &renderer).unwrap();
            assert_eq!(out.pixels().to_rgba8().get_pixel(0, 0).0, [255, 0, 0, 10]);
        }
    }

    mod image_tests {
        use super::*;

        fn overlay(width: u32, height: u32, px: Rgba<u8>) -> ImageHandle {
            ImageHandle::from_image(DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, px)))
        }

        #[test]
        fn composites_at_offset_with_opacity() {
            let spec = WatermarkImageSpec::new(2, 3, 0.5).unwrap();
            let out = apply_image_watermark(solid(10, 10, 0), &overlay(2, 2, Rgba([200, 100, 0, 255])), &spec)
                .unwrap();
            assert!(!out.has_alpha());
            let img = out.into_pixels().to_rgb8();
            assert_eq!(img.get_pixel(2, 3).0, [100, 50, 0]);
            assert_eq!(img.get_pixel(3, 4).0, [100, 50, 0]);
            assert_eq!(img.get_pixel(4, 3).0, [0, 0, 0]);
        }

        #[test]
        fn negative_offsets_anchor_from_far_edge() {
            let spec = WatermarkImageSpec::new(-1, -2, 1.0).unwrap();
            let out = apply_image_watermark(solid(10, 10, 0), &overlay(3, 3, Rgba([255, 255, 255, 255])), &spec)
                .unwrap()
                .into_pixels()
                .to_rgb8();
            // x 6..9, y 5..8
            assert_eq!(out.get_pixel(6, 5).0, [255, 255, 255]);
            assert_eq!(out.get_pixel(8, 7).0, [255, 255, 255]);
            assert_eq!(out.get_pixel(9, 7).0, [0, 0, 0]);
            assert_eq!(out.get_pixel(8, 8).0, [0, 0, 0]);
        }

        #[test]
        fn overlay_outside_base_is_out_of_bounds() {
            let spec = WatermarkImageSpec::new(9, 0, 1.0).unwrap();
            let err = apply_image_watermark(solid(10, 10, 0), &overlay(2, 2, Rgba([0, 0, 0, 255])), &spec)
                .unwrap_err();
            assert!(matches!(err, PixformError::OutOfBounds { .. }));

            let spec = WatermarkImageSpec::new(-9, 0, 1.0).unwrap();
            assert!(apply_image_watermark(solid(10, 10, 0), &overlay(2, 2, Rgba([0, 0, 0, 255])), &spec).is_err());
        }

        #[test]
        fn transparent_overlay_pixels_leave_base() {
            let spec = WatermarkImageSpec::new(0, 0, 1.0).unwrap();
            let out = apply_image_watermark(solid(4, 4, 50), &overlay(4, 4, Rgba([255, 0, 0, 0])), &spec)
                .unwrap();
            assert!(out.into_pixels().to_rgb8().pixels().all(|p| p.0 == [50, 50, 50]));
        }

        #[test]
        fn over_operator_on_transparent_base() {
            let base = overlay(2, 2, Rgba([0, 0, 0, 0]));
            let spec = WatermarkImageSpec::new(0, 0, 0.5).unwrap();
            let out = apply_image_watermark(base, &overlay(1, 1, Rgba([255, 255, 255, 255])), &spec)
                .unwrap();
            assert!(out.has_alpha());
            assert_eq!(out.pixels().to_rgba8().get_pixel(0, 0).0, [255, 255, 255, 128]);
        }

        #[test]
        fn grey_base_takes_colour_overlay() {
            let base = ImageHandle::from_image(DynamicImage::ImageLuma8(GrayImage::new(3, 3)));
            let spec = WatermarkImageSpec::new(0, 0, 1.0).unwrap();
            let out = apply_image_watermark(base, &overlay(1, 1, Rgba([255, 0, 0, 255])), &spec).unwrap();
            assert_eq!(out.interpretation(), Interpretation::BW);
            assert_eq!(out.pixels().to_luma8().get_pixel(0, 0).0, [76]);
        }
    }
}
