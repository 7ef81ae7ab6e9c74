// src/engine/api.rs
//
// ImageEngine: buffer-in, buffer-out convenience API over the pipeline.
// Every call runs a full decode -> transform -> encode pass and replaces the
// held buffer with the result.

use crate::engine::analysis::{smart_crop, trim};
use crate::engine::color::{
    convert_colorspace, is_colorspace_supported, transform_icc, transform_icc_with_fallback,
};
use crate::engine::decoder::{load, load_auto, read_dimensions};
use crate::engine::effects::{brightness, contrast, gamma, gaussian_blur, sharpen};
use crate::engine::encoder::{encode, EncodeParams};
use crate::engine::handle::{ImageHandle, Interpretation};
use crate::engine::io::{extract_exif_raw, read_file, write_file};
use crate::engine::metadata::{self, orientation_from_exif, ImageMetadata};
use crate::engine::pipeline::{calc_cover_dimensions, calc_resize_dimensions, gravity_offset};
use crate::engine::registry::{detect_format, supports_encode, FormatTag};
use crate::engine::transform::{autorotate, embed, extract_area, flatten, flip, resize_to, rotate, zoom};
use crate::engine::watermark::{
    apply_image_watermark, apply_text_watermark, WatermarkImageSpec, WatermarkLayout, WatermarkText,
};
use crate::error::PixformError;
use crate::ops::{
    Area, Color, Direction, Gravity, ProcessOptions, WatermarkImageOptions, WatermarkOptions,
};
use crate::ImageSize;
use std::path::Path;
use tracing::debug;

type ApiResult<T> = std::result::Result<T, PixformError>;

const DEFAULT_WATERMARK_DPI: u32 = 150;
const DEFAULT_WATERMARK_OPACITY: f32 = 0.25;
const THUMBNAIL_QUALITY: u8 = 95;

/// An encoded image plus a method DSL that re-processes it.
///
/// ```no_run
/// use pixform::ImageEngine;
///
/// let mut image = ImageEngine::from_file("input.jpg")?;
/// image.resize(800, 600)?;
/// image.rotate(90)?;
/// image.save("output.jpg")?;
/// # Ok::<(), pixform::PixformError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageEngine {
    buffer: Vec<u8>,
}

impl ImageEngine {
    pub fn new(buffer: Vec<u8>) -> Self {
        Self { buffer }
    }

    /// Reads (memory-maps) a file into a new engine.
    pub fn from_file(path: impl AsRef<Path>) -> ApiResult<Self> {
        Ok(Self::new(read_file(path)?.into_vec()))
    }

    /// Writes the current buffer to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> ApiResult<usize> {
        write_file(path, &self.buffer)
    }

    /// Fit inside `width` x `height`, then pad to exactly that size.
    pub fn resize(&mut self, width: u32, height: u32) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            width: Some(width),
            height: Some(height),
            embed: true,
            ..ProcessOptions::default()
        })
    }

    /// Resize to exactly `width` x `height`, ignoring the aspect ratio.
    pub fn force_resize(&mut self, width: u32, height: u32) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            width: Some(width),
            height: Some(height),
            force: true,
            ..ProcessOptions::default()
        })
    }

    pub fn resize_and_crop(&mut self, width: u32, height: u32) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            width: Some(width),
            height: Some(height),
            embed: true,
            crop: true,
            ..ProcessOptions::default()
        })
    }

    /// Cover `width` x `height` and keep the most interesting region.
    pub fn smart_crop(&mut self, width: u32, height: u32) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            width: Some(width),
            height: Some(height),
            crop: true,
            gravity: Gravity::Smart,
            ..ProcessOptions::default()
        })
    }

    pub fn extract(&mut self, top: u32, left: u32, width: u32, height: u32) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            area: Some(Area {
                left,
                top,
                width,
                height,
            }),
            ..ProcessOptions::default()
        })
    }

    pub fn enlarge(&mut self, width: u32, height: u32) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            width: Some(width),
            height: Some(height),
            enlarge: true,
            ..ProcessOptions::default()
        })
    }

    pub fn enlarge_and_crop(&mut self, width: u32, height: u32) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            width: Some(width),
            height: Some(height),
            enlarge: true,
            crop: true,
            ..ProcessOptions::default()
        })
    }

    pub fn crop(&mut self, width: u32, height: u32, gravity: Gravity) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            width: Some(width),
            height: Some(height),
            crop: true,
            gravity,
            ..ProcessOptions::default()
        })
    }

    pub fn crop_by_width(&mut self, width: u32) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            width: Some(width),
            crop: true,
            ..ProcessOptions::default()
        })
    }

    pub fn crop_by_height(&mut self, height: u32) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            height: Some(height),
            crop: true,
            ..ProcessOptions::default()
        })
    }

    /// Square crop at high quality.
    pub fn thumbnail(&mut self, pixels: u32) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            width: Some(pixels),
            height: Some(pixels),
            crop: true,
            encode: EncodeParams::with_quality(THUMBNAIL_QUALITY),
            ..ProcessOptions::default()
        })
    }

    pub fn rotate(&mut self, angle: i32) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            rotate: angle,
            ..ProcessOptions::default()
        })
    }

    /// Mirror vertically.
    pub fn flip(&mut self) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            flip: true,
            ..ProcessOptions::default()
        })
    }

    /// Mirror horizontally.
    pub fn flop(&mut self) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            flop: true,
            ..ProcessOptions::default()
        })
    }

    pub fn watermark(&mut self, watermark: WatermarkOptions) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            watermark: Some(watermark),
            ..ProcessOptions::default()
        })
    }

    pub fn watermark_image(&mut self, watermark: WatermarkImageOptions) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            watermark_image: Some(watermark),
            ..ProcessOptions::default()
        })
    }

    pub fn convert(&mut self, format: FormatTag) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            format: Some(format),
            ..ProcessOptions::default()
        })
    }

    pub fn colourspace(&mut self, interpretation: Interpretation) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions {
            interpretation: Some(interpretation),
            ..ProcessOptions::default()
        })
    }

    /// Applies the EXIF orientation and nothing else.
    pub fn auto_rotate(&mut self) -> ApiResult<&[u8]> {
        self.process(&ProcessOptions::default())
    }

    /// Runs [`process`] and keeps the output. On failure the buffer is unchanged.
    pub fn process(&mut self, options: &ProcessOptions) -> ApiResult<&[u8]> {
        self.buffer = process(&self.buffer, options)?;
        Ok(&self.buffer)
    }

    pub fn image(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    pub fn length(&self) -> usize {
        self.buffer.len()
    }

    pub fn metadata(&self) -> ApiResult<ImageMetadata> {
        metadata::metadata(&self.buffer)
    }

    pub fn interpretation(&self) -> ApiResult<Interpretation> {
        Ok(self.metadata()?.interpretation)
    }

    pub fn colourspace_is_supported(&self) -> ApiResult<bool> {
        let handle = load_auto(&self.buffer, 1)?;
        Ok(is_colorspace_supported(&handle))
    }

    /// Format name of the held buffer, `"unknown"` when unrecognized.
    pub fn format(&self) -> &'static str {
        detect_format(&self.buffer)
            .unwrap_or(FormatTag::Unknown)
            .name()
    }

    pub fn size(&self) -> ApiResult<ImageSize> {
        crate::size(&self.buffer)
    }
}

impl From<Vec<u8>> for ImageEngine {
    fn from(buffer: Vec<u8>) -> Self {
        Self::new(buffer)
    }
}

/// Decodes `buffer`, applies `options` and encodes the result.
pub fn process(buffer: &[u8], options: &ProcessOptions) -> ApiResult<Vec<u8>> {
    let tag = detect_format(buffer)?;
    let output = match options.format {
        Some(format) => format,
        None if supports_encode(tag) => tag,
        None => FormatTag::Jpeg,
    };
    if !supports_encode(output) {
        return Err(PixformError::unsupported_format(output.name(), "encode"));
    }
    options.encode.validate_for(output)?;

    let shrink = shrink_on_load(buffer, tag, options);
    let mut handle = load(buffer, tag, shrink)?;
    debug!(
        target: "pixform::pipeline",
        input = %tag,
        output = %output,
        shrink,
        width = handle.width(),
        height = handle.height(),
        "process"
    );

    if !options.no_autorotate {
        handle = autorotate(handle)?;
    }
    if let Some(t) = options.trim {
        handle = trim(handle, t.background, t.threshold)?;
    }
    handle = resize_stage(handle, options)?;
    if let Some(area) = options.area {
        handle = extract_area(handle, area.left, area.top, area.width, area.height)?;
    }
    if options.zoom > 1 {
        handle = zoom(handle, options.zoom, options.zoom)?;
    }
    if options.rotate != 0 {
        handle = rotate(handle, options.rotate.rem_euclid(360))?;
    }
    if options.flip {
        handle = flip(handle, Direction::Vertical)?;
    }
    if options.flop {
        handle = flip(handle, Direction::Horizontal)?;
    }

    if let Some(blur) = options.blur {
        handle = gaussian_blur(handle, blur.sigma, blur.min_amplitude)?;
    }
    if let Some(params) = &options.sharpen {
        handle = sharpen(handle, params)?;
    }
    if let Some(exponent) = options.gamma {
        handle = gamma(handle, exponent)?;
    }
    if let Some(k) = options.brightness {
        handle = brightness(handle, k)?;
    }
    if let Some(k) = options.contrast {
        handle = contrast(handle, k)?;
    }
    if options.flatten {
        handle = flatten(handle, options.background)?;
    }

    if let Some(profile) = &options.output_icc {
        handle = match &options.input_icc {
            Some(fallback) => transform_icc_with_fallback(handle, profile, fallback)?,
            None => transform_icc(handle, profile)?,
        };
    }
    if let Some(target) = options.interpretation {
        handle = convert_colorspace(handle, target)?;
    }

    if let Some(watermark) = &options.watermark {
        handle = text_watermark(handle, watermark)?;
    }
    if let Some(watermark) = &options.watermark_image {
        handle = image_watermark(handle, watermark)?;
    }

    encode(&handle, output, &options.encode)
}

/// Final size the resize stage will produce for a `width` x `height` input.
fn target_dimensions(width: u32, height: u32, options: &ProcessOptions) -> Option<(u32, u32)> {
    if options.width.is_none() && options.height.is_none() {
        return None;
    }
    let target = match (options.force, options.crop, options.width, options.height) {
        (true, _, _, _) => {
            let (fit_w, fit_h) = calc_resize_dimensions(width, height, options.width, options.height);
            (options.width.unwrap_or(fit_w), options.height.unwrap_or(fit_h))
        }
        (false, true, Some(w), Some(h)) => calc_cover_dimensions(width, height, w, h),
        _ => calc_resize_dimensions(width, height, options.width, options.height),
    };
    if !options.enlarge && !options.force && (target.0 > width || target.1 > height) {
        return Some((width, height));
    }
    Some(target)
}

/// Integer shrink-on-load factor for JPEG/WebP that keeps the decoded image at
/// least as large as the resize target.
fn shrink_on_load(buffer: &[u8], tag: FormatTag, options: &ProcessOptions) -> u32 {
    if !tag.supports_shrink_on_load() || options.trim.is_some() {
        return 1;
    }
    let Ok((mut width, mut height)) = read_dimensions(buffer, tag) else {
        return 1;
    };
    let orientation = extract_exif_raw(buffer, tag)
        .as_deref()
        .and_then(orientation_from_exif)
        .unwrap_or(1);
    if !options.no_autorotate && (5..=8).contains(&orientation) {
        std::mem::swap(&mut width, &mut height);
    }
    let Some((tw, th)) = target_dimensions(width, height, options) else {
        return 1;
    };
    if tw == 0 || th == 0 {
        return 1;
    }
    (width / tw).min(height / th).max(1)
}

fn resize_stage(handle: ImageHandle, options: &ProcessOptions) -> ApiResult<ImageHandle> {
    let (width, height) = handle.dimensions();
    let Some((rw, rh)) = target_dimensions(width, height, options) else {
        return Ok(handle);
    };
    let handle = if (rw, rh) == (width, height) {
        handle
    } else {
        resize_to(handle, rw, rh, options.kernel)?
    };
    if options.force {
        return Ok(handle);
    }

    let (Some(w), Some(h)) = (options.width, options.height) else {
        return Ok(handle);
    };
    let handle = if options.crop {
        let (cw, ch) = (w.min(rw), h.min(rh));
        if (cw, ch) == (rw, rh) {
            handle
        } else if options.gravity == Gravity::Smart {
            smart_crop(handle, cw, ch)?
        } else {
            let (left, top) = gravity_offset(options.gravity, rw, rh, cw, ch);
            extract_area(handle, left, top, cw, ch)?
        }
    } else {
        handle
    };

    if options.embed && handle.dimensions() != (w, h) {
        let (left, top) = gravity_offset(Gravity::Centre, w, h, handle.width(), handle.height());
        return embed(handle, left, top, w, h, options.extend, options.background);
    }
    Ok(handle)
}

fn text_watermark(handle: ImageHandle, options: &WatermarkOptions) -> ApiResult<ImageHandle> {
    let text = WatermarkText::new(options.text.clone(), options.font.clone())?;
    let width = options
        .width
        .filter(|w| *w > 0)
        .unwrap_or_else(|| (handle.width() / 6).max(1));
    let layout = WatermarkLayout::new(
        width,
        options.dpi.filter(|d| *d > 0).unwrap_or(DEFAULT_WATERMARK_DPI),
        options.margin.unwrap_or(width),
        options.no_replicate,
        options
            .opacity
            .filter(|o| *o > 0.0)
            .unwrap_or(DEFAULT_WATERMARK_OPACITY)
            .min(1.0),
        options.background.unwrap_or(Color::WHITE),
    )?;
    apply_text_watermark(handle, &text, &layout)
}

fn image_watermark(handle: ImageHandle, options: &WatermarkImageOptions) -> ApiResult<ImageHandle> {
    let overlay = load_auto(&options.buffer, 1)?;
    let spec = WatermarkImageSpec::new(
        options.left,
        options.top,
        options.opacity.unwrap_or(1.0).clamp(0.0, 1.0),
    )?;
    apply_image_watermark(handle, &overlay, &spec)
}
