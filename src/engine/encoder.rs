// src/engine/encoder.rs
//
// Encoder: validates per-format parameters, normalizes the handle to something
// the target codec can write, then dispatches to JPEG (mozjpeg), PNG (image +
// oxipng), WebP (libwebp), TIFF/GIF (image) or AVIF (libavif).

use crate::codecs::avif_safe::{AvifRgbView, SafeAvifEncoder, SafeAvifImage, SafeAvifRwData};
use crate::engine::color::{convert_colorspace, transform_icc, BuiltinProfile, ProfileSource};
use crate::engine::common::run_with_panic_policy;
use crate::engine::handle::{BitDepth, ImageHandle, Interpretation};
use crate::engine::registry::{supports_encode, FormatTag, ParamSupport};
use crate::engine::transform::flatten;
use crate::error::PixformError;
use crate::ops::Color;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ImageEncoder, ImageFormat, RgbaImage};
use img_parts::{jpeg::Jpeg, png::Png, webp::WebP, Bytes, ImageEXIF, ImageICC};
use libavif_sys::*;
use mozjpeg::{ColorSpace, Compress, ScanMode};
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Cursor;
use tracing::{debug, warn};

type EncoderResult<T> = std::result::Result<T, PixformError>;

/// Format-specific encode parameters.
///
/// Fields a format does not accept are ignored; values outside a field's range
/// are rejected regardless of format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeParams {
    /// Drop ICC profile and EXIF from the output.
    pub strip: bool,
    /// 0..=100, lossy formats and palette PNG.
    pub quality: u8,
    /// 0..=9, zlib effort for PNG.
    pub compression: u8,
    /// Effort level; PNG 0..=9, AVIF 0..=10. `None` picks a default from quality.
    pub speed: Option<u8>,
    pub lossless: bool,
    /// Progressive JPEG / Adam7 PNG.
    pub interlace: bool,
    /// Quantize PNG output to an indexed palette.
    pub palette: bool,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            strip: false,
            quality: 80,
            compression: 6,
            speed: None,
            lossless: false,
            interlace: false,
            palette: false,
        }
    }
}

impl EncodeParams {
    pub fn with_quality(quality: u8) -> Self {
        Self {
            quality,
            ..Self::default()
        }
    }

    /// Rejects out-of-range values for `tag`.
    pub fn validate_for(&self, tag: FormatTag) -> EncoderResult<()> {
        if self.quality > 100 {
            return Err(PixformError::invalid_argument(
                "encode",
                "quality",
                self.quality,
                "must be within 0..=100",
            ));
        }
        if self.compression > 9 {
            return Err(PixformError::invalid_argument(
                "encode",
                "compression",
                self.compression,
                "must be within 0..=9",
            ));
        }
        if let (Some(speed), Some((lo, hi))) = (self.speed, tag.speed_range()) {
            if !(lo..=hi).contains(&speed) {
                return Err(PixformError::invalid_argument(
                    "encode",
                    "speed",
                    speed,
                    format!("must be within {lo}..={hi} for {tag}"),
                ));
            }
        }
        Ok(())
    }
}

/// Derives codec knobs from a 0-100 quality value.
///
/// Bands: High (>= 85), Balanced (70-84), Fast (50-69), Fastest (< 50).
#[derive(Debug, Clone, Copy)]
pub struct QualitySettings {
    quality: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QualityBand {
    High,
    Balanced,
    Fast,
    Fastest,
}

impl QualitySettings {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.min(100) as f32,
        }
    }

    fn band(&self) -> QualityBand {
        if self.quality >= 85.0 {
            QualityBand::High
        } else if self.quality >= 70.0 {
            QualityBand::Balanced
        } else if self.quality >= 50.0 {
            QualityBand::Fast
        } else {
            QualityBand::Fastest
        }
    }

    pub fn jpeg_smoothing(&self) -> u8 {
        if self.quality >= 90.0 {
            0
        } else if self.quality >= 70.0 {
            5
        } else if self.quality >= 60.0 {
            10
        } else {
            18
        }
    }

    pub fn webp_sns_strength(&self) -> i32 {
        match self.band() {
            QualityBand::High => 50,
            QualityBand::Balanced => 70,
            QualityBand::Fast | QualityBand::Fastest => 80,
        }
    }

    pub fn webp_filter_strength(&self) -> i32 {
        if self.quality >= 80.0 {
            20
        } else if self.quality >= 60.0 {
            30
        } else {
            40
        }
    }

    pub fn webp_filter_sharpness(&self) -> i32 {
        match self.band() {
            QualityBand::High => 2,
            QualityBand::Balanced | QualityBand::Fast | QualityBand::Fastest => 0,
        }
    }

    /// libavif speed: 0 (slowest) to 10 (fastest).
    pub fn avif_speed(&self) -> i32 {
        match self.band() {
            QualityBand::High => 6,
            QualityBand::Balanced => 7,
            QualityBand::Fast => 8,
            QualityBand::Fastest => 9,
        }
    }

    /// Palette size for quantized PNG output.
    pub fn palette_colors(&self) -> usize {
        2 + (self.quality as usize * 254) / 100
    }
}

/// Metadata carried into the output container.
struct Embedded<'a> {
    icc: Option<&'a [u8]>,
    exif: Option<&'a [u8]>,
}

/// Encodes `handle` as `tag`.
pub fn encode(handle: &ImageHandle, tag: FormatTag, params: &EncodeParams) -> EncoderResult<Vec<u8>> {
    if !supports_encode(tag) {
        return Err(PixformError::unsupported_format(tag.name(), "encode"));
    }
    params.validate_for(tag)?;

    let (w, h) = handle.dimensions();
    if w == 0 || h == 0 {
        return Err(PixformError::encode_failed(tag.name(), "image has zero width or height"));
    }
    let limit = tag.max_dimension();
    if w > limit || h > limit {
        return Err(PixformError::encode_failed(
            tag.name(),
            format!("{w}x{h} exceeds the {tag} limit of {limit} pixels per side"),
        ));
    }

    let prepared = normalize_for(handle, tag)?;
    let strip = params.strip && tag.encode_params().contains(ParamSupport::STRIP);
    let embedded = Embedded {
        icc: if strip { None } else { prepared.icc_profile() },
        exif: if strip { None } else { prepared.exif() },
    };

    debug!(
        target: "pixform::encoder",
        format = %tag,
        width = w,
        height = h,
        quality = params.quality,
        lossless = params.lossless,
        interlace = params.interlace,
        strip,
        "encode"
    );

    let img = prepared.pixels();
    let encoded = match tag {
        FormatTag::Jpeg => encode_jpeg(img, params, &embedded),
        FormatTag::Png => encode_png(img, params, &embedded),
        FormatTag::Webp => encode_webp(img, params, &embedded),
        FormatTag::Tiff => encode_tiff(img),
        FormatTag::Gif => encode_gif(img),
        FormatTag::Avif => encode_avif(img, params, &embedded),
        FormatTag::Pdf
        | FormatTag::Svg
        | FormatTag::Magick
        | FormatTag::Heif
        | FormatTag::Jxl
        | FormatTag::Unknown => Err(PixformError::unsupported_format(tag.name(), "encode")),
    }?;

    debug!(target: "pixform::encoder", format = %tag, bytes = encoded.len(), "encoded");
    Ok(encoded)
}

/// Brings the handle into a shape `tag` can write: RGB or grey interpretation,
/// alpha flattened onto white when unsupported, 16-bit reduced to 8-bit when
/// the format has no high bit depth.
fn normalize_for(handle: &ImageHandle, tag: FormatTag) -> EncoderResult<Cow<'_, ImageHandle>> {
    let mut current = Cow::Borrowed(handle);

    match current.interpretation() {
        Interpretation::Srgb
        | Interpretation::Rgb16
        | Interpretation::BW
        | Interpretation::Grey16
        | Interpretation::Multiband => {}
        Interpretation::Cmyk if current.has_icc_profile() => {
            let srgb = ProfileSource::Named(BuiltinProfile::Srgb);
            let owned = current.into_owned();
            current = Cow::Owned(match transform_icc(owned.clone(), &srgb) {
                Ok(converted) => converted,
                Err(err @ (PixformError::InvalidProfile { .. } | PixformError::UnsupportedConversion { .. })) => {
                    warn!(target: "pixform::encoder", error = %err, "CMYK profile unusable, converting without it");
                    convert_colorspace(owned, Interpretation::Srgb)?
                }
                Err(err) => return Err(err),
            });
        }
        _ => {
            current = Cow::Owned(convert_colorspace(current.into_owned(), Interpretation::Srgb)?);
        }
    }

    if current.has_alpha() && !tag.supports_alpha() {
        current = Cow::Owned(flatten(current.into_owned(), Color::WHITE)?);
    }

    if current.bit_depth() != BitDepth::Eight && !tag.supports_high_bit_depth() {
        let img = current.pixels();
        let reduced = match img.color().channel_count() {
            1 => DynamicImage::ImageLuma8(img.to_luma8()),
            2 => DynamicImage::ImageLumaA8(img.to_luma_alpha8()),
            3 => DynamicImage::ImageRgb8(img.to_rgb8()),
            _ => DynamicImage::ImageRgba8(img.to_rgba8()),
        };
        current = Cow::Owned(current.into_owned().with_pixels(reduced, "encode:depth"));
    }

    Ok(current)
}

fn encode_jpeg(img: &DynamicImage, params: &EncodeParams, embedded: &Embedded<'_>) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:jpeg", || {
        let grey = img.color().channel_count() <= 2;
        let (pixels, components, in_space, out_space): (Cow<'_, [u8]>, usize, ColorSpace, ColorSpace) = if grey {
            let luma = match img {
                DynamicImage::ImageLuma8(l) => Cow::Borrowed(l.as_raw().as_slice()),
                _ => Cow::Owned(img.to_luma8().into_raw()),
            };
            (luma, 1, ColorSpace::JCS_GRAYSCALE, ColorSpace::JCS_GRAYSCALE)
        } else {
            let rgb = match img {
                DynamicImage::ImageRgb8(rgb) => Cow::Borrowed(rgb.as_raw().as_slice()),
                _ => Cow::Owned(img.to_rgb8().into_raw()),
            };
            (rgb, 3, ColorSpace::JCS_RGB, ColorSpace::JCS_YCbCr)
        };
        let (w, h) = (img.width() as usize, img.height() as usize);
        if pixels.len() != w * h * components {
            return Err(PixformError::encode_failed("jpeg", "pixel buffer size mismatch"));
        }

        let settings = QualitySettings::new(params.quality);
        let mut comp = Compress::new(in_space);
        comp.set_size(w, h);
        comp.set_color_space(out_space);
        comp.set_quality(params.quality as f32);
        if !grey {
            comp.set_chroma_sampling_pixel_sizes((2, 2), (2, 2));
        }
        if params.interlace {
            comp.set_progressive_mode();
            comp.set_optimize_scans(true);
            comp.set_scan_optimization_mode(ScanMode::AllComponentsTogether);
        }
        comp.set_optimize_coding(true);
        comp.set_smoothing_factor(settings.jpeg_smoothing());

        let mut output = Vec::with_capacity((w * h * components / 10).max(4096));
        {
            let mut writer = comp.start_compress(&mut output).map_err(|e| {
                PixformError::encode_failed("jpeg", format!("mozjpeg: failed to start compress: {e:?}"))
            })?;
            for row in pixels.chunks(w * components) {
                writer.write_scanlines(row).map_err(|e| {
                    PixformError::encode_failed("jpeg", format!("mozjpeg: failed to write scanlines: {e:?}"))
                })?;
            }
            writer.finish().map_err(|e| {
                PixformError::encode_failed("jpeg", format!("mozjpeg: failed to finish: {e:?}"))
            })?;
        }

        if embedded.icc.is_none() && embedded.exif.is_none() {
            return Ok(output);
        }
        embed_jpeg_metadata(output, embedded)
    })
}

/// Re-inserts ICC (APP2, split into numbered chunks) and EXIF (APP1) segments
/// after the JFIF header.
fn embed_jpeg_metadata(jpeg_data: Vec<u8>, embedded: &Embedded<'_>) -> EncoderResult<Vec<u8>> {
    let mut jpeg = Jpeg::from_bytes(Bytes::from(jpeg_data))
        .map_err(|e| PixformError::encode_failed("jpeg", format!("failed to reparse output: {e}")))?;

    if let Some(icc) = embedded.icc {
        jpeg.set_icc_profile(Some(Bytes::copy_from_slice(icc)));
    }
    if let Some(exif) = embedded.exif {
        jpeg.set_exif(Some(Bytes::copy_from_slice(exif)));
    }

    let mut output = Vec::new();
    jpeg.encoder()
        .write_to(&mut output)
        .map_err(|e| PixformError::encode_failed("jpeg", format!("failed to write metadata: {e}")))?;
    Ok(output)
}

fn encode_png(img: &DynamicImage, params: &EncodeParams, embedded: &Embedded<'_>) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:png", || {
        let quantized;
        let source = if params.palette {
            quantized = quantize(img, QualitySettings::new(params.quality).palette_colors());
            &quantized
        } else {
            img
        };

        let compression = match params.compression {
            0..=2 => CompressionType::Fast,
            3..=6 => CompressionType::Default,
            _ => CompressionType::Best,
        };
        let mut buf = Vec::new();
        PngEncoder::new_with_quality(&mut buf, compression, FilterType::Adaptive)
            .write_image(
                source.as_bytes(),
                source.width(),
                source.height(),
                source.color().into(),
            )
            .map_err(|e| PixformError::encode_failed("png", format!("PNG encode failed: {e}")))?;

        // oxipng performs palette reduction and interlacing, so it always runs for those.
        if params.palette || params.interlace || params.compression >= 3 {
            let preset = match params.speed {
                Some(speed) => (9 - speed.min(9)) * 6 / 9,
                None if params.compression >= 7 => 4,
                None => 2,
            };
            let mut options = oxipng::Options::from_preset(preset);
            options.strip = oxipng::StripChunks::None;
            options.interlace = Some(params.interlace);
            buf = oxipng::optimize_from_memory(&buf, &options).map_err(|e| {
                PixformError::encode_failed("png", format!("oxipng optimization failed: {e}"))
            })?;
        }

        if embedded.icc.is_none() && embedded.exif.is_none() {
            return Ok(buf);
        }
        let mut png = Png::from_bytes(Bytes::from(buf))
            .map_err(|e| PixformError::encode_failed("png", format!("failed to reparse output: {e}")))?;
        if let Some(icc) = embedded.icc {
            png.set_icc_profile(Some(Bytes::copy_from_slice(icc)));
        }
        if let Some(exif) = embedded.exif {
            png.set_exif(Some(Bytes::copy_from_slice(exif)));
        }
        let mut output = Vec::new();
        png.encoder()
            .write_to(&mut output)
            .map_err(|e| PixformError::encode_failed("png", format!("failed to write metadata: {e}")))?;
        Ok(output)
    })
}

/// Popularity quantizer: buckets colours at 5 bits per channel (4 for alpha),
/// keeps the `max_colors` most frequent bucket means and maps every pixel to
/// the nearest of them. Output keeps the input's alpha layout.
fn quantize(img: &DynamicImage, max_colors: usize) -> DynamicImage {
    let has_alpha = img.color().has_alpha();
    let rgba = img.to_rgba8();
    let key = |p: &[u8]| -> u32 {
        (p[0] as u32 >> 3) << 15 | (p[1] as u32 >> 3) << 10 | (p[2] as u32 >> 3) << 5 | (p[3] as u32 >> 4)
    };

    let mut buckets: HashMap<u32, (u64, [u64; 4])> = HashMap::new();
    for p in rgba.pixels() {
        let entry = buckets.entry(key(&p.0)).or_insert((0, [0; 4]));
        entry.0 += 1;
        for (sum, v) in entry.1.iter_mut().zip(p.0) {
            *sum += v as u64;
        }
    }
    let mut ranked: Vec<(u64, [u64; 4])> = buckets.into_values().collect();
    ranked.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    let palette: Vec<[u8; 4]> = ranked
        .iter()
        .take(max_colors.max(1))
        .map(|(count, sum)| sum.map(|s| (s / count) as u8))
        .collect();

    let nearest = |p: &[u8]| -> [u8; 4] {
        let mut best = palette[0];
        let mut best_dist = u32::MAX;
        for c in &palette {
            let dist: u32 = c
                .iter()
                .zip(p)
                .map(|(&a, &b)| (a as i32 - b as i32).unsigned_abs().pow(2))
                .sum();
            if dist < best_dist {
                best_dist = dist;
                best = *c;
            }
        }
        best
    };

    let mut cache: HashMap<u32, [u8; 4]> = HashMap::new();
    let mapped = RgbaImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let p = rgba.get_pixel(x, y).0;
        image::Rgba(*cache.entry(key(&p)).or_insert_with(|| nearest(&p)))
    });
    let mapped = DynamicImage::ImageRgba8(mapped);
    if has_alpha {
        mapped
    } else {
        DynamicImage::ImageRgb8(mapped.to_rgb8())
    }
}

fn encode_webp(img: &DynamicImage, params: &EncodeParams, embedded: &Embedded<'_>) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:webp", || {
        let has_alpha = img.color().has_alpha();
        let (w, h) = (img.width(), img.height());
        let pixels: Cow<'_, [u8]> = match (img, has_alpha) {
            (DynamicImage::ImageRgba8(rgba), true) => Cow::Borrowed(rgba.as_raw().as_slice()),
            (DynamicImage::ImageRgb8(rgb), false) => Cow::Borrowed(rgb.as_raw().as_slice()),
            (_, true) => Cow::Owned(img.to_rgba8().into_raw()),
            (_, false) => Cow::Owned(img.to_rgb8().into_raw()),
        };
        let encoder = if has_alpha {
            webp::Encoder::from_rgba(&pixels, w, h)
        } else {
            webp::Encoder::from_rgb(&pixels, w, h)
        };

        let mut config = webp::WebPConfig::new()
            .map_err(|_| PixformError::engine_failure("encode:webp", "failed to create WebPConfig"))?;
        let settings = QualitySettings::new(params.quality);
        config.lossless = i32::from(params.lossless);
        config.quality = params.quality as f32;
        config.method = 4;
        config.pass = 1;
        config.sns_strength = settings.webp_sns_strength();
        config.autofilter = 1;
        config.filter_strength = settings.webp_filter_strength();
        config.filter_sharpness = settings.webp_filter_sharpness();
        if params.lossless {
            config.exact = 1;
        }

        let encoded = encoder
            .encode_advanced(&config)
            .map_err(|e| PixformError::encode_failed("webp", format!("WebP encode failed: {e:?}")))?
            .to_vec();

        if embedded.icc.is_none() && embedded.exif.is_none() {
            return Ok(encoded);
        }
        let mut webp = WebP::from_bytes(Bytes::from(encoded))
            .map_err(|e| PixformError::encode_failed("webp", format!("failed to reparse output: {e}")))?;
        if let Some(icc) = embedded.icc {
            webp.set_icc_profile(Some(Bytes::copy_from_slice(icc)));
        }
        if let Some(exif) = embedded.exif {
            webp.set_exif(Some(Bytes::copy_from_slice(exif)));
        }
        let mut output = Vec::new();
        webp.encoder()
            .write_to(&mut output)
            .map_err(|e| PixformError::encode_failed("webp", format!("failed to write metadata: {e}")))?;
        Ok(output)
    })
}

fn encode_tiff(img: &DynamicImage) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:tiff", || {
        let converted;
        let source = match img {
            DynamicImage::ImageLumaA8(_) => {
                converted = DynamicImage::ImageRgba8(img.to_rgba8());
                &converted
            }
            DynamicImage::ImageLumaA16(_) => {
                converted = DynamicImage::ImageRgba16(img.to_rgba16());
                &converted
            }
            _ => img,
        };
        write_with_image_crate(source, ImageFormat::Tiff, "tiff")
    })
}

fn encode_gif(img: &DynamicImage) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:gif", || {
        let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
        write_with_image_crate(&rgba, ImageFormat::Gif, "gif")
    })
}

fn write_with_image_crate(img: &DynamicImage, format: ImageFormat, name: &'static str) -> EncoderResult<Vec<u8>> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format)
        .map_err(|e| PixformError::encode_failed(name, e.to_string()))?;
    Ok(buf)
}

fn encode_avif(img: &DynamicImage, params: &EncodeParams, embedded: &Embedded<'_>) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:avif", || {
        let (width, height) = (img.width(), img.height());
        let has_alpha = img.color().has_alpha();
        let settings = QualitySettings::new(params.quality);

        let pixels: Cow<'_, [u8]> = match (img, has_alpha) {
            (DynamicImage::ImageRgba8(rgba), true) => Cow::Borrowed(rgba.as_raw().as_slice()),
            (DynamicImage::ImageRgb8(rgb), false) => Cow::Borrowed(rgb.as_raw().as_slice()),
            (_, true) => Cow::Owned(img.to_rgba8().into_raw()),
            (_, false) => Cow::Owned(img.to_rgb8().into_raw()),
        };

        let (pixel_format, matrix, quality) = if params.lossless {
            (AVIF_PIXEL_FORMAT_YUV444, AVIF_MATRIX_COEFFICIENTS_IDENTITY, 100)
        } else {
            (AVIF_PIXEL_FORMAT_YUV420, AVIF_MATRIX_COEFFICIENTS_BT709, params.quality)
        };

        let mut avif_image = SafeAvifImage::new(width, height, 8, pixel_format)?;
        avif_image.set_color_properties(
            AVIF_COLOR_PRIMARIES_BT709 as u16,
            AVIF_TRANSFER_CHARACTERISTICS_SRGB as u16,
            matrix as u16,
            AVIF_RANGE_FULL,
        );
        if let Some(icc) = embedded.icc {
            avif_image.set_icc_profile(icc)?;
        }
        if let Some(exif) = embedded.exif {
            avif_image.set_exif(exif)?;
        }

        let rgb = AvifRgbView::new(&mut avif_image, &pixels, has_alpha)?;
        avif_image.allocate_planes(AVIF_PLANES_YUV)?;
        avif_image.rgb_to_yuv(&rgb)?;
        if has_alpha {
            avif_image.allocate_planes(AVIF_PLANES_A)?;
            avif_image.copy_alpha_from_rgba(&pixels)?;
        }

        let speed = params
            .speed
            .map(i32::from)
            .unwrap_or_else(|| settings.avif_speed());
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .clamp(2, 8) as i32;

        let mut encoder = SafeAvifEncoder::new()?;
        encoder.configure(quality, quality, speed, threads);
        let mut output = SafeAvifRwData::new();
        encoder.add_image(&mut avif_image, 1, AVIF_ADD_IMAGE_FLAG_SINGLE)?;
        encoder.finish(&mut output)?;
        Ok(output.to_vec())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::decoder::load_auto;
    use crate::engine::io::tests::create_minimal_srgb_icc;
    use crate::engine::metadata::tests::exif_block;
    use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

    fn gradient(width: u32, height: u32) -> ImageHandle {
        ImageHandle::from_image(DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        })))
    }

    fn translucent(width: u32, height: u32) -> ImageHandle {
        ImageHandle::from_image(DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, _| {
            Rgba([200, 40, (x % 256) as u8, 100])
        })))
    }

    fn with_metadata(handle: ImageHandle) -> ImageHandle {
        let mut handle = handle;
        handle.set_icc_profile(Some(create_minimal_srgb_icc()));
        handle.set_exif(Some(exif_block(1)));
        handle
    }

    mod params_tests {
        use super::*;

        #[test]
        fn defaults_are_valid_everywhere() {
            for tag in FormatTag::ALL {
                assert!(EncodeParams::default().validate_for(tag).is_ok());
            }
        }

        #[test]
        fn out_of_range_values_are_rejected() {
            let bad_quality = EncodeParams::with_quality(101);
            assert!(matches!(
                bad_quality.validate_for(FormatTag::Jpeg),
                Err(PixformError::InvalidArgument { .. })
            ));
            let bad_compression = EncodeParams {
                compression: 10,
                ..EncodeParams::default()
            };
            assert!(bad_compression.validate_for(FormatTag::Png).is_err());

            let speed = |speed| EncodeParams {
                speed: Some(speed),
                ..EncodeParams::default()
            };
            assert!(speed(9).validate_for(FormatTag::Png).is_ok());
            assert!(speed(10).validate_for(FormatTag::Png).is_err());
            assert!(speed(10).validate_for(FormatTag::Avif).is_ok());
            assert!(speed(11).validate_for(FormatTag::Avif).is_err());
            // Formats without a speed knob ignore it.
            assert!(speed(200).validate_for(FormatTag::Jpeg).is_ok());
        }

        #[test]
        fn invalid_params_fail_before_encoding() {
            let err = encode(&gradient(4, 4), FormatTag::Jpeg, &EncodeParams::with_quality(150)).unwrap_err();
            assert!(matches!(err, PixformError::InvalidArgument { .. }));
        }

        #[test]
        fn quality_bands() {
            assert_eq!(QualitySettings::new(90).avif_speed(), 6);
            assert_eq!(QualitySettings::new(75).avif_speed(), 7);
            assert_eq!(QualitySettings::new(55).avif_speed(), 8);
            assert_eq!(QualitySettings::new(10).avif_speed(), 9);
            assert_eq!(QualitySettings::new(0).palette_colors(), 2);
            assert_eq!(QualitySettings::new(100).palette_colors(), 256);
        }
    }

    mod dispatch_tests {
        use super::*;

        #[test]
        fn unsupported_targets_are_rejected() {
            for tag in [FormatTag::Pdf, FormatTag::Svg, FormatTag::Heif, FormatTag::Jxl, FormatTag::Unknown] {
                let err = encode(&gradient(4, 4), tag, &EncodeParams::default()).unwrap_err();
                assert!(matches!(err, PixformError::UnsupportedFormat { .. }), "{tag}");
            }
        }

        #[test]
        fn format_dimension_limit_is_an_encode_error() {
            let wide = ImageHandle::from_image(DynamicImage::ImageLuma8(GrayImage::new(16_384, 1)));
            let err = encode(&wide, FormatTag::Webp, &EncodeParams::default()).unwrap_err();
            assert!(matches!(err, PixformError::EncodeFailed { .. }));
        }

        #[test]
        fn outputs_decode_with_same_dimensions() {
            let source = gradient(37, 23);
            for tag in [FormatTag::Jpeg, FormatTag::Png, FormatTag::Webp, FormatTag::Tiff, FormatTag::Gif] {
                let bytes = encode(&source, tag, &EncodeParams::default()).unwrap();
                let decoded = load_auto(&bytes, 1).unwrap();
                assert_eq!(decoded.source_format(), tag);
                assert_eq!(decoded.dimensions(), (37, 23), "{tag}");
            }
        }

        #[test]
        fn avif_output_has_ftyp_brand() {
            let bytes = encode(&translucent(16, 8), FormatTag::Avif, &EncodeParams::default()).unwrap();
            assert_eq!(&bytes[4..8], b"ftyp");
            assert_eq!(&bytes[8..12], b"avif");

            let lossless = EncodeParams {
                lossless: true,
                speed: Some(10),
                ..EncodeParams::default()
            };
            assert!(encode(&gradient(16, 8), FormatTag::Avif, &lossless).is_ok());
        }
    }

    mod normalize_tests {
        use super::*;

        #[test]
        fn jpeg_flattens_alpha_onto_white() {
            let img = ImageHandle::from_image(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                8,
                8,
                Rgba([0, 0, 0, 0]),
            )));
            let bytes = encode(&img, FormatTag::Jpeg, &EncodeParams::with_quality(95)).unwrap();
            let decoded = load_auto(&bytes, 1).unwrap();
            assert!(!decoded.has_alpha());
            let px = decoded.pixels().to_rgb8().get_pixel(4, 4).0;
            assert!(px.iter().all(|&c| c > 245), "{px:?}");
        }

        #[test]
        fn png_keeps_alpha_and_sixteen_bits() {
            let deep = ImageHandle::from_image(DynamicImage::ImageRgba16(image::ImageBuffer::from_pixel(
                4,
                4,
                Rgba([1000u16, 30000, 65535, 40000]),
            )));
            let bytes = encode(&deep, FormatTag::Png, &EncodeParams::default()).unwrap();
            let decoded = load_auto(&bytes, 1).unwrap();
            assert_eq!(decoded.bit_depth(), BitDepth::Sixteen);
            assert!(decoded.has_alpha());
        }

        #[test]
        fn webp_reduces_sixteen_bits() {
            let deep = ImageHandle::from_image(DynamicImage::ImageRgb16(image::ImageBuffer::from_pixel(
                4,
                4,
                Rgb([65535u16, 0, 0]),
            )));
            let prepared = normalize_for(&deep, FormatTag::Webp).unwrap();
            assert_eq!(prepared.bit_depth(), BitDepth::Eight);
            assert_eq!(prepared.pixels().to_rgb8().get_pixel(0, 0).0, [255, 0, 0]);
        }

        #[test]
        fn non_rgb_interpretations_go_to_srgb() {
            let lab = convert_colorspace(gradient(4, 4), Interpretation::Lab).unwrap();
            let prepared = normalize_for(&lab, FormatTag::Png).unwrap();
            assert_eq!(prepared.interpretation(), Interpretation::Srgb);
            assert!(matches!(prepared, Cow::Owned(_)));

            let untouched = gradient(4, 4);
            assert!(matches!(normalize_for(&untouched, FormatTag::Png).unwrap(), Cow::Borrowed(_)));
        }

        #[test]
        fn grey_jpeg_stays_grey() {
            let grey = ImageHandle::from_image(DynamicImage::ImageLuma8(GrayImage::from_pixel(9, 5, Luma([90]))));
            let bytes = encode(&grey, FormatTag::Jpeg, &EncodeParams::default()).unwrap();
            let decoded = load_auto(&bytes, 1).unwrap();
            assert_eq!(decoded.bands(), 1);
            assert_eq!(decoded.dimensions(), (9, 5));
        }
    }

    mod metadata_tests {
        use super::*;

        #[test]
        fn icc_and_exif_are_reembedded() {
            let source = with_metadata(gradient(8, 8));
            for tag in [FormatTag::Jpeg, FormatTag::Png] {
                let bytes = encode(&source, tag, &EncodeParams::default()).unwrap();
                let decoded = load_auto(&bytes, 1).unwrap();
                assert!(decoded.has_icc_profile(), "{tag} lost ICC");
                assert!(decoded.has_exif(), "{tag} lost EXIF");
            }
            let webp = encode(&source, FormatTag::Webp, &EncodeParams::default()).unwrap();
            assert_eq!(&webp[0..4], b"RIFF");
            assert!(load_auto(&webp, 1).unwrap().has_icc_profile());
        }

        #[test]
        fn strip_drops_metadata() {
            let source = with_metadata(gradient(8, 8));
            let params = EncodeParams {
                strip: true,
                ..EncodeParams::default()
            };
            for tag in [FormatTag::Jpeg, FormatTag::Png, FormatTag::Webp] {
                let bytes = encode(&source, tag, &params).unwrap();
                let decoded = load_auto(&bytes, 1).unwrap();
                assert!(!decoded.has_icc_profile(), "{tag} kept ICC");
                assert!(!decoded.has_exif(), "{tag} kept EXIF");
            }
        }

        #[test]
        fn large_icc_profile_is_chunked_in_jpeg() {
            let mut icc = create_minimal_srgb_icc();
            icc.resize(70_000, 0x5A);
            icc[0..4].copy_from_slice(&70_000u32.to_be_bytes());
            let mut source = gradient(8, 8);
            source.set_icc_profile(Some(icc.clone()));

            let bytes = encode(&source, FormatTag::Jpeg, &EncodeParams::default()).unwrap();
            let container = Jpeg::from_bytes(Bytes::from(bytes.clone())).unwrap();
            assert_eq!(container.segments()[0].marker(), img_parts::jpeg::markers::APP0);
            assert!(container.segments().iter().all(|segment| segment.len() <= 65_537));

            let decoded = load_auto(&bytes, 1).unwrap();
            assert_eq!(decoded.icc_profile().map(<[u8]>::len), Some(70_000));
            assert_eq!(decoded.icc_profile(), Some(icc.as_slice()));
        }
    }

    mod png_tests {
        use super::*;

        #[test]
        fn palette_limits_colours() {
            let bytes = encode(
                &gradient(64, 64),
                FormatTag::Png,
                &EncodeParams {
                    palette: true,
                    quality: 5,
                    ..EncodeParams::default()
                },
            )
            .unwrap();
            let decoded = load_auto(&bytes, 1).unwrap().into_pixels().to_rgb8();
            let distinct: std::collections::HashSet<[u8; 3]> = decoded.pixels().map(|p| p.0).collect();
            assert!(distinct.len() <= QualitySettings::new(5).palette_colors());
            assert_eq!(decoded.dimensions(), (64, 64));
        }

        #[test]
        fn quantize_preserves_exact_small_palettes() {
            let img = DynamicImage::ImageRgb8(RgbImage::from_fn(4, 4, |x, _| {
                if x < 2 {
                    Rgb([255, 0, 0])
                } else {
                    Rgb([0, 0, 255])
                }
            }));
            let out = quantize(&img, 2).to_rgb8();
            assert_eq!(out.get_pixel(0, 0).0, [255, 0, 0]);
            assert_eq!(out.get_pixel(3, 3).0, [0, 0, 255]);
        }

        #[test]
        fn interlaced_and_fast_variants_decode() {
            for params in [
                EncodeParams {
                    interlace: true,
                    ..EncodeParams::default()
                },
                EncodeParams {
                    compression: 0,
                    ..EncodeParams::default()
                },
                EncodeParams {
                    compression: 9,
                    speed: Some(9),
                    ..EncodeParams::default()
                },
            ] {
                let bytes = encode(&gradient(20, 10), FormatTag::Png, &params).unwrap();
                let decoded = load_auto(&bytes, 1).unwrap();
                assert_eq!(decoded.pixels().to_rgb8(), gradient(20, 10).pixels().to_rgb8());
            }
        }
    }

    #[test]
    fn webp_lossless_is_exact() {
        let source = translucent(16, 16);
        let params = EncodeParams {
            lossless: true,
            ..EncodeParams::default()
        };
        let bytes = encode(&source, FormatTag::Webp, &params).unwrap();
        let decoded = load_auto(&bytes, 1).unwrap();
        assert_eq!(decoded.pixels().to_rgba8(), source.pixels().to_rgba8());
    }

    #[test]
    fn progressive_jpeg_decodes() {
        let params = EncodeParams {
            interlace: true,
            ..EncodeParams::default()
        };
        let bytes = encode(&gradient(30, 30), FormatTag::Jpeg, &params).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(load_auto(&bytes, 1).unwrap().dimensions(), (30, 30));
    }
}
