// src/engine/decoder.rs
//
// Loader: format-specific decoding into an ImageHandle with optional shrink-on-load.
// JPEG (mozjpeg, DCT-domain scaling), PNG (zune-png, 16-bit preserved), WebP
// (libwebp), SVG (resvg), everything else through the image crate.

use crate::engine::common::run_with_panic_policy;
use crate::engine::config::config;
use crate::engine::handle::{interpretation_for, BitDepth, ImageHandle, Interpretation};
use crate::engine::io::{extract_exif_raw, extract_icc_profile};
use crate::engine::metadata::{orientation_from_container, orientation_from_exif};
use crate::engine::registry::{detect_format, supports_decode, FormatTag};
use crate::engine::resize::{box_resize, box_resize_bands};
use crate::engine::text::font_database;
use crate::error::PixformError;
use image::{
    DynamicImage, GrayAlphaImage, GrayImage, ImageBuffer, ImageFormat, ImageReader, RgbImage,
    RgbaImage,
};
use mozjpeg::{ColorSpace as JpegColorSpace, Decompress};
use std::io::Cursor;
use tracing::{debug, warn};
use webp::{BitstreamFeatures, Decoder as WebPDecoder};
use zune_core::bytestream::ZCursor;
use zune_core::colorspace::ColorSpace;
use zune_core::options::DecoderOptions;
use zune_png::PngDecoder;

// Decode errors keep their taxonomy (CodecError, ResourceLimit, ...) all the way up.
type DecoderResult<T> = std::result::Result<T, PixformError>;

/// Largest DCT-domain reduction libjpeg supports.
const MAX_DCT_SHRINK: u32 = 8;

/// Detects the format of `buffer` and loads it.
pub fn load_auto(buffer: &[u8], shrink: u32) -> DecoderResult<ImageHandle> {
    let tag = detect_format(buffer)?;
    load(buffer, tag, shrink)
}

/// Decodes `buffer` as `tag`.
///
/// `shrink` (>= 1) reduces the decoded size to `ceil(source / shrink)` for formats
/// that support shrink-on-load (JPEG, WebP) and is ignored for the rest.
pub fn load(buffer: &[u8], tag: FormatTag, shrink: u32) -> DecoderResult<ImageHandle> {
    if !supports_decode(tag) {
        return Err(PixformError::unsupported_format(tag.name(), "load"));
    }
    if shrink == 0 {
        return Err(PixformError::invalid_argument(
            "load",
            "shrink",
            shrink,
            "shrink factor must be at least 1",
        ));
    }

    let limits = &config().limits;
    limits.enforce_input_len(buffer.len())?;
    if tag != FormatTag::Svg {
        // Reject decompression bombs before any pixel buffer is allocated.
        if let Ok((width, height)) = read_dimensions(buffer, tag) {
            check_dimensions(width, height)?;
        }
    }

    let (pixels, interpretation) = match tag {
        FormatTag::Jpeg => decode_jpeg(buffer, shrink)?,
        other => {
            let img = match other {
                FormatTag::Png => decode_png_zune(buffer)?,
                FormatTag::Webp => {
                    let img = decode_webp_libwebp(buffer)?;
                    shrink_decoded(img, shrink)?
                }
                FormatTag::Tiff => decode_with_image_crate(buffer, Some(ImageFormat::Tiff))?,
                FormatTag::Gif => decode_with_image_crate(buffer, Some(ImageFormat::Gif))?,
                FormatTag::Magick => decode_with_image_crate(buffer, None)?,
                FormatTag::Svg => decode_svg(buffer)?,
                FormatTag::Jpeg
                | FormatTag::Unknown
                | FormatTag::Pdf
                | FormatTag::Heif
                | FormatTag::Avif
                | FormatTag::Jxl => return Err(PixformError::unsupported_format(tag.name(), "load")),
            };
            let interpretation = interpretation_for(
                img.color().channel_count() as usize,
                BitDepth::of(img.color()),
            );
            (img, interpretation)
        }
    };
    check_dimensions(pixels.width(), pixels.height())?;

    if shrink > 1 && !tag.supports_shrink_on_load() {
        debug!(target: "pixform::loader", format = %tag, shrink, "shrink-on-load ignored");
    }

    let icc = extract_icc_profile(buffer, tag).filter(|icc| {
        let matches = profile_matches(icc, interpretation);
        if !matches {
            warn!(target: "pixform::loader", format = %tag, %interpretation, "embedded ICC profile does not match pixels, dropped");
        }
        matches
    });
    let exif = extract_exif_raw(buffer, tag);
    let orientation = exif
        .as_deref()
        .and_then(orientation_from_exif)
        .or_else(|| (tag == FormatTag::Tiff).then(|| orientation_from_container(buffer)).flatten())
        .unwrap_or(1);

    debug!(
        target: "pixform::loader",
        format = %tag,
        %interpretation,
        width = pixels.width(),
        height = pixels.height(),
        shrink,
        orientation,
        has_icc = icc.is_some(),
        has_exif = exif.is_some(),
        "decoded"
    );
    crate::engine::common::trace_materialize("load", &pixels);
    Ok(ImageHandle::from_decoded_as(
        pixels,
        interpretation,
        tag,
        icc,
        exif,
        orientation,
    ))
}

/// Reads the image size from the header without decoding pixels.
pub fn read_dimensions(buffer: &[u8], tag: FormatTag) -> DecoderResult<(u32, u32)> {
    match tag {
        FormatTag::Jpeg
        | FormatTag::Png
        | FormatTag::Webp
        | FormatTag::Tiff
        | FormatTag::Gif
        | FormatTag::Magick => ImageReader::new(Cursor::new(buffer))
            .with_guessed_format()
            .map_err(|e| PixformError::decode_failed(tag.name(), e.to_string()))?
            .into_dimensions()
            .map_err(|e| PixformError::decode_failed(tag.name(), e.to_string())),
        FormatTag::Svg => {
            let tree = parse_svg(buffer)?;
            let size = tree.size().to_int_size();
            Ok((size.width(), size.height()))
        }
        FormatTag::Unknown
        | FormatTag::Pdf
        | FormatTag::Heif
        | FormatTag::Avif
        | FormatTag::Jxl => Err(PixformError::unsupported_format(tag.name(), "read_dimensions")),
    }
}

/// Check image dimensions against the process-wide limits.
/// Returns an error if the image is too large (potential decompression bomb).
pub fn check_dimensions(width: u32, height: u32) -> DecoderResult<()> {
    config().limits.enforce_dimensions(width, height)
}

/// Power-of-two DCT reduction to request from libjpeg for an overall `shrink`.
fn dct_shrink(shrink: u32) -> u32 {
    let mut scale = 1;
    while scale * 2 <= shrink.min(MAX_DCT_SHRINK) {
        scale *= 2;
    }
    scale
}

/// Decode a JPEG at `ceil(source / shrink)`: libjpeg scales in the DCT domain by
/// the largest power of two that fits, a box filter finishes the remainder.
/// Greyscale streams stay one band and CMYK/YCCK streams stay four ink bands.
fn decode_jpeg(data: &[u8], shrink: u32) -> DecoderResult<(DynamicImage, Interpretation)> {
    // Truncated streams would otherwise decode to a grey-filled image.
    if !data.windows(2).any(|pair| pair == [0xFF, 0xD9]) {
        return Err(PixformError::decode_failed("jpeg", "missing JPEG EOI marker"));
    }
    let dct = dct_shrink(shrink);
    let (img, interpretation, (src_w, src_h)) = match decode_jpeg_mozjpeg(data, dct) {
        Ok(decoded) => decoded,
        Err(err @ (PixformError::DecodeFailed { .. } | PixformError::EngineFailure { .. })) => {
            warn!(target: "pixform::loader", error = %err, "mozjpeg failed, falling back to image crate");
            let img = decode_with_image_crate(data, Some(ImageFormat::Jpeg))?;
            let interpretation = interpretation_for(
                img.color().channel_count() as usize,
                BitDepth::of(img.color()),
            );
            let dims = (img.width(), img.height());
            (img, interpretation, dims)
        }
        Err(err) => return Err(err),
    };

    let target = (src_w.div_ceil(shrink), src_h.div_ceil(shrink));
    let (w, h) = (target.0.max(1), target.1.max(1));
    if (img.width(), img.height()) == (w, h) {
        Ok((img, interpretation))
    } else if interpretation == Interpretation::Cmyk {
        Ok((box_resize_bands(&img, w, h)?, interpretation))
    } else {
        Ok((box_resize(&img, w, h)?, interpretation))
    }
}

/// Decode JPEG using mozjpeg (backed by libjpeg-turbo), scaled by `1/dct`.
/// Returns the decoded image, its interpretation and the full-resolution source size.
fn decode_jpeg_mozjpeg(
    data: &[u8],
    dct: u32,
) -> DecoderResult<(DynamicImage, Interpretation, (u32, u32))> {
    run_with_panic_policy("decode:mozjpeg", || {
        let mut decompress = Decompress::new_mem(data).map_err(|e| {
            PixformError::decode_failed("jpeg", format!("mozjpeg decompress init failed: {e:?}"))
        })?;
        let source = (decompress.width() as u32, decompress.height() as u32);
        check_dimensions(source.0, source.1)?;
        if dct > 1 {
            decompress.scale((8 / dct) as u8);
        }

        let (out_space, interpretation) = match decompress.color_space() {
            JpegColorSpace::JCS_GRAYSCALE => (JpegColorSpace::JCS_GRAYSCALE, Interpretation::BW),
            JpegColorSpace::JCS_CMYK | JpegColorSpace::JCS_YCCK => {
                (JpegColorSpace::JCS_CMYK, Interpretation::Cmyk)
            }
            _ => (JpegColorSpace::JCS_RGB, Interpretation::Srgb),
        };
        let mut decompress = decompress.to_colorspace(out_space).map_err(|e| {
            PixformError::decode_failed("jpeg", format!("mozjpeg {out_space:?} conversion failed: {e:?}"))
        })?;
        let width = decompress.width() as u32;
        let height = decompress.height() as u32;

        let mut samples: Vec<u8> = decompress.read_scanlines().map_err(|e| {
            PixformError::decode_failed("jpeg", format!("mozjpeg: failed to read scanlines: {e:?}"))
        })?;

        let img = match interpretation {
            Interpretation::BW => GrayImage::from_raw(width, height, samples).map(DynamicImage::ImageLuma8),
            Interpretation::Cmyk => {
                // Adobe writers store inverted inks (255 = no ink).
                if has_adobe_marker(data) {
                    samples.iter_mut().for_each(|v| *v = 255 - *v);
                }
                RgbaImage::from_raw(width, height, samples).map(DynamicImage::ImageRgba8)
            }
            _ => RgbImage::from_raw(width, height, samples).map(DynamicImage::ImageRgb8),
        }
        .ok_or_else(|| {
            PixformError::decode_failed("jpeg", "mozjpeg: failed to create image from raw data")
        })?;
        Ok((img, interpretation, source))
    })
}

/// True when the stream carries an Adobe APP14 segment.
fn has_adobe_marker(data: &[u8]) -> bool {
    data.windows(9)
        .any(|w| w[0] == 0xFF && w[1] == 0xEE && &w[4..9] == b"Adobe")
}

/// An embedded profile only describes the pixels when both agree on CMYK vs not.
fn profile_matches(icc: &[u8], interpretation: Interpretation) -> bool {
    let cmyk_profile = icc.get(16..20) == Some(b"CMYK".as_slice());
    cmyk_profile == (interpretation == Interpretation::Cmyk)
}

/// Decode PNG using zune-png. 16-bit inputs stay 16-bit.
fn decode_png_zune(data: &[u8]) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:png", || {
        let options = DecoderOptions::default().png_set_strip_to_8bit(false);
        let mut decoder = PngDecoder::new_with_options(ZCursor::new(data), options);
        let pixels = decoder
            .decode()
            .map_err(|e| PixformError::decode_failed("png", format!("decode failed: {e:?}")))?;

        let info = decoder
            .info()
            .ok_or_else(|| PixformError::decode_failed("png", "missing header info"))?;
        let width = info.width as u32;
        let height = info.height as u32;
        check_dimensions(width, height)?;

        let colorspace = decoder
            .colorspace()
            .ok_or_else(|| PixformError::decode_failed("png", "missing colorspace"))?;

        let img = match pixels {
            zune_core::result::DecodingResult::U8(buf) => match colorspace {
                ColorSpace::RGB => RgbImage::from_raw(width, height, buf).map(DynamicImage::ImageRgb8),
                ColorSpace::RGBA => RgbaImage::from_raw(width, height, buf).map(DynamicImage::ImageRgba8),
                ColorSpace::Luma => GrayImage::from_raw(width, height, buf).map(DynamicImage::ImageLuma8),
                ColorSpace::LumaA => {
                    GrayAlphaImage::from_raw(width, height, buf).map(DynamicImage::ImageLumaA8)
                }
                other => {
                    return Err(PixformError::decode_failed(
                        "png",
                        format!("unsupported colorspace {other:?}"),
                    ))
                }
            },
            zune_core::result::DecodingResult::U16(buf) => match colorspace {
                ColorSpace::RGB => ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgb16),
                ColorSpace::RGBA => ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageRgba16),
                ColorSpace::Luma => ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageLuma16),
                ColorSpace::LumaA => {
                    ImageBuffer::from_raw(width, height, buf).map(DynamicImage::ImageLumaA16)
                }
                other => {
                    return Err(PixformError::decode_failed(
                        "png",
                        format!("unsupported 16-bit colorspace {other:?}"),
                    ))
                }
            },
            _ => return Err(PixformError::decode_failed("png", "unexpected sample type")),
        };

        img.ok_or_else(|| PixformError::decode_failed("png", "pixel buffer does not match header"))
    })
}

/// Decode WebP using libwebp (via webp crate). Falls back to image crate for animated WebP.
fn decode_webp_libwebp(data: &[u8]) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:webp", || {
        // Parse header first to avoid allocating huge buffers on malformed files
        let features = BitstreamFeatures::new(data).ok_or_else(|| {
            PixformError::decode_failed("webp", "failed to read bitstream features")
        })?;
        check_dimensions(features.width(), features.height())?;

        if features.has_animation() {
            // First frame only; the simple libwebp decoder has no animation support.
            return image::load_from_memory_with_format(data, ImageFormat::WebP).map_err(|e| {
                PixformError::decode_failed("webp", format!("animated decode failed: {e}"))
            });
        }

        let decoded = WebPDecoder::new(data)
            .decode()
            .ok_or_else(|| PixformError::decode_failed("webp", "decode failed"))?;
        Ok(decoded.to_image())
    })
}

/// Decode through the image crate under the global panic policy.
fn decode_with_image_crate(data: &[u8], format: Option<ImageFormat>) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:image", || {
        let result = match format {
            Some(format) => image::load_from_memory_with_format(data, format),
            None => image::load_from_memory(data),
        };
        let name = format
            .map(|f| f.extensions_str().first().copied().unwrap_or("image"))
            .unwrap_or("magick");
        result.map_err(|e| PixformError::decode_failed(name, format!("decode failed: {e}")))
    })
}

fn parse_svg(data: &[u8]) -> DecoderResult<resvg::usvg::Tree> {
    let options = resvg::usvg::Options {
        fontdb: font_database(),
        ..Default::default()
    };
    resvg::usvg::Tree::from_data(data, &options)
        .map_err(|e| PixformError::decode_failed("svg", format!("parse failed: {e}")))
}

/// Rasterize an SVG at its intrinsic size into straight-alpha RGBA.
fn decode_svg(data: &[u8]) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:svg", || {
        let tree = parse_svg(data)?;
        let size = tree.size().to_int_size();
        check_dimensions(size.width(), size.height())?;

        let mut pixmap = resvg::tiny_skia::Pixmap::new(size.width(), size.height())
            .ok_or_else(|| PixformError::out_of_memory("failed to allocate svg pixmap"))?;
        resvg::render(&tree, resvg::tiny_skia::Transform::default(), &mut pixmap.as_mut());

        let rgba: Vec<u8> = pixmap
            .pixels()
            .iter()
            .flat_map(|p| {
                let c = p.demultiply();
                [c.red(), c.green(), c.blue(), c.alpha()]
            })
            .collect();
        RgbaImage::from_raw(size.width(), size.height(), rgba)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| PixformError::decode_failed("svg", "pixmap size mismatch"))
    })
}

/// Box-reduce a fully decoded image to `ceil(size / shrink)`.
fn shrink_decoded(img: DynamicImage, shrink: u32) -> DecoderResult<DynamicImage> {
    if shrink <= 1 {
        return Ok(img);
    }
    let width = img.width().div_ceil(shrink).max(1);
    let height = img.height().div_ceil(shrink).max(1);
    box_resize(&img, width, height)
}
