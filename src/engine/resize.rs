// src/engine/resize.rs
//
// Resampling primitives. 8-bit layouts go through fast_image_resize (SIMD);
// 16-bit and float rasters fall back to the image crate's resampler.

use crate::engine::common::EngineResult;
use crate::error::PixformError;
use crate::ops::Kernel;
use fast_image_resize::{self as fir, MulDiv, PixelType, ResizeOptions};
use image::{imageops::FilterType, DynamicImage, GrayAlphaImage, GrayImage, RgbImage, RgbaImage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Filter {
    Box,
    Kernel(Kernel),
}

impl Filter {
    fn fir_alg(self) -> fir::ResizeAlg {
        use fir::{FilterType as F, ResizeAlg};
        match self {
            Filter::Box => ResizeAlg::Convolution(F::Box),
            Filter::Kernel(Kernel::Nearest) => ResizeAlg::Nearest,
            Filter::Kernel(Kernel::Linear) => ResizeAlg::Convolution(F::Bilinear),
            Filter::Kernel(Kernel::Cubic) => ResizeAlg::Convolution(F::CatmullRom),
            Filter::Kernel(Kernel::Mitchell) => ResizeAlg::Convolution(F::Mitchell),
            Filter::Kernel(Kernel::Lanczos3) => ResizeAlg::Convolution(F::Lanczos3),
        }
    }

    fn image_filter(self) -> FilterType {
        match self {
            Filter::Box | Filter::Kernel(Kernel::Linear) => FilterType::Triangle,
            Filter::Kernel(Kernel::Nearest) => FilterType::Nearest,
            Filter::Kernel(Kernel::Cubic) | Filter::Kernel(Kernel::Mitchell) => {
                FilterType::CatmullRom
            }
            Filter::Kernel(Kernel::Lanczos3) => FilterType::Lanczos3,
        }
    }
}

/// Resamples `img` to exactly `width`x`height`.
///
/// `premultiply` controls whether an alpha band is premultiplied around the
/// convolution; callers pass false for layouts whose fourth band is not alpha.
pub fn resize_exact(
    img: &DynamicImage,
    width: u32,
    height: u32,
    kernel: Kernel,
    premultiply: bool,
) -> EngineResult<DynamicImage> {
    resize_with(img, width, height, Filter::Kernel(kernel), premultiply)
}

/// Box-filter downsample used after decode-time shrinking.
pub fn box_resize(img: &DynamicImage, width: u32, height: u32) -> EngineResult<DynamicImage> {
    resize_with(img, width, height, Filter::Box, true)
}

/// Box-filter downsample for four-band layouts whose last band is not alpha (CMYK).
pub fn box_resize_bands(img: &DynamicImage, width: u32, height: u32) -> EngineResult<DynamicImage> {
    resize_with(img, width, height, Filter::Box, false)
}

fn resize_with(
    img: &DynamicImage,
    width: u32,
    height: u32,
    filter: Filter,
    premultiply: bool,
) -> EngineResult<DynamicImage> {
    if width == 0 || height == 0 {
        return Err(PixformError::invalid_argument(
            "resize",
            "size",
            format!("{width}x{height}"),
            "target dimensions must be positive",
        ));
    }
    if img.width() == width && img.height() == height {
        return Ok(img.clone());
    }

    let (pixel_type, pixels) = match img {
        DynamicImage::ImageLuma8(b) => (PixelType::U8, b.as_raw().clone()),
        DynamicImage::ImageLumaA8(b) => (PixelType::U8x2, b.as_raw().clone()),
        DynamicImage::ImageRgb8(b) => (PixelType::U8x3, b.as_raw().clone()),
        DynamicImage::ImageRgba8(b) => (PixelType::U8x4, b.as_raw().clone()),
        _ => return Ok(img.resize_exact(width, height, filter.image_filter())),
    };

    fir_resize(
        img.width(),
        img.height(),
        pixels,
        pixel_type,
        width,
        height,
        filter,
        premultiply,
    )
    .map_err(|reason| {
        PixformError::engine_failure(
            "resize",
            format!(
                "{}x{} -> {width}x{height}: {reason}",
                img.width(),
                img.height()
            ),
        )
    })
}

#[allow(clippy::too_many_arguments)]
fn fir_resize(
    src_width: u32,
    src_height: u32,
    mut src_pixels: Vec<u8>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    filter: Filter,
    premultiply: bool,
) -> std::result::Result<DynamicImage, String> {
    let mut src_image =
        fir::images::Image::from_slice_u8(src_width, src_height, &mut src_pixels, pixel_type)
            .map_err(|e| format!("fir source image error: {e:?}"))?;
    let mut dst_image = fir::images::Image::new(dst_width, dst_height, pixel_type);

    let has_alpha = matches!(pixel_type, PixelType::U8x2 | PixelType::U8x4);
    let needs_premultiply = premultiply && has_alpha && !is_fully_opaque(&src_image, pixel_type);

    let mul_div = MulDiv::default();
    if needs_premultiply {
        mul_div
            .multiply_alpha_inplace(&mut src_image)
            .map_err(|e| format!("failed to premultiply alpha: {e}"))?;
    }

    let options = ResizeOptions::new().resize_alg(filter.fir_alg());
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, &options)
        .map_err(|e| format!("fir resize error: {e:?}"))?;

    if needs_premultiply {
        mul_div
            .divide_alpha_inplace(&mut dst_image)
            .map_err(|e| format!("failed to unpremultiply alpha: {e}"))?;
    }

    let dst_pixels = dst_image.into_vec();
    let img = match pixel_type {
        PixelType::U8 => GrayImage::from_raw(dst_width, dst_height, dst_pixels).map(DynamicImage::ImageLuma8),
        PixelType::U8x2 => {
            GrayAlphaImage::from_raw(dst_width, dst_height, dst_pixels).map(DynamicImage::ImageLumaA8)
        }
        PixelType::U8x3 => RgbImage::from_raw(dst_width, dst_height, dst_pixels).map(DynamicImage::ImageRgb8),
        PixelType::U8x4 => {
            RgbaImage::from_raw(dst_width, dst_height, dst_pixels).map(DynamicImage::ImageRgba8)
        }
        _ => None,
    };
    img.ok_or_else(|| "failed to create image from resized data".to_string())
}

/// True when every alpha sample is at full opacity; premultiplication is then a no-op.
fn is_fully_opaque(image: &fir::images::Image, pixel_type: PixelType) -> bool {
    let stride = match pixel_type {
        PixelType::U8x2 => 2,
        PixelType::U8x4 => 4,
        _ => return true,
    };
    image
        .buffer()
        .iter()
        .skip(stride - 1)
        .step_by(stride)
        .all(|&alpha| alpha == 255)
}
