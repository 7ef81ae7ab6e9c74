// src/engine/transform.rs
//
// Geometric transforms. Every function consumes its input handle and returns a
// new one; metadata (ICC, EXIF) travels with the pixels.

use crate::engine::config::config;
use crate::engine::handle::{ImageHandle, Interpretation};
use crate::engine::metadata::set_exif_orientation;
use crate::engine::raster::Raster;
use crate::engine::resize::resize_exact;
use crate::error::PixformError;
use crate::ops::{Color, Direction, Extend, Interpolator, Kernel};
use image::{DynamicImage, ImageBuffer, Pixel};
use rayon::prelude::*;
use tracing::debug;

type TransformResult<T> = std::result::Result<T, PixformError>;

const SCALE_EPSILON: f64 = 1e-9;

/// Applies the EXIF orientation (rotation plus mirror) and resets it to 1.
///
/// Idempotent: an upright handle is returned unchanged.
pub fn autorotate(handle: ImageHandle) -> TransformResult<ImageHandle> {
    let orientation = handle.orientation();
    let img = handle.pixels();
    let upright = match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(), // transpose
        6 => img.rotate90(),
        7 => img.rotate270().fliph(), // transverse
        8 => img.rotate270(),
        _ => return Ok(handle),
    };

    debug!(target: "pixform::pipeline", orientation, "autorotate");
    let mut handle = handle.with_pixels(upright, "autorotate");
    handle.set_orientation(1);
    if let Some(exif) = handle.exif_mut() {
        set_exif_orientation(exif, 1);
    }
    Ok(handle)
}

/// Uniform scale. `scale == 1.0` returns the input untouched.
pub fn resize(handle: ImageHandle, scale: f64) -> TransformResult<ImageHandle> {
    if !scale.is_finite() || scale <= 0.0 {
        return Err(PixformError::invalid_argument(
            "resize",
            "scale",
            scale,
            "scale must be a positive finite number",
        ));
    }
    if (scale - 1.0).abs() < SCALE_EPSILON {
        return Ok(handle);
    }
    let width = scaled_dimension(handle.width(), scale);
    let height = scaled_dimension(handle.height(), scale);
    resize_to(handle, width, height, Kernel::Lanczos3)
}

/// Resamples to exactly `width`x`height`.
pub fn resize_to(
    handle: ImageHandle,
    width: u32,
    height: u32,
    kernel: Kernel,
) -> TransformResult<ImageHandle> {
    if width == 0 || height == 0 {
        return Err(PixformError::invalid_argument(
            "resize_to",
            "size",
            format!("{width}x{height}"),
            "target dimensions must be positive",
        ));
    }
    if handle.dimensions() == (width, height) {
        return Ok(handle);
    }
    config().limits.enforce_dimensions(width, height)?;

    debug!(
        target: "pixform::pipeline",
        from_width = handle.width(),
        from_height = handle.height(),
        width,
        height,
        ?kernel,
        "resize"
    );
    let resized = resize_exact(handle.pixels(), width, height, kernel, handle.has_alpha())?;
    Ok(handle.with_pixels(resized, "resize"))
}

/// Downsamples by fractional factors (each >= 1) using `kernel`.
pub fn reduce(
    handle: ImageHandle,
    xshrink: f64,
    yshrink: f64,
    kernel: Kernel,
) -> TransformResult<ImageHandle> {
    for (name, factor) in [("xshrink", xshrink), ("yshrink", yshrink)] {
        if !factor.is_finite() || factor < 1.0 {
            return Err(PixformError::invalid_argument(
                "reduce",
                name,
                factor,
                "reduce factors must be >= 1",
            ));
        }
    }
    let width = scaled_dimension(handle.width(), 1.0 / xshrink);
    let height = scaled_dimension(handle.height(), 1.0 / yshrink);
    resize_to(handle, width, height, kernel)
}

/// Integer box-average downsample. Output size is `ceil(size / factor)`; edge
/// blocks average only the pixels they cover.
pub fn shrink(handle: ImageHandle, xshrink: u32, yshrink: u32) -> TransformResult<ImageHandle> {
    if xshrink == 0 || yshrink == 0 {
        return Err(PixformError::invalid_argument(
            "shrink",
            "factor",
            format!("{xshrink}x{yshrink}"),
            "shrink factors must be >= 1",
        ));
    }
    if xshrink == 1 && yshrink == 1 {
        return Ok(handle);
    }

    let src = Raster::from_image(handle.pixels());
    let width = src.width.div_ceil(xshrink);
    let height = src.height.div_ceil(yshrink);
    let mut dst = Raster::new(width, height, src.bands, src.depth);
    let bands = src.bands;

    dst.data
        .par_chunks_mut(width as usize * bands)
        .enumerate()
        .for_each(|(oy, row)| {
            let y0 = oy as u32 * yshrink;
            let y1 = (y0 + yshrink).min(src.height);
            for ox in 0..width {
                let x0 = ox * xshrink;
                let x1 = (x0 + xshrink).min(src.width);
                let out = &mut row[ox as usize * bands..(ox as usize + 1) * bands];
                for y in y0..y1 {
                    for x in x0..x1 {
                        for (acc, v) in out.iter_mut().zip(src.pixel(x, y)) {
                            *acc += v;
                        }
                    }
                }
                let count = ((x1 - x0) * (y1 - y0)) as f32;
                out.iter_mut().for_each(|v| *v /= count);
            }
        });

    let img = dst.into_image()?;
    Ok(handle.with_pixels(img, "shrink"))
}

/// General 2x2 linear transform `[a, b, c, d]` mapping source `(x, y)` to
/// `(a*x + b*y, c*x + d*y)`. Output covers the bounding box of the transformed
/// source; pixels mapped from outside the source follow `extend` (black fill for
/// the constant modes).
pub fn affine(
    handle: ImageHandle,
    matrix: [f64; 4],
    interpolator: Interpolator,
    extend: Extend,
) -> TransformResult<ImageHandle> {
    affine_with_background(handle, matrix, interpolator, extend, Color::BLACK)
}

/// [`affine`] with an explicit colour for `Extend::Background`.
pub fn affine_with_background(
    handle: ImageHandle,
    matrix: [f64; 4],
    interpolator: Interpolator,
    extend: Extend,
    background: Color,
) -> TransformResult<ImageHandle> {
    let [a, b, c, d] = matrix;
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(PixformError::invalid_argument(
            "affine",
            "matrix",
            format!("{matrix:?}"),
            "coefficients must be finite",
        ));
    }
    let det = a * d - b * c;
    if det.abs() < 1e-12 {
        return Err(PixformError::invalid_argument(
            "affine",
            "matrix",
            format!("{matrix:?}"),
            "matrix is singular",
        ));
    }
    if matrix == [1.0, 0.0, 0.0, 1.0] {
        return Ok(handle);
    }

    let (w, h) = (handle.width() as f64, handle.height() as f64);
    let corners = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)].map(|(x, y)| (a * x + b * y, c * x + d * y));
    let min_x = corners.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let max_x = corners.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    let min_y = corners.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max_y = corners.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
    let out_w = bounded_extent(max_x - min_x);
    let out_h = bounded_extent(max_y - min_y);
    config().limits.enforce_dimensions(out_w, out_h)?;

    debug!(
        target: "pixform::pipeline",
        ?matrix,
        interpolator = interpolator.name(),
        ?extend,
        width = out_w,
        height = out_h,
        "affine"
    );

    let src = Raster::from_image(handle.pixels());
    let sampler = Sampler::new(&src, extend, fill_pixel(&handle, extend, background));
    let (ia, ib, ic, id) = (d / det, -b / det, -c / det, a / det);
    let bands = src.bands;
    let mut dst = Raster::new(out_w, out_h, bands, src.depth);

    dst.data
        .par_chunks_mut(out_w as usize * bands)
        .enumerate()
        .for_each(|(oy, row)| {
            let y = oy as f64 + 0.5 + min_y;
            for ox in 0..out_w as usize {
                let x = ox as f64 + 0.5 + min_x;
                // Continuous source position, then into pixel-index space.
                let sx = ia * x + ib * y - 0.5;
                let sy = ic * x + id * y - 0.5;
                sampler.sample(interpolator, sx, sy, &mut row[ox * bands..(ox + 1) * bands]);
            }
        });

    let img = dst.into_image()?;
    Ok(handle.with_pixels(img, "affine"))
}

/// Rotates clockwise by 0, 90, 180 or 270 degrees.
pub fn rotate(handle: ImageHandle, angle: i32) -> TransformResult<ImageHandle> {
    let img = handle.pixels();
    let rotated = match angle {
        0 => return Ok(handle),
        90 => img.rotate90(),
        180 => img.rotate180(),
        270 => img.rotate270(),
        other => {
            return Err(PixformError::invalid_argument(
                "rotate",
                "angle",
                other,
                "angle must be 0, 90, 180 or 270; use affine for arbitrary angles",
            ))
        }
    };
    Ok(handle.with_pixels(rotated, "rotate"))
}

pub fn flip(handle: ImageHandle, direction: Direction) -> TransformResult<ImageHandle> {
    let flipped = match direction {
        Direction::Horizontal => handle.pixels().fliph(),
        Direction::Vertical => handle.pixels().flipv(),
    };
    Ok(handle.with_pixels(flipped, "flip"))
}

/// Integer pixel-replication zoom.
pub fn zoom(handle: ImageHandle, xfactor: u32, yfactor: u32) -> TransformResult<ImageHandle> {
    if xfactor == 0 || yfactor == 0 {
        return Err(PixformError::invalid_argument(
            "zoom",
            "factor",
            format!("{xfactor}x{yfactor}"),
            "zoom factors must be >= 1",
        ));
    }
    if xfactor == 1 && yfactor == 1 {
        return Ok(handle);
    }
    let overflow = || {
        PixformError::invalid_argument(
            "zoom",
            "factor",
            format!("{xfactor}x{yfactor}"),
            "zoomed size overflows",
        )
    };
    let width = handle.width().checked_mul(xfactor).ok_or_else(overflow)?;
    let height = handle.height().checked_mul(yfactor).ok_or_else(overflow)?;
    config().limits.enforce_dimensions(width, height)?;

    fn replicate<P: Pixel>(
        buf: &ImageBuffer<P, Vec<P::Subpixel>>,
        xf: u32,
        yf: u32,
    ) -> ImageBuffer<P, Vec<P::Subpixel>> {
        ImageBuffer::from_fn(buf.width() * xf, buf.height() * yf, |x, y| {
            *buf.get_pixel(x / xf, y / yf)
        })
    }

    let zoomed = match handle.pixels() {
        DynamicImage::ImageLuma8(b) => DynamicImage::ImageLuma8(replicate(b, xfactor, yfactor)),
        DynamicImage::ImageLumaA8(b) => DynamicImage::ImageLumaA8(replicate(b, xfactor, yfactor)),
        DynamicImage::ImageRgb8(b) => DynamicImage::ImageRgb8(replicate(b, xfactor, yfactor)),
        DynamicImage::ImageRgba8(b) => DynamicImage::ImageRgba8(replicate(b, xfactor, yfactor)),
        DynamicImage::ImageLuma16(b) => DynamicImage::ImageLuma16(replicate(b, xfactor, yfactor)),
        DynamicImage::ImageLumaA16(b) => DynamicImage::ImageLumaA16(replicate(b, xfactor, yfactor)),
        DynamicImage::ImageRgb16(b) => DynamicImage::ImageRgb16(replicate(b, xfactor, yfactor)),
        DynamicImage::ImageRgba16(b) => DynamicImage::ImageRgba16(replicate(b, xfactor, yfactor)),
        DynamicImage::ImageRgb32F(b) => DynamicImage::ImageRgb32F(replicate(b, xfactor, yfactor)),
        other => DynamicImage::ImageRgba32F(replicate(&other.to_rgba32f(), xfactor, yfactor)),
    };
    Ok(handle.with_pixels(zoomed, "zoom"))
}

/// Places the image at (`left`, `top`) inside a `width`x`height` canvas.
///
/// The canvas must hold the whole source at that offset; the surrounding area
/// is generated per `extend` (`background` for `Extend::Background`).
pub fn embed(
    handle: ImageHandle,
    left: u32,
    top: u32,
    width: u32,
    height: u32,
    extend: Extend,
    background: Color,
) -> TransformResult<ImageHandle> {
    let needed_w = left as u64 + handle.width() as u64;
    let needed_h = top as u64 + handle.height() as u64;
    if (width as u64) < needed_w || (height as u64) < needed_h {
        return Err(PixformError::invalid_argument(
            "embed",
            "size",
            format!("{width}x{height}"),
            format!("canvas must be at least {needed_w}x{needed_h} to hold the source at ({left}, {top})"),
        ));
    }
    if (left, top) == (0, 0) && handle.dimensions() == (width, height) {
        return Ok(handle);
    }
    config().limits.enforce_dimensions(width, height)?;

    let src = Raster::from_image(handle.pixels());
    let sampler = Sampler::new(&src, extend, fill_pixel(&handle, extend, background));
    let bands = src.bands;
    let mut dst = Raster::new(width, height, bands, src.depth);

    dst.data
        .par_chunks_mut(width as usize * bands)
        .enumerate()
        .for_each(|(y, row)| {
            let sy = y as i64 - top as i64;
            for x in 0..width as usize {
                let sx = x as i64 - left as i64;
                row[x * bands..(x + 1) * bands].copy_from_slice(sampler.texel(sx, sy));
            }
        });

    let img = dst.into_image()?;
    Ok(handle.with_pixels(img, "embed"))
}

/// Crops to the given rectangle, which must lie within the source.
pub fn extract_area(
    handle: ImageHandle,
    left: u32,
    top: u32,
    width: u32,
    height: u32,
) -> TransformResult<ImageHandle> {
    if width == 0 || height == 0 {
        return Err(PixformError::invalid_argument(
            "extract_area",
            "size",
            format!("{width}x{height}"),
            "crop dimensions must be positive",
        ));
    }
    let (bw, bh) = handle.dimensions();
    if left as u64 + width as u64 > bw as u64 || top as u64 + height as u64 > bh as u64 {
        return Err(PixformError::out_of_bounds(
            "extract_area",
            (left as i64, top as i64),
            (width, height),
            (bw, bh),
        ));
    }
    if (left, top, width, height) == (0, 0, bw, bh) {
        return Ok(handle);
    }
    let cropped = handle.pixels().crop_imm(left, top, width, height);
    Ok(handle.with_pixels(cropped, "extract_area"))
}

/// Composites the alpha band onto `background`, producing an opaque image.
/// No-op without alpha.
pub fn flatten(handle: ImageHandle, background: Color) -> TransformResult<ImageHandle> {
    if !handle.has_alpha() {
        return Ok(handle);
    }
    let src = Raster::from_image(handle.pixels());
    let max = src.max_value();
    let colour_bands = src.bands - 1;
    let bg = background_bands(handle.interpretation(), colour_bands, max, background);
    let mut dst = Raster::new(src.width, src.height, colour_bands, src.depth);

    for (out, px) in dst
        .data
        .chunks_exact_mut(colour_bands)
        .zip(src.data.chunks_exact(src.bands))
    {
        let alpha = (px[colour_bands] / max).clamp(0.0, 1.0);
        for ((o, &v), &b) in out.iter_mut().zip(px).zip(&bg) {
            *o = v * alpha + b * (1.0 - alpha);
        }
    }

    let img = dst.into_image()?;
    Ok(handle.with_pixels(img, "flatten"))
}

/// Colour values of `background` for the non-alpha bands of an image.
pub(crate) fn background_bands(
    interpretation: Interpretation,
    colour_bands: usize,
    max: f32,
    background: Color,
) -> Vec<f32> {
    if colour_bands < 3 || interpretation.is_grey() {
        vec![background.luma() * max / 255.0; colour_bands]
    } else {
        let rgb = background.scaled(max);
        (0..colour_bands).map(|i| rgb.get(i).copied().unwrap_or(0.0)).collect()
    }
}

/// Constant pixel used for out-of-source areas.
fn fill_pixel(handle: &ImageHandle, extend: Extend, background: Color) -> Vec<f32> {
    let bands = handle.bands();
    let max = handle.bit_depth().max_value();
    match extend {
        Extend::Black => vec![0.0; bands],
        Extend::White => vec![max; bands],
        _ => {
            let colour_bands = if handle.has_alpha() { bands - 1 } else { bands };
            let mut px = background_bands(handle.interpretation(), colour_bands, max, background);
            px.resize(bands, max);
            px
        }
    }
}

fn scaled_dimension(size: u32, scale: f64) -> u32 {
    (size as f64 * scale).round().clamp(1.0, u32::MAX as f64) as u32
}

fn bounded_extent(extent: f64) -> u32 {
    // Absorb float noise so exact 90-degree maps keep their size.
    (extent - 1e-6).ceil().clamp(1.0, u32::MAX as f64) as u32
}

/// Reads source texels under an edge-extension policy.
struct Sampler<'a> {
    src: &'a Raster,
    extend: Extend,
    fill: Vec<f32>,
}

impl<'a> Sampler<'a> {
    fn new(src: &'a Raster, extend: Extend, fill: Vec<f32>) -> Self {
        Self { src, extend, fill }
    }

    fn texel(&self, x: i64, y: i64) -> &[f32] {
        let (w, h) = (self.src.width as i64, self.src.height as i64);
        if (0..w).contains(&x) && (0..h).contains(&y) {
            return self.src.pixel(x as u32, y as u32);
        }
        let (x, y) = match self.extend {
            Extend::Copy => (x.clamp(0, w - 1), y.clamp(0, h - 1)),
            Extend::Repeat => (x.rem_euclid(w), y.rem_euclid(h)),
            Extend::Mirror => (mirror(x, w), mirror(y, h)),
            Extend::Black | Extend::White | Extend::Background => return &self.fill,
        };
        self.src.pixel(x as u32, y as u32)
    }

    /// Samples at a continuous pixel-index position into `out`.
    fn sample(&self, interpolator: Interpolator, x: f64, y: f64, out: &mut [f32]) {
        match interpolator {
            Interpolator::Nearest => {
                out.copy_from_slice(self.texel(x.round() as i64, y.round() as i64));
            }
            Interpolator::Bilinear => {
                let (x0, y0) = (x.floor(), y.floor());
                let (tx, ty) = ((x - x0) as f32, (y - y0) as f32);
                let (x0, y0) = (x0 as i64, y0 as i64);
                let taps = [
                    (self.texel(x0, y0), (1.0 - tx) * (1.0 - ty)),
                    (self.texel(x0 + 1, y0), tx * (1.0 - ty)),
                    (self.texel(x0, y0 + 1), (1.0 - tx) * ty),
                    (self.texel(x0 + 1, y0 + 1), tx * ty),
                ];
                for (i, o) in out.iter_mut().enumerate() {
                    *o = taps.iter().map(|(px, w)| px[i] * w).sum();
                }
            }
            Interpolator::Bicubic => {
                let (x0, y0) = (x.floor(), y.floor());
                let wx = catmull_rom((x - x0) as f32);
                let wy = catmull_rom((y - y0) as f32);
                let (x0, y0) = (x0 as i64, y0 as i64);
                out.iter_mut().for_each(|o| *o = 0.0);
                for (j, wyj) in wy.iter().enumerate() {
                    for (i, wxi) in wx.iter().enumerate() {
                        let px = self.texel(x0 + i as i64 - 1, y0 + j as i64 - 1);
                        let weight = wxi * wyj;
                        for (o, v) in out.iter_mut().zip(px) {
                            *o += v * weight;
                        }
                    }
                }
            }
        }
    }
}

fn mirror(v: i64, size: i64) -> i64 {
    let period = size * 2;
    let m = v.rem_euclid(period);
    if m >= size {
        period - 1 - m
    } else {
        m
    }
}

/// Catmull-Rom weights for taps at offsets -1, 0, 1, 2.
fn catmull_rom(t: f32) -> [f32; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        (-t3 + 2.0 * t2 - t) * 0.5,
        (3.0 * t3 - 5.0 * t2 + 2.0) * 0.5,
        (-3.0 * t3 + 4.0 * t2 + t) * 0.5,
        (t3 - t2) * 0.5,
    ]
}
