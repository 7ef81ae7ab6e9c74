// src/engine/effects.rs
//
// Convolution filters and tone curves: gaussian blur, unsharp mask, gamma,
// brightness, contrast. Alpha bands are never altered by tone curves.

use crate::engine::color::convert_colorspace;
use crate::engine::handle::{ImageHandle, Interpretation};
use crate::engine::raster::Raster;
use crate::error::PixformError;
use crate::ops::SharpenParams;
use rayon::prelude::*;
use tracing::debug;

type EffectResult<T> = std::result::Result<T, PixformError>;

/// Kernel truncation used for the sharpen mask.
const SHARPEN_MIN_AMPLITUDE: f64 = 0.2;

/// Gaussian blur with standard deviation `sigma`.
///
/// The kernel is truncated where its amplitude falls below `min_amplitude`
/// (0 < min_amplitude < 1); smaller values give a wider kernel.
pub fn gaussian_blur(handle: ImageHandle, sigma: f64, min_amplitude: f64) -> EffectResult<ImageHandle> {
    let kernel = gaussian_kernel("gaussian_blur", sigma, min_amplitude)?;
    debug!(target: "pixform::pipeline", sigma, min_amplitude, taps = kernel.len(), "gaussian_blur");

    let mut raster = Raster::from_image(handle.pixels());
    let alpha_band = handle.has_alpha().then_some(raster.bands - 1);
    // Blur premultiplied so transparent pixels do not bleed their colour.
    if let Some(alpha) = alpha_band {
        premultiply(&mut raster, alpha, true);
    }
    convolve_separable(&mut raster, &kernel);
    if let Some(alpha) = alpha_band {
        premultiply(&mut raster, alpha, false);
    }

    let img = raster.into_image()?;
    Ok(handle.with_pixels(img, "gaussian_blur"))
}

/// Unsharp mask on lightness.
///
/// The difference between lightness and its blur (L* units, 0..100) is shaped by
/// the `x1`/`m1`/`m2` curve, clamped to `[-y3, y2]`, and added to every colour
/// band. Interpretations other than grey and RGB are sharpened in sRGB and
/// converted back.
pub fn sharpen(handle: ImageHandle, params: &SharpenParams) -> EffectResult<ImageHandle> {
    validate_sharpen(params)?;
    let original = handle.interpretation();
    let direct = matches!(
        original,
        Interpretation::BW
            | Interpretation::Grey16
            | Interpretation::Srgb
            | Interpretation::Rgb16
            | Interpretation::ScRgb
    );
    if !direct {
        let srgb = convert_colorspace(handle, Interpretation::Srgb)?;
        let sharpened = sharpen(srgb, params)?;
        return convert_colorspace(sharpened, original);
    }

    let kernel = gaussian_kernel("sharpen", params.radius, SHARPEN_MIN_AMPLITUDE)?;
    let raster = Raster::from_image(handle.pixels());
    let max = raster.max_value();
    let colour_bands = colour_bands(&handle);

    let mut lightness = Raster::new(raster.width, raster.height, 1, raster.depth);
    for (l, px) in lightness
        .data
        .iter_mut()
        .zip(raster.data.chunks_exact(raster.bands))
    {
        let luma = if colour_bands >= 3 {
            0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2]
        } else {
            px[0]
        };
        *l = luma / max * 100.0;
    }
    let mut blurred = lightness.clone();
    convolve_separable(&mut blurred, &kernel);

    let (x1, y2, y3) = (params.x1 as f32, params.y2 as f32, params.y3 as f32);
    let (m1, m2) = (params.m1 as f32, params.m2 as f32);
    let mut out = raster;
    let bands = out.bands;
    for ((px, &l), &b) in out
        .data
        .chunks_exact_mut(bands)
        .zip(&lightness.data)
        .zip(&blurred.data)
    {
        let diff = l - b;
        let magnitude = diff.abs();
        let shaped = if magnitude < x1 {
            magnitude * m1
        } else {
            x1 * m1 + (magnitude - x1) * m2
        };
        let delta = (shaped * diff.signum()).clamp(-y3, y2) * max / 100.0;
        px[..colour_bands].iter_mut().for_each(|v| *v += delta);
    }

    debug!(target: "pixform::pipeline", ?params, "sharpen");
    let img = out.into_image()?;
    Ok(handle.with_pixels(img, "sharpen"))
}

/// `out = max * (v / max)^(1 / exponent)` on colour bands.
pub fn gamma(handle: ImageHandle, exponent: f64) -> EffectResult<ImageHandle> {
    if !exponent.is_finite() || exponent <= 0.0 {
        return Err(PixformError::invalid_argument(
            "gamma",
            "exponent",
            exponent,
            "exponent must be a positive number",
        ));
    }
    let inverse = (1.0 / exponent) as f32;
    map_colour_bands(handle, "gamma", move |v, max| max * (v.max(0.0) / max).powf(inverse))
}

/// Adds `k` (8-bit units, scaled to the image depth) to colour bands.
pub fn brightness(handle: ImageHandle, k: f64) -> EffectResult<ImageHandle> {
    if !k.is_finite() {
        return Err(PixformError::invalid_argument(
            "brightness",
            "k",
            k,
            "offset must be finite",
        ));
    }
    let k = k as f32;
    map_colour_bands(handle, "brightness", move |v, max| v + k * max / 255.0)
}

/// Scales the distance from mid-grey by `k` (>= 0) on colour bands.
pub fn contrast(handle: ImageHandle, k: f64) -> EffectResult<ImageHandle> {
    if !k.is_finite() || k < 0.0 {
        return Err(PixformError::invalid_argument(
            "contrast",
            "k",
            k,
            "contrast factor must be >= 0",
        ));
    }
    let k = k as f32;
    map_colour_bands(handle, "contrast", move |v, max| {
        let mid = max / 2.0;
        (v - mid) * k + mid
    })
}

fn colour_bands(handle: &ImageHandle) -> usize {
    if handle.has_alpha() {
        handle.bands() - 1
    } else {
        handle.bands()
    }
}

fn map_colour_bands<F>(handle: ImageHandle, stage: &'static str, f: F) -> EffectResult<ImageHandle>
where
    F: Fn(f32, f32) -> f32 + Sync,
{
    let mut raster = Raster::from_image(handle.pixels());
    let max = raster.max_value();
    let colour_bands = colour_bands(&handle);
    let bands = raster.bands;
    raster.data.par_chunks_mut(bands).for_each(|px| {
        px[..colour_bands].iter_mut().for_each(|v| *v = f(*v, max));
    });
    let img = raster.into_image()?;
    debug!(target: "pixform::pipeline", stage, "tone curve");
    Ok(handle.with_pixels(img, stage))
}

fn validate_sharpen(params: &SharpenParams) -> EffectResult<()> {
    let checks = [
        ("radius", params.radius, params.radius > 0.0),
        ("x1", params.x1, params.x1 >= 0.0),
        ("y2", params.y2, params.y2 >= 0.0),
        ("y3", params.y3, params.y3 >= 0.0),
        ("m1", params.m1, params.m1 >= 0.0),
        ("m2", params.m2, params.m2 >= 0.0),
    ];
    for (name, value, ok) in checks {
        if !value.is_finite() || !ok {
            return Err(PixformError::invalid_argument(
                "sharpen",
                name,
                value,
                "sharpen parameters must be finite and non-negative (radius > 0)",
            ));
        }
    }
    Ok(())
}

/// Normalized 1-D Gaussian truncated at `min_amplitude`.
fn gaussian_kernel(operation: &'static str, sigma: f64, min_amplitude: f64) -> EffectResult<Vec<f32>> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(PixformError::invalid_argument(
            operation,
            "sigma",
            sigma,
            "sigma must be a positive number",
        ));
    }
    if !(min_amplitude > 0.0 && min_amplitude < 1.0) {
        return Err(PixformError::invalid_argument(
            operation,
            "min_amplitude",
            min_amplitude,
            "min_amplitude must lie strictly between 0 and 1",
        ));
    }
    let radius = (-2.0 * sigma * sigma * min_amplitude.ln()).sqrt().ceil().max(1.0) as i64;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|x| (-((x * x) as f64) / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    Ok(weights.into_iter().map(|w| (w / total) as f32).collect())
}

/// Horizontal then vertical pass with edge clamping.
fn convolve_separable(raster: &mut Raster, kernel: &[f32]) {
    let (w, h, bands) = (raster.width as usize, raster.height as usize, raster.bands);
    if w == 0 || h == 0 {
        return;
    }
    let radius = (kernel.len() / 2) as isize;
    let mut tmp = vec![0.0f32; raster.data.len()];

    let src = &raster.data;
    tmp.par_chunks_mut(w * bands).enumerate().for_each(|(y, row)| {
        let line = &src[y * w * bands..(y + 1) * w * bands];
        for x in 0..w {
            for (k, weight) in kernel.iter().enumerate() {
                let sx = (x as isize + k as isize - radius).clamp(0, w as isize - 1) as usize;
                for b in 0..bands {
                    row[x * bands + b] += line[sx * bands + b] * weight;
                }
            }
        }
    });

    let tmp = &tmp;
    raster.data.par_chunks_mut(w * bands).enumerate().for_each(|(y, row)| {
        row.iter_mut().for_each(|v| *v = 0.0);
        for (k, weight) in kernel.iter().enumerate() {
            let sy = (y as isize + k as isize - radius).clamp(0, h as isize - 1) as usize;
            let line = &tmp[sy * w * bands..(sy + 1) * w * bands];
            for (o, v) in row.iter_mut().zip(line) {
                *o += v * weight;
            }
        }
    });
}

fn premultiply(raster: &mut Raster, alpha: usize, forward: bool) {
    let max = raster.max_value();
    let bands = raster.bands;
    raster.data.par_chunks_mut(bands).for_each(|px| {
        let a = px[alpha] / max;
        for v in &mut px[..alpha] {
            if forward {
                *v *= a;
            } else if a > 0.0 {
                *v /= a;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, Luma, Rgba, RgbaImage};

    fn grey(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> ImageHandle {
        ImageHandle::from_image(DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| {
            Luma([f(x, y)])
        })))
    }

    mod blur_tests {
        use super::*;

        #[test]
        fn kernel_is_normalized_and_widens() {
            let narrow = gaussian_kernel("t", 1.0, 0.2).unwrap();
            let wide = gaussian_kernel("t", 1.0, 0.01).unwrap();
            assert!(wide.len() > narrow.len());
            assert!((narrow.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }

        #[test]
        fn uniform_image_is_unchanged() {
            let img = grey(8, 8, |_, _| 77);
            let out = gaussian_blur(img.clone(), 2.0, 0.2).unwrap();
            assert_eq!(out.pixels(), img.pixels());
        }

        #[test]
        fn point_spreads_and_conserves_energy() {
            let img = grey(15, 15, |x, y| if (x, y) == (7, 7) { 255 } else { 0 });
            let out = gaussian_blur(img, 1.0, 0.05).unwrap().into_pixels().to_luma8();
            assert!(out.get_pixel(7, 7).0[0] < 255);
            assert!(out.get_pixel(8, 7).0[0] > 0);
            let total: u32 = out.pixels().map(|p| p.0[0] as u32).sum();
            assert!((240..=270).contains(&total), "total {total}");
        }

        #[test]
        fn invalid_parameters() {
            assert!(gaussian_blur(grey(2, 2, |_, _| 0), 0.0, 0.2).is_err());
            assert!(gaussian_blur(grey(2, 2, |_, _| 0), 1.0, 1.0).is_err());
            assert!(gaussian_blur(grey(2, 2, |_, _| 0), 1.0, 0.0).is_err());
        }

        #[test]
        fn transparent_neighbours_do_not_tint() {
            let img = ImageHandle::from_image(DynamicImage::ImageRgba8(RgbaImage::from_fn(5, 1, |x, _| {
                if x == 2 {
                    Rgba([255, 0, 0, 255])
                } else {
                    Rgba([0, 255, 0, 0])
                }
            })));
            let out = gaussian_blur(img, 1.0, 0.2).unwrap().into_pixels().to_rgba8();
            let px = out.get_pixel(1, 0).0;
            assert!(px[3] > 0);
            assert!(px[0] > 200 && px[1] < 10, "{px:?}");
        }
    }

    mod sharpen_tests {
        use super::*;

        #[test]
        fn step_edge_gains_contrast() {
            let img = grey(10, 3, |x, _| if x < 5 { 100 } else { 150 });
            let out = sharpen(img, &SharpenParams::default()).unwrap().into_pixels().to_luma8();
            assert!(out.get_pixel(4, 1).0[0] < 100);
            assert!(out.get_pixel(5, 1).0[0] > 150);
            // Far from the edge nothing changes.
            assert_eq!(out.get_pixel(0, 1).0[0], 100);
        }

        #[test]
        fn flat_image_is_unchanged() {
            let img = grey(6, 6, |_, _| 90);
            let out = sharpen(img.clone(), &SharpenParams::default()).unwrap();
            assert_eq!(out.pixels(), img.pixels());
        }

        #[test]
        fn adjustment_is_capped() {
            let params = SharpenParams { y2: 1.0, y3: 1.0, m2: 100.0, ..SharpenParams::default() };
            let img = grey(10, 1, |x, _| if x < 5 { 0 } else { 255 });
            let out = sharpen(img, &params).unwrap().into_pixels().to_luma8();
            // 1 L* unit is at most ~3 levels.
            assert!(out.get_pixel(5, 0).0[0] == 255);
            assert!(out.get_pixel(4, 0).0[0] == 0);
            let mid = grey(10, 1, |x, _| if x < 5 { 100 } else { 150 });
            let out = sharpen(mid, &params).unwrap().into_pixels().to_luma8();
            assert!(out.get_pixel(4, 0).0[0] >= 97);
        }

        #[test]
        fn negative_parameters_are_rejected() {
            let params = SharpenParams { m2: -1.0, ..SharpenParams::default() };
            assert!(matches!(
                sharpen(grey(2, 2, |_, _| 0), &params),
                Err(PixformError::InvalidArgument { .. })
            ));
        }
    }

    mod tone_tests {
        use super::*;

        #[test]
        fn gamma_brightness_contrast() {
            let out = gamma(grey(1, 1, |_, _| 64), 2.0).unwrap();
            assert_eq!(out.pixels().to_luma8().get_pixel(0, 0).0, [128]);

            let out = brightness(grey(1, 1, |_, _| 100), 10.0).unwrap();
            assert_eq!(out.pixels().to_luma8().get_pixel(0, 0).0, [110]);

            let out = contrast(grey(1, 1, |_, _| 100), 2.0).unwrap();
            assert_eq!(out.pixels().to_luma8().get_pixel(0, 0).0, [73]);
        }

        #[test]
        fn tone_curves_keep_alpha() {
            let img = ImageHandle::from_image(DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([100, 100, 100, 40]))));
            let out = brightness(img, 50.0).unwrap();
            assert_eq!(out.pixels().to_rgba8().get_pixel(0, 0).0, [150, 150, 150, 40]);
        }

        #[test]
        fn invalid_tone_parameters() {
            assert!(gamma(grey(1, 1, |_, _| 0), 0.0).is_err());
            assert!(contrast(grey(1, 1, |_, _| 0), -1.0).is_err());
            assert!(brightness(grey(1, 1, |_, _| 0), f64::NAN).is_err());
        }
    }
}
