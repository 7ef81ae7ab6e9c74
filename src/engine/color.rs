// src/engine/color.rs
//
// Color Manager: ICC profile transforms (moxcms) and colourspace conversion
// between interpretations through an sRGB hub.

use crate::engine::common::run_with_panic_policy;
use crate::engine::handle::{interpretation_for, BitDepth, ImageHandle, Interpretation};
use crate::engine::io::read_file;
use crate::engine::metadata;
use crate::engine::raster::Raster;
use crate::error::PixformError;
use image::{DynamicImage, ImageBuffer};
use moxcms::{ColorProfile, DataColorSpace, Layout, TransformOptions};
use rayon::prelude::*;
use std::path::PathBuf;
use tracing::debug;

type ColorResult<T> = std::result::Result<T, PixformError>;

/// Profiles that ship with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinProfile {
    Srgb,
    DisplayP3,
    AdobeRgb,
    Bt2020,
}

impl BuiltinProfile {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "srgb" => Some(BuiltinProfile::Srgb),
            "p3" | "display-p3" => Some(BuiltinProfile::DisplayP3),
            "adobe-rgb" | "adobergb" => Some(BuiltinProfile::AdobeRgb),
            "bt2020" | "rec2020" => Some(BuiltinProfile::Bt2020),
            _ => None,
        }
    }

    fn profile(self) -> ColorProfile {
        match self {
            BuiltinProfile::Srgb => ColorProfile::new_srgb(),
            BuiltinProfile::DisplayP3 => ColorProfile::new_display_p3(),
            BuiltinProfile::AdobeRgb => ColorProfile::new_adobe_rgb(),
            BuiltinProfile::Bt2020 => ColorProfile::new_bt2020(),
        }
    }
}

/// Where an ICC profile comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSource {
    Named(BuiltinProfile),
    Bytes(Vec<u8>),
    Path(PathBuf),
}

impl ProfileSource {
    /// Built-in names (`srgb`, `p3`, `adobe-rgb`, `bt2020`) resolve to the
    /// built-in profile; anything else is treated as a file path.
    pub fn parse(value: &str) -> Self {
        match BuiltinProfile::from_name(value) {
            Some(builtin) => ProfileSource::Named(builtin),
            None => ProfileSource::Path(PathBuf::from(value)),
        }
    }

    /// Parsed profile plus the bytes to embed in the output.
    fn resolve(&self) -> ColorResult<(ColorProfile, Vec<u8>)> {
        match self {
            ProfileSource::Named(builtin) => {
                let profile = builtin.profile();
                let bytes = profile.encode().map_err(|e| {
                    PixformError::engine_failure("icc_transform", format!("cannot serialize {builtin:?}: {e:?}"))
                })?;
                Ok((profile, bytes))
            }
            ProfileSource::Bytes(bytes) => Ok((parse_profile(bytes)?, bytes.clone())),
            ProfileSource::Path(path) => {
                let bytes = read_file(path)
                    .map_err(|e| PixformError::invalid_profile(format!("{}: {e}", path.display())))?
                    .into_vec();
                Ok((parse_profile(&bytes)?, bytes))
            }
        }
    }
}

fn parse_profile(bytes: &[u8]) -> ColorResult<ColorProfile> {
    ColorProfile::new_from_slice(bytes)
        .map_err(|e| PixformError::invalid_profile(format!("unparseable ICC profile: {e:?}")))
}

/// Transforms pixels from the embedded profile to `output`.
///
/// Fails with `NoSourceProfile` when the image carries no profile.
pub fn transform_icc(handle: ImageHandle, output: &ProfileSource) -> ColorResult<ImageHandle> {
    let source = handle
        .icc_profile()
        .ok_or_else(|| PixformError::no_source_profile("icc_transform"))
        .and_then(parse_profile)?;
    let (target, target_bytes) = output.resolve()?;
    apply_profiles(handle, &source, &target, target_bytes)
}

/// Like [`transform_icc`], but uses `fallback` when the embedded profile is
/// missing or unusable. Fails with `InvalidProfile` if neither resolves.
pub fn transform_icc_with_fallback(
    handle: ImageHandle,
    output: &ProfileSource,
    fallback: &ProfileSource,
) -> ColorResult<ImageHandle> {
    let embedded = handle.icc_profile().and_then(|bytes| match parse_profile(bytes) {
        Ok(profile) => Some(profile),
        Err(e) => {
            debug!(target: "pixform::color", error = %e, "embedded profile unusable, using fallback");
            None
        }
    });
    let source = match embedded {
        Some(profile) => profile,
        None => fallback.resolve()?.0,
    };
    let (target, target_bytes) = output.resolve()?;
    apply_profiles(handle, &source, &target, target_bytes)
}

fn layout_for(space: DataColorSpace, alpha: bool) -> Option<(Layout, usize)> {
    match (space, alpha) {
        (DataColorSpace::Rgb, false) => Some((Layout::Rgb, 3)),
        (DataColorSpace::Rgb, true) => Some((Layout::Rgba, 4)),
        (DataColorSpace::Gray, false) => Some((Layout::Gray, 1)),
        (DataColorSpace::Gray, true) => Some((Layout::GrayAlpha, 2)),
        (DataColorSpace::Cmyk, false) => Some((Layout::Rgba, 4)),
        _ => None,
    }
}

fn apply_profiles(
    handle: ImageHandle,
    source: &ColorProfile,
    target: &ColorProfile,
    target_bytes: Vec<u8>,
) -> ColorResult<ImageHandle> {
    // Float interpretations carry no device values for a profile to describe.
    let handle = if handle.bit_depth() == BitDepth::Float {
        convert_colorspace(handle, Interpretation::Srgb)?
    } else {
        handle
    };
    let handle = if handle.interpretation().is_grey() && source.color_space == DataColorSpace::Rgb {
        let rgb = if handle.bit_depth() == BitDepth::Sixteen {
            Interpretation::Rgb16
        } else {
            Interpretation::Srgb
        };
        convert_colorspace(handle, rgb)?
    } else {
        handle
    };

    let alpha = handle.has_alpha();
    let (src_layout, src_channels) = layout_for(source.color_space, alpha).ok_or_else(|| {
        PixformError::unsupported_conversion(format!("{:?}", source.color_space), "icc")
    })?;
    let (dst_layout, dst_channels) = layout_for(target.color_space, alpha)
        .filter(|_| target.color_space != DataColorSpace::Cmyk)
        .ok_or_else(|| PixformError::unsupported_conversion("icc", format!("{:?}", target.color_space)))?;
    if src_channels != handle.bands() {
        return Err(PixformError::invalid_profile(format!(
            "{:?} profile does not describe a {}-band {} image",
            source.color_space,
            handle.bands(),
            handle.interpretation()
        )));
    }

    let (width, height) = handle.dimensions();
    let options = TransformOptions::default();
    let failure = |e: moxcms::CmsError| PixformError::engine_failure("icc_transform", format!("{e:?}"));
    // A profile that parses but cannot drive a transform (missing curves or LUTs).
    let unusable = |e: moxcms::CmsError| PixformError::invalid_profile(format!("cannot build transform: {e:?}"));

    let img = run_with_panic_policy("icc_transform", || match handle.pixels() {
        DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_) => {
            let src = samples16(handle.pixels());
            let transform = source
                .create_transform_16bit(src_layout, target, dst_layout, options)
                .map_err(unusable)?;
            let mut dst = vec![0u16; width as usize * height as usize * dst_channels];
            src.par_chunks(width as usize * src_channels)
                .zip(dst.par_chunks_mut(width as usize * dst_channels))
                .try_for_each(|(s, d)| transform.transform(s, d))
                .map_err(failure)?;
            image_from_samples(width, height, dst_channels, dst)
        }
        img => {
            let src = img.as_bytes();
            let transform = source
                .create_transform_8bit(src_layout, target, dst_layout, options)
                .map_err(unusable)?;
            let mut dst = vec![0u8; width as usize * height as usize * dst_channels];
            src.par_chunks(width as usize * src_channels)
                .zip(dst.par_chunks_mut(width as usize * dst_channels))
                .try_for_each(|(s, d)| transform.transform(s, d))
                .map_err(failure)?;
            image_from_samples(width, height, dst_channels, dst)
        }
    })?;

    debug!(
        target: "pixform::color",
        from = ?source.color_space,
        to = ?target.color_space,
        width,
        height,
        "icc transform"
    );
    let interpretation = interpretation_for(dst_channels, BitDepth::of(img.color()));
    let mut out = handle.with_pixels_as(img, interpretation, "icc_transform");
    out.set_icc_profile(Some(target_bytes));
    Ok(out)
}

fn samples16(img: &DynamicImage) -> &[u16] {
    match img {
        DynamicImage::ImageLuma16(b) => b.as_raw(),
        DynamicImage::ImageLumaA16(b) => b.as_raw(),
        DynamicImage::ImageRgb16(b) => b.as_raw(),
        DynamicImage::ImageRgba16(b) => b.as_raw(),
        _ => &[],
    }
}

trait Sample: Sized {
    fn wrap(width: u32, height: u32, channels: usize, data: Vec<Self>) -> Option<DynamicImage>;
}

impl Sample for u8 {
    fn wrap(width: u32, height: u32, channels: usize, data: Vec<u8>) -> Option<DynamicImage> {
        match channels {
            1 => ImageBuffer::from_raw(width, height, data).map(DynamicImage::ImageLuma8),
            2 => ImageBuffer::from_raw(width, height, data).map(DynamicImage::ImageLumaA8),
            3 => ImageBuffer::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
            4 => ImageBuffer::from_raw(width, height, data).map(DynamicImage::ImageRgba8),
            _ => None,
        }
    }
}

impl Sample for u16 {
    fn wrap(width: u32, height: u32, channels: usize, data: Vec<u16>) -> Option<DynamicImage> {
        match channels {
            1 => ImageBuffer::from_raw(width, height, data).map(DynamicImage::ImageLuma16),
            2 => ImageBuffer::from_raw(width, height, data).map(DynamicImage::ImageLumaA16),
            3 => ImageBuffer::from_raw(width, height, data).map(DynamicImage::ImageRgb16),
            4 => ImageBuffer::from_raw(width, height, data).map(DynamicImage::ImageRgba16),
            _ => None,
        }
    }
}

fn image_from_samples<T: Sample>(width: u32, height: u32, channels: usize, data: Vec<T>) -> ColorResult<DynamicImage> {
    T::wrap(width, height, channels, data)
        .ok_or_else(|| PixformError::engine_failure("icc_transform", "output buffer length mismatch"))
}

/// Whether the handle's interpretation is one the converter understands.
pub fn is_colorspace_supported(handle: &ImageHandle) -> bool {
    let interpretation = handle.interpretation();
    interpretation != Interpretation::Multiband && interpretation.fits(handle.bands(), handle.bit_depth())
}

/// Same contract as [`metadata::guess_interpretation`].
pub fn guess_interpretation(handle: &ImageHandle) -> Interpretation {
    metadata::guess_interpretation(handle)
}

/// Converts pixel values to `target` through gamma-encoded sRGB.
///
/// The embedded profile is dropped when the colour family changes. Multiband
/// sources and targets, and CMYK with alpha, have no conversion path.
pub fn convert_colorspace(handle: ImageHandle, target: Interpretation) -> ColorResult<ImageHandle> {
    let from = handle.interpretation();
    if from == target {
        return Ok(handle);
    }
    if !is_colorspace_supported(&handle) || target == Interpretation::Multiband {
        return Err(PixformError::unsupported_conversion(from.name(), target.name()));
    }
    let alpha = handle.has_alpha();
    if alpha && target == Interpretation::Cmyk {
        return Err(PixformError::unsupported_conversion(
            format!("{from} with alpha"),
            target.name(),
        ));
    }
    let (target_colour, target_depth) = match (target.colour_bands(), target.depth()) {
        (Some(c), Some(d)) => (c, d),
        _ => return Err(PixformError::unsupported_conversion(from.name(), target.name())),
    };

    let src = Raster::from_image(handle.pixels());
    let src_max = src.max_value();
    let src_colour = src.bands - usize::from(alpha);
    let out_bands = target_colour + usize::from(alpha);
    let mut out = Raster::new(src.width, src.height, out_bands, target_depth);
    let out_max = out.max_value();

    out.data
        .par_chunks_mut(out_bands)
        .zip(src.data.par_chunks(src.bands))
        .for_each(|(dst, px)| {
            let rgb = to_srgb(from, &px[..src_colour], src_max);
            from_srgb(target, rgb, out_max, &mut dst[..target_colour]);
            if alpha {
                dst[target_colour] = px[src_colour] / src_max * out_max;
            }
        });

    debug!(target: "pixform::color", from = %from, to = %target, "colourspace");
    let img = out.into_image()?;
    let same_family = family(from) == family(target);
    let mut result = handle.with_pixels_as(img, target, "colourspace");
    if !same_family {
        result.set_icc_profile(None);
    }
    Ok(result)
}

fn family(interpretation: Interpretation) -> u8 {
    match interpretation {
        Interpretation::BW | Interpretation::Grey16 => 0,
        Interpretation::Srgb | Interpretation::Rgb16 => 1,
        Interpretation::ScRgb => 2,
        Interpretation::Cmyk => 3,
        Interpretation::Lab => 4,
        Interpretation::Xyz => 5,
        Interpretation::Multiband => 6,
    }
}

const D65: [f32; 3] = [95.047, 100.0, 108.883];
const DELTA: f32 = 6.0 / 29.0;

fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(v: f32) -> f32 {
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

/// Linear RGB to XYZ with Y in 0..100.
fn linear_to_xyz([r, g, b]: [f32; 3]) -> [f32; 3] {
    [
        (0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b) * 100.0,
        (0.212_672_9 * r + 0.715_152_2 * g + 0.072_175 * b) * 100.0,
        (0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b) * 100.0,
    ]
}

fn xyz_to_linear([x, y, z]: [f32; 3]) -> [f32; 3] {
    let (x, y, z) = (x / 100.0, y / 100.0, z / 100.0);
    [
        3.240_454_2 * x - 1.537_138_5 * y - 0.498_531_4 * z,
        -0.969_266 * x + 1.876_010_8 * y + 0.041_556 * z,
        0.055_643_4 * x - 0.204_025_9 * y + 1.057_225_2 * z,
    ]
}

fn xyz_to_lab(xyz: [f32; 3]) -> [f32; 3] {
    let f = |t: f32| {
        if t > DELTA.powi(3) {
            t.cbrt()
        } else {
            t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
        }
    };
    let fx = f(xyz[0] / D65[0]);
    let fy = f(xyz[1] / D65[1]);
    let fz = f(xyz[2] / D65[2]);
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

fn lab_to_xyz([l, a, b]: [f32; 3]) -> [f32; 3] {
    let finv = |t: f32| {
        if t > DELTA {
            t * t * t
        } else {
            3.0 * DELTA * DELTA * (t - 4.0 / 29.0)
        }
    };
    let fy = (l + 16.0) / 116.0;
    [
        D65[0] * finv(fy + a / 500.0),
        D65[1] * finv(fy),
        D65[2] * finv(fy - b / 200.0),
    ]
}

/// Gamma-encoded sRGB in 0..1 (values may fall outside for wide-gamut sources).
fn to_srgb(from: Interpretation, px: &[f32], max: f32) -> [f32; 3] {
    match from {
        Interpretation::BW | Interpretation::Grey16 => {
            let v = px[0] / max;
            [v, v, v]
        }
        Interpretation::Srgb | Interpretation::Rgb16 => [px[0] / max, px[1] / max, px[2] / max],
        Interpretation::ScRgb => [
            linear_to_srgb(px[0]),
            linear_to_srgb(px[1]),
            linear_to_srgb(px[2]),
        ],
        Interpretation::Cmyk => {
            let [c, m, y, k] = [px[0] / max, px[1] / max, px[2] / max, px[3] / max];
            [(1.0 - c) * (1.0 - k), (1.0 - m) * (1.0 - k), (1.0 - y) * (1.0 - k)]
        }
        Interpretation::Lab => xyz_to_linear(lab_to_xyz([px[0], px[1], px[2]])).map(linear_to_srgb),
        Interpretation::Xyz => xyz_to_linear([px[0], px[1], px[2]]).map(linear_to_srgb),
        Interpretation::Multiband => [0.0; 3],
    }
}

fn from_srgb(target: Interpretation, rgb: [f32; 3], max: f32, out: &mut [f32]) {
    match target {
        Interpretation::BW | Interpretation::Grey16 => {
            out[0] = (0.299 * rgb[0] + 0.587 * rgb[1] + 0.114 * rgb[2]) * max;
        }
        Interpretation::Srgb | Interpretation::Rgb16 => {
            for (o, v) in out.iter_mut().zip(rgb) {
                *o = v * max;
            }
        }
        Interpretation::ScRgb => {
            for (o, v) in out.iter_mut().zip(rgb) {
                *o = srgb_to_linear(v);
            }
        }
        Interpretation::Cmyk => {
            let [r, g, b] = rgb.map(|v| v.clamp(0.0, 1.0));
            let k = 1.0 - r.max(g).max(b);
            let ink = |v: f32| if k >= 1.0 { 0.0 } else { (1.0 - v - k) / (1.0 - k) };
            out.copy_from_slice(&[ink(r) * max, ink(g) * max, ink(b) * max, k * max]);
        }
        Interpretation::Lab => {
            out.copy_from_slice(&xyz_to_lab(linear_to_xyz(rgb.map(srgb_to_linear))));
        }
        Interpretation::Xyz => {
            out.copy_from_slice(&linear_to_xyz(rgb.map(srgb_to_linear)));
        }
        Interpretation::Multiband => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn solid(rgb: [u8; 3]) -> ImageHandle {
        ImageHandle::from_image(DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb(rgb))))
    }

    fn first_f32(handle: &ImageHandle) -> [f32; 3] {
        let px = handle.pixels().to_rgb32f();
        px.get_pixel(0, 0).0
    }

    mod conversion_tests {
        use super::*;

        #[test]
        fn srgb_to_lab_reference_values() {
            let lab = convert_colorspace(solid([255, 0, 0]), Interpretation::Lab).unwrap();
            assert_eq!(lab.interpretation(), Interpretation::Lab);
            let [l, a, b] = first_f32(&lab);
            assert!((l - 53.24).abs() < 0.5, "L {l}");
            assert!((a - 80.09).abs() < 0.5, "a {a}");
            assert!((b - 67.20).abs() < 0.5, "b {b}");

            let white = convert_colorspace(solid([255, 255, 255]), Interpretation::Lab).unwrap();
            let [l, a, b] = first_f32(&white);
            assert!((l - 100.0).abs() < 0.1 && a.abs() < 0.1 && b.abs() < 0.1);
        }

        #[test]
        fn lab_round_trips_to_srgb() {
            let original = solid([200, 120, 40]);
            let lab = convert_colorspace(original.clone(), Interpretation::Lab).unwrap();
            let back = convert_colorspace(lab, Interpretation::Srgb).unwrap();
            let a = original.pixels().to_rgb8().get_pixel(0, 0).0;
            let b = back.pixels().to_rgb8().get_pixel(0, 0).0;
            for (x, y) in a.iter().zip(b.iter()) {
                assert!(x.abs_diff(*y) <= 1, "{a:?} vs {b:?}");
            }
        }

        #[test]
        fn xyz_white_point() {
            let xyz = convert_colorspace(solid([255, 255, 255]), Interpretation::Xyz).unwrap();
            let [x, y, z] = first_f32(&xyz);
            assert!((x - 95.05).abs() < 0.1 && (y - 100.0).abs() < 0.1 && (z - 108.9).abs() < 0.2);
        }

        #[test]
        fn cmyk_round_trip() {
            let cmyk = convert_colorspace(solid([30, 160, 90]), Interpretation::Cmyk).unwrap();
            assert_eq!(cmyk.bands(), 4);
            assert!(!cmyk.has_alpha());
            let back = convert_colorspace(cmyk, Interpretation::Srgb).unwrap();
            let px = back.pixels().to_rgb8().get_pixel(0, 0).0;
            assert!(px[0].abs_diff(30) <= 1 && px[1].abs_diff(160) <= 1 && px[2].abs_diff(90) <= 1);
        }

        #[test]
        fn grey_and_linear_targets() {
            let bw = convert_colorspace(solid([255, 0, 0]), Interpretation::BW).unwrap();
            assert_eq!(bw.pixels().to_luma8().get_pixel(0, 0).0, [76]);

            let linear = convert_colorspace(solid([128, 128, 128]), Interpretation::ScRgb).unwrap();
            assert!((first_f32(&linear)[0] - 0.2158).abs() < 0.001);

            let grey16 = convert_colorspace(solid([255, 255, 255]), Interpretation::Grey16).unwrap();
            assert_eq!(grey16.pixels().to_luma16().get_pixel(0, 0).0, [65535]);
        }

        #[test]
        fn alpha_is_carried_across() {
            let rgba = ImageHandle::from_image(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                1,
                1,
                Rgba([10, 20, 30, 128]),
            )));
            let rgb16 = convert_colorspace(rgba, Interpretation::Rgb16).unwrap();
            assert!(rgb16.has_alpha());
            assert_eq!(rgb16.pixels().to_rgba16().get_pixel(0, 0).0[3], 128 * 257);
        }

        #[test]
        fn unsupported_paths() {
            let rgba = ImageHandle::from_image(DynamicImage::ImageRgba8(RgbaImage::new(1, 1)));
            assert!(matches!(
                convert_colorspace(rgba, Interpretation::Cmyk),
                Err(PixformError::UnsupportedConversion { .. })
            ));

            let multiband = solid([1, 2, 3]).with_pixels_as(
                DynamicImage::ImageRgb8(RgbImage::new(1, 1)),
                Interpretation::Multiband,
                "test",
            );
            assert!(!is_colorspace_supported(&multiband));
            assert!(matches!(
                convert_colorspace(multiband, Interpretation::Srgb),
                Err(PixformError::UnsupportedConversion { .. })
            ));
            assert!(convert_colorspace(solid([1, 2, 3]), Interpretation::Multiband).is_err());
        }

        #[test]
        fn same_interpretation_is_untouched() {
            let img = solid([9, 8, 7]);
            let out = convert_colorspace(img.clone(), Interpretation::Srgb).unwrap();
            assert_eq!(out.pixels(), img.pixels());
            assert_eq!(guess_interpretation(&out), Interpretation::Srgb);
        }
    }

    mod icc_tests {
        use super::*;

        fn srgb_bytes() -> Vec<u8> {
            ColorProfile::new_srgb().encode().unwrap()
        }

        #[test]
        fn parse_names_and_paths() {
            assert_eq!(ProfileSource::parse("sRGB"), ProfileSource::Named(BuiltinProfile::Srgb));
            assert_eq!(ProfileSource::parse("p3"), ProfileSource::Named(BuiltinProfile::DisplayP3));
            assert_eq!(
                ProfileSource::parse("/tmp/print.icc"),
                ProfileSource::Path(PathBuf::from("/tmp/print.icc"))
            );
        }

        #[test]
        fn missing_source_profile_fails() {
            let err = transform_icc(solid([1, 2, 3]), &ProfileSource::parse("srgb")).unwrap_err();
            assert!(matches!(err, PixformError::NoSourceProfile { .. }));
        }

        #[test]
        fn fallback_supplies_the_source() {
            let srgb = ProfileSource::parse("srgb");
            let out = transform_icc_with_fallback(solid([100, 150, 200]), &srgb, &srgb).unwrap();
            assert!(out.has_icc_profile());
            let px = out.pixels().to_rgb8().get_pixel(0, 0).0;
            assert!(px[0].abs_diff(100) <= 1 && px[1].abs_diff(150) <= 1 && px[2].abs_diff(200) <= 1);
        }

        #[test]
        fn unusable_profiles_are_invalid() {
            let garbage = ProfileSource::Bytes(vec![0u8; 64]);
            let err = transform_icc_with_fallback(solid([1, 2, 3]), &ProfileSource::parse("srgb"), &garbage)
                .unwrap_err();
            assert!(matches!(err, PixformError::InvalidProfile { .. }));

            let missing = ProfileSource::Path(PathBuf::from("/nonexistent/profile.icc"));
            assert!(matches!(
                transform_icc_with_fallback(solid([1, 2, 3]), &ProfileSource::parse("srgb"), &missing),
                Err(PixformError::InvalidProfile { .. })
            ));
        }

        #[test]
        fn embedded_profile_to_wide_gamut() {
            let mut img = solid([255, 0, 0]);
            img.set_icc_profile(Some(srgb_bytes()));
            let out = transform_icc(img, &ProfileSource::parse("p3")).unwrap();
            let px = out.pixels().to_rgb8().get_pixel(0, 0).0;
            assert!(px[0] < 250 && px[1] > 20, "{px:?}");
        }

        #[test]
        fn profile_from_disk_and_alpha() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("srgb.icc");
            std::fs::write(&path, srgb_bytes()).unwrap();

            let mut img = ImageHandle::from_image(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                2,
                2,
                Rgba([40, 80, 120, 77]),
            )));
            img.set_icc_profile(Some(srgb_bytes()));
            let out = transform_icc(img, &ProfileSource::Path(path)).unwrap();
            assert!(out.has_alpha());
            assert_eq!(out.pixels().to_rgba8().get_pixel(1, 1).0[3], 77);
        }

        #[test]
        fn grey_image_with_rgb_profile() {
            let mut img = ImageHandle::from_image(DynamicImage::ImageLuma8(image::GrayImage::from_pixel(
                2,
                2,
                image::Luma([90]),
            )));
            img.set_icc_profile(Some(srgb_bytes()));
            let out = transform_icc(img, &ProfileSource::parse("srgb")).unwrap();
            assert_eq!(out.interpretation(), Interpretation::Srgb);
            assert_eq!(out.bands(), 3);
        }
    }
}
