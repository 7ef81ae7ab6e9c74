// src/engine/handle.rs
//
// ImageHandle: a decoded raster plus the metadata that travels with it
// (interpretation, ICC profile, raw EXIF, orientation, source format).
//
// Handles are moved through the pipeline: every transform consumes its input and
// returns a new handle. They are Send (a pipeline may run on any worker) but not
// Sync, so one handle is never observed by two threads at once.

use crate::engine::common::trace_materialize;
use crate::engine::registry::FormatTag;
use image::{ColorType, DynamicImage};
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

/// Colour interpretation of the pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interpretation {
    /// Bands with no colour meaning.
    Multiband,
    /// 8-bit greyscale.
    BW,
    /// 16-bit greyscale.
    Grey16,
    /// 8-bit gamma-encoded sRGB.
    Srgb,
    /// 16-bit gamma-encoded sRGB.
    Rgb16,
    /// Linear-light float RGB.
    ScRgb,
    /// 8-bit CMYK (four bands, no alpha).
    Cmyk,
    /// CIE L*a*b*, float.
    Lab,
    /// CIE XYZ (D65, Y in 0..100), float.
    Xyz,
}

impl Interpretation {
    pub fn name(self) -> &'static str {
        match self {
            Interpretation::Multiband => "multiband",
            Interpretation::BW => "b-w",
            Interpretation::Grey16 => "grey16",
            Interpretation::Srgb => "srgb",
            Interpretation::Rgb16 => "rgb16",
            Interpretation::ScRgb => "scrgb",
            Interpretation::Cmyk => "cmyk",
            Interpretation::Lab => "lab",
            Interpretation::Xyz => "xyz",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let interpretation = match name.trim().to_ascii_lowercase().as_str() {
            "multiband" => Interpretation::Multiband,
            "b-w" | "bw" | "b_w" | "grey" | "gray" => Interpretation::BW,
            "grey16" | "gray16" => Interpretation::Grey16,
            "srgb" | "rgb" => Interpretation::Srgb,
            "rgb16" => Interpretation::Rgb16,
            "scrgb" => Interpretation::ScRgb,
            "cmyk" => Interpretation::Cmyk,
            "lab" => Interpretation::Lab,
            "xyz" => Interpretation::Xyz,
            _ => return None,
        };
        Some(interpretation)
    }

    pub fn is_grey(self) -> bool {
        matches!(self, Interpretation::BW | Interpretation::Grey16)
    }

    /// Number of colour bands, excluding alpha.
    pub fn colour_bands(self) -> Option<usize> {
        match self {
            Interpretation::BW | Interpretation::Grey16 => Some(1),
            Interpretation::Srgb
            | Interpretation::Rgb16
            | Interpretation::ScRgb
            | Interpretation::Lab
            | Interpretation::Xyz => Some(3),
            Interpretation::Cmyk => Some(4),
            Interpretation::Multiband => None,
        }
    }

    /// Sample depth this interpretation is stored with.
    pub fn depth(self) -> Option<BitDepth> {
        match self {
            Interpretation::BW | Interpretation::Srgb | Interpretation::Cmyk => Some(BitDepth::Eight),
            Interpretation::Grey16 | Interpretation::Rgb16 => Some(BitDepth::Sixteen),
            Interpretation::ScRgb | Interpretation::Lab | Interpretation::Xyz => Some(BitDepth::Float),
            Interpretation::Multiband => None,
        }
    }

    /// Whether a raster with `bands` bands at `depth` can carry this interpretation.
    pub fn fits(self, bands: usize, depth: BitDepth) -> bool {
        match (self.colour_bands(), self.depth()) {
            (Some(colour), Some(d)) => d == depth && (bands == colour || bands == colour + 1),
            _ => true,
        }
    }
}

impl fmt::Display for Interpretation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sample depth class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitDepth {
    Eight,
    Sixteen,
    Float,
}

impl BitDepth {
    pub fn of(color: ColorType) -> Self {
        match color {
            ColorType::L16 | ColorType::La16 | ColorType::Rgb16 | ColorType::Rgba16 => {
                BitDepth::Sixteen
            }
            ColorType::Rgb32F | ColorType::Rgba32F => BitDepth::Float,
            _ => BitDepth::Eight,
        }
    }

    /// Largest sample value (white).
    pub fn max_value(self) -> f32 {
        match self {
            BitDepth::Eight => 255.0,
            BitDepth::Sixteen => 65535.0,
            BitDepth::Float => 1.0,
        }
    }
}

/// Alpha is present when: 2 bands and greyscale, 4 bands and not CMYK, or 5 bands
/// and CMYK.
pub fn has_alpha_channel(bands: usize, interpretation: Interpretation) -> bool {
    match bands {
        2 => interpretation.is_grey(),
        4 => interpretation != Interpretation::Cmyk,
        5 => interpretation == Interpretation::Cmyk,
        _ => false,
    }
}

/// Best interpretation for a raster of the given shape.
pub(crate) fn interpretation_for(bands: usize, depth: BitDepth) -> Interpretation {
    match (bands, depth) {
        (1 | 2, BitDepth::Eight) => Interpretation::BW,
        (1 | 2, BitDepth::Sixteen) => Interpretation::Grey16,
        (3 | 4, BitDepth::Eight) => Interpretation::Srgb,
        (3 | 4, BitDepth::Sixteen) => Interpretation::Rgb16,
        (3 | 4, BitDepth::Float) => Interpretation::ScRgb,
        _ => Interpretation::Multiband,
    }
}

/// A decoded image exclusively owned by the pipeline stage holding it.
#[derive(Clone)]
pub struct ImageHandle {
    pixels: DynamicImage,
    interpretation: Interpretation,
    icc_profile: Option<Vec<u8>>,
    exif: Option<Vec<u8>>,
    orientation: u16,
    source_format: FormatTag,
    _not_sync: PhantomData<Cell<()>>,
}

impl fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageHandle")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("bands", &self.bands())
            .field("interpretation", &self.interpretation)
            .field("icc_profile", &self.icc_profile.as_ref().map(Vec::len))
            .field("exif", &self.exif.as_ref().map(Vec::len))
            .field("orientation", &self.orientation)
            .field("source_format", &self.source_format)
            .finish()
    }
}

impl ImageHandle {
    /// Wraps an in-memory raster with no metadata.
    pub fn from_image(pixels: DynamicImage) -> Self {
        let interpretation = interpretation_for(
            pixels.color().channel_count() as usize,
            BitDepth::of(pixels.color()),
        );
        Self {
            pixels,
            interpretation,
            icc_profile: None,
            exif: None,
            orientation: 1,
            source_format: FormatTag::Unknown,
            _not_sync: PhantomData,
        }
    }

    pub(crate) fn from_decoded(
        pixels: DynamicImage,
        source_format: FormatTag,
        icc_profile: Option<Vec<u8>>,
        exif: Option<Vec<u8>>,
        orientation: u16,
    ) -> Self {
        let mut handle = Self::from_image(pixels);
        handle.source_format = source_format;
        handle.icc_profile = icc_profile;
        handle.exif = exif;
        handle.orientation = if (1..=8).contains(&orientation) { orientation } else { 1 };
        handle
    }

    /// Like `from_decoded`, for codecs that know the coding colour space
    /// (a 4-band JPEG is CMYK ink, not RGBA).
    pub(crate) fn from_decoded_as(
        pixels: DynamicImage,
        interpretation: Interpretation,
        source_format: FormatTag,
        icc_profile: Option<Vec<u8>>,
        exif: Option<Vec<u8>>,
        orientation: u16,
    ) -> Self {
        let mut handle = Self::from_decoded(pixels, source_format, icc_profile, exif, orientation);
        if interpretation.fits(handle.bands(), handle.bit_depth()) {
            handle.interpretation = interpretation;
        }
        handle
    }

    /// Replaces the pixels, keeping metadata. The interpretation is kept when it
    /// still fits the new band layout and re-derived otherwise.
    pub(crate) fn with_pixels(self, pixels: DynamicImage, stage: &'static str) -> Self {
        let interpretation = if self.interpretation.fits(
            pixels.color().channel_count() as usize,
            BitDepth::of(pixels.color()),
        ) {
            self.interpretation
        } else {
            interpretation_for(
                pixels.color().channel_count() as usize,
                BitDepth::of(pixels.color()),
            )
        };
        self.with_pixels_as(pixels, interpretation, stage)
    }

    /// Replaces the pixels and sets the interpretation explicitly.
    pub(crate) fn with_pixels_as(
        mut self,
        pixels: DynamicImage,
        interpretation: Interpretation,
        stage: &'static str,
    ) -> Self {
        trace_materialize(stage, &pixels);
        self.pixels = pixels;
        self.interpretation = interpretation;
        self
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.pixels.width(), self.pixels.height())
    }

    pub fn bands(&self) -> usize {
        self.pixels.color().channel_count() as usize
    }

    pub fn bit_depth(&self) -> BitDepth {
        BitDepth::of(self.pixels.color())
    }

    pub fn interpretation(&self) -> Interpretation {
        self.interpretation
    }

    pub fn has_alpha(&self) -> bool {
        has_alpha_channel(self.bands(), self.interpretation)
    }

    pub fn icc_profile(&self) -> Option<&[u8]> {
        self.icc_profile.as_deref()
    }

    pub fn has_icc_profile(&self) -> bool {
        self.icc_profile.is_some()
    }

    pub(crate) fn set_icc_profile(&mut self, profile: Option<Vec<u8>>) {
        self.icc_profile = profile;
    }

    pub fn exif(&self) -> Option<&[u8]> {
        self.exif.as_deref()
    }

    pub fn has_exif(&self) -> bool {
        self.exif.is_some()
    }

    pub(crate) fn exif_mut(&mut self) -> Option<&mut Vec<u8>> {
        self.exif.as_mut()
    }

    pub(crate) fn set_exif(&mut self, exif: Option<Vec<u8>>) {
        self.exif = exif;
    }

    /// EXIF orientation, 1..=8.
    pub fn orientation(&self) -> u16 {
        self.orientation
    }

    pub(crate) fn set_orientation(&mut self, orientation: u16) {
        self.orientation = orientation;
    }

    pub fn source_format(&self) -> FormatTag {
        self.source_format
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    pub fn into_pixels(self) -> DynamicImage {
        self.pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayAlphaImage, RgbImage, RgbaImage};

    fn assert_send<T: Send>() {}

    #[test]
    fn handles_move_between_threads() {
        assert_send::<ImageHandle>();
    }

    #[test]
    fn alpha_rule() {
        assert!(has_alpha_channel(2, Interpretation::BW));
        assert!(has_alpha_channel(2, Interpretation::Grey16));
        assert!(has_alpha_channel(4, Interpretation::Srgb));
        assert!(!has_alpha_channel(4, Interpretation::Cmyk));
        assert!(has_alpha_channel(5, Interpretation::Cmyk));
        assert!(!has_alpha_channel(5, Interpretation::Srgb));
        assert!(!has_alpha_channel(3, Interpretation::Srgb));
        assert!(!has_alpha_channel(1, Interpretation::BW));
    }

    #[test]
    fn from_image_guesses_interpretation() {
        let rgb = ImageHandle::from_image(DynamicImage::ImageRgb8(RgbImage::new(2, 2)));
        assert_eq!(rgb.interpretation(), Interpretation::Srgb);
        assert!(!rgb.has_alpha());
        assert_eq!(rgb.orientation(), 1);

        let ga = ImageHandle::from_image(DynamicImage::ImageLumaA8(GrayAlphaImage::new(2, 2)));
        assert_eq!(ga.interpretation(), Interpretation::BW);
        assert!(ga.has_alpha());

        let rgb16 = ImageHandle::from_image(DynamicImage::ImageRgb16(image::ImageBuffer::new(1, 1)));
        assert_eq!(rgb16.interpretation(), Interpretation::Rgb16);
        assert_eq!(rgb16.bit_depth(), BitDepth::Sixteen);
    }

    #[test]
    fn with_pixels_keeps_or_rederives_interpretation() {
        let cmyk = ImageHandle::from_image(DynamicImage::ImageRgba8(RgbaImage::new(2, 2)))
            .with_pixels_as(
                DynamicImage::ImageRgba8(RgbaImage::new(2, 2)),
                Interpretation::Cmyk,
                "test",
            );
        assert!(!cmyk.has_alpha());

        // Same layout keeps CMYK.
        let cropped = cmyk.with_pixels(DynamicImage::ImageRgba8(RgbaImage::new(1, 1)), "test");
        assert_eq!(cropped.interpretation(), Interpretation::Cmyk);

        // Three bands cannot be CMYK.
        let rgb = cropped.with_pixels(DynamicImage::ImageRgb8(RgbImage::new(1, 1)), "test");
        assert_eq!(rgb.interpretation(), Interpretation::Srgb);
    }

    #[test]
    fn decoded_orientation_is_clamped() {
        let handle = ImageHandle::from_decoded(
            DynamicImage::ImageRgb8(RgbImage::new(1, 1)),
            FormatTag::Jpeg,
            None,
            None,
            42,
        );
        assert_eq!(handle.orientation(), 1);
        assert_eq!(handle.source_format(), FormatTag::Jpeg);
    }

    #[test]
    fn interpretation_names_round_trip() {
        for i in [
            Interpretation::Multiband,
            Interpretation::BW,
            Interpretation::Grey16,
            Interpretation::Srgb,
            Interpretation::Rgb16,
            Interpretation::ScRgb,
            Interpretation::Cmyk,
            Interpretation::Lab,
            Interpretation::Xyz,
        ] {
            assert_eq!(Interpretation::from_name(i.name()), Some(i));
        }
    }
}
