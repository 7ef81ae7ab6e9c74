// src/engine/registry.rs
//
// Format Registry: the closed set of container formats, their codec capabilities,
// the encode parameters each accepts, and signature-based format detection.

use crate::error::PixformError;
use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Capabilities of the codec wired up for a format in this build.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CodecCapabilities: u32 {
        const ALPHA = 1 << 0;
        const PALETTE = 1 << 1;
        const LOSSLESS = 1 << 2;
        const ANIMATION = 1 << 3;
        /// 16-bit samples survive encoding.
        const HIGH_BIT_DEPTH = 1 << 4;
        /// Decoder can downscale while decoding.
        const SHRINK_ON_LOAD = 1 << 5;
        const DECODE = 1 << 6;
        const ENCODE = 1 << 7;
    }
}

bitflags! {
    /// Encode parameters a format accepts. Parameters outside this set are ignored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ParamSupport: u32 {
        const QUALITY = 1 << 0;
        const COMPRESSION = 1 << 1;
        const LOSSLESS = 1 << 2;
        const INTERLACE = 1 << 3;
        const PALETTE = 1 << 4;
        const SPEED = 1 << 5;
        const STRIP = 1 << 6;
    }
}

/// Container format tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Unknown,
    Jpeg,
    Webp,
    Png,
    Tiff,
    Gif,
    Pdf,
    Svg,
    /// Raster formats handled by the generic decoder (BMP, ICO, PNM, ...).
    Magick,
    Heif,
    Avif,
    Jxl,
}

impl FormatTag {
    pub const ALL: [FormatTag; 12] = [
        FormatTag::Unknown,
        FormatTag::Jpeg,
        FormatTag::Webp,
        FormatTag::Png,
        FormatTag::Tiff,
        FormatTag::Gif,
        FormatTag::Pdf,
        FormatTag::Svg,
        FormatTag::Magick,
        FormatTag::Heif,
        FormatTag::Avif,
        FormatTag::Jxl,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FormatTag::Unknown => "unknown",
            FormatTag::Jpeg => "jpeg",
            FormatTag::Webp => "webp",
            FormatTag::Png => "png",
            FormatTag::Tiff => "tiff",
            FormatTag::Gif => "gif",
            FormatTag::Pdf => "pdf",
            FormatTag::Svg => "svg",
            FormatTag::Magick => "magick",
            FormatTag::Heif => "heif",
            FormatTag::Avif => "avif",
            FormatTag::Jxl => "jxl",
        }
    }

    /// Case-insensitive lookup by name; accepts common aliases such as `jpg`.
    pub fn from_name(name: &str) -> Option<Self> {
        let tag = match name.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => FormatTag::Jpeg,
            "webp" => FormatTag::Webp,
            "png" => FormatTag::Png,
            "tiff" | "tif" => FormatTag::Tiff,
            "gif" => FormatTag::Gif,
            "pdf" => FormatTag::Pdf,
            "svg" => FormatTag::Svg,
            "magick" => FormatTag::Magick,
            "heif" | "heic" => FormatTag::Heif,
            "avif" => FormatTag::Avif,
            "jxl" => FormatTag::Jxl,
            "unknown" => FormatTag::Unknown,
            _ => return None,
        };
        Some(tag)
    }

    pub fn capabilities(self) -> CodecCapabilities {
        use CodecCapabilities as C;
        match self {
            FormatTag::Unknown => C::empty(),
            FormatTag::Jpeg => C::SHRINK_ON_LOAD | C::DECODE | C::ENCODE,
            FormatTag::Webp => {
                C::ALPHA | C::LOSSLESS | C::ANIMATION | C::SHRINK_ON_LOAD | C::DECODE | C::ENCODE
            }
            FormatTag::Png => C::ALPHA | C::PALETTE | C::LOSSLESS | C::HIGH_BIT_DEPTH | C::DECODE | C::ENCODE,
            FormatTag::Tiff => C::ALPHA | C::LOSSLESS | C::HIGH_BIT_DEPTH | C::DECODE | C::ENCODE,
            FormatTag::Gif => C::ALPHA | C::PALETTE | C::ANIMATION | C::DECODE | C::ENCODE,
            FormatTag::Pdf => C::ALPHA,
            FormatTag::Svg => C::ALPHA | C::DECODE,
            FormatTag::Magick => C::ALPHA | C::DECODE,
            FormatTag::Heif => C::ALPHA | C::LOSSLESS | C::HIGH_BIT_DEPTH,
            FormatTag::Avif => C::ALPHA | C::LOSSLESS | C::ENCODE,
            FormatTag::Jxl => C::ALPHA | C::LOSSLESS | C::HIGH_BIT_DEPTH | C::ANIMATION,
        }
    }

    pub fn encode_params(self) -> ParamSupport {
        use ParamSupport as P;
        match self {
            FormatTag::Jpeg => P::QUALITY | P::INTERLACE | P::STRIP,
            FormatTag::Png => {
                P::QUALITY | P::COMPRESSION | P::INTERLACE | P::PALETTE | P::SPEED | P::STRIP
            }
            FormatTag::Webp => P::QUALITY | P::LOSSLESS | P::STRIP,
            FormatTag::Heif => P::QUALITY | P::LOSSLESS | P::STRIP,
            FormatTag::Avif => P::QUALITY | P::LOSSLESS | P::SPEED | P::STRIP,
            FormatTag::Gif => P::STRIP,
            FormatTag::Jxl => P::QUALITY | P::LOSSLESS | P::STRIP,
            FormatTag::Tiff
            | FormatTag::Pdf
            | FormatTag::Svg
            | FormatTag::Magick
            | FormatTag::Unknown => P::empty(),
        }
    }

    /// Inclusive range accepted for the `speed` parameter.
    pub fn speed_range(self) -> Option<(u8, u8)> {
        match self {
            FormatTag::Png => Some((0, 9)),
            FormatTag::Avif => Some((0, 10)),
            _ => None,
        }
    }

    /// Largest width or height the encoder for this format can write.
    pub fn max_dimension(self) -> u32 {
        match self {
            FormatTag::Jpeg | FormatTag::Gif => 65_535,
            FormatTag::Webp => 16_383,
            _ => u32::MAX,
        }
    }

    pub fn supports_alpha(self) -> bool {
        self.capabilities().contains(CodecCapabilities::ALPHA)
    }

    pub fn supports_high_bit_depth(self) -> bool {
        self.capabilities().contains(CodecCapabilities::HIGH_BIT_DEPTH)
    }

    pub fn supports_shrink_on_load(self) -> bool {
        self.capabilities().contains(CodecCapabilities::SHRINK_ON_LOAD)
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn supports_decode(tag: FormatTag) -> bool {
    tag.capabilities().contains(CodecCapabilities::DECODE)
}

pub fn supports_encode(tag: FormatTag) -> bool {
    tag.capabilities().contains(CodecCapabilities::ENCODE)
}

/// Identifies the container format of `data` by its signature.
///
/// Recognizes formats even when this build cannot decode them (PDF, HEIF, JXL,
/// AVIF); use [`supports_decode`] before loading.
pub fn detect_format(data: &[u8]) -> Result<FormatTag, PixformError> {
    // ISOBMFF brands first: image's sniffer would also claim some HEIF files.
    if is_avif_data(data) {
        return Ok(FormatTag::Avif);
    }
    if is_heif_data(data) {
        return Ok(FormatTag::Heif);
    }
    if let Ok(format) = image::guess_format(data) {
        let tag = match format {
            image::ImageFormat::Jpeg => FormatTag::Jpeg,
            image::ImageFormat::Png => FormatTag::Png,
            image::ImageFormat::WebP => FormatTag::Webp,
            image::ImageFormat::Tiff => FormatTag::Tiff,
            image::ImageFormat::Gif => FormatTag::Gif,
            image::ImageFormat::Avif => FormatTag::Avif,
            image::ImageFormat::Bmp
            | image::ImageFormat::Ico
            | image::ImageFormat::Pnm
            | image::ImageFormat::Tga
            | image::ImageFormat::Qoi
            | image::ImageFormat::Farbfeld => FormatTag::Magick,
            _ => FormatTag::Unknown,
        };
        if tag != FormatTag::Unknown {
            return Ok(tag);
        }
    }
    if data.starts_with(b"%PDF") {
        return Ok(FormatTag::Pdf);
    }
    if is_jxl_data(data) {
        return Ok(FormatTag::Jxl);
    }
    if is_svg_data(data) {
        return Ok(FormatTag::Svg);
    }
    Err(PixformError::unsupported_format(
        "unknown",
        "detect_format: no decoder recognizes the signature",
    ))
}

/// ISOBMFF `ftyp` brands: major brand followed by compatible brands.
fn ftyp_brands(data: &[u8]) -> Option<impl Iterator<Item = &[u8]>> {
    if data.len() < 12 || &data[4..8] != b"ftyp" {
        return None;
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if size < 12 || size > data.len() {
        return None;
    }
    let major = std::iter::once(&data[8..12]);
    let compatible = data[16.min(size)..size].chunks_exact(4);
    Some(major.chain(compatible))
}

/// Check if data is AVIF (ISOBMFF with an `avif`/`avis` brand)
pub(crate) fn is_avif_data(data: &[u8]) -> bool {
    ftyp_brands(data).is_some_and(|mut brands| brands.any(|b| b == b"avif" || b == b"avis"))
}

fn is_heif_data(data: &[u8]) -> bool {
    const HEIF_BRANDS: [&[u8]; 7] = [b"heic", b"heix", b"hevc", b"hevx", b"heim", b"mif1", b"msf1"];
    ftyp_brands(data).is_some_and(|mut brands| brands.any(|b| HEIF_BRANDS.contains(&b)))
}

fn is_jxl_data(data: &[u8]) -> bool {
    const CONTAINER: [u8; 12] = [0, 0, 0, 0x0C, b'J', b'X', b'L', b' ', 0x0D, 0x0A, 0x87, 0x0A];
    data.starts_with(&[0xFF, 0x0A]) || data.starts_with(&CONTAINER)
}

fn is_svg_data(data: &[u8]) -> bool {
    let head = &data[..data.len().min(1024)];
    // A multi-byte character may straddle the cut; keep the valid prefix.
    let text = match std::str::from_utf8(head) {
        Ok(text) => text,
        Err(e) => std::str::from_utf8(&head[..e.valid_up_to()]).unwrap_or_default(),
    };
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    (trimmed.starts_with("<?xml") || trimmed.starts_with("<svg") || trimmed.starts_with("<!--"))
        && text.contains("<svg")
}
