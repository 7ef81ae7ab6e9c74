// src/engine/metadata.rs
//
// Metadata Inspector: orientation, ICC presence, interpretation, alpha, EXIF tags,
// plus the buffer-level metadata summary.

use crate::engine::decoder::load_auto;
use crate::engine::handle::{interpretation_for, BitDepth, ImageHandle, Interpretation};
use crate::engine::registry::FormatTag;
use std::io::Cursor;

/// EXIF Orientation tag id.
const ORIENTATION_TAG: u16 = 0x0112;

/// EXIF orientation of the handle, 1..=8 (1 when absent).
pub fn read_orientation(handle: &ImageHandle) -> u16 {
    handle.orientation()
}

pub fn has_icc_profile(handle: &ImageHandle) -> bool {
    handle.has_icc_profile()
}

/// Drops the embedded ICC profile. Pixels are untouched.
pub fn remove_icc_profile(handle: &mut ImageHandle) {
    handle.set_icc_profile(None);
}

pub fn has_alpha(handle: &ImageHandle) -> bool {
    handle.has_alpha()
}

/// Returns the handle's interpretation if it is consistent with its band layout
/// and depth, otherwise the most plausible one for that layout.
pub fn guess_interpretation(handle: &ImageHandle) -> Interpretation {
    let declared = handle.interpretation();
    if declared != Interpretation::Multiband && declared.fits(handle.bands(), handle.bit_depth()) {
        declared
    } else {
        interpretation_for(handle.bands(), handle.bit_depth())
    }
}

pub fn is_16bit(interpretation: Interpretation) -> bool {
    matches!(interpretation, Interpretation::Rgb16 | Interpretation::Grey16)
}

/// Looks up an EXIF tag by name.
///
/// Accepts plain tag names (`"Make"`, `"Orientation"`) and `exif-ifdN-Name`
/// style names. IFD 1 addresses the thumbnail; every other IFD number maps to the
/// primary image. Returns the tag's display value.
pub fn read_exif_tag(handle: &ImageHandle, name: &str) -> Option<String> {
    let raw = handle.exif()?;
    let exif = exif::Reader::new().read_raw(raw.to_vec()).ok()?;

    let (ifd, tag_name) = match name.strip_prefix("exif-ifd") {
        Some(rest) => {
            let (num, tag_name) = rest.split_once('-')?;
            let ifd = if num.parse::<u16>().ok()? == 1 {
                exif::In::THUMBNAIL
            } else {
                exif::In::PRIMARY
            };
            (ifd, tag_name)
        }
        None => (exif::In::PRIMARY, name),
    };

    let value = exif
        .fields()
        .find(|field| field.ifd_num == ifd && field.tag.to_string() == tag_name)
        .map(|field| field.display_value().to_string());
    value
}

/// Orientation stored in a raw EXIF block, if valid.
pub(crate) fn orientation_from_exif(raw: &[u8]) -> Option<u16> {
    let exif = exif::Reader::new().read_raw(raw.to_vec()).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    let orientation = field.value.get_uint(0)? as u16;
    (1..=8).contains(&orientation).then_some(orientation)
}

/// Orientation read straight from an encoded container (TIFF, JPEG, PNG, WebP, HEIF).
pub(crate) fn orientation_from_container(bytes: &[u8]) -> Option<u16> {
    let mut cursor = Cursor::new(bytes);
    let exif = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    let orientation = field.value.get_uint(0)? as u16;
    (1..=8).contains(&orientation).then_some(orientation)
}

/// Rewrites the IFD0 Orientation entry of a raw EXIF block in place.
///
/// Returns false when the block has no Orientation entry or is malformed.
pub(crate) fn set_exif_orientation(raw: &mut [u8], orientation: u16) -> bool {
    let base = if raw.starts_with(b"Exif\0\0") { 6 } else { 0 };
    let tiff = &mut raw[base..];
    if tiff.len() < 8 {
        return false;
    }
    let big_endian = match &tiff[..4] {
        b"MM\0*" => true,
        b"II*\0" => false,
        _ => return false,
    };
    let read_u16 = |buf: &[u8], at: usize| -> Option<u16> {
        let bytes: [u8; 2] = buf.get(at..at + 2)?.try_into().ok()?;
        Some(if big_endian { u16::from_be_bytes(bytes) } else { u16::from_le_bytes(bytes) })
    };
    let read_u32 = |buf: &[u8], at: usize| -> Option<u32> {
        let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
        Some(if big_endian { u32::from_be_bytes(bytes) } else { u32::from_le_bytes(bytes) })
    };

    let Some(ifd0) = read_u32(&*tiff, 4).map(|v| v as usize) else {
        return false;
    };
    let Some(count) = read_u16(&*tiff, ifd0) else {
        return false;
    };
    for i in 0..count as usize {
        let entry = ifd0 + 2 + i * 12;
        let (Some(tag), Some(kind)) = (read_u16(&*tiff, entry), read_u16(&*tiff, entry + 2)) else {
            return false;
        };
        // Orientation is a SHORT stored inline in the value field.
        if tag == ORIENTATION_TAG && kind == 3 {
            let Some(slot) = tiff.get_mut(entry + 8..entry + 10) else {
                return false;
            };
            let bytes = if big_endian {
                orientation.to_be_bytes()
            } else {
                orientation.to_le_bytes()
            };
            slot.copy_from_slice(&bytes);
            return true;
        }
    }
    false
}

/// Summary of a decoded buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: FormatTag,
    pub orientation: u16,
    pub channels: usize,
    pub depth: BitDepth,
    pub interpretation: Interpretation,
    pub has_alpha: bool,
    pub has_profile: bool,
    pub has_exif: bool,
}

impl ImageMetadata {
    pub fn of(handle: &ImageHandle) -> Self {
        Self {
            width: handle.width(),
            height: handle.height(),
            format: handle.source_format(),
            orientation: handle.orientation(),
            channels: handle.bands(),
            depth: handle.bit_depth(),
            interpretation: guess_interpretation(handle),
            has_alpha: handle.has_alpha(),
            has_profile: handle.has_icc_profile(),
            has_exif: handle.has_exif(),
        }
    }
}

/// Decodes `buffer` and summarizes it.
pub fn metadata(buffer: &[u8]) -> crate::error::Result<ImageMetadata> {
    let handle = load_auto(buffer, 1)?;
    Ok(ImageMetadata::of(&handle))
}
