// src/engine/io.rs
//
// I/O operations: Source enum, file read/write, and ICC/EXIF extraction from
// encoded containers.

use crate::engine::registry::FormatTag;
use crate::error::PixformError;
use image::{ImageDecoder, ImageReader};
use img_parts::{jpeg::Jpeg, png::Png, webp::WebP, ImageEXIF, ImageICC};
use memmap2::Mmap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Encoded image bytes, either owned or memory-mapped from a file.
#[derive(Clone, Debug)]
pub enum Source {
    /// In-memory image data
    Memory(Arc<Vec<u8>>),
    /// Memory-mapped file (zero-copy access)
    Mapped(Arc<Mmap>),
}

impl Source {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Source::Memory(data) => data.as_slice(),
            Source::Mapped(mmap) => mmap.as_ref(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self {
            Source::Memory(data) => Arc::try_unwrap(data).unwrap_or_else(|shared| (*shared).clone()),
            Source::Mapped(mmap) => mmap.as_ref().to_vec(),
        }
    }
}

impl From<Vec<u8>> for Source {
    fn from(data: Vec<u8>) -> Self {
        Source::Memory(Arc::new(data))
    }
}

/// Opens `path` as a memory-mapped [`Source`].
pub fn read_file(path: impl AsRef<Path>) -> Result<Source, PixformError> {
    let path = path.as_ref();
    let display = path.to_string_lossy().to_string();
    if !path.exists() {
        return Err(PixformError::file_not_found(display));
    }
    let file =
        std::fs::File::open(path).map_err(|e| PixformError::file_read_failed(display.clone(), e))?;
    let len = file
        .metadata()
        .map_err(|e| PixformError::file_read_failed(display.clone(), e))?
        .len();
    if len == 0 {
        // Zero-length files cannot be mapped on every platform.
        return Ok(Source::Memory(Arc::new(Vec::new())));
    }

    // Safety: the file is assumed not to be truncated by another process while mapped.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| PixformError::mmap_failed(display, e))?;
    Ok(Source::Mapped(Arc::new(mmap)))
}

/// Writes `data` to `path` atomically: a temp file in the same directory is
/// written, synced and renamed over the target.
pub fn write_file(path: impl AsRef<Path>, data: &[u8]) -> Result<usize, PixformError> {
    let path = path.as_ref();
    let display = path.to_string_lossy().to_string();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut temp = NamedTempFile::new_in(dir)
        .map_err(|e| PixformError::file_write_failed(dir.to_string_lossy().to_string(), e))?;
    temp.write_all(data)
        .map_err(|e| PixformError::file_write_failed(display.clone(), e))?;
    temp.as_file_mut()
        .sync_all()
        .map_err(|e| PixformError::file_write_failed(display.clone(), e))?;
    temp.persist(path)
        .map_err(|e| PixformError::file_write_failed(display, e.error))?;
    Ok(data.len())
}

/// Extract a valid ICC profile from encoded `data` of format `tag`.
pub fn extract_icc_profile(data: &[u8], tag: FormatTag) -> Option<Vec<u8>> {
    let icc = match tag {
        FormatTag::Jpeg => Jpeg::from_bytes(data.to_vec().into())
            .ok()?
            .icc_profile()
            .map(|icc| icc.to_vec()),
        FormatTag::Png => Png::from_bytes(data.to_vec().into())
            .ok()?
            .icc_profile()
            .map(|icc| icc.to_vec()),
        FormatTag::Webp => WebP::from_bytes(data.to_vec().into())
            .ok()?
            .icc_profile()
            .map(|icc| icc.to_vec()),
        FormatTag::Tiff | FormatTag::Gif | FormatTag::Magick => {
            let reader = ImageReader::new(Cursor::new(data))
                .with_guessed_format()
                .ok()?;
            let mut decoder = reader.into_decoder().ok()?;
            decoder.icc_profile().ok().flatten()
        }
        _ => None,
    }?;

    if validate_icc_profile(&icc) {
        Some(icc)
    } else {
        tracing::debug!(target: "pixform::io", format = %tag, len = icc.len(), "ignoring malformed ICC profile");
        None
    }
}

/// Extract the raw EXIF block (TIFF-structured, without the `Exif\0\0` prefix).
pub fn extract_exif_raw(data: &[u8], tag: FormatTag) -> Option<Vec<u8>> {
    let exif = match tag {
        FormatTag::Jpeg => Jpeg::from_bytes(data.to_vec().into()).ok()?.exif(),
        FormatTag::Png => Png::from_bytes(data.to_vec().into()).ok()?.exif(),
        FormatTag::Webp => WebP::from_bytes(data.to_vec().into()).ok()?.exif(),
        _ => None,
    }?;
    let exif = exif.to_vec();
    let body = exif.strip_prefix(b"Exif\0\0").unwrap_or(&exif);
    if body.starts_with(b"II*\0") || body.starts_with(b"MM\0*") {
        Some(body.to_vec())
    } else {
        None
    }
}

/// Validate ICC profile header
/// ICC profiles must start with a 128-byte header containing specific fields
pub(crate) fn validate_icc_profile(icc_data: &[u8]) -> bool {
    if icc_data.len() < 128 {
        return false;
    }

    // Declared size (bytes 0-3, big-endian) must match the payload
    let profile_size =
        u32::from_be_bytes([icc_data[0], icc_data[1], icc_data[2], icc_data[3]]) as usize;
    if profile_size != icc_data.len() {
        return false;
    }

    // Major version is 2, 4 or 5 in practice
    if icc_data[8] > 10 {
        return false;
    }

    // CMM type, profile class, colour space and PCS signatures are ASCII (or zero)
    let signature_ok = |range: std::ops::Range<usize>| {
        icc_data[range]
            .iter()
            .all(|&byte| (32..=126).contains(&byte) || byte == 0)
    };
    signature_ok(4..8) && signature_ok(12..16) && signature_ok(16..20) && signature_ok(20..24)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // Minimal header-only profile that passes validation.
    pub(crate) fn create_minimal_srgb_icc() -> Vec<u8> {
        let mut data = vec![0u8; 128];
        data[3] = 0x80;
        data[4..8].copy_from_slice(b"ADBE");
        data[8] = 2;
        data[12..16].copy_from_slice(b"mntr");
        data[16..20].copy_from_slice(b"RGB ");
        data[20..24].copy_from_slice(b"XYZ ");
        data
    }

    mod icc_tests {
        use super::*;

        #[test]
        fn test_validate_icc_profile_too_small() {
            assert!(!validate_icc_profile(&[0u8; 127]));
            assert!(!validate_icc_profile(&[]));
        }

        #[test]
        fn test_validate_icc_profile_minimal_valid() {
            assert!(validate_icc_profile(&create_minimal_srgb_icc()));
        }

        #[test]
        fn test_validate_icc_profile_size_mismatch() {
            let mut data = create_minimal_srgb_icc();
            data[3] = 0xFF;
            assert!(!validate_icc_profile(&data));
        }

        #[test]
        fn test_validate_icc_profile_invalid_version() {
            let mut data = create_minimal_srgb_icc();
            data[8] = 20;
            assert!(!validate_icc_profile(&data));
        }

        #[test]
        fn test_validate_icc_profile_binary_signature() {
            let mut data = create_minimal_srgb_icc();
            data[17] = 0x01;
            assert!(!validate_icc_profile(&data));
        }

        #[test]
        fn test_extract_from_garbage_is_none() {
            assert!(extract_icc_profile(b"not an image", FormatTag::Jpeg).is_none());
            assert!(extract_icc_profile(&[], FormatTag::Png).is_none());
            assert!(extract_exif_raw(b"not an image", FormatTag::Webp).is_none());
            assert!(extract_icc_profile(b"%PDF-1.4", FormatTag::Pdf).is_none());
        }
    }

    mod file_tests {
        use super::*;

        #[test]
        fn write_then_read_round_trips() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("out.bin");
            let written = write_file(&path, b"pixels").unwrap();
            assert_eq!(written, 6);

            let source = read_file(&path).unwrap();
            assert!(matches!(source, Source::Mapped(_)));
            assert_eq!(source.as_bytes(), b"pixels");
            assert_eq!(source.into_vec(), b"pixels".to_vec());
        }

        #[test]
        fn missing_file_is_not_found() {
            let dir = tempfile::tempdir().unwrap();
            let err = read_file(dir.path().join("missing.jpg")).unwrap_err();
            assert!(matches!(err, PixformError::FileNotFound { .. }));
        }

        #[test]
        fn empty_file_reads_as_empty_memory() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("empty");
            std::fs::write(&path, b"").unwrap();
            let source = read_file(&path).unwrap();
            assert!(source.is_empty());
        }

        #[test]
        fn write_into_missing_directory_fails() {
            let dir = tempfile::tempdir().unwrap();
            let err = write_file(dir.path().join("nope/out.bin"), b"x").unwrap_err();
            assert!(matches!(err, PixformError::FileWriteFailed { .. }));
        }
    }
}
