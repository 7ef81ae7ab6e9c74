// lib.rs
//
// pixform: an image transform-and-codec bridge.
//
// Design goals:
// - Detect, decode, transform, colour-manage, watermark and re-encode in one call chain
// - Owned image handles: every transform consumes its input
// - Typed errors for every failure, no partial results
// - Header-only inspection without decoding pixels

// Memory allocator optimization: jemalloc handles the many short-lived raster
// buffers better than the system allocator.
// jemalloc is not supported on Windows/MSVC, so we exclude it on that platform
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod codecs;
pub mod engine;
pub mod error;
pub mod ops;

use std::path::Path;

pub use engine::{
    process, process_batch, EncodeParams, FormatTag, ImageEngine, ImageHandle, Interpretation,
};
pub use error::{ErrorCategory, PixformError, Result};
pub use ops::{Color, Gravity, Operation, ProcessOptions};

/// Image size read from the container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Inspect image dimensions WITHOUT decoding pixels.
/// Only the header is parsed, so this is cheap even for very large inputs.
pub fn size(buffer: &[u8]) -> Result<ImageSize> {
    let tag = engine::detect_format(buffer)?;
    let (width, height) = engine::read_dimensions(buffer, tag)?;
    Ok(ImageSize { width, height })
}

/// Like [`size`], for a file on disk. The file is memory-mapped, not copied.
pub fn size_from_path(path: impl AsRef<Path>) -> Result<ImageSize> {
    let source = engine::read_file(path)?;
    size(source.as_bytes())
}

/// Library version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Names of the formats this build can decode.
pub fn supported_input_formats() -> Vec<&'static str> {
    FormatTag::ALL
        .into_iter()
        .filter(|tag| engine::supports_decode(*tag))
        .map(FormatTag::name)
        .collect()
}

/// Names of the formats this build can encode.
pub fn supported_output_formats() -> Vec<&'static str> {
    FormatTag::ALL
        .into_iter()
        .filter(|tag| engine::supports_encode(*tag))
        .map(FormatTag::name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn size_reads_header_only() {
        let mut data = png(123, 45);
        // Corrupt the pixel data; the header still parses.
        let len = data.len();
        data.truncate(len - 20);
        assert_eq!(
            size(&data).unwrap(),
            ImageSize {
                width: 123,
                height: 45
            }
        );
    }

    #[test]
    fn size_rejects_unknown_bytes() {
        let err = size(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PixformError::UnsupportedFormat { .. }));
    }

    #[test]
    fn size_from_missing_path() {
        let err = size_from_path("/nonexistent/pixform/input.png").unwrap_err();
        assert!(matches!(err, PixformError::FileNotFound { .. }));
    }

    #[test]
    fn format_lists_follow_registry() {
        let inputs = supported_input_formats();
        let outputs = supported_output_formats();
        assert!(inputs.contains(&"jpeg"));
        assert!(inputs.contains(&"svg"));
        assert!(!inputs.contains(&"avif"));
        assert!(outputs.contains(&"avif"));
        assert!(!outputs.contains(&"svg"));
        assert!(!version().is_empty());
    }
}
