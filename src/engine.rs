// src/engine.rs
//
// The core of pixform. Every buffer goes through the same chain:
// 1. The registry sniffs the container format
// 2. The loader decodes it into an owned ImageHandle (optionally shrunk on load)
// 3. Transforms consume the handle and return a new one
// 4. The encoder serializes the final handle back to bytes
//
// This file is a facade over the component modules in engine/.

// =============================================================================
// SECURITY LIMITS
// =============================================================================

/// Default maximum image dimension (width or height).
/// Larger images are rejected to prevent decompression bombs.
pub const MAX_DIMENSION: u32 = 32768;

/// Default maximum total pixels (width * height).
/// 100 megapixels = 400MB uncompressed RGBA.
pub const MAX_PIXELS: u64 = 100_000_000;

// =============================================================================
// MODULE DECOMPOSITION
// =============================================================================

pub mod analysis;
pub mod api;
pub mod batch;
pub mod color;
pub(crate) mod common;
pub mod config;
pub mod decoder;
pub mod effects;
pub mod encoder;
pub mod handle;
pub mod io;
pub mod metadata;
pub mod pipeline;
pub(crate) mod raster;
pub mod registry;
pub mod resize;
pub mod text;
pub mod transform;
pub mod watermark;

pub use analysis::{find_trim, smart_crop, trim, TrimBox};
pub use api::{process, ImageEngine};
pub use batch::{process_batch, process_files, BatchResult};
pub use color::{
    convert_colorspace, is_colorspace_supported, transform_icc, transform_icc_with_fallback,
    BuiltinProfile, ProfileSource,
};
pub use config::{configure, EngineConfig, Limits};
pub use decoder::{check_dimensions, load, load_auto, read_dimensions};
pub use encoder::{encode, EncodeParams, QualitySettings};
pub use handle::{has_alpha_channel, BitDepth, ImageHandle, Interpretation};
pub use io::{read_file, write_file, Source};
pub use metadata::{metadata, read_exif_tag, ImageMetadata};
pub use pipeline::{apply_ops, calc_resize_dimensions, optimize_ops};
pub use registry::{
    detect_format, supports_decode, supports_encode, CodecCapabilities, FormatTag, ParamSupport,
};
pub use text::{FontDescriptor, GlyphRenderer, SvgGlyphRenderer};
pub use watermark::{
    apply_image_watermark, apply_text_watermark, apply_text_watermark_with, WatermarkImageSpec,
    WatermarkLayout, WatermarkText,
};
