// src/error.rs
//
// Unified error handling for pixform
// Uses thiserror for simple, type-safe error handling
//
// Error Taxonomy:
// - UserError: Invalid input, recoverable
// - CodecError: Format/encoding/colour issues
// - ResourceLimit: Memory/dimension/I/O limits
// - InternalBug: Engine failures (should not happen)

use std::borrow::Cow;
use thiserror::Error;

/// Coarse classification of every [`PixformError`].
///
/// - UserError: Invalid input, recoverable by the caller
/// - CodecError: Format, codec or colour-profile issues
/// - ResourceLimit: Memory/dimension limits and file system failures
/// - InternalBug: Engine failures (should not happen)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCategory {
    /// Invalid input, recoverable by user
    UserError,
    /// Format/encoding issues
    CodecError,
    /// Memory/dimension/I/O limits
    ResourceLimit,
    /// Engine failures (should not happen)
    InternalBug,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::UserError => "UserError",
            ErrorCategory::CodecError => "CodecError",
            ErrorCategory::ResourceLimit => "ResourceLimit",
            ErrorCategory::InternalBug => "InternalBug",
        }
    }
}

/// pixform error types
///
/// Every variant carries enough context (operation, offending parameter) for the
/// caller to log or report it. No numeric error codes.
#[derive(Debug, Error)]
pub enum PixformError {
    // File I/O Errors
    #[error("File not found: {path}")]
    FileNotFound { path: Cow<'static, str> },

    #[error("Failed to read file '{path}': {source}")]
    FileReadFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to memory-map file '{path}': {source}")]
    MmapFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWriteFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    // Codec Errors
    #[error("Unsupported image format {format} for {operation}")]
    UnsupportedFormat {
        format: Cow<'static, str>,
        operation: Cow<'static, str>,
    },

    #[error("Failed to decode {format} image: {message}")]
    DecodeFailed {
        format: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Failed to encode as {format}: {message}")]
    EncodeFailed {
        format: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    // Argument Errors
    #[error("{operation}: invalid value for {name}: {value}. {reason}")]
    InvalidArgument {
        operation: Cow<'static, str>,
        name: Cow<'static, str>,
        value: Cow<'static, str>,
        reason: Cow<'static, str>,
    },

    #[error("{operation}: area {width}x{height} at ({left}, {top}) exceeds bounds {bounds_width}x{bounds_height}")]
    OutOfBounds {
        operation: Cow<'static, str>,
        left: i64,
        top: i64,
        width: u32,
        height: u32,
        bounds_width: u32,
        bounds_height: u32,
    },

    // Colour Errors
    #[error("{operation}: image has no embedded ICC profile and no fallback was supplied")]
    NoSourceProfile { operation: Cow<'static, str> },

    #[error("Invalid ICC profile: {message}")]
    InvalidProfile { message: Cow<'static, str> },

    #[error("No colourspace conversion from {from} to {to}")]
    UnsupportedConversion {
        from: Cow<'static, str>,
        to: Cow<'static, str>,
    },

    // Size Limit Errors
    #[error("Image dimension {dimension} exceeds maximum {max}")]
    DimensionExceedsLimit { dimension: u32, max: u32 },

    #[error("Image pixel count {pixels} exceeds maximum {max}")]
    PixelCountExceedsLimit { pixels: u64, max: u64 },

    #[error("Input of {bytes} bytes exceeds limit of {max} bytes")]
    InputTooLarge { bytes: u64, max: u64 },

    #[error("Out of memory: {message}")]
    OutOfMemory { message: Cow<'static, str> },

    // Internal Errors
    #[error("Engine failure during {operation}: {message}")]
    EngineFailure {
        operation: Cow<'static, str>,
        message: Cow<'static, str>,
    },
}

// Constructor Helpers
impl PixformError {
    pub fn file_not_found(path: impl Into<Cow<'static, str>>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    pub fn file_read_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            source,
        }
    }

    pub fn mmap_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::MmapFailed {
            path: path.into(),
            source,
        }
    }

    pub fn file_write_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::FileWriteFailed {
            path: path.into(),
            source,
        }
    }

    pub fn unsupported_format(
        format: impl Into<Cow<'static, str>>,
        operation: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::UnsupportedFormat {
            format: format.into(),
            operation: operation.into(),
        }
    }

    pub fn decode_failed(
        format: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::DecodeFailed {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn encode_failed(
        format: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::EncodeFailed {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn invalid_argument(
        operation: impl Into<Cow<'static, str>>,
        name: impl Into<Cow<'static, str>>,
        value: impl ToString,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::InvalidArgument {
            operation: operation.into(),
            name: name.into(),
            value: Cow::Owned(value.to_string()),
            reason: reason.into(),
        }
    }

    pub fn out_of_bounds(
        operation: impl Into<Cow<'static, str>>,
        origin: (i64, i64),
        size: (u32, u32),
        bounds: (u32, u32),
    ) -> Self {
        Self::OutOfBounds {
            operation: operation.into(),
            left: origin.0,
            top: origin.1,
            width: size.0,
            height: size.1,
            bounds_width: bounds.0,
            bounds_height: bounds.1,
        }
    }

    pub fn no_source_profile(operation: impl Into<Cow<'static, str>>) -> Self {
        Self::NoSourceProfile {
            operation: operation.into(),
        }
    }

    pub fn invalid_profile(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidProfile {
            message: message.into(),
        }
    }

    pub fn unsupported_conversion(
        from: impl Into<Cow<'static, str>>,
        to: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::UnsupportedConversion {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn dimension_exceeds_limit(dimension: u32, max: u32) -> Self {
        Self::DimensionExceedsLimit { dimension, max }
    }

    pub fn pixel_count_exceeds_limit(pixels: u64, max: u64) -> Self {
        Self::PixelCountExceedsLimit { pixels, max }
    }

    pub fn input_too_large(bytes: u64, max: u64) -> Self {
        Self::InputTooLarge { bytes, max }
    }

    pub fn out_of_memory(message: impl Into<Cow<'static, str>>) -> Self {
        Self::OutOfMemory {
            message: message.into(),
        }
    }

    pub fn engine_failure(
        operation: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::EngineFailure {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (caller can fix it)
    ///
    /// Consistent with category():
    /// - UserError and ResourceLimit errors are recoverable
    /// - CodecError and InternalBug errors are not
    pub fn is_recoverable(&self) -> bool {
        match self.category() {
            ErrorCategory::UserError | ErrorCategory::ResourceLimit => true,
            ErrorCategory::CodecError | ErrorCategory::InternalBug => false,
        }
    }

    /// Get the error category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::FileNotFound { .. }
            | Self::InvalidArgument { .. }
            | Self::OutOfBounds { .. }
            | Self::NoSourceProfile { .. } => ErrorCategory::UserError,

            Self::UnsupportedFormat { .. }
            | Self::DecodeFailed { .. }
            | Self::EncodeFailed { .. }
            | Self::InvalidProfile { .. }
            | Self::UnsupportedConversion { .. } => ErrorCategory::CodecError,

            // File system failures land here: they are usually disk/permission
            // constraints the caller can fix.
            Self::DimensionExceedsLimit { .. }
            | Self::PixelCountExceedsLimit { .. }
            | Self::InputTooLarge { .. }
            | Self::OutOfMemory { .. }
            | Self::FileReadFailed { .. }
            | Self::MmapFailed { .. }
            | Self::FileWriteFailed { .. } => ErrorCategory::ResourceLimit,

            Self::EngineFailure { .. } => ErrorCategory::InternalBug,
        }
    }
}

// Result type alias
pub type Result<T> = std::result::Result<T, PixformError>;
