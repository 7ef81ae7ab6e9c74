// src/ops.rs
//
// Caller-facing value types: pipeline operations and the small enums they carry.
// Operations are plain data; the work happens in engine::pipeline::apply_ops().

use crate::engine::color::ProfileSource;
use crate::engine::encoder::EncodeParams;
use crate::engine::handle::Interpretation;
use crate::engine::registry::FormatTag;
use crate::engine::watermark::{WatermarkImageSpec, WatermarkLayout, WatermarkText};
use std::sync::Arc;

/// A single step of a declarative pipeline.
///
/// Each operation is self-contained: no borrowed data, so an operation list can be
/// built once and replayed against many inputs.
#[derive(Clone, Debug)]
pub enum Operation {
    /// Apply the EXIF orientation and reset it to 1
    Autorotate,

    /// Uniform scale by `scale` (> 0)
    Resize { scale: f64 },

    /// Resample to an exact size
    ResizeTo {
        width: u32,
        height: u32,
        kernel: Kernel,
    },

    /// Downsample by fractional factors (>= 1) with a resampling kernel
    Reduce {
        xshrink: f64,
        yshrink: f64,
        kernel: Kernel,
    },

    /// Integer box-average downsample
    Shrink { xshrink: u32, yshrink: u32 },

    /// 2x2 linear transform `[a, b, c, d]`
    Affine {
        matrix: [f64; 4],
        interpolator: Interpolator,
        extend: Extend,
        background: Color,
    },

    /// Rotate by a multiple of 90 degrees
    Rotate { angle: i32 },

    Flip { direction: Direction },

    /// Pixel replication
    Zoom { xfactor: u32, yfactor: u32 },

    /// Place the image inside a larger canvas
    Embed {
        left: u32,
        top: u32,
        width: u32,
        height: u32,
        extend: Extend,
        background: Color,
    },

    /// Crop a region
    ExtractArea {
        left: u32,
        top: u32,
        width: u32,
        height: u32,
    },

    /// Content-aware crop
    SmartCrop { width: u32, height: u32 },

    /// Strip a uniform border (find-trim followed by extract)
    Trim { background: Color, threshold: f64 },

    GaussianBlur { sigma: f64, min_amplitude: f64 },

    Sharpen(SharpenParams),

    Gamma { exponent: f64 },

    /// Add `k` (8-bit units) to every colour band
    Brightness { k: f64 },

    /// Scale distance from mid-grey by `k`
    Contrast { k: f64 },

    /// Composite alpha onto a solid colour
    Flatten { background: Color },

    Colourspace { target: Interpretation },

    IccTransform {
        output: ProfileSource,
        fallback: Option<ProfileSource>,
    },

    TextWatermark {
        text: WatermarkText,
        layout: WatermarkLayout,
    },

    /// Composite an encoded overlay image
    ImageWatermark {
        overlay: Arc<Vec<u8>>,
        spec: WatermarkImageSpec,
    },
}

impl Operation {
    /// Short name used in logs and error context.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Autorotate => "autorotate",
            Operation::Resize { .. } => "resize",
            Operation::ResizeTo { .. } => "resize_to",
            Operation::Reduce { .. } => "reduce",
            Operation::Shrink { .. } => "shrink",
            Operation::Affine { .. } => "affine",
            Operation::Rotate { .. } => "rotate",
            Operation::Flip { .. } => "flip",
            Operation::Zoom { .. } => "zoom",
            Operation::Embed { .. } => "embed",
            Operation::ExtractArea { .. } => "extract_area",
            Operation::SmartCrop { .. } => "smart_crop",
            Operation::Trim { .. } => "trim",
            Operation::GaussianBlur { .. } => "gaussian_blur",
            Operation::Sharpen(_) => "sharpen",
            Operation::Gamma { .. } => "gamma",
            Operation::Brightness { .. } => "brightness",
            Operation::Contrast { .. } => "contrast",
            Operation::Flatten { .. } => "flatten",
            Operation::Colourspace { .. } => "colourspace",
            Operation::IccTransform { .. } => "icc_transform",
            Operation::TextWatermark { .. } => "text_watermark",
            Operation::ImageWatermark { .. } => "image_watermark",
        }
    }
}

/// An opaque RGB colour, 8 bits per channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color::new(0, 0, 0);
    pub const WHITE: Color = Color::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// From unit-range components, clamped.
    pub fn from_unit(rgb: [f32; 3]) -> Self {
        let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        Self::new(q(rgb[0]), q(rgb[1]), q(rgb[2]))
    }

    /// Components rescaled so that 255 maps to `max`.
    pub fn scaled(self, max: f32) -> [f32; 3] {
        let s = max / 255.0;
        [self.r as f32 * s, self.g as f32 * s, self.b as f32 * s]
    }

    /// Rec.601 luma, 8-bit scale.
    pub fn luma(self) -> f32 {
        0.299 * self.r as f32 + 0.587 * self.g as f32 + 0.114 * self.b as f32
    }
}

/// How pixels outside the source are produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Extend {
    #[default]
    Black,
    White,
    /// Replicate the nearest edge pixel
    Copy,
    /// Wrap around
    Repeat,
    Mirror,
    /// Fill with the operation's background colour
    Background,
}

impl Extend {
    pub fn from_name(name: &str) -> Option<Self> {
        let extend = match name.to_ascii_lowercase().as_str() {
            "black" => Extend::Black,
            "white" => Extend::White,
            "copy" => Extend::Copy,
            "repeat" => Extend::Repeat,
            "mirror" => Extend::Mirror,
            "background" => Extend::Background,
            _ => return None,
        };
        Some(extend)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Horizontal,
    Vertical,
}

/// Point-sampling kernel for affine transforms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Interpolator {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
}

impl Interpolator {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "nearest" => Some(Interpolator::Nearest),
            "bilinear" => Some(Interpolator::Bilinear),
            "bicubic" => Some(Interpolator::Bicubic),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Interpolator::Nearest => "nearest",
            Interpolator::Bilinear => "bilinear",
            Interpolator::Bicubic => "bicubic",
        }
    }

    /// Width of the sampling window in source pixels.
    pub fn window_size(self) -> u32 {
        match self {
            Interpolator::Nearest => 1,
            Interpolator::Bilinear => 2,
            Interpolator::Bicubic => 4,
        }
    }
}

/// Resampling kernel for resize/reduce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Kernel {
    Nearest,
    Linear,
    Cubic,
    Mitchell,
    #[default]
    Lanczos3,
}

impl Kernel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "nearest" => Some(Kernel::Nearest),
            "linear" => Some(Kernel::Linear),
            "cubic" => Some(Kernel::Cubic),
            "mitchell" => Some(Kernel::Mitchell),
            "lanczos3" => Some(Kernel::Lanczos3),
            _ => None,
        }
    }
}

/// Anchor used when cropping to a target box.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Gravity {
    #[default]
    Centre,
    North,
    East,
    South,
    West,
    /// Content-aware
    Smart,
}

/// Unsharp-mask parameters.
///
/// `radius` is the Gaussian sigma of the mask; `x1` separates flat from jaggy
/// areas; `y2`/`y3` cap brightening/darkening; `m1`/`m2` are the slopes for flat
/// and jaggy areas. Differences are measured in L* units (0..100).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SharpenParams {
    pub radius: f64,
    pub x1: f64,
    pub y2: f64,
    pub y3: f64,
    pub m1: f64,
    pub m2: f64,
}

impl Default for SharpenParams {
    fn default() -> Self {
        Self {
            radius: 1.0,
            x1: 2.0,
            y2: 10.0,
            y3: 20.0,
            m1: 0.0,
            m2: 3.0,
        }
    }
}

/// A rectangle in pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Area {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrimOptions {
    pub background: Color,
    /// Maximum per-band distance from `background` still counted as border.
    pub threshold: f64,
}

impl Default for TrimOptions {
    fn default() -> Self {
        Self {
            background: Color::WHITE,
            threshold: 10.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlurOptions {
    pub sigma: f64,
    pub min_amplitude: f64,
}

impl Default for BlurOptions {
    fn default() -> Self {
        Self {
            sigma: 1.0,
            min_amplitude: 0.2,
        }
    }
}

/// Text watermark request. Unset fields are resolved against the image being
/// processed: width is a sixth of the image width, margin equals the width,
/// DPI is 150, opacity 0.25 and the ink colour white.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WatermarkOptions {
    pub text: String,
    /// `"family [style] size"`; empty means `sans 10`.
    pub font: String,
    pub width: Option<u32>,
    pub dpi: Option<u32>,
    pub margin: Option<u32>,
    /// Clamped to 0..=1.
    pub opacity: Option<f32>,
    pub no_replicate: bool,
    pub background: Option<Color>,
}

/// Image overlay request; `opacity` defaults to fully opaque.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WatermarkImageOptions {
    /// Encoded overlay image.
    pub buffer: Arc<Vec<u8>>,
    pub left: i32,
    pub top: i32,
    pub opacity: Option<f32>,
}

/// Everything `process` can do to one image, applied in a fixed order:
/// autorotate, trim, resize/crop/embed, area extract, zoom, rotate, flip/flop,
/// effects, flatten, colour, watermarks, encode.
#[derive(Clone, Debug, Default)]
pub struct ProcessOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Cover the target box and cut the excess at `gravity`.
    pub crop: bool,
    /// Pad to exactly `width` x `height` after a fit-inside resize.
    pub embed: bool,
    /// Resize to exactly `width` x `height`, ignoring aspect ratio.
    pub force: bool,
    /// Allow upscaling.
    pub enlarge: bool,
    pub gravity: Gravity,
    pub kernel: Kernel,
    /// Region to extract after resizing.
    pub area: Option<Area>,
    pub extend: Extend,
    /// Fill colour for embed padding and flatten.
    pub background: Color,
    pub no_autorotate: bool,
    /// Multiple of 90 degrees; other values are rejected.
    pub rotate: i32,
    /// Mirror vertically.
    pub flip: bool,
    /// Mirror horizontally.
    pub flop: bool,
    /// Integer pixel replication; 0 and 1 leave the image alone.
    pub zoom: u32,
    pub trim: Option<TrimOptions>,
    pub blur: Option<BlurOptions>,
    pub sharpen: Option<SharpenParams>,
    pub gamma: Option<f64>,
    pub brightness: Option<f64>,
    pub contrast: Option<f64>,
    pub flatten: bool,
    pub interpretation: Option<Interpretation>,
    /// Target ICC profile; requires an embedded profile unless `input_icc` is set.
    pub output_icc: Option<ProfileSource>,
    /// Profile assumed when the image has no usable embedded one.
    pub input_icc: Option<ProfileSource>,
    pub watermark: Option<WatermarkOptions>,
    pub watermark_image: Option<WatermarkImageOptions>,
    /// Output format; `None` keeps the input format when it can be encoded and
    /// falls back to JPEG otherwise.
    pub format: Option<FormatTag>,
    pub encode: EncodeParams,
}
