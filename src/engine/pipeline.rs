// src/engine/pipeline.rs
//
// Pipeline operations: apply_ops, optimize_ops, resize box calculations

use crate::engine::analysis::{smart_crop, trim};
use crate::engine::color::{convert_colorspace, transform_icc, transform_icc_with_fallback};
use crate::engine::decoder::load_auto;
use crate::engine::effects::{brightness, contrast, gamma, gaussian_blur, sharpen};
use crate::engine::handle::ImageHandle;
use crate::engine::transform::{
    affine_with_background, autorotate, embed, extract_area, flatten, flip, reduce, resize,
    resize_to, rotate, shrink, zoom,
};
use crate::engine::watermark::{apply_image_watermark, apply_text_watermark};
use crate::error::PixformError;
use crate::ops::{Gravity, Operation};
use tracing::debug;

type PipelineResult<T> = std::result::Result<T, PixformError>;

const SCALE_EPSILON: f64 = 1e-9;

/// Fit-inside box for `orig` scaled towards `target_w` x `target_h`.
///
/// A missing side follows the aspect ratio; with both sides given the result
/// fits inside the box. Sides never round below 1.
pub fn calc_resize_dimensions(
    orig_w: u32,
    orig_h: u32,
    target_w: Option<u32>,
    target_h: Option<u32>,
) -> (u32, u32) {
    let scaled = |len: u32, ratio: f64| ((len as f64 * ratio).round() as u32).max(1);
    match (target_w, target_h) {
        (Some(w), Some(h)) => {
            let orig_ratio = orig_w as f64 / orig_h as f64;
            let target_ratio = w as f64 / h as f64;
            if orig_ratio > target_ratio {
                (w, scaled(orig_h, w as f64 / orig_w as f64))
            } else {
                (scaled(orig_w, h as f64 / orig_h as f64), h)
            }
        }
        (Some(w), None) => (w, scaled(orig_h, w as f64 / orig_w as f64)),
        (None, Some(h)) => (scaled(orig_w, h as f64 / orig_h as f64), h),
        (None, None) => (orig_w, orig_h),
    }
}

/// Smallest aspect-preserving size that covers `target_w` x `target_h`.
pub fn calc_cover_dimensions(orig_w: u32, orig_h: u32, target_w: u32, target_h: u32) -> (u32, u32) {
    if orig_w == 0 || orig_h == 0 {
        return (target_w.max(1), target_h.max(1));
    }
    let scale = (target_w as f64 / orig_w as f64).max(target_h as f64 / orig_h as f64);
    let w = ((orig_w as f64 * scale).round() as u32).max(target_w).max(1);
    let h = ((orig_h as f64 * scale).round() as u32).max(target_h).max(1);
    (w, h)
}

/// Top-left corner of a `crop_w` x `crop_h` window anchored by `gravity`.
///
/// `Gravity::Smart` has no fixed anchor and resolves to the centre here.
pub fn gravity_offset(gravity: Gravity, width: u32, height: u32, crop_w: u32, crop_h: u32) -> (u32, u32) {
    let free_x = width.saturating_sub(crop_w);
    let free_y = height.saturating_sub(crop_h);
    match gravity {
        Gravity::North => (free_x / 2, 0),
        Gravity::South => (free_x / 2, free_y),
        Gravity::East => (free_x, free_y / 2),
        Gravity::West => (0, free_y / 2),
        Gravity::Centre | Gravity::Smart => (free_x / 2, free_y / 2),
    }
}

fn is_noop(op: &Operation) -> bool {
    match op {
        Operation::Resize { scale } => (scale - 1.0).abs() < SCALE_EPSILON,
        Operation::Rotate { angle } => *angle == 0,
        Operation::Shrink { xshrink, yshrink } | Operation::Zoom {
            xfactor: xshrink,
            yfactor: yshrink,
        } => *xshrink == 1 && *yshrink == 1,
        Operation::Reduce { xshrink, yshrink, .. } => {
            (xshrink - 1.0).abs() < SCALE_EPSILON && (yshrink - 1.0).abs() < SCALE_EPSILON
        }
        _ => false,
    }
}

/// Simplifies an operation list without changing its result shape.
///
/// - consecutive uniform resizes collapse into one scale (product)
/// - consecutive exact resizes keep only the last
/// - quarter-turn rotations accumulate; a full turn disappears
/// - two flips in the same direction cancel
/// - identity steps (scale 1, rotate 0, shrink/zoom/reduce by 1) are dropped
///
/// Invalid parameters are left alone so the step still fails when applied.
pub fn optimize_ops(ops: &[Operation]) -> Vec<Operation> {
    let mut optimized: Vec<Operation> = Vec::with_capacity(ops.len());

    for op in ops {
        if is_noop(op) {
            continue;
        }
        let merged = match (optimized.last(), op) {
            (Some(Operation::Resize { scale: a }), Operation::Resize { scale: b })
                if a.is_finite() && *a > 0.0 && b.is_finite() && *b > 0.0 =>
            {
                Some(Some(Operation::Resize { scale: a * b }))
            }
            (Some(Operation::ResizeTo { .. }), Operation::ResizeTo { width, height, kernel })
                if *width > 0 && *height > 0 =>
            {
                Some(Some(Operation::ResizeTo {
                    width: *width,
                    height: *height,
                    kernel: *kernel,
                }))
            }
            (Some(Operation::Rotate { angle: a }), Operation::Rotate { angle: b })
                if a % 90 == 0 && b % 90 == 0 && (0..360).contains(a) && (0..360).contains(b) =>
            {
                let angle = (a + b) % 360;
                Some((angle != 0).then_some(Operation::Rotate { angle }))
            }
            (Some(Operation::Flip { direction: a }), Operation::Flip { direction: b }) if a == b => {
                Some(None)
            }
            _ => None,
        };

        match merged {
            Some(replacement) => {
                optimized.pop();
                optimized.extend(replacement);
            }
            None => optimized.push(op.clone()),
        }
    }

    if optimized.len() != ops.len() {
        debug!(target: "pixform::pipeline", before = ops.len(), after = optimized.len(), "operations optimized");
    }
    optimized
}

/// Runs `ops` in order, each step consuming the previous handle.
///
/// The first failing step aborts the run; its error is returned with no
/// partial image.
pub fn apply_ops(handle: ImageHandle, ops: &[Operation]) -> PipelineResult<ImageHandle> {
    optimize_ops(ops)
        .iter()
        .try_fold(handle, |handle, op| apply_op(handle, op))
}

/// Applies a single operation.
pub fn apply_op(handle: ImageHandle, op: &Operation) -> PipelineResult<ImageHandle> {
    debug!(
        target: "pixform::pipeline",
        op = op.name(),
        width = handle.width(),
        height = handle.height(),
        "apply"
    );
    match op {
        Operation::Autorotate => autorotate(handle),
        Operation::Resize { scale } => resize(handle, *scale),
        Operation::ResizeTo { width, height, kernel } => resize_to(handle, *width, *height, *kernel),
        Operation::Reduce { xshrink, yshrink, kernel } => reduce(handle, *xshrink, *yshrink, *kernel),
        Operation::Shrink { xshrink, yshrink } => shrink(handle, *xshrink, *yshrink),
        Operation::Affine {
            matrix,
            interpolator,
            extend,
            background,
        } => affine_with_background(handle, *matrix, *interpolator, *extend, *background),
        Operation::Rotate { angle } => rotate(handle, *angle),
        Operation::Flip { direction } => flip(handle, *direction),
        Operation::Zoom { xfactor, yfactor } => zoom(handle, *xfactor, *yfactor),
        Operation::Embed {
            left,
            top,
            width,
            height,
            extend,
            background,
        } => embed(handle, *left, *top, *width, *height, *extend, *background),
        Operation::ExtractArea { left, top, width, height } => {
            extract_area(handle, *left, *top, *width, *height)
        }
        Operation::SmartCrop { width, height } => smart_crop(handle, *width, *height),
        Operation::Trim { background, threshold } => trim(handle, *background, *threshold),
        Operation::GaussianBlur { sigma, min_amplitude } => gaussian_blur(handle, *sigma, *min_amplitude),
        Operation::Sharpen(params) => sharpen(handle, params),
        Operation::Gamma { exponent } => gamma(handle, *exponent),
        Operation::Brightness { k } => brightness(handle, *k),
        Operation::Contrast { k } => contrast(handle, *k),
        Operation::Flatten { background } => flatten(handle, *background),
        Operation::Colourspace { target } => convert_colorspace(handle, *target),
        Operation::IccTransform { output, fallback } => match fallback {
            Some(fallback) => transform_icc_with_fallback(handle, output, fallback),
            None => transform_icc(handle, output),
        },
        Operation::TextWatermark { text, layout } => apply_text_watermark(handle, text, layout),
        Operation::ImageWatermark { overlay, spec } => {
            let overlay = load_auto(overlay, 1)?;
            apply_image_watermark(handle, &overlay, spec)
        }
    }
}
