// src/engine/common.rs
//
// Common utilities shared across engine modules: panic containment around codec
// calls and the cache trace hook.

use crate::engine::config;
use crate::error::PixformError;
use image::DynamicImage;
use std::panic::{catch_unwind, AssertUnwindSafe};

pub type EngineResult<T> = std::result::Result<T, PixformError>;

/// Runs `f`, converting a panic inside a codec or raster routine into
/// [`PixformError::EngineFailure`] tagged with `stage`.
pub fn run_with_panic_policy<T, F>(stage: &'static str, f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(target: "pixform::engine", stage, %message, "engine panic contained");
            Err(PixformError::engine_failure(stage, message))
        }
    }
}

/// Reports a freshly materialized raster when the process-wide cache trace is on.
pub fn trace_materialize(stage: &'static str, img: &DynamicImage) {
    if !config::config().cache_trace {
        return;
    }
    tracing::trace!(
        target: "pixform::cache",
        stage,
        width = img.width(),
        height = img.height(),
        bytes = img.as_bytes().len(),
        "materialized"
    );
}
