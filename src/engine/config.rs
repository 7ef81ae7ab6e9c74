// src/engine/config.rs
//
// Process-wide engine configuration: resource limits and the cache trace toggle.
// Installed once at startup, read-only afterwards.

use crate::engine::{MAX_DIMENSION, MAX_PIXELS};
use crate::error::PixformError;
use std::sync::OnceLock;

const STRICT_MAX_PIXELS: u64 = 40_000_000; // ~8K x 5K
const STRICT_MAX_DIMENSION: u32 = 16_384;
const STRICT_MAX_BYTES: u64 = 32 * 1024 * 1024; // 32MB input cap

static ENGINE_CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// Decode-time resource limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_dimension: u32,
    pub max_pixels: u64,
    pub max_input_bytes: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_dimension: MAX_DIMENSION,
            max_pixels: MAX_PIXELS,
            max_input_bytes: None,
        }
    }
}

impl Limits {
    pub fn strict() -> Self {
        Self {
            max_dimension: STRICT_MAX_DIMENSION,
            max_pixels: STRICT_MAX_PIXELS,
            max_input_bytes: Some(STRICT_MAX_BYTES),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            max_dimension: u32::MAX,
            max_pixels: u64::MAX,
            max_input_bytes: None,
        }
    }

    pub fn enforce_input_len(&self, len: usize) -> Result<(), PixformError> {
        if let Some(limit) = self.max_input_bytes {
            let len = len as u64;
            if len > limit {
                return Err(PixformError::input_too_large(len, limit));
            }
        }
        Ok(())
    }

    pub fn enforce_dimensions(&self, width: u32, height: u32) -> Result<(), PixformError> {
        if width > self.max_dimension || height > self.max_dimension {
            return Err(PixformError::dimension_exceeds_limit(
                width.max(height),
                self.max_dimension,
            ));
        }
        let pixels = width as u64 * height as u64;
        if pixels > self.max_pixels {
            return Err(PixformError::pixel_count_exceeds_limit(
                pixels,
                self.max_pixels,
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Emit a `pixform::cache` trace event whenever a stage materializes a raster.
    pub cache_trace: bool,
    pub limits: Limits,
}

impl EngineConfig {
    /// Builds a configuration from `PIXFORM_*` environment variables.
    ///
    /// Unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("PIXFORM_TRACE_CACHE") {
            config.cache_trace = matches!(value.as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(max) = env_number::<u32>("PIXFORM_MAX_DIMENSION") {
            config.limits.max_dimension = max;
        }
        if let Some(max) = env_number::<u64>("PIXFORM_MAX_PIXELS") {
            config.limits.max_pixels = max;
        }
        if let Some(max) = env_number::<u64>("PIXFORM_MAX_INPUT_BYTES") {
            config.limits.max_input_bytes = Some(max);
        }
        config
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

/// Installs the process-wide configuration.
///
/// Only the first call (or the first implicit read via [`config`]) takes effect;
/// a rejected configuration is handed back to the caller.
pub fn configure(config: EngineConfig) -> Result<(), EngineConfig> {
    ENGINE_CONFIG.set(config)
}

/// Returns the process-wide configuration, initializing it from the environment
/// if [`configure`] was never called.
pub fn config() -> &'static EngineConfig {
    ENGINE_CONFIG.get_or_init(EngineConfig::from_env)
}
