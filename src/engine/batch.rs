// src/engine/batch.rs
//
// Batch processing on a shared rayon pool. Inputs are independent: every
// buffer is decoded, processed and encoded on one worker, and handles never
// cross threads.

use crate::engine::api::process;
use crate::engine::io::{read_file, write_file};
use crate::engine::registry::{detect_format, FormatTag};
use crate::error::{ErrorCategory, PixformError};
use crate::ops::ProcessOptions;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

const MIN_THREADS: usize = 1;

static POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();

/// Runs `f` on the batch pool, or on rayon's global pool if building ours failed.
fn install<R: Send>(f: impl FnOnce() -> R + Send) -> R {
    let pool = POOL.get_or_init(|| {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_THREADS);
        match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("pixform-batch-{i}"))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                warn!(target: "pixform::engine", error = %e, "batch pool unavailable, using global pool");
                None
            }
        }
    });
    match pool {
        Some(pool) => pool.install(f),
        None => f(),
    }
}

/// Processes every buffer with the same options. Results keep input order.
pub fn process_batch<B>(inputs: &[B], options: &ProcessOptions) -> Vec<Result<Vec<u8>, PixformError>>
where
    B: AsRef<[u8]> + Sync,
{
    debug!(target: "pixform::engine", items = inputs.len(), "batch start");
    install(|| {
        inputs
            .par_iter()
            .map(|input| process(input.as_ref(), options))
            .collect()
    })
}

/// Outcome of one file in [`process_files`].
#[derive(Debug)]
pub struct BatchResult {
    pub source: PathBuf,
    pub output: Option<PathBuf>,
    pub error: Option<PixformError>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_category(&self) -> Option<ErrorCategory> {
        self.error.as_ref().map(PixformError::category)
    }
}

/// Processes files into `output_dir`, keeping each file stem and using the
/// output format's name as extension. One failure does not stop the others.
pub fn process_files<P>(inputs: &[P], output_dir: impl AsRef<Path>, options: &ProcessOptions) -> Vec<BatchResult>
where
    P: AsRef<Path> + Sync,
{
    let output_dir = output_dir.as_ref();
    install(|| {
        inputs
            .par_iter()
            .map(|input| {
                let source = input.as_ref().to_path_buf();
                match process_file(&source, output_dir, options) {
                    Ok(output) => BatchResult {
                        source,
                        output: Some(output),
                        error: None,
                    },
                    Err(error) => {
                        warn!(target: "pixform::engine", source = %source.display(), %error, "batch item failed");
                        BatchResult {
                            source,
                            output: None,
                            error: Some(error),
                        }
                    }
                }
            })
            .collect()
    })
}

fn process_file(source: &Path, output_dir: &Path, options: &ProcessOptions) -> Result<PathBuf, PixformError> {
    let input = read_file(source)?;
    let encoded = process(input.as_bytes(), options)?;
    let extension = match options.format {
        Some(tag) => tag,
        None => detect_format(&encoded).unwrap_or(FormatTag::Jpeg),
    }
    .name();
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let output = output_dir.join(format!("{stem}.{extension}"));
    write_file(&output, &encoded)?;
    Ok(output)
}
