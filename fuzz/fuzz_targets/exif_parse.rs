#![no_main]

//! Fuzz target for EXIF parsing paths in pixform.
//! Exercises container EXIF extraction and the metadata summary on arbitrary data.

use libfuzzer_sys::fuzz_target;
use pixform::engine::io::{extract_exif_raw, extract_icc_profile};
use pixform::engine::{metadata, FormatTag};

fuzz_target!(|data: &[u8]| {
    for tag in [FormatTag::Jpeg, FormatTag::Png, FormatTag::Webp] {
        let _ = extract_exif_raw(data, tag);
        let _ = extract_icc_profile(data, tag);
    }
    if let Ok(meta) = metadata(data) {
        assert!((1..=8).contains(&meta.orientation));
    }
});
