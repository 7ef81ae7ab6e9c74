#![no_main]

//! Fuzz target for format detection and decoding.
//! Every decoder behind load_auto() sees the raw bytes, with and without shrink-on-load.

use libfuzzer_sys::fuzz_target;
use pixform::engine::decoder;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let shrink = u32::from(data[0] % 9).max(1);
    let _ = decoder::load_auto(data, 1);
    let _ = decoder::load_auto(data, shrink);
});
