#![no_main]

//! Fuzz target for image encoding to various formats.
//! Tests JPEG (mozjpeg), PNG (with palette/oxipng), WebP, TIFF, GIF and AVIF paths
//! for crashes and memory issues.

use arbitrary::{Arbitrary, Unstructured};
use image::{DynamicImage, RgbaImage};
use libfuzzer_sys::fuzz_target;
use pixform::engine::{encoder, EncodeParams, FormatTag, ImageHandle};

#[derive(Arbitrary, Debug)]
struct EncodeSeed {
    format: u8,
    quality: u8,
    compression: u8,
    speed: Option<u8>,
    lossless: bool,
    interlace: bool,
    palette: bool,
    width: u8,
    height: u8,
}

fn build_image(data: &[u8], width: u8, height: u8) -> DynamicImage {
    // Limit dimensions to avoid OOM (max 128x128 = 64KB RGBA)
    let w = (width as u32 % 128).max(1);
    let h = (height as u32 % 128).max(1);
    let pixel_count = (w * h * 4) as usize;

    let mut buffer = vec![0u8; pixel_count];
    for (i, byte) in buffer.iter_mut().enumerate() {
        *byte = data.get(i % data.len().max(1)).copied().unwrap_or(128);
    }

    let rgba = RgbaImage::from_raw(w, h, buffer)
        .unwrap_or_else(|| RgbaImage::from_raw(1, 1, vec![0, 0, 0, 255]).unwrap());
    DynamicImage::ImageRgba8(rgba)
}

const FORMATS: [FormatTag; 6] = [
    FormatTag::Jpeg,
    FormatTag::Png,
    FormatTag::Webp,
    FormatTag::Tiff,
    FormatTag::Gif,
    FormatTag::Avif,
];

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let mut unstructured = Unstructured::new(data);
    let seed: EncodeSeed = match EncodeSeed::arbitrary(&mut unstructured) {
        Ok(s) => s,
        Err(_) => return,
    };

    let handle = ImageHandle::from_image(build_image(data, seed.width, seed.height));
    let tag = FORMATS[seed.format as usize % FORMATS.len()];
    let params = EncodeParams {
        quality: seed.quality,
        compression: seed.compression,
        speed: seed.speed,
        lossless: seed.lossless,
        interlace: seed.interlace,
        palette: seed.palette,
        strip: false,
    };

    // Out-of-range parameters must be rejected, never panic
    let valid = params.validate_for(tag).is_ok();
    match encoder::encode(&handle, tag, &params) {
        Ok(bytes) => assert!(valid && !bytes.is_empty()),
        Err(_) => {}
    }
});
