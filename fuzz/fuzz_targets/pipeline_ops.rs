#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use image::{self, DynamicImage, RgbaImage};
use libfuzzer_sys::fuzz_target;
use pixform::engine::{apply_ops, ImageHandle, Interpretation};
use pixform::ops::{Color, Direction, Extend, Interpolator, Kernel, Operation};

#[derive(Arbitrary, Debug)]
struct OperationSeed {
    kind: u8,
    a: i32,
    b: i32,
    c: i32,
    d: i32,
}

fn build_image(data: &[u8]) -> DynamicImage {
    if let Ok(img) = image::load_from_memory(data) {
        if img.width() <= 256 && img.height() <= 256 {
            return img;
        }
    }

    let width = data.first().copied().unwrap_or(0) as u32 % 64 + 1;
    let height = data.get(1).copied().unwrap_or(0) as u32 % 64 + 1;
    let mut buffer = vec![0u8; (width * height * 4) as usize];
    for (i, byte) in buffer.iter_mut().enumerate() {
        *byte = data.get(i % data.len()).copied().unwrap_or(0);
    }

    let rgba = RgbaImage::from_raw(width, height, buffer)
        .unwrap_or_else(|| RgbaImage::from_raw(1, 1, vec![0, 0, 0, 255]).unwrap());
    DynamicImage::ImageRgba8(rgba)
}

fn small(v: i32, max: i32) -> u32 {
    v.rem_euclid(max) as u32
}

fn seeds_to_ops(seeds: Vec<OperationSeed>) -> Vec<Operation> {
    seeds
        .into_iter()
        .take(12)
        .map(|seed| match seed.kind % 12 {
            0 => Operation::ResizeTo {
                width: small(seed.a, 512),
                height: small(seed.b, 512),
                kernel: Kernel::Linear,
            },
            1 => Operation::ExtractArea {
                left: seed.a.max(0) as u32,
                top: seed.b.max(0) as u32,
                width: seed.c.max(0) as u32,
                height: seed.d.max(0) as u32,
            },
            2 => Operation::Rotate { angle: seed.a },
            3 => Operation::Flip {
                direction: if seed.a % 2 == 0 {
                    Direction::Horizontal
                } else {
                    Direction::Vertical
                },
            },
            4 => Operation::Resize {
                scale: seed.a as f64 / 1000.0,
            },
            5 => Operation::Embed {
                left: small(seed.a, 64),
                top: small(seed.b, 64),
                width: small(seed.c, 512),
                height: small(seed.d, 512),
                extend: Extend::Mirror,
                background: Color::BLACK,
            },
            6 => Operation::Affine {
                matrix: [
                    seed.a as f64 / 1000.0,
                    seed.b as f64 / 1000.0,
                    seed.c as f64 / 1000.0,
                    seed.d as f64 / 1000.0,
                ],
                interpolator: Interpolator::Bicubic,
                extend: Extend::Copy,
                background: Color::WHITE,
            },
            7 => Operation::Brightness {
                k: seed.a.clamp(-255, 255) as f64,
            },
            8 => Operation::Contrast {
                k: seed.b as f64 / 100.0,
            },
            9 => Operation::Trim {
                background: Color::WHITE,
                threshold: seed.a as f64,
            },
            10 => Operation::Shrink {
                xshrink: small(seed.a, 9),
                yshrink: small(seed.b, 9),
            },
            _ => Operation::Colourspace {
                target: if seed.a % 2 == 0 {
                    Interpretation::BW
                } else {
                    Interpretation::Lab
                },
            },
        })
        .collect()
}

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    let mut unstructured = Unstructured::new(data);
    let seeds: Vec<OperationSeed> = match Vec::arbitrary(&mut unstructured) {
        Ok(v) => v,
        Err(_) => return,
    };

    let ops = seeds_to_ops(seeds);
    let handle = ImageHandle::from_image(build_image(data));
    // Invalid steps return errors; we're interested only in panics or memory issues.
    let _ = apply_ops(handle, &ops);
});
