// tests/integration_tests.rs
//
// Integration tests for the buffer-level public API: ImageEngine, process(),
// batch processing and header-only inspection.

use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use pixform::engine::{process_files, BuiltinProfile, ProfileSource};
use pixform::ops::{Area, BlurOptions, TrimOptions, WatermarkImageOptions};
use pixform::{
    process, process_batch, size, Color, EncodeParams, FormatTag, Gravity, ImageEngine,
    Interpretation, PixformError, ProcessOptions,
};
use std::io::Cursor;
use std::sync::Arc;

// Helper to create a test image buffer
fn create_test_image_buffer(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), format)
        .unwrap();
    buf
}

fn dims(buffer: &[u8]) -> (u32, u32) {
    let s = size(buffer).unwrap();
    (s.width, s.height)
}

#[test]
fn test_image_engine_dimensions() {
    let engine = ImageEngine::new(create_test_image_buffer(100, 80, ImageFormat::Png));
    let s = engine.size().unwrap();
    assert_eq!((s.width, s.height), (100, 80));
    assert_eq!(engine.format(), "png");
    assert_eq!(engine.length(), engine.image().len());
}

#[test]
fn test_image_engine_chained_operations() {
    let mut engine = ImageEngine::new(create_test_image_buffer(200, 100, ImageFormat::Jpeg));
    engine.resize_and_crop(50, 50).unwrap();
    assert_eq!(dims(engine.image()), (50, 50));
    engine.rotate(90).unwrap();
    engine.flop().unwrap();
    engine.convert(FormatTag::Png).unwrap();
    assert_eq!(engine.format(), "png");
    assert_eq!(dims(engine.image()), (50, 50));
}

#[test]
fn test_image_engine_failure_keeps_buffer() {
    let original = create_test_image_buffer(40, 40, ImageFormat::Png);
    let mut engine = ImageEngine::new(original.clone());
    assert!(engine.extract(30, 30, 20, 20).is_err());
    assert!(engine.rotate(33).is_err());
    assert_eq!(engine.image(), &original[..]);
}

#[test]
fn test_image_engine_metadata() {
    let engine = ImageEngine::new(create_test_image_buffer(12, 34, ImageFormat::Png));
    let meta = engine.metadata().unwrap();
    assert_eq!((meta.width, meta.height), (12, 34));
    assert_eq!(meta.format, FormatTag::Png);
    assert_eq!(meta.orientation, 1);
    assert!(!meta.has_alpha);
    assert!(!meta.has_profile);
    assert_eq!(engine.interpretation().unwrap(), Interpretation::Srgb);
    assert!(engine.colourspace_is_supported().unwrap());
}

#[test]
fn test_process_full_chain() {
    let input = create_test_image_buffer(300, 200, ImageFormat::Jpeg);
    let options = ProcessOptions {
        width: Some(120),
        height: Some(120),
        crop: true,
        gravity: Gravity::North,
        rotate: 180,
        flip: true,
        blur: Some(BlurOptions::default()),
        brightness: Some(5.0),
        output_icc: Some(ProfileSource::Named(BuiltinProfile::Srgb)),
        input_icc: Some(ProfileSource::Named(BuiltinProfile::Srgb)),
        format: Some(FormatTag::Webp),
        encode: EncodeParams {
            quality: 70,
            ..EncodeParams::default()
        },
        ..ProcessOptions::default()
    };
    let out = process(&input, &options).unwrap();
    assert_eq!(pixform::engine::detect_format(&out).unwrap(), FormatTag::Webp);
    assert_eq!(dims(&out), (120, 120));
}

#[test]
fn test_process_trim_then_area() {
    let mut img = RgbImage::from_pixel(60, 60, Rgb([255, 255, 255]));
    for y in 10..50 {
        for x in 20..40 {
            img.put_pixel(x, y, Rgb([0, 0, 0]));
        }
    }
    let mut input = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut input), ImageFormat::Png)
        .unwrap();

    let options = ProcessOptions {
        trim: Some(TrimOptions::default()),
        area: Some(Area {
            left: 5,
            top: 5,
            width: 10,
            height: 30,
        }),
        ..ProcessOptions::default()
    };
    let out = process(&input, &options).unwrap();
    assert_eq!(dims(&out), (10, 30));
}

#[test]
fn test_process_image_watermark_anchors() {
    let base = create_test_image_buffer(50, 50, ImageFormat::Png);
    let mut overlay = Vec::new();
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])))
        .write_to(&mut Cursor::new(&mut overlay), ImageFormat::Png)
        .unwrap();

    let options = ProcessOptions {
        watermark_image: Some(WatermarkImageOptions {
            buffer: Arc::new(overlay),
            left: -1,
            top: -1,
            opacity: None,
        }),
        ..ProcessOptions::default()
    };
    let out = process(&base, &options).unwrap();
    let decoded = image::load_from_memory(&out).unwrap().to_rgb8();
    // Negative offsets anchor from the far edges: the overlay ends one pixel in.
    assert_eq!(decoded.get_pixel(48, 48).0, [255, 0, 0]);
    assert_eq!(decoded.get_pixel(39, 39).0, [255, 0, 0]);
    assert_ne!(decoded.get_pixel(49, 49).0, [255, 0, 0]);
    assert_ne!(decoded.get_pixel(38, 38).0, [255, 0, 0]);
}

#[test]
fn test_process_flatten_removes_alpha() {
    let mut input = Vec::new();
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 0])))
        .write_to(&mut Cursor::new(&mut input), ImageFormat::Png)
        .unwrap();
    let options = ProcessOptions {
        flatten: true,
        background: Color::new(0, 0, 255),
        format: Some(FormatTag::Png),
        ..ProcessOptions::default()
    };
    let out = process(&input, &options).unwrap();
    let decoded = image::load_from_memory(&out).unwrap();
    assert!(!decoded.color().has_alpha());
    assert_eq!(decoded.to_rgb8().get_pixel(3, 3).0, [0, 0, 255]);
}

#[test]
fn test_batch_mixed_inputs() {
    let inputs = vec![
        create_test_image_buffer(64, 32, ImageFormat::Png),
        create_test_image_buffer(32, 64, ImageFormat::Jpeg),
        Vec::new(),
    ];
    let options = ProcessOptions {
        width: Some(16),
        format: Some(FormatTag::Png),
        ..ProcessOptions::default()
    };
    let results = process_batch(&inputs, &options);
    assert_eq!(dims(results[0].as_ref().unwrap()), (16, 8));
    assert_eq!(dims(results[1].as_ref().unwrap()), (16, 32));
    assert!(results[2].is_err());
}

#[test]
fn test_batch_files() {
    let dir = tempfile::tempdir().unwrap();
    let inputs: Vec<_> = (0..4)
        .map(|i| {
            let path = dir.path().join(format!("in{i}.jpg"));
            std::fs::write(&path, create_test_image_buffer(20 + i, 10, ImageFormat::Jpeg)).unwrap();
            path
        })
        .collect();
    let out_dir = tempfile::tempdir().unwrap();
    let results = process_files(&inputs, out_dir.path(), &ProcessOptions::default());
    assert!(results.iter().all(|r| r.is_success()));
    for (i, result) in results.iter().enumerate() {
        let output = result.output.as_ref().unwrap();
        assert_eq!(output, &out_dir.path().join(format!("in{i}.jpeg")));
        let written = std::fs::read(output).unwrap();
        assert_eq!(dims(&written), (20 + i as u32, 10));
    }
}

#[test]
fn test_svg_input_falls_back_to_jpeg() {
    let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="30" height="20"><rect width="30" height="20" fill="red"/></svg>"#;
    let out = process(svg, &ProcessOptions::default()).unwrap();
    assert_eq!(pixform::engine::detect_format(&out).unwrap(), FormatTag::Jpeg);
    assert_eq!(dims(&out), (30, 20));
}

#[test]
fn test_unsupported_output_is_rejected_early() {
    let input = create_test_image_buffer(10, 10, ImageFormat::Png);
    let options = ProcessOptions {
        format: Some(FormatTag::Heif),
        ..ProcessOptions::default()
    };
    assert!(matches!(
        process(&input, &options),
        Err(PixformError::UnsupportedFormat { .. })
    ));
}
