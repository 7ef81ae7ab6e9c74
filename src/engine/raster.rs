// src/engine/raster.rs
//
// Interleaved f32 working buffer for operations that must treat every band layout
// and sample depth alike (affine, embed, zoom, blur, compositing, colour maths).
// Values stay in the source depth's scale: 0..255, 0..65535 or 0.0..1.0.

use crate::engine::handle::BitDepth;
use crate::error::PixformError;
use image::{DynamicImage, ImageBuffer};

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Raster {
    pub width: u32,
    pub height: u32,
    pub bands: usize,
    pub depth: BitDepth,
    pub data: Vec<f32>,
}

impl Raster {
    pub fn new(width: u32, height: u32, bands: usize, depth: BitDepth) -> Self {
        Self {
            width,
            height,
            bands,
            depth,
            data: vec![0.0; width as usize * height as usize * bands],
        }
    }

    pub fn from_image(img: &DynamicImage) -> Self {
        fn collect<T: Copy + Into<f32>>(
            width: u32,
            height: u32,
            bands: usize,
            depth: BitDepth,
            samples: &[T],
        ) -> Raster {
            Raster {
                width,
                height,
                bands,
                depth,
                data: samples.iter().map(|&v| v.into()).collect(),
            }
        }

        let (w, h) = (img.width(), img.height());
        match img {
            DynamicImage::ImageLuma8(b) => collect(w, h, 1, BitDepth::Eight, b.as_raw()),
            DynamicImage::ImageLumaA8(b) => collect(w, h, 2, BitDepth::Eight, b.as_raw()),
            DynamicImage::ImageRgb8(b) => collect(w, h, 3, BitDepth::Eight, b.as_raw()),
            DynamicImage::ImageRgba8(b) => collect(w, h, 4, BitDepth::Eight, b.as_raw()),
            DynamicImage::ImageLuma16(b) => collect(w, h, 1, BitDepth::Sixteen, b.as_raw()),
            DynamicImage::ImageLumaA16(b) => collect(w, h, 2, BitDepth::Sixteen, b.as_raw()),
            DynamicImage::ImageRgb16(b) => collect(w, h, 3, BitDepth::Sixteen, b.as_raw()),
            DynamicImage::ImageRgba16(b) => collect(w, h, 4, BitDepth::Sixteen, b.as_raw()),
            DynamicImage::ImageRgb32F(b) => collect(w, h, 3, BitDepth::Float, b.as_raw()),
            DynamicImage::ImageRgba32F(b) => collect(w, h, 4, BitDepth::Float, b.as_raw()),
            other => Self::from_image(&DynamicImage::ImageRgba32F(other.to_rgba32f())),
        }
    }

    /// Converts back into a `DynamicImage`, rounding and clamping integer samples.
    pub fn into_image(self) -> Result<DynamicImage, PixformError> {
        let (w, h) = (self.width, self.height);
        let Raster {
            bands, depth, data, ..
        } = self;
        let to_u8 = |v: f32| v.round().clamp(0.0, 255.0) as u8;
        let to_u16 = |v: f32| v.round().clamp(0.0, 65535.0) as u16;

        let img = match (bands, depth) {
            (1, BitDepth::Eight) => ImageBuffer::from_raw(w, h, data.into_iter().map(to_u8).collect())
                .map(DynamicImage::ImageLuma8),
            (2, BitDepth::Eight) => ImageBuffer::from_raw(w, h, data.into_iter().map(to_u8).collect())
                .map(DynamicImage::ImageLumaA8),
            (3, BitDepth::Eight) => ImageBuffer::from_raw(w, h, data.into_iter().map(to_u8).collect())
                .map(DynamicImage::ImageRgb8),
            (4, BitDepth::Eight) => ImageBuffer::from_raw(w, h, data.into_iter().map(to_u8).collect())
                .map(DynamicImage::ImageRgba8),
            (1, BitDepth::Sixteen) => ImageBuffer::from_raw(w, h, data.into_iter().map(to_u16).collect())
                .map(DynamicImage::ImageLuma16),
            (2, BitDepth::Sixteen) => ImageBuffer::from_raw(w, h, data.into_iter().map(to_u16).collect())
                .map(DynamicImage::ImageLumaA16),
            (3, BitDepth::Sixteen) => ImageBuffer::from_raw(w, h, data.into_iter().map(to_u16).collect())
                .map(DynamicImage::ImageRgb16),
            (4, BitDepth::Sixteen) => ImageBuffer::from_raw(w, h, data.into_iter().map(to_u16).collect())
                .map(DynamicImage::ImageRgba16),
            (3, BitDepth::Float) => ImageBuffer::from_raw(w, h, data).map(DynamicImage::ImageRgb32F),
            (4, BitDepth::Float) => ImageBuffer::from_raw(w, h, data).map(DynamicImage::ImageRgba32F),
            _ => {
                return Err(PixformError::engine_failure(
                    "raster",
                    format!("no pixel layout for {bands} bands at {depth:?}"),
                ))
            }
        };
        img.ok_or_else(|| PixformError::engine_failure("raster", "buffer length mismatch"))
    }

    pub fn max_value(&self) -> f32 {
        self.depth.max_value()
    }

    #[inline]
    pub fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.bands
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> &[f32] {
        let i = self.offset(x, y);
        &self.data[i..i + self.bands]
    }

    #[inline]
    pub fn pixel_mut(&mut self, x: u32, y: u32) -> &mut [f32] {
        let i = self.offset(x, y);
        let bands = self.bands;
        &mut self.data[i..i + bands]
    }
}
