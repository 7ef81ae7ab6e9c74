// src/codecs/avif_safe.rs
//
// RAII wrappers around the libavif encoder FFI. Every raw pointer is owned by
// exactly one wrapper and released in Drop, so error and unwind paths cannot
// leak or double free.
#![deny(unsafe_op_in_unsafe_fn)]

use crate::engine::config::config;
use crate::error::PixformError;
use libavif_sys::*;
use std::marker::PhantomData;
use std::ptr::NonNull;
#[cfg(test)]
use std::{cell::Cell, thread_local};

#[cfg(test)]
thread_local! {
    static TRACK_DROPS: Cell<bool> = const { Cell::new(false) };
    static LIVE_IMAGES: Cell<usize> = const { Cell::new(0) };
    static LIVE_ENCODERS: Cell<usize> = const { Cell::new(0) };
    static LIVE_RWDATA: Cell<usize> = const { Cell::new(0) };
}

#[cfg(test)]
fn track(counter: &'static std::thread::LocalKey<Cell<usize>>, delta: isize) {
    TRACK_DROPS.with(|flag| {
        if flag.get() {
            counter.with(|c| c.set(c.get().saturating_add_signed(delta)));
        }
    });
}

fn avif_error(message: impl Into<std::borrow::Cow<'static, str>>) -> PixformError {
    PixformError::encode_failed("avif", message)
}

fn check(result: avifResult, what: &str) -> Result<(), PixformError> {
    if result == AVIF_RESULT_OK {
        Ok(())
    } else {
        Err(avif_error(format!("{what}: {result:?}")))
    }
}

fn validate_dimensions(width: u32, height: u32) -> Result<(), PixformError> {
    if width == 0 || height == 0 {
        return Err(avif_error(format!("dimensions must be positive ({width}x{height})")));
    }
    config()
        .limits
        .enforce_dimensions(width, height)
        .map_err(|e| avif_error(e.to_string()))
}

/// Owned `avifImage`.
pub struct SafeAvifImage {
    ptr: NonNull<avifImage>,
    width: u32,
    height: u32,
}

impl SafeAvifImage {
    /// `depth` is the sample depth (8 here); `pixel_format` the YUV subsampling.
    pub fn new(width: u32, height: u32, depth: u32, pixel_format: avifPixelFormat) -> Result<Self, PixformError> {
        validate_dimensions(width, height)?;
        let ptr = unsafe { avifImageCreate(width, height, depth, pixel_format) };
        let ptr = NonNull::new(ptr).ok_or_else(|| avif_error("failed to create image"))?;
        #[cfg(test)]
        track(&LIVE_IMAGES, 1);
        Ok(Self { ptr, width, height })
    }

    pub fn set_color_properties(&mut self, primaries: u16, transfer: u16, matrix: u16, yuv_range: avifRange) {
        let raw = self.ptr.as_ptr();
        unsafe {
            (*raw).colorPrimaries = primaries;
            (*raw).transferCharacteristics = transfer;
            (*raw).matrixCoefficients = matrix;
            (*raw).yuvRange = yuv_range;
        }
    }

    pub fn set_icc_profile(&mut self, icc: &[u8]) -> Result<(), PixformError> {
        let result = unsafe { avifImageSetProfileICC(self.ptr.as_ptr(), icc.as_ptr(), icc.len()) };
        check(result, "failed to set ICC profile")
    }

    pub fn set_exif(&mut self, exif: &[u8]) -> Result<(), PixformError> {
        let result = unsafe { avifImageSetMetadataExif(self.ptr.as_ptr(), exif.as_ptr(), exif.len()) };
        check(result, "failed to set EXIF")
    }

    pub fn allocate_planes(&mut self, planes: u32) -> Result<(), PixformError> {
        let result = unsafe { avifImageAllocatePlanes(self.ptr.as_ptr(), planes) };
        check(result, "failed to allocate planes")
    }

    /// Converts interleaved RGB(A) into the image's YUV planes.
    pub fn rgb_to_yuv(&mut self, rgb: &AvifRgbView<'_>) -> Result<(), PixformError> {
        let result = unsafe { avifImageRGBToYUV(self.ptr.as_ptr(), &rgb.raw) };
        check(result, "failed to convert RGB to YUV")
    }

    /// Copies the fourth band of an RGBA8 buffer into the alpha plane.
    /// The alpha plane must have been allocated.
    pub fn copy_alpha_from_rgba(&mut self, rgba: &[u8]) -> Result<(), PixformError> {
        let (w, h) = (self.width as usize, self.height as usize);
        if rgba.len() != w * h * 4 {
            return Err(avif_error("alpha source length does not match image size"));
        }
        let (plane, row_bytes) = unsafe {
            let raw = self.ptr.as_ptr();
            ((*raw).alphaPlane, (*raw).alphaRowBytes as usize)
        };
        if plane.is_null() || row_bytes < w {
            return Err(avif_error("alpha plane is not allocated"));
        }
        // SAFETY: libavif allocated `row_bytes * h` bytes for the plane and we
        // hold the only handle to the image.
        let plane = unsafe { std::slice::from_raw_parts_mut(plane, row_bytes * h) };
        for (dst_row, src_row) in plane.chunks_exact_mut(row_bytes).zip(rgba.chunks_exact(w * 4)) {
            for (dst, px) in dst_row[..w].iter_mut().zip(src_row.chunks_exact(4)) {
                *dst = px[3];
            }
        }
        Ok(())
    }

    fn as_mut_ptr(&mut self) -> *mut avifImage {
        self.ptr.as_ptr()
    }
}

impl Drop for SafeAvifImage {
    fn drop(&mut self) {
        unsafe { avifImageDestroy(self.ptr.as_ptr()) };
        #[cfg(test)]
        track(&LIVE_IMAGES, -1);
    }
}

/// An `avifRGBImage` describing a borrowed pixel buffer.
pub struct AvifRgbView<'a> {
    raw: avifRGBImage,
    _pixels: PhantomData<&'a [u8]>,
}

impl<'a> AvifRgbView<'a> {
    /// Describes `pixels` (interleaved RGB8 or RGBA8) for conversion into `image`.
    pub fn new(image: &mut SafeAvifImage, pixels: &'a [u8], has_alpha: bool) -> Result<Self, PixformError> {
        let channels: u32 = if has_alpha { 4 } else { 3 };
        let row_bytes = image
            .width
            .checked_mul(channels)
            .ok_or_else(|| avif_error("row bytes overflow"))?;
        let expected = (row_bytes as usize)
            .checked_mul(image.height as usize)
            .ok_or_else(|| avif_error("pixel buffer size overflow"))?;
        if pixels.len() != expected {
            return Err(avif_error(format!(
                "pixel buffer is {} bytes, expected {expected}",
                pixels.len()
            )));
        }

        let mut raw: avifRGBImage = unsafe { std::mem::zeroed() };
        unsafe {
            avifRGBImageSetDefaults(&mut raw, image.as_mut_ptr());
        }
        raw.format = if has_alpha { AVIF_RGB_FORMAT_RGBA } else { AVIF_RGB_FORMAT_RGB };
        raw.depth = 8;
        // libavif only reads through this pointer during RGB to YUV conversion.
        raw.pixels = pixels.as_ptr() as *mut u8;
        raw.rowBytes = row_bytes;
        Ok(Self {
            raw,
            _pixels: PhantomData,
        })
    }
}

/// Owned `avifEncoder`.
pub struct SafeAvifEncoder {
    ptr: NonNull<avifEncoder>,
}

impl SafeAvifEncoder {
    pub fn new() -> Result<Self, PixformError> {
        let ptr = unsafe { avifEncoderCreate() };
        let ptr = NonNull::new(ptr).ok_or_else(|| avif_error("failed to create encoder"))?;
        #[cfg(test)]
        track(&LIVE_ENCODERS, 1);
        Ok(Self { ptr })
    }

    /// `quality` 0..=100, `speed` 0 (slowest) ..= 10 (fastest).
    pub fn configure(&mut self, quality: u8, quality_alpha: u8, speed: i32, max_threads: i32) {
        let raw = self.ptr.as_ptr();
        unsafe {
            (*raw).quality = quality as i32;
            (*raw).qualityAlpha = quality_alpha as i32;
            (*raw).speed = speed;
            (*raw).maxThreads = max_threads;
        }
    }

    pub fn add_image(&mut self, image: &mut SafeAvifImage, duration: u64, flags: u32) -> Result<(), PixformError> {
        let result = unsafe { avifEncoderAddImage(self.ptr.as_ptr(), image.as_mut_ptr(), duration, flags) };
        check(result, "failed to add image")
    }

    pub fn finish(&mut self, output: &mut SafeAvifRwData) -> Result<(), PixformError> {
        let result = unsafe { avifEncoderFinish(self.ptr.as_ptr(), &mut output.data) };
        check(result, "failed to finish encoding")
    }
}

impl Drop for SafeAvifEncoder {
    fn drop(&mut self) {
        unsafe { avifEncoderDestroy(self.ptr.as_ptr()) };
        #[cfg(test)]
        track(&LIVE_ENCODERS, -1);
    }
}

/// Owned `avifRWData` output buffer.
pub struct SafeAvifRwData {
    data: avifRWData,
}

impl SafeAvifRwData {
    pub fn new() -> Self {
        #[cfg(test)]
        track(&LIVE_RWDATA, 1);
        Self {
            data: unsafe { std::mem::zeroed() },
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.data.data.is_null() || self.data.size == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.data.data, self.data.size) }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl Drop for SafeAvifRwData {
    fn drop(&mut self) {
        unsafe { avifRWDataFree(&mut self.data) };
        #[cfg(test)]
        track(&LIVE_RWDATA, -1);
    }
}

impl Default for SafeAvifRwData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DropTrackingGuard;

    impl Drop for DropTrackingGuard {
        fn drop(&mut self) {
            TRACK_DROPS.with(|t| t.set(false));
        }
    }

    fn enable_drop_tracking() -> DropTrackingGuard {
        TRACK_DROPS.with(|t| t.set(true));
        LIVE_IMAGES.with(|c| c.set(0));
        LIVE_ENCODERS.with(|c| c.set(0));
        LIVE_RWDATA.with(|c| c.set(0));
        DropTrackingGuard
    }

    fn live(counter: &'static std::thread::LocalKey<Cell<usize>>) -> usize {
        counter.with(|c| c.get())
    }

    #[test]
    fn new_rejects_zero_dimensions() {
        assert!(SafeAvifImage::new(0, 10, 8, AVIF_PIXEL_FORMAT_YUV420).is_err());
    }

    #[test]
    fn new_rejects_dimension_limits() {
        let over = config().limits.max_dimension + 1;
        assert!(SafeAvifImage::new(over, 10, 8, AVIF_PIXEL_FORMAT_YUV420).is_err());
    }

    #[test]
    fn rgb_view_checks_buffer_length() {
        let mut img = SafeAvifImage::new(4, 2, 8, AVIF_PIXEL_FORMAT_YUV420).unwrap();
        let rgba = [0u8; 32];
        let view = AvifRgbView::new(&mut img, &rgba, true).unwrap();
        assert_eq!(view.raw.rowBytes, 16);
        assert_eq!(view.raw.format, AVIF_RGB_FORMAT_RGBA);

        let rgb = [0u8; 24];
        let view = AvifRgbView::new(&mut img, &rgb, false).unwrap();
        assert_eq!(view.raw.rowBytes, 12);

        assert!(AvifRgbView::new(&mut img, &rgb[..20], false).is_err());
    }

    #[test]
    fn alpha_copy_requires_allocated_plane() {
        let mut img = SafeAvifImage::new(2, 2, 8, AVIF_PIXEL_FORMAT_YUV444).unwrap();
        let rgba = [9u8; 16];
        assert!(img.copy_alpha_from_rgba(&rgba).is_err());
        img.allocate_planes(AVIF_PLANES_A).unwrap();
        img.copy_alpha_from_rgba(&rgba).unwrap();
        assert!(img.copy_alpha_from_rgba(&rgba[..12]).is_err());
    }

    #[test]
    fn image_drop_happens_on_unwind() {
        let _guard = enable_drop_tracking();
        let result = std::panic::catch_unwind(|| {
            let _img = SafeAvifImage::new(2, 2, 8, AVIF_PIXEL_FORMAT_YUV444).unwrap();
            assert_eq!(live(&LIVE_IMAGES), 1);
            panic!("force unwind");
        });
        assert!(result.is_err());
        assert_eq!(live(&LIVE_IMAGES), 0);
    }

    #[test]
    fn encoder_and_rwdata_drop_once_after_move() {
        let _guard = enable_drop_tracking();
        {
            let enc = SafeAvifEncoder::new().unwrap();
            let rw = SafeAvifRwData::new();
            assert_eq!(live(&LIVE_ENCODERS), 1);
            assert_eq!(live(&LIVE_RWDATA), 1);
            drop((enc, rw));
        }
        assert_eq!(live(&LIVE_ENCODERS), 0);
        assert_eq!(live(&LIVE_RWDATA), 0);
    }

    #[test]
    fn image_drop_runs_on_error_path() {
        let _guard = enable_drop_tracking();
        let result: Result<(), PixformError> = (|| {
            let _img = SafeAvifImage::new(3, 3, 8, AVIF_PIXEL_FORMAT_YUV444)?;
            Err(avif_error("synthetic failure"))
        })();
        assert!(result.is_err());
        assert_eq!(live(&LIVE_IMAGES), 0);
    }
}
