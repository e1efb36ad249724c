//! Bitmap sources and scoped pixel locking.

use crate::pixel::{to_canonical_strided, BitmapError, PixelFormat, FORMAT_CODE_RGBA_8888};
use facekit_core::types::CanonicalImage;

/// Geometry and format reported by a bitmap before its pixels are locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapInfo {
    pub width: u32,
    pub height: u32,
    /// Bytes between the starts of consecutive rows.
    pub stride: usize,
    /// Platform format code, see [`PixelFormat::from_code`].
    pub format: i32,
}

/// A bitmap whose pixel memory must be locked while read.
pub trait BitmapSource {
    fn info(&self) -> Result<BitmapInfo, BitmapError>;

    fn lock_pixels(&mut self) -> Result<(), BitmapError>;

    /// Pixel bytes. Only meaningful between lock and unlock.
    fn pixels(&self) -> &[u8];

    fn unlock_pixels(&mut self);
}

/// Unlocks the source when dropped.
pub struct PixelGuard<'a, S: BitmapSource + ?Sized> {
    source: &'a mut S,
}

impl<'a, S: BitmapSource + ?Sized> PixelGuard<'a, S> {
    /// Lock `source`; on failure nothing is held and nothing will be unlocked.
    pub fn lock(source: &'a mut S) -> Result<Self, BitmapError> {
        source.lock_pixels()?;
        Ok(Self { source })
    }

    pub fn pixels(&self) -> &[u8] {
        self.source.pixels()
    }
}

impl<S: BitmapSource + ?Sized> Drop for PixelGuard<'_, S> {
    fn drop(&mut self) {
        self.source.unlock_pixels();
    }
}

/// Run `f` over the locked pixels; the unlock happens on every exit path.
pub fn with_locked_pixels<S, R>(
    source: &mut S,
    f: impl FnOnce(&[u8]) -> R,
) -> Result<R, BitmapError>
where
    S: BitmapSource + ?Sized,
{
    let guard = PixelGuard::lock(source)?;
    Ok(f(guard.pixels()))
}

/// Convert a bitmap to canonical RGB.
///
/// Unsupported formats are rejected from `info()` alone, before any lock.
pub fn canonical_from_bitmap<S>(source: &mut S) -> Result<CanonicalImage, BitmapError>
where
    S: BitmapSource + ?Sized,
{
    let info = source.info()?;
    let format = PixelFormat::from_code(info.format).map_err(|e| {
        tracing::warn!(format = info.format, "rejecting bitmap: {e}");
        e
    })?;

    with_locked_pixels(source, |pixels| {
        to_canonical_strided(pixels, info.width, info.height, info.stride, format)
    })?
}

/// Owned in-memory bitmap.
#[derive(Debug, Clone)]
pub struct MemoryBitmap {
    info: BitmapInfo,
    data: Vec<u8>,
    locked: bool,
    lock_count: usize,
    unlock_count: usize,
    refuse_lock: bool,
}

impl MemoryBitmap {
    pub fn new(info: BitmapInfo, data: Vec<u8>) -> Self {
        Self {
            info,
            data,
            locked: false,
            lock_count: 0,
            unlock_count: 0,
            refuse_lock: false,
        }
    }

    /// A bitmap whose `lock_pixels` always fails.
    pub fn refusing_lock(mut self) -> Self {
        self.refuse_lock = true;
        self
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn lock_count(&self) -> usize {
        self.lock_count
    }

    pub fn unlock_count(&self) -> usize {
        self.unlock_count
    }
}

impl BitmapSource for MemoryBitmap {
    fn info(&self) -> Result<BitmapInfo, BitmapError> {
        Ok(self.info)
    }

    fn lock_pixels(&mut self) -> Result<(), BitmapError> {
        if self.refuse_lock {
            return Err(BitmapError::LockFailed("bitmap refused lock".into()));
        }
        if self.locked {
            return Err(BitmapError::LockFailed("bitmap already locked".into()));
        }
        self.locked = true;
        self.lock_count += 1;
        Ok(())
    }

    fn pixels(&self) -> &[u8] {
        &self.data
    }

    fn unlock_pixels(&mut self) {
        if self.locked {
            self.locked = false;
            self.unlock_count += 1;
        }
    }
}

/// Wrap a decoded image as an RGBA_8888 bitmap.
pub fn from_dynamic_image(image: &image::DynamicImage) -> MemoryBitmap {
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    let info = BitmapInfo {
        width,
        height,
        stride: width as usize * 4,
        format: FORMAT_CODE_RGBA_8888,
    };
    MemoryBitmap::new(info, rgba.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::FORMAT_CODE_RGB_565;

    fn rgba_bitmap(width: u32, height: u32, rgba: [u8; 4]) -> MemoryBitmap {
        let info = BitmapInfo {
            width,
            height,
            stride: width as usize * 4,
            format: FORMAT_CODE_RGBA_8888,
        };
        let data = (0..width * height).flat_map(|_| rgba).collect();
        MemoryBitmap::new(info, data)
    }

    #[test]
    fn test_canonical_from_bitmap_locks_once() {
        let mut bmp = rgba_bitmap(3, 2, [9, 8, 7, 255]);
        let img = canonical_from_bitmap(&mut bmp).unwrap();
        assert_eq!((img.width(), img.height()), (3, 2));
        assert_eq!(&img.as_bytes()[..3], &[9, 8, 7]);
        assert_eq!(bmp.lock_count(), 1);
        assert_eq!(bmp.unlock_count(), 1);
        assert!(!bmp.is_locked());
    }

    #[test]
    fn test_unlocks_when_conversion_fails() {
        let info = BitmapInfo {
            width: 4,
            height: 4,
            stride: 16,
            format: FORMAT_CODE_RGBA_8888,
        };
        let mut bmp = MemoryBitmap::new(info, vec![0u8; 10]);
        let err = canonical_from_bitmap(&mut bmp).unwrap_err();
        assert!(matches!(err, BitmapError::InvalidLength { .. }));
        assert_eq!(bmp.lock_count(), 1);
        assert_eq!(bmp.unlock_count(), 1);
    }

    #[test]
    fn test_unsupported_format_never_locks() {
        let info = BitmapInfo {
            width: 2,
            height: 2,
            stride: 2,
            format: 8,
        };
        let mut bmp = MemoryBitmap::new(info, vec![0u8; 4]);
        assert_eq!(canonical_from_bitmap(&mut bmp), Err(BitmapError::UnsupportedFormat(8)));
        assert_eq!(bmp.lock_count(), 0);
        assert_eq!(bmp.unlock_count(), 0);
    }

    #[test]
    fn test_lock_failure_does_not_unlock() {
        let mut bmp = rgba_bitmap(2, 2, [0, 0, 0, 0]).refusing_lock();
        assert!(matches!(canonical_from_bitmap(&mut bmp), Err(BitmapError::LockFailed(_))));
        assert_eq!(bmp.unlock_count(), 0);
    }

    #[test]
    fn test_guard_unlocks_on_panic() {
        let mut bmp = rgba_bitmap(1, 1, [0, 0, 0, 0]);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = with_locked_pixels(&mut bmp, |_| panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!bmp.is_locked());
        assert_eq!(bmp.unlock_count(), 1);
    }

    #[test]
    fn test_rgb565_bitmap() {
        let info = BitmapInfo {
            width: 2,
            height: 1,
            stride: 4,
            format: FORMAT_CODE_RGB_565,
        };
        let data = [0xf800u16.to_le_bytes(), 0x001fu16.to_le_bytes()].concat();
        let mut bmp = MemoryBitmap::new(info, data);
        let img = canonical_from_bitmap(&mut bmp).unwrap();
        assert_eq!(img.as_bytes(), &[255, 0, 0, 0, 0, 255]);
    }

    #[test]
    fn test_from_dynamic_image() {
        let rgb = image::RgbImage::from_pixel(5, 4, image::Rgb([11, 22, 33]));
        let mut bmp = from_dynamic_image(&image::DynamicImage::ImageRgb8(rgb));
        let img = canonical_from_bitmap(&mut bmp).unwrap();
        assert_eq!((img.width(), img.height()), (5, 4));
        assert!(img.as_bytes().chunks_exact(3).all(|px| px == [11, 22, 33]));
    }
}
