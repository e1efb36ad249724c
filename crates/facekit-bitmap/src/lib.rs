//! facekit-bitmap — Platform bitmap boundary.
//!
//! Converts RGBA_8888 and RGB_565 pixel buffers into the canonical RGB
//! image consumed by `facekit-core`, and scopes pixel locking so a locked
//! bitmap is always unlocked again.

pub mod bitmap;
pub mod pixel;

pub use bitmap::{
    canonical_from_bitmap, from_dynamic_image, with_locked_pixels, BitmapInfo, BitmapSource,
    MemoryBitmap, PixelGuard,
};
pub use pixel::{to_canonical, BitmapError, PixelFormat};
