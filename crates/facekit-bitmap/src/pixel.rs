//! Source pixel formats and conversion to canonical RGB.

use facekit_core::types::{CanonicalImage, ImageError, CANONICAL_CHANNELS};
use thiserror::Error;

/// Android `Bitmap.Config` code for ARGB_8888 (stored R, G, B, A in memory).
pub const FORMAT_CODE_RGBA_8888: i32 = 1;
/// Android `Bitmap.Config` code for RGB_565.
pub const FORMAT_CODE_RGB_565: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes/pixel in R, G, B, A order; alpha is dropped.
    Rgba8888,
    /// 2 bytes/pixel, little-endian `u16` packed as 5-6-5 bits R, G, B.
    Rgb565,
}

impl PixelFormat {
    /// Map a platform format code; anything else is unsupported.
    pub fn from_code(code: i32) -> Result<Self, BitmapError> {
        match code {
            FORMAT_CODE_RGBA_8888 => Ok(PixelFormat::Rgba8888),
            FORMAT_CODE_RGB_565 => Ok(PixelFormat::Rgb565),
            other => Err(BitmapError::UnsupportedFormat(other)),
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8888 => 4,
            PixelFormat::Rgb565 => 2,
        }
    }

    fn convert_row(self, src: &[u8], dst: &mut [u8]) {
        match self {
            PixelFormat::Rgba8888 => {
                for (px, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(CANONICAL_CHANNELS)) {
                    out.copy_from_slice(&px[..3]);
                }
            }
            PixelFormat::Rgb565 => {
                for (px, out) in src.chunks_exact(2).zip(dst.chunks_exact_mut(CANONICAL_CHANNELS)) {
                    out.copy_from_slice(&rgb565_to_rgb(u16::from_le_bytes([px[0], px[1]])));
                }
            }
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitmapError {
    #[error("unsupported bitmap format code {0}")]
    UnsupportedFormat(i32),
    #[error("invalid pixel buffer length: expected at least {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("row stride {stride} is smaller than a {width}-pixel row")]
    InvalidStride { stride: usize, width: u32 },
    #[error("failed to lock bitmap pixels: {0}")]
    LockFailed(String),
    #[error("bitmap image: {0}")]
    Image(#[from] ImageError),
}

/// Expand a packed RGB565 value to 8 bits per channel by bit replication.
pub fn rgb565_to_rgb(value: u16) -> [u8; 3] {
    let r = ((value >> 11) & 0x1f) as u8;
    let g = ((value >> 5) & 0x3f) as u8;
    let b = (value & 0x1f) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

/// Convert a tightly packed pixel buffer to canonical RGB.
pub fn to_canonical(
    buffer: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<CanonicalImage, BitmapError> {
    let stride = width as usize * format.bytes_per_pixel();
    to_canonical_strided(buffer, width, height, stride, format)
}

/// Convert a pixel buffer whose rows are `stride` bytes apart.
pub fn to_canonical_strided(
    buffer: &[u8],
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
) -> Result<CanonicalImage, BitmapError> {
    if width == 0 || height == 0 {
        return Err(ImageError::ZeroDimensions.into());
    }
    let row_bytes = width as usize * format.bytes_per_pixel();
    if stride < row_bytes {
        return Err(BitmapError::InvalidStride { stride, width });
    }
    // Last row needs only its pixels, not the trailing padding.
    let expected = stride
        .checked_mul(height as usize - 1)
        .and_then(|n| n.checked_add(row_bytes))
        .unwrap_or(usize::MAX);
    if buffer.len() < expected {
        return Err(BitmapError::InvalidLength {
            expected,
            actual: buffer.len(),
        });
    }

    let out_row = width as usize * CANONICAL_CHANNELS;
    let mut data = vec![0u8; out_row * height as usize];
    for (y, dst) in data.chunks_exact_mut(out_row).enumerate() {
        let start = y * stride;
        format.convert_row(&buffer[start..start + row_bytes], dst);
    }

    Ok(CanonicalImage::new(width, height, data)?)
}
