//! Pixel codec: raw packed 4:2:2 frames to JPEG
//!
//! Encoding pipeline:
//! ```text
//! MJPEG/JPEG ──────────────────────────────> pass-through
//! YUYV/YVYU/UYVY ──convert──> I420 ──turbojpeg──> JPEG
//! ```
//!
//! The conversion tolerates short reads: rows past the end of the input
//! stay black and the output is still a complete JPEG.

use bytes::Bytes;

use crate::error::{AppError, Result};
use crate::video::format::{PackedLayout, PixelFormat, Resolution};

/// Luma value for black in limited range
const BLACK_Y: u8 = 16;
/// Neutral chroma
const NEUTRAL_UV: u8 = 128;

/// Placeholder color, as (Y, U, V)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YuvColor {
    pub y: u8,
    pub u: u8,
    pub v: u8,
}

/// Connected, waiting for the first frame (dark blue)
pub const WAITING_COLOR: YuvColor = YuvColor { y: 29, u: 184, v: 119 };
/// Disconnected or faulted (dark red)
pub const DISCONNECTED_COLOR: YuvColor = YuvColor { y: 49, u: 109, v: 184 };

/// I420 plane geometry as laid out for turbojpeg with `align = 1`.
///
/// 4:2:0 MCUs force the luma plane to even dimensions, so odd sizes are
/// padded by one column/row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlaneGeometry {
    width: usize,
    height: usize,
    luma_width: usize,
    luma_height: usize,
    chroma_width: usize,
    chroma_height: usize,
}

impl PlaneGeometry {
    fn new(resolution: Resolution) -> Self {
        let width = resolution.width as usize;
        let height = resolution.height as usize;
        let luma_width = (width + 1) & !1;
        let luma_height = (height + 1) & !1;
        Self {
            width,
            height,
            luma_width,
            luma_height,
            chroma_width: luma_width / 2,
            chroma_height: luma_height / 2,
        }
    }

    fn luma_len(&self) -> usize {
        self.luma_width * self.luma_height
    }

    fn chroma_len(&self) -> usize {
        self.chroma_width * self.chroma_height
    }

    fn total_len(&self) -> usize {
        self.luma_len() + 2 * self.chroma_len()
    }
}

/// Converts captured frames into the transport format
///
/// Holds a turbojpeg compressor and a reusable I420 buffer, so one codec
/// belongs to one capture loop. Not thread-safe.
pub struct PixelCodec {
    compressor: turbojpeg::Compressor,
    quality: u8,
    i420_buffer: Vec<u8>,
}

impl PixelCodec {
    /// Create a codec compressing at `quality` (1-100)
    pub fn new(quality: u8) -> Result<Self> {
        let quality = quality.clamp(1, 100);
        let mut compressor = turbojpeg::Compressor::new()
            .map_err(|e| AppError::Codec(format!("Failed to create turbojpeg compressor: {}", e)))?;
        compressor
            .set_quality(quality as i32)
            .map_err(|e| AppError::Codec(format!("Failed to set JPEG quality: {}", e)))?;

        Ok(Self {
            compressor,
            quality,
            i420_buffer: Vec::new(),
        })
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Encode one captured frame.
    ///
    /// Compressed formats are returned unchanged (same buffer). Packed 4:2:2
    /// input is converted to I420 and compressed.
    pub fn encode(&mut self, raw: Bytes, format: PixelFormat, resolution: Resolution) -> Result<Bytes> {
        let Some(layout) = format.packed_layout() else {
            return Ok(raw);
        };

        let geometry = PlaneGeometry::new(resolution);
        if geometry.width == 0 || geometry.height == 0 {
            return Err(AppError::Codec(format!("Invalid resolution {}", resolution)));
        }

        let expected = format.frame_size(resolution).unwrap_or(0);
        if raw.len() < expected {
            tracing::trace!(
                "Short {} frame: {} of {} bytes, padding with black",
                format,
                raw.len(),
                expected
            );
        }

        packed422_to_i420(&raw, layout, geometry, &mut self.i420_buffer);
        self.compress_i420(geometry)
    }

    /// Generate a solid-color placeholder JPEG
    pub fn placeholder(&mut self, resolution: Resolution, color: YuvColor) -> Result<Bytes> {
        let geometry = PlaneGeometry::new(resolution);
        if geometry.width == 0 || geometry.height == 0 {
            return Err(AppError::Codec(format!("Invalid resolution {}", resolution)));
        }

        let luma = geometry.luma_len();
        let chroma = geometry.chroma_len();
        self.i420_buffer.clear();
        self.i420_buffer.resize(luma, color.y);
        self.i420_buffer.resize(luma + chroma, color.u);
        self.i420_buffer.resize(luma + 2 * chroma, color.v);

        self.compress_i420(geometry)
    }

    fn compress_i420(&mut self, geometry: PlaneGeometry) -> Result<Bytes> {
        let yuv_image = turbojpeg::YuvImage {
            pixels: self.i420_buffer.as_slice(),
            width: geometry.width,
            height: geometry.height,
            align: 1,
            subsamp: turbojpeg::Subsamp::Sub2x2,
        };

        let jpeg = self
            .compressor
            .compress_yuv_to_vec(yuv_image)
            .map_err(|e| AppError::Codec(format!("JPEG compression failed: {}", e)))?;
        Ok(Bytes::from(jpeg))
    }
}

/// Convert packed 4:2:2 into planar I420.
///
/// `dst` is resized and prefilled with black, then overwritten up to the
/// last complete macropixel present in `src`. Chroma comes from even rows.
fn packed422_to_i420(src: &[u8], layout: PackedLayout, geometry: PlaneGeometry, dst: &mut Vec<u8>) {
    let luma_len = geometry.luma_len();
    let chroma_len = geometry.chroma_len();

    dst.clear();
    dst.resize(luma_len, BLACK_Y);
    dst.resize(geometry.total_len(), NEUTRAL_UV);

    let (y_plane, uv) = dst.split_at_mut(luma_len);
    let (u_plane, v_plane) = uv.split_at_mut(chroma_len);

    let macropixels = geometry.width.div_ceil(2);
    let src_stride = macropixels * 4;

    'rows: for row in 0..geometry.height {
        let src_row = row * src_stride;
        let y_row = row * geometry.luma_width;
        let chroma_row = (row % 2 == 0).then(|| (row / 2) * geometry.chroma_width);

        for mp in 0..macropixels {
            let offset = src_row + mp * 4;
            let Some(px) = src.get(offset..offset + 4) else {
                break 'rows;
            };

            let x = mp * 2;
            y_plane[y_row + x] = px[layout.y0];
            if x + 1 < geometry.width {
                y_plane[y_row + x + 1] = px[layout.y1];
            }
            if let Some(base) = chroma_row {
                u_plane[base + mp] = px[layout.u];
                v_plane[base + mp] = px[layout.v];
            }
        }
    }
}
