//! Pixel format definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc;

/// Pixel formats a camera may be negotiated into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// MJPEG compressed format (the transport format)
    Mjpeg,
    /// JPEG compressed format
    Jpeg,
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// YVYU 4:2:2 packed format
    Yvyu,
    /// UYVY 4:2:2 packed format
    Uyvy,
}

/// Byte offsets of Y0, U, Y1, V inside one 4-byte macropixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedLayout {
    pub y0: usize,
    pub u: usize,
    pub y1: usize,
    pub v: usize,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC
    pub fn to_fourcc(&self) -> fourcc::FourCC {
        match self {
            PixelFormat::Mjpeg => fourcc::FourCC::new(b"MJPG"),
            PixelFormat::Jpeg => fourcc::FourCC::new(b"JPEG"),
            PixelFormat::Yuyv => fourcc::FourCC::new(b"YUYV"),
            PixelFormat::Yvyu => fourcc::FourCC::new(b"YVYU"),
            PixelFormat::Uyvy => fourcc::FourCC::new(b"UYVY"),
        }
    }

    /// Check if format is compressed (JPEG/MJPEG), i.e. already transport-ready
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg | PixelFormat::Jpeg)
    }

    /// Format tried when the device rejects this one
    pub fn fallback(&self) -> PixelFormat {
        if self.is_compressed() {
            PixelFormat::Yuyv
        } else {
            PixelFormat::Mjpeg
        }
    }

    /// Macropixel layout for packed 4:2:2 formats
    pub fn packed_layout(&self) -> Option<PackedLayout> {
        match self {
            PixelFormat::Yuyv => Some(PackedLayout { y0: 0, u: 1, y1: 2, v: 3 }),
            PixelFormat::Yvyu => Some(PackedLayout { y0: 0, v: 1, y1: 2, u: 3 }),
            PixelFormat::Uyvy => Some(PackedLayout { u: 0, y0: 1, v: 2, y1: 3 }),
            PixelFormat::Mjpeg | PixelFormat::Jpeg => None,
        }
    }

    /// Expected raw frame size; None for compressed formats
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        if self.is_compressed() {
            None
        } else {
            Some(resolution.pixels() as usize * 2)
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Jpeg => "JPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Yvyu => "YVYU",
            PixelFormat::Uyvy => "UYVY",
        };
        write!(f, "{}", name)
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
