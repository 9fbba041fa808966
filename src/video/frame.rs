//! Published frame type

use bytes::Bytes;
use std::time::Instant;

/// One compressed image published by a capture session
///
/// Frames are immutable once published. The session swaps in a new `Arc<Frame>`
/// for every capture, readers keep whichever one they loaded.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Bytes,
    /// Per-session sequence number, restarts at 1 after reconnect
    pub sequence: u64,
    /// When the frame was dequeued from the device
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(data: Bytes, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check for JPEG SOI and EOI markers
    pub fn is_valid_jpeg(&self) -> bool {
        is_jpeg(&self.data)
    }
}

/// Check that `data` starts with SOI and ends with EOI
pub fn is_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data.starts_with(&[0xFF, 0xD8]) && data.ends_with(&[0xFF, 0xD9])
}
