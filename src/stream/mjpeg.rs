//! MJPEG multiplexer
//!
//! Every viewer gets its own ticker-paced stream that reads the session's
//! latest frame. Viewers never wait on the capture loop or on each other; a
//! slow viewer just misses frames.

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::video::codec::{PixelCodec, DISCONNECTED_COLOR, WAITING_COLOR};
use crate::video::{CaptureSession, Resolution};

/// Multipart boundary used in the Content-Type header
pub const BOUNDARY: &str = "frame";

/// Create MJPEG multipart frame bytes
pub fn create_mjpeg_part(jpeg_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + jpeg_data.len());

    buf.put_slice(b"--frame\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", jpeg_data.len()).as_bytes());
    buf.put_slice(b"\r\n");

    buf.put_slice(jpeg_data);
    buf.put_slice(b"\r\n");

    buf.freeze()
}

/// RAII registration of one viewer on a session
pub struct ViewerGuard {
    id: String,
    session: Arc<CaptureSession>,
    connected_at: Instant,
    frames_sent: u64,
}

impl ViewerGuard {
    pub fn new(session: Arc<CaptureSession>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let count = session.viewer_connected();
        info!(
            "Viewer {} connected to camera {} ({} watching)",
            id,
            session.index(),
            count
        );
        Self {
            id,
            session,
            connected_at: Instant::now(),
            frames_sent: 0,
        }
    }

    pub fn record_frame_sent(&mut self) {
        self.frames_sent += 1;
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let count = self.session.viewer_disconnected();
        info!(
            "Viewer {} left camera {} after {:.1}s, {} frames ({} watching)",
            self.id,
            self.session.index(),
            self.connected_at.elapsed().as_secs_f32(),
            self.frames_sent,
            count
        );
    }
}

/// Fans the latest frame of each session out to its viewers
pub struct FrameMultiplexer {
    quality: u8,
    placeholders: Mutex<HashMap<(Resolution, bool), Bytes>>,
}

impl FrameMultiplexer {
    pub fn new(quality: u8) -> Self {
        Self {
            quality,
            placeholders: Mutex::new(HashMap::new()),
        }
    }

    /// Placeholder for a session with no frame, colored by connectivity
    pub fn placeholder(&self, resolution: Resolution, connected: bool) -> Option<Bytes> {
        let key = (resolution, connected);
        if let Some(image) = self.placeholders.lock().get(&key) {
            return Some(image.clone());
        }

        // Encode unlocked; a racing caller may encode too, first insert wins

        let color = if connected {
            WAITING_COLOR
        } else {
            DISCONNECTED_COLOR
        };
        let image = PixelCodec::new(self.quality)
            .and_then(|mut codec| codec.placeholder(resolution, color));
        match image {
            Ok(image) => {
                debug!("Generated {} placeholder (connected: {})", resolution, connected);
                Some(self.placeholders.lock().entry(key).or_insert(image).clone())
            }
            Err(e) => {
                warn!("Failed to generate placeholder: {}", e);
                None
            }
        }
    }

    /// Latest frame of the session, or a placeholder when there is none
    pub fn current_image(&self, session: &CaptureSession) -> Option<Bytes> {
        match session.get_frame() {
            Some(frame) if session.is_connected() => Some(frame.data_bytes()),
            _ => self.placeholder(session.resolution(), session.is_connected()),
        }
    }

    /// Per-viewer multipart body stream.
    ///
    /// Ticks at the session's frame rate. Ends only when the consumer drops
    /// it, which is how a viewer disconnect surfaces.
    pub fn viewer_stream(
        self: &Arc<Self>,
        session: Arc<CaptureSession>,
    ) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        let multiplexer = Arc::clone(self);
        let period = Duration::from_secs(1) / session.fps().max(1);
        let mut guard = ViewerGuard::new(session.clone());

        async_stream::stream! {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(image) = multiplexer.current_image(&session) else {
                    continue;
                };
                yield Ok(create_mjpeg_part(&image));
                guard.record_frame_sent();
            }
        }
    }
}
