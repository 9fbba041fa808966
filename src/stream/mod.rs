//! Video streaming to HTTP viewers
//!
//! - `FrameMultiplexer` - per-viewer multipart MJPEG streams
//! - `ViewerGuard` - viewer accounting on a capture session

pub mod mjpeg;

pub use mjpeg::{create_mjpeg_part, FrameMultiplexer, ViewerGuard};
