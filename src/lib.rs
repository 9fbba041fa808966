//! multicam - multi-camera MJPEG streaming server
//!
//! Serves every attached camera as a multipart MJPEG stream over HTTP, with
//! per-device reconnect handling, and supervises one external RTSP transcode
//! process per camera.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod state;
pub mod stream;
pub mod utils;
pub mod video;
pub mod web;

pub use error::{AppError, Result};
