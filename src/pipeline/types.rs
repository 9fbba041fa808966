use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::PipelineSettings;

/// Status of one pipeline index
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub id: usize,
    pub device: String,
    pub product: String,
    pub rtsp: String,
    pub running: bool,
    /// Exited unexpectedly and waiting to be restarted
    pub restart_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// RFC 3339 start time of the current (or last) process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    pub restarts: u32,
}

/// `GET /` on the pipeline control surface
#[derive(Debug, Serialize)]
pub struct PipelineList {
    pub message: &'static str,
    pub cameras: Vec<PipelineStatus>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub status: &'static str,
    pub id: usize,
    pub rtsp: String,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub status: &'static str,
    pub id: usize,
}

#[derive(Debug, Serialize)]
pub struct EndpointResponse {
    pub rtsp: String,
}

/// Stable RTSP endpoint for an index
pub fn endpoint_for(index: usize, settings: &PipelineSettings) -> String {
    format!(
        "rtsp://{}:{}/cam{}",
        settings.rtsp_host, settings.rtsp_port, index
    )
}

/// Hardware transcode pipeline for one device: V4L2 source, NVMM
/// conversion to NV12, H.264 encode, RTP payload for the RTSP server.
pub fn pipeline_description(device_path: &str, settings: &PipelineSettings) -> String {
    format!(
        "( v4l2src device={} ! video/x-raw,width={},height={},framerate={}/1 \
         ! nvvidconv ! 'video/x-raw(memory:NVMM),format=NV12' \
         ! nvv4l2h264enc bitrate={} ! h264parse ! rtph264pay name=pay0 pt=96 )",
        device_path, settings.width, settings.height, settings.fps, settings.bitrate
    )
}
