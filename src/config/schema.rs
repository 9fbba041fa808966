use serde::{Deserialize, Serialize};

use crate::video::discovery::DiscoveredDevice;
use crate::video::format::PixelFormat;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Camera capture settings shared by every slot
    pub capture: CaptureSettings,
    /// External RTSP pipeline settings
    pub pipeline: PipelineSettings,
    /// Where the device list comes from
    pub discovery: DiscoveryConfig,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address for both HTTP surfaces
    pub bind_address: String,
    /// MJPEG streaming port
    pub stream_port: u16,
    /// Pipeline control port
    pub pipeline_port: u16,
    /// Grace period for in-flight requests on shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            stream_port: 8000,
            pipeline_port: 8100,
            shutdown_grace_ms: 3000,
        }
    }
}

/// Reconnect policy for a capture session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Pause after tearing the device down, before the first attempt
    pub cooldown_ms: u64,
    /// Pause between failed attempts
    pub retry_delay_ms: u64,
    /// Attempts before the session is left disconnected
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            cooldown_ms: 2000,
            retry_delay_ms: 2000,
            max_attempts: 5,
        }
    }
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureSettings {
    /// Requested width
    pub width: u32,
    /// Requested height
    pub height: u32,
    /// Requested frame rate
    pub fps: u32,
    /// Preferred pixel format (e.g., "MJPEG", "YUYV")
    pub format: PixelFormat,
    /// Bounded wait for a frame before the loop ticks again
    pub wait_timeout_ms: u64,
    /// Number of mmap buffers
    pub buffer_count: u32,
    /// JPEG quality (1-100) for raw formats
    pub jpeg_quality: u8,
    /// Number of camera slots
    pub max_slots: usize,
    /// Pause between consecutive device initializations
    pub init_stagger_ms: u64,
    /// Consecutive read failures tolerated before reconnecting
    pub read_failure_threshold: u32,
    /// Consecutive wait failures tolerated before reconnecting
    pub wait_failure_threshold: u32,
    pub reconnect: ReconnectPolicy,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            format: PixelFormat::Mjpeg,
            wait_timeout_ms: 1000,
            buffer_count: 4,
            jpeg_quality: 85,
            max_slots: 8,
            init_stagger_ms: 1000,
            read_failure_threshold: 10,
            wait_failure_threshold: 5,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// External transcoding pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    /// Serve the pipeline control surface at all
    pub enabled: bool,
    /// Start a pipeline for every discovered device at boot
    pub autostart: bool,
    /// Launcher program and leading arguments; the pipeline description is appended
    pub command: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Encoder bitrate in bits per second
    pub bitrate: u32,
    pub rtsp_host: String,
    pub rtsp_port: u16,
    /// Directory for per-index stdout/stderr logs
    pub log_dir: String,
    /// Time to wait after SIGTERM before SIGKILL
    pub stop_grace_ms: u64,
    /// Pause after spawning so early failures surface in logs
    pub startup_settle_ms: u64,
    /// Restart pipelines that exit on their own
    pub auto_restart: bool,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            autostart: true,
            command: vec!["test-launch".to_string()],
            width: 1280,
            height: 720,
            fps: 30,
            bitrate: 2_000_000,
            rtsp_host: "127.0.0.1".to_string(),
            rtsp_port: 8554,
            log_dir: "./logs".to_string(),
            stop_grace_ms: 2000,
            startup_settle_ms: 400,
            auto_restart: false,
            max_restarts: 3,
            restart_delay_ms: 2000,
        }
    }
}

/// Device discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// JSON file holding a list of devices
    pub devices_file: Option<String>,
    /// Inline device list
    pub devices: Vec<DiscoveredDevice>,
    /// Scan /dev/video* when no list is configured
    pub scan: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            devices_file: None,
            devices: Vec::new(),
            scan: true,
        }
    }
}
