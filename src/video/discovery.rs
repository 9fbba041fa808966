//! Camera discovery providers
//!
//! A provider yields an ordered list of devices. The list position is the
//! slot index a device is offered first.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use v4l::capability::Flags;
use v4l::video::Capture;
use v4l::Device;

use crate::config::DiscoveryConfig;
use crate::error::{AppError, Result};

/// One discovered capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub device_path: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
}

impl DiscoveredDevice {
    pub fn new(device_path: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            display_name: display_name.into(),
            vendor_id: None,
            product_id: None,
        }
    }

    /// Name to show, falling back to the device path
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.device_path
        } else {
            &self.display_name
        }
    }
}

/// Source of the device list. Implementations may block.
pub trait DeviceDiscovery: Send + Sync {
    fn name(&self) -> &'static str;

    fn discover(&self) -> Result<Vec<DiscoveredDevice>>;
}

/// Fixed list, from config or tests
pub struct StaticDiscovery {
    devices: Vec<DiscoveredDevice>,
}

impl StaticDiscovery {
    pub fn new(devices: Vec<DiscoveredDevice>) -> Self {
        Self { devices }
    }
}

impl DeviceDiscovery for StaticDiscovery {
    fn name(&self) -> &'static str {
        "static"
    }

    fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        Ok(self.devices.clone())
    }
}

/// JSON file written by an external enumerator, re-read on every run
pub struct JsonFileDiscovery {
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DeviceFile {
    List(Vec<DiscoveredDevice>),
    Wrapped { devices: Vec<DiscoveredDevice> },
}

impl JsonFileDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(raw: &str) -> Result<Vec<DiscoveredDevice>> {
        let devices = match serde_json::from_str::<DeviceFile>(raw)? {
            DeviceFile::List(devices) => devices,
            DeviceFile::Wrapped { devices } => devices,
        };
        Ok(devices
            .into_iter()
            .filter(|d| !d.device_path.trim().is_empty())
            .collect())
    }
}

impl DeviceDiscovery for JsonFileDiscovery {
    fn name(&self) -> &'static str {
        "json-file"
    }

    fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        Self::parse(&raw)
    }
}

/// Scan `/dev/video*` for capture nodes, reading USB ids from sysfs
pub struct V4lScanDiscovery {
    dev_dir: PathBuf,
    sysfs_dir: PathBuf,
}

impl Default for V4lScanDiscovery {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            sysfs_dir: PathBuf::from("/sys/class/video4linux"),
        }
    }
}

impl V4lScanDiscovery {
    fn probe(&self, path: &Path, node: &str) -> Option<DiscoveredDevice> {
        let device = match Device::with_path(path) {
            Ok(device) => device,
            Err(e) => {
                debug!("Failed to open {:?}: {}", path, e);
                return None;
            }
        };
        let caps = device.query_caps().ok()?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("Skipping non-capture device: {:?}", path);
            return None;
        }
        // Metadata nodes of UVC cameras report capture caps but no formats
        if device.enum_formats().map(|f| f.is_empty()).unwrap_or(true) {
            debug!("Skipping {:?}: no capture formats", path);
            return None;
        }

        let (vendor_id, product_id) = read_usb_ids(&self.sysfs_dir, node);
        Some(DiscoveredDevice {
            device_path: path.to_string_lossy().to_string(),
            display_name: caps.card.trim().to_string(),
            vendor_id,
            product_id,
        })
    }
}

impl DeviceDiscovery for V4lScanDiscovery {
    fn name(&self) -> &'static str {
        "v4l2-scan"
    }

    fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        let mut nodes: Vec<(u32, String)> = std::fs::read_dir(&self.dev_dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let number = name.strip_prefix("video")?.parse::<u32>().ok()?;
                Some((number, name))
            })
            .collect();
        nodes.sort();

        let devices: Vec<_> = nodes
            .into_iter()
            .filter_map(|(_, node)| self.probe(&self.dev_dir.join(&node), &node))
            .collect();

        info!("Found {} video capture devices", devices.len());
        Ok(devices)
    }
}

/// Read idVendor/idProduct of the USB device behind a video4linux node
pub fn read_usb_ids(sysfs_dir: &Path, node: &str) -> (Option<String>, Option<String>) {
    let usb_dir = sysfs_dir.join(node).join("device").join("..");
    let read = |name: &str| {
        std::fs::read_to_string(usb_dir.join(name))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    (read("idVendor"), read("idProduct"))
}

/// Pick the provider described by the configuration
pub fn from_config(config: &DiscoveryConfig) -> Box<dyn DeviceDiscovery> {
    if let Some(ref path) = config.devices_file {
        Box::new(JsonFileDiscovery::new(path))
    } else if !config.devices.is_empty() || !config.scan {
        Box::new(StaticDiscovery::new(config.devices.clone()))
    } else {
        Box::new(V4lScanDiscovery::default())
    }
}
