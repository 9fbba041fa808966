//! Video capture: device access, pixel conversion and capture sessions

pub mod codec;
pub mod device;
pub mod discovery;
pub mod format;
pub mod frame;
pub mod session;

#[cfg(test)]
pub(crate) mod mock;

pub use codec::PixelCodec;
pub use device::{CaptureDevice, DeviceDriver, DeviceHandle, V4lDriver};
pub use discovery::{DeviceDiscovery, DiscoveredDevice};
pub use format::{PixelFormat, Resolution};
pub use frame::Frame;
pub use session::{CaptureSession, DeviceConfig, SessionStatus};
