//! Device I/O contract and the V4L2 implementation
//!
//! A capture session only talks to hardware through [`DeviceDriver`] and
//! [`CaptureDevice`]. An opened device is wrapped in a [`DeviceHandle`],
//! whose `Drop` is the single teardown path (stop stream, close device).

use bytes::Bytes;
use std::io;
use std::time::Duration;
use tracing::{debug, warn};
use v4l::buffer::Type as BufferType;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format};

use super::format::{PixelFormat, Resolution};

/// Opens capture devices by path
pub trait DeviceDriver: Send + Sync {
    fn open(&self, path: &str) -> io::Result<Box<dyn CaptureDevice>>;
}

/// Primitive operations on one opened capture device
pub trait CaptureDevice: Send {
    /// Request a format; fails if the device does not accept it as-is.
    /// Returns the resolution the device settled on.
    fn negotiate_format(&mut self, format: PixelFormat, resolution: Resolution) -> io::Result<Resolution>;

    fn set_rate(&mut self, fps: u32) -> io::Result<()>;

    fn start(&mut self) -> io::Result<()>;

    /// Wait for a frame. `Ok(false)` means the timeout elapsed with nothing ready.
    fn wait_frame(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Read the frame made ready by the last successful `wait_frame`
    fn read_frame(&mut self) -> io::Result<Bytes>;

    fn stop(&mut self) -> io::Result<()>;

    fn close(&mut self);
}

/// Scoped ownership of an opened device
pub struct DeviceHandle {
    path: String,
    device: Box<dyn CaptureDevice>,
    started: bool,
}

impl DeviceHandle {
    pub fn new(path: impl Into<String>, device: Box<dyn CaptureDevice>) -> Self {
        Self {
            path: path.into(),
            device,
            started: false,
        }
    }

    pub fn negotiate_format(&mut self, format: PixelFormat, resolution: Resolution) -> io::Result<Resolution> {
        self.device.negotiate_format(format, resolution)
    }

    pub fn set_rate(&mut self, fps: u32) -> io::Result<()> {
        self.device.set_rate(fps)
    }

    pub fn start(&mut self) -> io::Result<()> {
        self.device.start()?;
        self.started = true;
        Ok(())
    }

    pub fn wait_frame(&mut self, timeout: Duration) -> io::Result<bool> {
        self.device.wait_frame(timeout)
    }

    pub fn read_frame(&mut self) -> io::Result<Bytes> {
        self.device.read_frame()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.started {
            if let Err(e) = self.device.stop() {
                debug!("Failed to stop stream on {}: {}", self.path, e);
            }
        }
        self.device.close();
        debug!("Released device {}", self.path);
    }
}

/// Errors that mean the device node is gone (unplugged, re-enumerated).
/// These skip the failure thresholds and reconnect at once.
pub fn is_device_lost(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(6)      // ENXIO
            | Some(19)  // ENODEV
            | Some(32)  // EPIPE
            | Some(108) // ESHUTDOWN
    )
}

/// V4L2 driver backed by the `v4l` crate (mmap streaming)
pub struct V4lDriver {
    buffer_count: u32,
}

impl V4lDriver {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            buffer_count: buffer_count.max(2),
        }
    }
}

impl DeviceDriver for V4lDriver {
    fn open(&self, path: &str) -> io::Result<Box<dyn CaptureDevice>> {
        debug!("Opening video device: {}", path);
        let device = Device::with_path(path)?;
        Ok(Box::new(V4lCaptureDevice {
            path: path.to_string(),
            device: Some(device),
            stream: None,
            buffer_count: self.buffer_count,
            pending: None,
        }))
    }
}

pub struct V4lCaptureDevice {
    path: String,
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    buffer_count: u32,
    pending: Option<Bytes>,
}

impl V4lCaptureDevice {
    fn device(&self) -> io::Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device closed"))
    }
}

impl CaptureDevice for V4lCaptureDevice {
    fn negotiate_format(&mut self, format: PixelFormat, resolution: Resolution) -> io::Result<Resolution> {
        let requested = Format::new(resolution.width, resolution.height, format.to_fourcc());
        let actual = self.device()?.set_format(&requested)?;

        // V4L2 substitutes a supported format instead of failing
        if actual.fourcc != requested.fourcc {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} rejected {}, offered {}", self.path, format, actual.fourcc),
            ));
        }

        if actual.width != resolution.width || actual.height != resolution.height {
            warn!(
                "{}: requested {}, got {}x{}",
                self.path, resolution, actual.width, actual.height
            );
        }

        Ok(Resolution::new(actual.width, actual.height))
    }

    fn set_rate(&mut self, fps: u32) -> io::Result<()> {
        if fps == 0 {
            return Ok(());
        }
        self.device()?.set_params(&Parameters::with_fps(fps))?;
        Ok(())
    }

    fn start(&mut self) -> io::Result<()> {
        let mut stream =
            MmapStream::with_buffers(self.device()?, BufferType::VideoCapture, self.buffer_count)?;
        stream.start()?;
        self.stream = Some(stream);
        Ok(())
    }

    fn wait_frame(&mut self, timeout: Duration) -> io::Result<bool> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stream not started"))?;
        stream.set_timeout(timeout);

        match stream.next() {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                self.pending = Some(Bytes::copy_from_slice(&buf[..used]));
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read_frame(&mut self) -> io::Result<Bytes> {
        self.pending
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no frame dequeued"))
    }

    fn stop(&mut self) -> io::Result<()> {
        self.pending = None;
        match self.stream.take() {
            Some(mut stream) => stream.stop(),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        self.pending = None;
        self.stream = None;
        self.device = None;
    }
}
