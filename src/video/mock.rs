//! Scripted capture driver for tests

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::device::{CaptureDevice, DeviceDriver};
use super::format::{PixelFormat, Resolution};

/// Minimal JPEG-shaped payload (SOI .. EOI)
pub const TEST_JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];

/// One scripted outcome of `wait_frame`/`read_frame`
#[derive(Debug, Clone)]
pub enum Step {
    /// `wait_frame` returns `Ok(false)`
    Timeout,
    /// `wait_frame` fails
    WaitFail,
    /// `wait_frame` succeeds, `read_frame` fails
    ReadFail,
    /// `wait_frame` fails with ENODEV
    Lost,
    /// A frame is delivered
    Frame(Bytes),
    /// `wait_frame` panics
    Panic,
}

#[derive(Default)]
struct Shared {
    rejected: Mutex<HashSet<PixelFormat>>,
    fail_open: AtomicBool,
    fail_start: AtomicBool,
    script: Mutex<VecDeque<Step>>,
    idle_frames: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    starts: AtomicUsize,
    negotiated: Mutex<Vec<PixelFormat>>,
}

/// Driver whose devices follow a shared script
#[derive(Clone, Default)]
pub struct MockDriver {
    shared: Arc<Shared>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices deliver `TEST_JPEG` whenever the script is empty
    pub fn streaming() -> Self {
        let driver = Self::new();
        driver.shared.idle_frames.store(true, Ordering::SeqCst);
        driver
    }

    pub fn reject_format(&self, format: PixelFormat) {
        self.shared.rejected.lock().insert(format);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.shared.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.shared.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn push(&self, steps: impl IntoIterator<Item = Step>) {
        self.shared.script.lock().extend(steps);
    }

    pub fn remaining_steps(&self) -> usize {
        self.shared.script.lock().len()
    }

    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    pub fn live_handles(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn max_live_handles(&self) -> usize {
        self.shared.max_live.load(Ordering::SeqCst)
    }

    pub fn negotiated(&self) -> Vec<PixelFormat> {
        self.shared.negotiated.lock().clone()
    }
}

impl DeviceDriver for MockDriver {
    fn open(&self, path: &str) -> io::Result<Box<dyn CaptureDevice>> {
        if self.shared.fail_open.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not present", path),
            ));
        }
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MockDevice {
            shared: self.shared.clone(),
            pending: None,
            closed: false,
        }))
    }
}

struct MockDevice {
    shared: Arc<Shared>,
    pending: Option<io::Result<Bytes>>,
    closed: bool,
}

impl CaptureDevice for MockDevice {
    fn negotiate_format(&mut self, format: PixelFormat, resolution: Resolution) -> io::Result<Resolution> {
        if self.shared.rejected.lock().contains(&format) {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "format rejected"));
        }
        self.shared.negotiated.lock().push(format);
        Ok(resolution)
    }

    fn set_rate(&mut self, _fps: u32) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "fixed rate"))
    }

    fn start(&mut self) -> io::Result<()> {
        if self.shared.fail_start.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "STREAMON failed"));
        }
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait_frame(&mut self, timeout: Duration) -> io::Result<bool> {
        let step = self.shared.script.lock().pop_front();
        let step = match step {
            Some(step) => step,
            None if self.shared.idle_frames.load(Ordering::SeqCst) => {
                std::thread::sleep(Duration::from_millis(2));
                Step::Frame(Bytes::from_static(TEST_JPEG))
            }
            None => Step::Timeout,
        };

        match step {
            Step::Timeout => {
                std::thread::sleep(timeout.min(Duration::from_millis(2)));
                Ok(false)
            }
            Step::WaitFail => Err(io::Error::new(io::ErrorKind::Other, "select failed")),
            Step::Lost => Err(io::Error::from_raw_os_error(19)),
            Step::ReadFail => {
                self.pending = Some(Err(io::Error::new(io::ErrorKind::Other, "dqbuf failed")));
                Ok(true)
            }
            Step::Frame(data) => {
                self.pending = Some(Ok(data));
                Ok(true)
            }
            Step::Panic => panic!("mock device fault"),
        }
    }

    fn read_frame(&mut self) -> io::Result<Bytes> {
        self.pending
            .take()
            .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::WouldBlock, "no frame")))
    }

    fn stop(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
