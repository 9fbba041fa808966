//! Per-camera capture session
//!
//! A session owns one device slot end to end:
//!
//! ```text
//! initialize ──> start_capture ──> capture loop ──(failures / fault)──> reconnect
//!      ^                                                                   │
//!      └──────────────────── up to max_attempts ───────────────────────────┘
//! ```
//!
//! The device handle lives behind a per-session mutex that is only taken by
//! `initialize`, the capture loop, `reconnect` and `close`. Viewers never
//! touch it; they read the latest frame through an `ArcSwapOption`.

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::codec::PixelCodec;
use super::device::{is_device_lost, DeviceDriver, DeviceHandle};
use super::discovery::DiscoveredDevice;
use super::format::{PixelFormat, Resolution};
use super::frame::Frame;
use crate::config::CaptureSettings;
use crate::error::{AppError, Result};
use crate::error_throttled;
use crate::utils::{catch_fault, LogThrottler};

/// Granularity of interruptible sleeps during reconnect
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Device configuration for one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_path: String,
    pub display_name: String,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    /// Requested resolution
    pub resolution: Resolution,
    /// Requested frame rate
    pub fps: u32,
    /// Requested pixel format
    pub format: PixelFormat,
    /// Format the device accepted, once negotiated
    pub negotiated_format: Option<PixelFormat>,
    /// Resolution the device settled on, once negotiated
    pub negotiated_resolution: Option<Resolution>,
}

impl DeviceConfig {
    pub fn from_discovered(device: &DiscoveredDevice, settings: &CaptureSettings) -> Self {
        Self {
            device_path: device.device_path.clone(),
            display_name: device.label().to_string(),
            vendor_id: device.vendor_id.clone(),
            product_id: device.product_id.clone(),
            resolution: Resolution::new(settings.width, settings.height),
            fps: settings.fps,
            format: settings.format,
            negotiated_format: None,
            negotiated_resolution: None,
        }
    }

    /// Format frames are actually delivered in
    pub fn active_format(&self) -> PixelFormat {
        self.negotiated_format.unwrap_or(self.format)
    }

    pub fn active_resolution(&self) -> Resolution {
        self.negotiated_resolution.unwrap_or(self.resolution)
    }
}

/// Snapshot of a session for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub camera_id: usize,
    pub device_path: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    pub connected: bool,
    pub running: bool,
    pub reconnecting: bool,
    pub error_count: u32,
    pub reconnect_attempts: u32,
    pub reconnects: u64,
    pub frames_captured: u64,
    pub viewers: usize,
    pub resolution: Resolution,
    pub fps: u32,
    pub format: PixelFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiated_format: Option<PixelFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_frame_age_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Why the capture loop returned
#[derive(Debug, PartialEq, Eq)]
enum LoopExit {
    /// `running` was cleared or the handle was taken away
    Stopped,
    /// Failure threshold crossed or the device vanished
    Reconnect(String),
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Wait,
    Read,
}

/// Clears the reconnect flag on every exit path
struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One camera slot
pub struct CaptureSession {
    index: usize,
    config: RwLock<DeviceConfig>,
    settings: CaptureSettings,
    driver: Arc<dyn DeviceDriver>,
    /// Exclusive region for the device handle
    device: Mutex<Option<DeviceHandle>>,
    running: AtomicBool,
    connected: AtomicBool,
    loop_active: AtomicBool,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    wait_failures: AtomicU32,
    read_failures: AtomicU32,
    reconnect_attempts: AtomicU32,
    reconnects: AtomicU64,
    frames_captured: AtomicU64,
    last_frame: ArcSwapOption<Frame>,
    viewers: AtomicUsize,
    last_error: RwLock<Option<String>>,
    throttler: LogThrottler,
}

impl CaptureSession {
    pub fn new(
        index: usize,
        config: DeviceConfig,
        settings: CaptureSettings,
        driver: Arc<dyn DeviceDriver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            config: RwLock::new(config),
            settings,
            driver,
            device: Mutex::new(None),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            loop_active: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            wait_failures: AtomicU32::new(0),
            read_failures: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
            reconnects: AtomicU64::new(0),
            frames_captured: AtomicU64::new(0),
            last_frame: ArcSwapOption::empty(),
            viewers: AtomicUsize::new(0),
            last_error: RwLock::new(None),
            throttler: LogThrottler::with_secs(5),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> DeviceConfig {
        self.config.read().clone()
    }

    pub fn device_path(&self) -> String {
        self.config.read().device_path.clone()
    }

    pub fn fps(&self) -> u32 {
        self.config.read().fps
    }

    pub fn resolution(&self) -> Resolution {
        self.config.read().active_resolution()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Consecutive wait failures plus consecutive read failures
    pub fn error_count(&self) -> u32 {
        self.wait_failures.load(Ordering::SeqCst) + self.read_failures.load(Ordering::SeqCst)
    }

    /// Number of reconnect sequences performed so far
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Latest published frame. Never blocks on the capture loop.
    pub fn get_frame(&self) -> Option<Arc<Frame>> {
        self.last_frame.load_full()
    }

    pub fn viewer_connected(&self) -> usize {
        self.viewers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn viewer_disconnected(&self) -> usize {
        self.viewers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub fn viewers(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        let config = self.config.read().clone();
        SessionStatus {
            camera_id: self.index,
            device_path: config.device_path.clone(),
            name: config.display_name.clone(),
            vendor_id: config.vendor_id.clone(),
            product_id: config.product_id.clone(),
            connected: self.is_connected(),
            running: self.is_running(),
            reconnecting: self.is_reconnecting(),
            error_count: self.error_count(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            reconnects: self.reconnects(),
            frames_captured: self.frames_captured(),
            viewers: self.viewers(),
            resolution: config.active_resolution(),
            fps: config.fps,
            format: config.format,
            negotiated_format: config.negotiated_format,
            last_frame_age_ms: self
                .get_frame()
                .map(|f| f.captured_at.elapsed().as_millis() as u64),
            last_error: self.last_error(),
        }
    }

    fn set_last_error(&self, message: impl Into<String>) {
        *self.last_error.write() = Some(message.into());
    }

    /// Acquire the device, negotiate its format and start streaming.
    ///
    /// On failure nothing is left behind: the handle (if any) is released
    /// and session state is unchanged.
    pub fn initialize(&self) -> Result<()> {
        let mut slot = self.device.lock();
        if slot.is_some() || self.loop_active.load(Ordering::SeqCst) {
            return Err(AppError::DeviceBusy(self.device_path()));
        }

        let config = self.config.read().clone();
        let path = config.device_path.clone();

        let device = self.driver.open(&path).map_err(|e| AppError::OpenFailed {
            device: path.clone(),
            reason: e.to_string(),
        })?;
        let mut handle = DeviceHandle::new(path.clone(), device);

        let (format, resolution) = Self::negotiate(&mut handle, &config)?;
        if format != config.format {
            info!(
                "Camera {} ({}): {} rejected, using {}",
                self.index, path, config.format, format
            );
        }

        if let Err(e) = handle.set_rate(config.fps) {
            warn!(
                "Camera {} ({}): failed to set {} fps: {}",
                self.index, path, config.fps, e
            );
        }

        handle.start().map_err(|e| AppError::StreamStartFailed {
            device: path.clone(),
            reason: e.to_string(),
        })?;

        {
            let mut config = self.config.write();
            config.negotiated_format = Some(format);
            config.negotiated_resolution = Some(resolution);
        }
        *slot = Some(handle);

        self.wait_failures.store(0, Ordering::SeqCst);
        self.read_failures.store(0, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        *self.last_error.write() = None;
        self.throttler.clear_all();

        info!(
            "Camera {} initialized: {} {} @ {}fps",
            self.index, path, format, config.fps
        );
        Ok(())
    }

    /// Preferred format first, then the fallback
    fn negotiate(handle: &mut DeviceHandle, config: &DeviceConfig) -> Result<(PixelFormat, Resolution)> {
        let preferred = config.format;
        let preferred_err = match handle.negotiate_format(preferred, config.resolution) {
            Ok(resolution) => return Ok((preferred, resolution)),
            Err(e) => e,
        };

        let fallback = preferred.fallback();
        match handle.negotiate_format(fallback, config.resolution) {
            Ok(resolution) => Ok((fallback, resolution)),
            Err(fallback_err) => Err(AppError::OpenFailed {
                device: config.device_path.clone(),
                reason: format!(
                    "{}: {}; {}: {}",
                    preferred, preferred_err, fallback, fallback_err
                ),
            }),
        }
    }

    /// Spawn the background capture loop.
    ///
    /// Returns false if the session is not running or a loop already exists.
    pub fn start_capture(self: &Arc<Self>) -> bool {
        if !self.is_running() {
            return false;
        }
        if self.loop_active.swap(true, Ordering::SeqCst) {
            debug!("Camera {}: capture loop already active", self.index);
            return false;
        }

        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || session.run_supervised());
        true
    }

    /// Run the capture loop, turning a fault or failure exit into a reconnect
    fn run_supervised(self: Arc<Self>) {
        debug!("Camera {}: capture loop started", self.index);
        let outcome = catch_fault(|| self.capture_loop());
        self.loop_active.store(false, Ordering::SeqCst);

        match outcome {
            Ok(LoopExit::Stopped) => {
                debug!("Camera {}: capture loop stopped", self.index);
            }
            Ok(LoopExit::Reconnect(reason)) => {
                warn!("Camera {}: {}, reconnecting", self.index, reason);
                self.set_last_error(reason);
                self.reconnect();
            }
            Err(panic) => {
                error!("Camera {}: capture loop fault: {}", self.index, panic);
                self.set_last_error(format!("capture fault: {}", panic));
                self.reconnect();
            }
        }
    }

    fn capture_loop(&self) -> LoopExit {
        let (format, resolution, fps) = {
            let config = self.config.read();
            (config.active_format(), config.active_resolution(), config.fps)
        };
        let mut codec = match PixelCodec::new(self.settings.jpeg_quality) {
            Ok(codec) => codec,
            Err(e) => return LoopExit::Reconnect(e.to_string()),
        };
        let wait_timeout = Duration::from_millis(self.settings.wait_timeout_ms.max(1));
        let frame_interval = Duration::from_secs(1) / fps.max(1);
        let mut sequence = 0u64;

        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();

            let raw = {
                let mut guard = self.device.lock();
                let Some(handle) = guard.as_mut() else {
                    return LoopExit::Stopped;
                };

                match handle.wait_frame(wait_timeout) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        drop(guard);
                        if let Some(exit) = self.on_failure(Failure::Wait, &e) {
                            return exit;
                        }
                        continue;
                    }
                }

                match handle.read_frame() {
                    Ok(data) if !data.is_empty() => data,
                    Ok(_) => {
                        drop(guard);
                        let e = io::Error::new(io::ErrorKind::UnexpectedEof, "empty frame");
                        if let Some(exit) = self.on_failure(Failure::Read, &e) {
                            return exit;
                        }
                        continue;
                    }
                    Err(e) => {
                        drop(guard);
                        if let Some(exit) = self.on_failure(Failure::Read, &e) {
                            return exit;
                        }
                        continue;
                    }
                }
            };

            match codec.encode(raw, format, resolution) {
                Ok(jpeg) => {
                    sequence += 1;
                    if !self.publish(jpeg, sequence) {
                        return LoopExit::Stopped;
                    }
                }
                Err(e) => {
                    let e = io::Error::new(io::ErrorKind::InvalidData, e.to_string());
                    if let Some(exit) = self.on_failure(Failure::Read, &e) {
                        return exit;
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed < frame_interval {
                std::thread::sleep(frame_interval - elapsed);
            }
        }

        LoopExit::Stopped
    }

    /// Publish an encoded frame and mark the session connected.
    ///
    /// Runs under the device lock so it cannot interleave with `teardown`.
    /// Returns false once the handle is gone or the session stopped running.
    fn publish(&self, jpeg: Bytes, sequence: u64) -> bool {
        let slot = self.device.lock();
        if slot.is_none() || !self.running.load(Ordering::SeqCst) {
            return false;
        }

        self.last_frame.store(Some(Arc::new(Frame::new(jpeg, sequence))));
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        self.wait_failures.store(0, Ordering::SeqCst);
        self.read_failures.store(0, Ordering::SeqCst);
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("Camera {}: frames flowing again", self.index);
        }
        true
    }

    /// Count a failure; returns an exit once the threshold is crossed
    fn on_failure(&self, kind: Failure, err: &io::Error) -> Option<LoopExit> {
        if is_device_lost(err) {
            return Some(LoopExit::Reconnect(format!("device lost: {}", err)));
        }

        let (counter, threshold, key) = match kind {
            Failure::Wait => (&self.wait_failures, self.settings.wait_failure_threshold, "wait"),
            Failure::Read => (&self.read_failures, self.settings.read_failure_threshold, "read"),
        };
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let reason = match kind {
            Failure::Wait => format!("wait failure: {}", err),
            Failure::Read => AppError::TransientRead(err.to_string()).to_string(),
        };
        error_throttled!(
            self.throttler,
            key,
            "Camera {} ({}/{}): {}",
            self.index,
            count,
            threshold,
            reason
        );
        self.set_last_error(reason);

        (count > threshold).then(|| {
            LoopExit::Reconnect(format!("{} consecutive {} failures", count, key))
        })
    }

    /// Tear down and re-acquire the device.
    ///
    /// Idempotent: if a reconnect is already running, returns false at once.
    /// Blocks for the whole sequence, so call it off the async runtime.
    pub fn reconnect(self: &Arc<Self>) -> bool {
        if self.is_closed() {
            debug!("Camera {}: closed, ignoring reconnect", self.index);
            return false;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Camera {}: reconnect already in progress", self.index);
            return false;
        }
        let _guard = ReconnectGuard(&self.reconnecting);
        self.reconnects.fetch_add(1, Ordering::SeqCst);

        let path = self.device_path();
        info!("Camera {} ({}): reconnecting", self.index, path);

        self.teardown();
        if !self.wait_for_loop_exit(self.loop_exit_timeout()) {
            warn!("Camera {}: capture loop did not exit in time", self.index);
        }

        let policy = &self.settings.reconnect;
        if !self.sleep_unless_closed(Duration::from_millis(policy.cooldown_ms)) {
            return false;
        }

        for attempt in 1..=policy.max_attempts {
            if self.is_closed() {
                return false;
            }
            self.reconnect_attempts.store(attempt, Ordering::SeqCst);

            match self.initialize() {
                Ok(()) => {
                    info!(
                        "Camera {} ({}): reconnected on attempt {}",
                        self.index, path, attempt
                    );
                    self.start_capture();
                    return true;
                }
                Err(e) => {
                    warn!(
                        "Camera {}: reconnect attempt {}/{} failed: {}",
                        self.index, attempt, policy.max_attempts, e
                    );
                    self.set_last_error(e.to_string());
                    if attempt < policy.max_attempts
                        && !self.sleep_unless_closed(Duration::from_millis(policy.retry_delay_ms))
                    {
                        return false;
                    }
                }
            }
        }

        let err = AppError::ReconnectExhausted {
            device: path,
            attempts: policy.max_attempts,
        };
        warn!("Camera {}: {}", self.index, err);
        self.connected.store(false, Ordering::SeqCst);
        self.set_last_error(err.to_string());
        true
    }

    /// Permanently stop the session and release the device
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown();
        info!("Camera {} closed", self.index);
    }

    /// Block until the capture loop has exited, up to `timeout`
    pub fn wait_for_loop_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.loop_active.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    fn loop_exit_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.wait_timeout_ms) * 2 + Duration::from_secs(1)
    }

    /// Stop the session and release the handle.
    ///
    /// The flags are cleared under the device lock; the handle is dropped
    /// outside it.
    fn teardown(&self) {
        let handle = {
            let mut slot = self.device.lock();
            self.running.store(false, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
            slot.take()
        };
        drop(handle);
    }

    /// Sleep in slices; returns false if the session was closed meanwhile
    fn sleep_unless_closed(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_closed() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
