//! Camera slot table
//!
//! `StreamingServer` owns a fixed number of slots. Each slot either holds a
//! live `CaptureSession` or is empty because its device failed to come up.
//! One broken device never keeps the others from serving.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::CaptureSettings;
use crate::error::{AppError, Result};
use crate::video::{CaptureSession, DeviceConfig, DeviceDriver, DiscoveredDevice, SessionStatus};

/// Upper bound for waiting on each capture loop during shutdown
const LOOP_EXIT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct StreamingServer {
    settings: CaptureSettings,
    driver: Arc<dyn DeviceDriver>,
    slots: RwLock<Vec<Option<Arc<CaptureSession>>>>,
    /// Serializes startup and rediscovery
    populate_lock: tokio::sync::Mutex<()>,
    shut_down: AtomicBool,
}

impl StreamingServer {
    pub fn new(settings: CaptureSettings, driver: Arc<dyn DeviceDriver>) -> Self {
        let slots = vec![None; settings.max_slots.max(1)];
        Self {
            settings,
            driver,
            slots: RwLock::new(slots),
            populate_lock: tokio::sync::Mutex::new(()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Bring up every discovered device, staggered. Returns how many started.
    pub async fn start(&self, devices: Vec<DiscoveredDevice>) -> usize {
        info!("Starting {} camera(s)", devices.len());
        let started = self.populate(devices).await;
        info!("{} camera(s) streaming", started);
        started
    }

    /// Fill empty slots with devices not already served.
    ///
    /// Running sessions are left alone, including disconnected ones.
    pub async fn rediscover(&self, devices: Vec<DiscoveredDevice>) -> Vec<SessionStatus> {
        let started = self.populate(devices).await;
        if started > 0 {
            info!("Rediscovery started {} new camera(s)", started);
        }
        self.slot_list()
    }

    async fn populate(&self, devices: Vec<DiscoveredDevice>) -> usize {
        let _lock = self.populate_lock.lock().await;
        let stagger = Duration::from_millis(self.settings.init_stagger_ms);
        let mut started = 0;

        for (position, device) in devices.iter().enumerate() {
            if self.shut_down.load(Ordering::SeqCst) {
                break;
            }
            if self.is_assigned(&device.device_path) {
                debug!("{} already has a slot", device.device_path);
                continue;
            }
            let Some(index) = self.free_slot(position) else {
                warn!(
                    "No free slot for {} ({} slots)",
                    device.device_path,
                    self.slot_count()
                );
                continue;
            };

            if started > 0 && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }

            let config = DeviceConfig::from_discovered(device, &self.settings);
            let session = CaptureSession::new(index, config, self.settings.clone(), self.driver.clone());

            let init = {
                let session = session.clone();
                tokio::task::spawn_blocking(move || session.initialize()).await
            };
            match init {
                Ok(Ok(())) => {
                    session.start_capture();
                    self.slots.write()[index] = Some(session);
                    started += 1;
                }
                Ok(Err(e)) => {
                    warn!(
                        "Camera {} ({}) failed to initialize: {}",
                        index,
                        device.label(),
                        e
                    );
                }
                Err(e) => {
                    error!("Camera {} initialization task failed: {}", index, e);
                }
            }
        }

        started
    }

    fn is_assigned(&self, device_path: &str) -> bool {
        self.slots
            .read()
            .iter()
            .flatten()
            .any(|s| s.device_path() == device_path)
    }

    /// The slot matching the device's list position if free, else the first free one
    fn free_slot(&self, position: usize) -> Option<usize> {
        let slots = self.slots.read();
        match slots.get(position) {
            Some(None) => Some(position),
            _ => slots.iter().position(Option::is_none),
        }
    }

    pub fn session(&self, index: usize) -> Result<Arc<CaptureSession>> {
        self.slots
            .read()
            .get(index)
            .cloned()
            .flatten()
            .ok_or(AppError::SlotNotFound(index))
    }

    pub fn sessions(&self) -> Vec<Arc<CaptureSession>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    /// Status of every populated slot, in slot order
    pub fn slot_list(&self) -> Vec<SessionStatus> {
        self.sessions().iter().map(|s| s.status()).collect()
    }

    pub fn status(&self, index: usize) -> Result<SessionStatus> {
        Ok(self.session(index)?.status())
    }

    /// Kick off a reconnect in the background and return immediately
    pub fn trigger_reconnect(&self, index: usize) -> Result<()> {
        let session = self.session(index)?;
        info!("Manual reconnect requested for camera {}", index);
        tokio::task::spawn_blocking(move || {
            session.reconnect();
        });
        Ok(())
    }

    /// Close every session and wait for the capture loops to wind down
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions = self.sessions();
        info!("Stopping {} camera(s)", sessions.len());

        let waits: Vec<_> = sessions
            .into_iter()
            .map(|session| {
                tokio::task::spawn_blocking(move || {
                    session.close();
                    if !session.wait_for_loop_exit(LOOP_EXIT_TIMEOUT) {
                        warn!("Camera {} capture loop still running", session.index());
                    }
                })
            })
            .collect();
        futures::future::join_all(waits).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::mock::MockDriver;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            width: 64,
            height: 48,
            fps: 100,
            wait_timeout_ms: 20,
            init_stagger_ms: 0,
            max_slots: 4,
            ..Default::default()
        }
    }

    fn devices(n: usize) -> Vec<DiscoveredDevice> {
        (0..n)
            .map(|i| DiscoveredDevice::new(format!("/dev/video{}", i * 2), format!("Cam {}", i)))
            .collect()
    }

    /// Driver that fails to open one specific path
    struct PickyDriver {
        inner: MockDriver,
        broken: parking_lot::Mutex<Option<String>>,
    }

    impl DeviceDriver for PickyDriver {
        fn open(&self, path: &str) -> std::io::Result<Box<dyn crate::video::CaptureDevice>> {
            if self.broken.lock().as_deref() == Some(path) {
                return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
            }
            self.inner.open(path)
        }
    }

    #[tokio::test]
    async fn test_empty_discovery() {
        let server = StreamingServer::new(settings(), Arc::new(MockDriver::new()));
        assert_eq!(server.start(Vec::new()).await, 0);
        assert!(server.slot_list().is_empty());
        assert!(matches!(server.session(0), Err(AppError::SlotNotFound(0))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_device_leaves_slot_empty() {
        let driver = Arc::new(PickyDriver {
            inner: MockDriver::streaming(),
            broken: parking_lot::Mutex::new(Some("/dev/video2".to_string())),
        });
        let server = StreamingServer::new(settings(), driver.clone());

        assert_eq!(server.start(devices(3)).await, 2);
        assert!(server.session(0).is_ok());
        assert!(matches!(server.session(1), Err(AppError::SlotNotFound(1))));
        assert!(server.session(2).is_ok());

        let list = server.slot_list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].camera_id, 0);
        assert_eq!(list[1].device_path, "/dev/video4");
        assert!(list.iter().all(|s| s.connected));

        // Device comes back; rediscovery fills only the empty slot
        let first = server.session(0).unwrap();
        *driver.broken.lock() = None;
        let list = server.rediscover(devices(3)).await;
        assert_eq!(list.len(), 3);
        assert_eq!(server.session(1).unwrap().device_path(), "/dev/video2");
        assert!(Arc::ptr_eq(&first, &server.session(0).unwrap()));
        assert_eq!(driver.inner.opens(), 3);

        server.shutdown().await;
        assert_eq!(driver.inner.live_handles(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_more_devices_than_slots() {
        let driver = MockDriver::new();
        let server = StreamingServer::new(settings(), Arc::new(driver.clone()));

        assert_eq!(server.start(devices(6)).await, 4);
        assert_eq!(server.slot_list().len(), 4);

        server.shutdown().await;
        assert_eq!(server.rediscover(devices(6)).await.len(), 4);
        assert!(server.slot_list().iter().all(|s| !s.running));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_trigger_reconnect() {
        let driver = MockDriver::new();
        let mut settings = settings();
        settings.reconnect.cooldown_ms = 10;
        let server = StreamingServer::new(settings, Arc::new(driver.clone()));
        server.start(devices(1)).await;

        assert!(matches!(server.trigger_reconnect(3), Err(AppError::SlotNotFound(3))));
        server.trigger_reconnect(0).unwrap();

        let session = server.session(0).unwrap();
        for _ in 0..200 {
            if session.reconnects() == 1 && session.is_connected() && !session.is_reconnecting() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.reconnects(), 1);
        assert!(session.is_connected());
        assert_eq!(driver.opens(), 2);

        server.shutdown().await;
    }
}
