use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{AppError, Result};
use crate::pipeline::PipelineSupervisor;
use crate::server::StreamingServer;
use crate::stream::FrameMultiplexer;
use crate::video::{DeviceDiscovery, DiscoveredDevice, SessionStatus};

/// Application-wide state shared across handlers
///
/// Both HTTP surfaces hang off one instance:
/// - `server` / `multiplexer` - camera slots and MJPEG viewers
/// - `pipelines` - external RTSP processes
pub struct AppState {
    /// Camera slot table
    pub server: Arc<StreamingServer>,
    /// MJPEG fan-out with placeholder cache
    pub multiplexer: Arc<FrameMultiplexer>,
    /// External pipeline processes
    pub pipelines: Arc<PipelineSupervisor>,
    /// Device discovery provider
    pub discovery: Arc<dyn DeviceDiscovery>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(
        server: Arc<StreamingServer>,
        multiplexer: Arc<FrameMultiplexer>,
        pipelines: Arc<PipelineSupervisor>,
        discovery: Arc<dyn DeviceDiscovery>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            multiplexer,
            pipelines,
            discovery,
            shutdown_tx,
        })
    }

    /// Subscribe to the shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Run the discovery provider off the async runtime
    pub async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        let discovery = self.discovery.clone();
        let devices = tokio::task::spawn_blocking(move || discovery.discover())
            .await
            .map_err(|e| AppError::Internal(format!("discovery task failed: {}", e)))??;
        info!(
            "Discovery ({}) found {} device(s)",
            self.discovery.name(),
            devices.len()
        );
        Ok(devices)
    }

    /// Re-run discovery, fill empty camera slots and register new pipeline indices
    pub async fn rediscover(&self) -> Result<Vec<SessionStatus>> {
        let devices = self.discover().await?;
        if self.pipelines.settings().enabled {
            self.pipelines.register_devices(&devices).await;
        }
        Ok(self.server.rediscover(devices).await)
    }
}
