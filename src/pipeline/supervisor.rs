//! External pipeline process supervisor
//!
//! One child process per device index. Each live child has a watcher task
//! that owns the `Child`, its log files and the exit notification. `stop`
//! only holds a cancellation token, an exit receiver and the pid.
//!
//! ```text
//! Stopped ──start──> Running ──exit observed──> Stopped
//!                       │                          │ auto_restart
//!                       │                          v
//!                       │                   restart pending ──delay──> Running
//!                       │                          │
//!                       └──stop: SIGTERM, grace,   └──stop──> Stopped
//!                          SIGKILL──> Stopped
//! ```

use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{endpoint_for, pipeline_description, PipelineStatus};
use crate::config::PipelineSettings;
use crate::error::{AppError, Result};
use crate::video::DiscoveredDevice;

/// How long to wait for the exit after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

struct Context {
    settings: PipelineSettings,
    shutting_down: AtomicBool,
}

impl Context {
    fn should_restart(&self, restarts: u32) -> bool {
        self.settings.auto_restart
            && restarts < self.settings.max_restarts
            && !self.shutting_down.load(Ordering::SeqCst)
    }
}

struct LiveProcess {
    pid: Option<u32>,
    cancel: CancellationToken,
    exited: oneshot::Receiver<()>,
    generation: u64,
}

struct PipelineProcess {
    index: usize,
    device: DiscoveredDevice,
    endpoint: String,
    live: Option<LiveProcess>,
    started_at: Option<DateTime<Utc>>,
    restarts: u32,
    generation: u64,
    /// Set while the watcher waits out `restart_delay_ms`
    pending_restart: Option<CancellationToken>,
}

impl PipelineProcess {
    /// Drop a scheduled restart; returns true if one was pending
    fn cancel_pending_restart(&mut self) -> bool {
        match self.pending_restart.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn status(&self) -> PipelineStatus {
        PipelineStatus {
            id: self.index,
            device: self.device.device_path.clone(),
            product: self.device.label().to_string(),
            rtsp: self.endpoint.clone(),
            running: self.live.is_some(),
            restart_pending: self.pending_restart.is_some(),
            pid: self.live.as_ref().and_then(|l| l.pid),
            started: self.started_at,
            restarts: self.restarts,
        }
    }
}

/// Append-mode stdout/stderr logs for one index
struct LogFiles {
    stdout: File,
    stderr: File,
}

impl LogFiles {
    fn open(dir: &Path, index: usize) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let open = |name: String| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))
        };
        Ok(Self {
            stdout: open(format!("cam{}_stdout.log", index))?,
            stderr: open(format!("cam{}_stderr.log", index))?,
        })
    }

    /// Supervisor note in the stderr log
    fn mark(&mut self, message: &str) {
        let _ = writeln!(
            self.stderr,
            "[multicam {}] {}",
            Utc::now().to_rfc3339(),
            message
        );
    }
}

/// Everything a watcher task owns
struct Watch {
    index: usize,
    entry: Arc<Mutex<PipelineProcess>>,
    child: Child,
    cancel: CancellationToken,
    exited_tx: oneshot::Sender<()>,
    logs: LogFiles,
    generation: u64,
    ctx: Arc<Context>,
}

pub struct PipelineSupervisor {
    ctx: Arc<Context>,
    entries: RwLock<BTreeMap<usize, Arc<Mutex<PipelineProcess>>>>,
}

impl PipelineSupervisor {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            ctx: Arc::new(Context {
                settings,
                shutting_down: AtomicBool::new(false),
            }),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.ctx.settings
    }

    /// Register devices by list position. Known indices that are stopped
    /// pick up the new device info; running ones are left alone.
    pub async fn register_devices(&self, devices: &[DiscoveredDevice]) {
        // Entry locks may be held through a stop grace period; never wait on
        // them while holding the table lock
        let known: Vec<_> = {
            let entries = self.entries.read().await;
            devices
                .iter()
                .enumerate()
                .filter_map(|(index, device)| {
                    entries.get(&index).map(|entry| (entry.clone(), device))
                })
                .collect()
        };
        for (entry, device) in known {
            let mut process = entry.lock().await;
            if process.live.is_none() && process.device != *device {
                debug!("Pipeline {} now targets {}", process.index, device.device_path);
                process.device = device.clone();
            }
        }

        let mut entries = self.entries.write().await;
        for (index, device) in devices.iter().enumerate() {
            entries.entry(index).or_insert_with(|| {
                Arc::new(Mutex::new(PipelineProcess {
                    index,
                    device: device.clone(),
                    endpoint: endpoint_for(index, &self.ctx.settings),
                    live: None,
                    started_at: None,
                    restarts: 0,
                    generation: 0,
                    pending_restart: None,
                }))
            });
        }
    }

    async fn entry(&self, index: usize) -> Result<Arc<Mutex<PipelineProcess>>> {
        self.entries
            .read()
            .await
            .get(&index)
            .cloned()
            .ok_or(AppError::SlotNotFound(index))
    }

    async fn indices(&self) -> Vec<usize> {
        self.entries.read().await.keys().copied().collect()
    }

    /// Launch the pipeline for `index`; returns its endpoint
    pub async fn start(&self, index: usize) -> Result<String> {
        let entry = self.entry(index).await?;
        let endpoint = {
            let mut process = entry.lock().await;
            if process.live.is_some() {
                return Err(AppError::AlreadyRunning(index));
            }
            process.cancel_pending_restart();
            launch(&mut process, &entry, &self.ctx)?;
            process.restarts = 0;
            process.endpoint.clone()
        };

        let settle = Duration::from_millis(self.ctx.settings.startup_settle_ms);
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        Ok(endpoint)
    }

    /// Stop the pipeline: SIGTERM, wait out the grace period, then SIGKILL.
    /// The live reference is cleared on every path. A restart scheduled
    /// after a crash is cancelled as well.
    pub async fn stop(&self, index: usize) -> Result<()> {
        let entry = self.entry(index).await?;
        let mut process = entry.lock().await;
        let restart_cancelled = process.cancel_pending_restart();
        let Some(mut live) = process.live.take() else {
            if restart_cancelled {
                info!("Pipeline {}: pending restart cancelled", index);
                return Ok(());
            }
            return Err(AppError::NotRunning(index));
        };

        info!("Stopping pipeline {} (pid {:?})", index, live.pid);
        live.cancel.cancel();

        let grace = Duration::from_millis(self.ctx.settings.stop_grace_ms);
        if tokio::time::timeout(grace, &mut live.exited).await.is_err() {
            warn!(
                "Pipeline {} did not exit within {:?}, killing",
                index, grace
            );
            send_signal(live.pid, Signal::SIGKILL);
            if tokio::time::timeout(KILL_WAIT, &mut live.exited).await.is_err() {
                error!("Pipeline {} (pid {:?}) not reaped after SIGKILL", index, live.pid);
            }
        }
        Ok(())
    }

    pub async fn status(&self, index: usize) -> Result<PipelineStatus> {
        let entry = self.entry(index).await?;
        let process = entry.lock().await;
        Ok(process.status())
    }

    pub async fn endpoint(&self, index: usize) -> Result<String> {
        let entry = self.entry(index).await?;
        let process = entry.lock().await;
        Ok(process.endpoint.clone())
    }

    pub async fn list(&self) -> Vec<PipelineStatus> {
        let entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        let mut list = Vec::with_capacity(entries.len());
        for entry in entries {
            list.push(entry.lock().await.status());
        }
        list
    }

    /// Start every registered index; failures are logged. Returns how many started.
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for index in self.indices().await {
            match self.start(index).await {
                Ok(endpoint) => {
                    info!("Pipeline {} serving {}", index, endpoint);
                    started += 1;
                }
                Err(e) => error!("Failed to start pipeline {}: {}", index, e),
            }
        }
        started
    }

    /// Stop every running pipeline in parallel and disable auto-restart
    pub async fn stop_all(&self) {
        self.ctx.shutting_down.store(true, Ordering::SeqCst);
        let indices = self.indices().await;
        let stops = indices.into_iter().map(|index| async move {
            match self.stop(index).await {
                Ok(()) | Err(AppError::NotRunning(_)) => {}
                Err(e) => warn!("Failed to stop pipeline {}: {}", index, e),
            }
        });
        futures::future::join_all(stops).await;
    }
}

/// Spawn the child for `process` and its watcher. Caller holds the entry lock.
fn launch(
    process: &mut PipelineProcess,
    entry: &Arc<Mutex<PipelineProcess>>,
    ctx: &Arc<Context>,
) -> Result<()> {
    let index = process.index;
    let spawn_failed = |reason: String| AppError::ProcessSpawnFailed { index, reason };

    let Some((program, leading_args)) = ctx.settings.command.split_first() else {
        return Err(AppError::Config("pipeline command is empty".to_string()));
    };

    let mut logs = LogFiles::open(Path::new(&ctx.settings.log_dir), index)
        .map_err(|e| spawn_failed(format!("log files: {}", e)))?;
    let stdout = logs
        .stdout
        .try_clone()
        .map_err(|e| spawn_failed(e.to_string()))?;
    let stderr = logs
        .stderr
        .try_clone()
        .map_err(|e| spawn_failed(e.to_string()))?;

    let description = pipeline_description(&process.device.device_path, &ctx.settings);
    let child = Command::new(program)
        .args(leading_args)
        .arg(&description)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_failed(format!("{}: {}", program, e)))?;

    let pid = child.id();
    process.generation += 1;
    let generation = process.generation;
    let cancel = CancellationToken::new();
    let (exited_tx, exited_rx) = oneshot::channel();

    logs.mark(&format!("started pid {:?}: {}", pid, description));
    process.live = Some(LiveProcess {
        pid,
        cancel: cancel.clone(),
        exited: exited_rx,
        generation,
    });
    process.started_at = Some(Utc::now());

    info!(
        "Pipeline {} started for {} (pid {:?}) -> {}",
        index, process.device.device_path, pid, process.endpoint
    );

    spawn_watcher(Watch {
        index,
        entry: entry.clone(),
        child,
        cancel,
        exited_tx,
        logs,
        generation,
        ctx: ctx.clone(),
    });
    Ok(())
}

fn spawn_watcher(watch: Watch) {
    tokio::spawn(async move {
        let Watch {
            index,
            entry,
            mut child,
            cancel,
            exited_tx,
            mut logs,
            generation,
            ctx,
        } = watch;

        let natural = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let (status, cancelled) = match natural {
            Some(status) => (status, false),
            None => {
                send_signal(child.id(), Signal::SIGTERM);
                (child.wait().await, true)
            }
        };

        match &status {
            Ok(s) => logs.mark(&format!("exited: {}", s)),
            Err(e) => logs.mark(&format!("wait failed: {}", e)),
        }
        drop(logs);
        let _ = exited_tx.send(());

        let mut process = entry.lock().await;
        if process
            .live
            .as_ref()
            .is_some_and(|live| live.generation == generation)
        {
            process.live = None;
        }

        match &status {
            Ok(s) if s.success() => info!("Pipeline {} exited cleanly", index),
            Ok(s) if cancelled => info!("Pipeline {} stopped ({})", index, s),
            Ok(s) => warn!("Pipeline {} exited unexpectedly: {}", index, s),
            Err(e) => error!("Pipeline {} wait failed: {}", index, e),
        }

        if cancelled
            || process.live.is_some()
            || process.generation != generation
            || !ctx.should_restart(process.restarts)
        {
            return;
        }
        let pending = CancellationToken::new();
        process.pending_restart = Some(pending.clone());
        drop(process);

        let delay = Duration::from_millis(ctx.settings.restart_delay_ms);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = pending.cancelled() => return,
        }

        let mut process = entry.lock().await;
        if pending.is_cancelled() || process.live.is_some() || process.generation != generation {
            return;
        }
        process.pending_restart = None;
        if !ctx.should_restart(process.restarts) {
            return;
        }
        process.restarts += 1;
        warn!(
            "Restarting pipeline {} ({}/{})",
            index, process.restarts, ctx.settings.max_restarts
        );
        if let Err(e) = launch(&mut process, &entry, &ctx) {
            error!("Failed to restart pipeline {}: {}", index, e);
        }
    });
}

fn send_signal(pid: Option<u32>, sig: Signal) {
    let Some(pid) = pid else {
        return;
    };
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
        debug!("Failed to send {} to {}: {}", sig, pid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn settings(dir: &Path, script: &str) -> PipelineSettings {
        PipelineSettings {
            command: vec!["sh".into(), "-c".into(), script.into()],
            log_dir: dir.to_string_lossy().to_string(),
            startup_settle_ms: 0,
            stop_grace_ms: 2000,
            ..Default::default()
        }
    }

    async fn supervisor(settings: PipelineSettings, count: usize) -> PipelineSupervisor {
        let supervisor = PipelineSupervisor::new(settings);
        let devices: Vec<_> = (0..count)
            .map(|i| DiscoveredDevice::new(format!("/dev/video{}", i), format!("Cam {}", i)))
            .collect();
        supervisor.register_devices(&devices).await;
        supervisor
    }

    async fn wait_stopped(supervisor: &PipelineSupervisor, index: usize) -> PipelineStatus {
        for _ in 0..300 {
            let status = supervisor.status(index).await.unwrap();
            if !status.running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pipeline {} still running", index);
    }

    #[tokio::test]
    async fn test_unknown_index() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(settings(dir.path(), "exec sleep 30"), 1).await;

        assert!(matches!(supervisor.start(4).await, Err(AppError::SlotNotFound(4))));
        assert!(matches!(supervisor.stop(4).await, Err(AppError::SlotNotFound(4))));
        assert!(matches!(supervisor.endpoint(4).await, Err(AppError::SlotNotFound(4))));
        assert_eq!(
            supervisor.endpoint(0).await.unwrap(),
            "rtsp://127.0.0.1:8554/cam0"
        );
    }

    #[tokio::test]
    async fn test_start_and_graceful_stop() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(settings(dir.path(), "exec sleep 30"), 2).await;

        let endpoint = supervisor.start(1).await.unwrap();
        assert_eq!(endpoint, "rtsp://127.0.0.1:8554/cam1");

        let status = supervisor.status(1).await.unwrap();
        assert!(status.running);
        assert!(status.started.is_some());
        let pid = status.pid.unwrap();

        assert!(matches!(supervisor.start(1).await, Err(AppError::AlreadyRunning(1))));
        assert_eq!(supervisor.status(1).await.unwrap().pid, Some(pid));
        assert!(!supervisor.status(0).await.unwrap().running);

        let begin = Instant::now();
        supervisor.stop(1).await.unwrap();
        assert!(begin.elapsed() < Duration::from_millis(1500));
        assert!(!supervisor.status(1).await.unwrap().running);
        assert!(matches!(supervisor.stop(1).await, Err(AppError::NotRunning(1))));

        assert!(dir.path().join("cam1_stdout.log").exists());
        let stderr = std::fs::read_to_string(dir.path().join("cam1_stderr.log")).unwrap();
        assert!(stderr.contains("started pid"));
    }

    #[tokio::test]
    async fn test_stop_force_kills_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), "trap '' TERM; exec sleep 30");
        settings.stop_grace_ms = 200;
        let supervisor = supervisor(settings, 1).await;

        supervisor.start(0).await.unwrap();
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pid = supervisor.status(0).await.unwrap().pid.unwrap();

        let begin = Instant::now();
        supervisor.stop(0).await.unwrap();
        assert!(begin.elapsed() >= Duration::from_millis(200));
        assert!(!supervisor.status(0).await.unwrap().running);

        // Reaped, so the pid no longer exists
        assert!(signal::kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[tokio::test]
    async fn test_natural_exit_clears_live_and_closes_logs() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(settings(dir.path(), "echo hello; exit 3"), 1).await;

        supervisor.start(0).await.unwrap();
        let status = wait_stopped(&supervisor, 0).await;
        assert!(status.pid.is_none());
        assert_eq!(status.restarts, 0);

        let stdout = std::fs::read_to_string(dir.path().join("cam0_stdout.log")).unwrap();
        assert!(stdout.contains("hello"));
        let stderr = std::fs::read_to_string(dir.path().join("cam0_stderr.log")).unwrap();
        assert!(stderr.contains("exited"));

        // Can be started again, logs append
        supervisor.start(0).await.unwrap();
        wait_stopped(&supervisor, 0).await;
        let stdout = std::fs::read_to_string(dir.path().join("cam0_stdout.log")).unwrap();
        assert_eq!(stdout.matches("hello").count(), 2);
    }

    #[tokio::test]
    async fn test_auto_restart_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), "exit 1");
        settings.auto_restart = true;
        settings.max_restarts = 2;
        settings.restart_delay_ms = 20;
        let supervisor = supervisor(settings, 1).await;

        supervisor.start(0).await.unwrap();
        for _ in 0..300 {
            let status = supervisor.status(0).await.unwrap();
            if status.restarts == 2 && !status.running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = supervisor.status(0).await.unwrap();
        assert_eq!(status.restarts, 2);
        assert!(!status.running);
    }

    #[tokio::test]
    async fn test_stop_does_not_trigger_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), "exec sleep 30");
        settings.auto_restart = true;
        settings.restart_delay_ms = 10;
        let supervisor = supervisor(settings, 1).await;

        supervisor.start(0).await.unwrap();
        supervisor.stop(0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = supervisor.status(0).await.unwrap();
        assert!(!status.running);
        assert_eq!(status.restarts, 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), "exit 1");
        settings.auto_restart = true;
        settings.max_restarts = 3;
        settings.restart_delay_ms = 200;
        let supervisor = supervisor(settings, 1).await;

        supervisor.start(0).await.unwrap();
        let status = wait_stopped(&supervisor, 0).await;
        assert!(status.restart_pending);

        supervisor.stop(0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let status = supervisor.status(0).await.unwrap();
        assert!(!status.running);
        assert!(!status.restart_pending);
        assert_eq!(status.restarts, 0);
        assert!(matches!(supervisor.stop(0).await, Err(AppError::NotRunning(0))));

        let stderr = std::fs::read_to_string(dir.path().join("cam0_stderr.log")).unwrap();
        assert_eq!(stderr.matches("started pid").count(), 1);
    }

    #[tokio::test]
    async fn test_register_does_not_block_other_indices() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), "trap '' TERM; exec sleep 30");
        settings.stop_grace_ms = 500;
        let supervisor = supervisor(settings, 2).await;
        supervisor.start(0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let devices = vec![
            DiscoveredDevice::new("/dev/video0", "Cam 0"),
            DiscoveredDevice::new("/dev/video1", "Cam 1"),
            DiscoveredDevice::new("/dev/video2", "Cam 2"),
        ];
        let (stopped, _, lookup) = tokio::join!(
            supervisor.stop(0),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                supervisor.register_devices(&devices).await;
            },
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let begin = Instant::now();
                supervisor.status(1).await.unwrap();
                begin.elapsed()
            }
        );

        stopped.unwrap();
        assert!(lookup < Duration::from_millis(200));
        assert_eq!(supervisor.list().await.len(), 3);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), "");
        settings.command = vec!["/nonexistent/test-launch".into()];
        let supervisor = supervisor(settings, 1).await;

        let err = supervisor.start(0).await.unwrap_err();
        assert!(matches!(err, AppError::ProcessSpawnFailed { index: 0, .. }));
        assert!(!supervisor.status(0).await.unwrap().running);
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_once() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(settings(dir.path(), "exec sleep 30"), 1).await;

        let (a, b) = tokio::join!(supervisor.start(0), supervisor.start(0));
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);

        supervisor.stop_all().await;
        assert!(!supervisor.status(0).await.unwrap().running);
    }

    #[tokio::test]
    async fn test_start_all_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(settings(dir.path(), "exec sleep 30"), 3).await;

        assert_eq!(supervisor.start_all().await, 3);
        let list = supervisor.list().await;
        assert_eq!(list.len(), 3);
        assert!(list.iter().all(|p| p.running));
        assert_eq!(list[2].device, "/dev/video2");
        assert_eq!(list[2].product, "Cam 2");

        supervisor.stop_all().await;
        assert!(supervisor.list().await.iter().all(|p| !p.running));
    }
}
