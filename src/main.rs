use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use clap::{Parser, ValueEnum};
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use multicam::config::ConfigStore;
use multicam::pipeline::PipelineSupervisor;
use multicam::server::StreamingServer;
use multicam::state::AppState;
use multicam::stream::FrameMultiplexer;
use multicam::utils::{bind_tcp_listener, resolve_bind_addr};
use multicam::video::{discovery, V4lDriver};
use multicam::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// multicam command line arguments
#[derive(Parser, Debug)]
#[command(name = "multicam")]
#[command(version, about = "Multi-camera MJPEG streaming server with RTSP pipelines", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// JSON device list (overrides discovery config)
    #[arg(long, value_name = "FILE")]
    devices: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// Stream port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Pipeline control port (overrides config)
    #[arg(long, value_name = "PORT")]
    pipeline_port: Option<u16>,

    /// Disable the RTSP pipeline supervisor
    #[arg(long)]
    no_pipeline: bool,

    /// Do not start pipelines on boot
    #[arg(long)]
    no_autostart: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting multicam v{}", env!("CARGO_PKG_VERSION"));

    let config_store = ConfigStore::load(args.config.as_deref()).await?;
    if let Some(path) = config_store.path() {
        tracing::info!("Configuration loaded from {}", path.display());
    }
    config_store.update(|config| {
        if let Some(ref devices) = args.devices {
            config.discovery.devices_file = Some(devices.to_string_lossy().to_string());
        }
        if let Some(ref address) = args.address {
            config.web.bind_address = address.clone();
        }
        if let Some(port) = args.port {
            config.web.stream_port = port;
        }
        if let Some(port) = args.pipeline_port {
            config.web.pipeline_port = port;
        }
        if args.no_pipeline {
            config.pipeline.enabled = false;
        }
        if args.no_autostart {
            config.pipeline.autostart = false;
        }
    });
    let config = config_store.get();

    // Discovery
    let discovery: Arc<dyn discovery::DeviceDiscovery> =
        Arc::from(discovery::from_config(&config.discovery));
    let devices = {
        let discovery = discovery.clone();
        tokio::task::spawn_blocking(move || discovery.discover()).await??
    };
    tracing::info!(
        "Discovery ({}) found {} device(s)",
        discovery.name(),
        devices.len()
    );
    for (index, device) in devices.iter().enumerate() {
        tracing::info!("  [{}] {} ({})", index, device.label(), device.device_path);
    }

    // Capture sessions
    let driver = Arc::new(V4lDriver::new(config.capture.buffer_count));
    let server = Arc::new(StreamingServer::new(config.capture.clone(), driver));
    server.start(devices.clone()).await;

    // Pipelines
    let pipelines = Arc::new(PipelineSupervisor::new(config.pipeline.clone()));
    if config.pipeline.enabled {
        pipelines.register_devices(&devices).await;
        if config.pipeline.autostart {
            let started = pipelines.start_all().await;
            tracing::info!("{} pipeline(s) started", started);
        }
    } else {
        tracing::info!("RTSP pipelines disabled");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = AppState::new(
        server,
        Arc::new(FrameMultiplexer::new(config.capture.jpeg_quality)),
        pipelines,
        discovery,
        shutdown_tx,
    );

    let mut servers = FuturesUnordered::new();
    servers.push(spawn_server(
        &state,
        web::create_stream_router(state.clone()),
        &config.web.bind_address,
        config.web.stream_port,
        "stream",
    )?);
    if config.pipeline.enabled {
        servers.push(spawn_server(
            &state,
            web::create_pipeline_router(state.clone()),
            &config.web.bind_address,
            config.web.pipeline_port,
            "pipeline control",
        )?);
    }

    tokio::select! {
        _ = shutdown_signal() => {}
        result = servers.next() => {
            match result {
                Some(Ok(Err(e))) => tracing::error!("HTTP server error: {}", e),
                Some(Err(e)) => tracing::error!("HTTP server task failed: {}", e),
                _ => {}
            }
        }
    }

    cleanup(&state).await;

    // Devices are released; now drain the HTTP listeners
    let _ = state.shutdown_tx.send(());
    let grace = Duration::from_millis(config.web.shutdown_grace_ms);
    let drain = async { while servers.next().await.is_some() {} };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!("HTTP connections still open after {:?}, exiting", grace);
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "multicam=error,tower_http=error",
        LogLevel::Warn => "multicam=warn,tower_http=warn",
        LogLevel::Info => "multicam=info,tower_http=info",
        LogLevel::Verbose => "multicam=debug,tower_http=info",
        LogLevel::Debug => "multicam=debug,tower_http=debug",
        LogLevel::Trace => "multicam=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Bind one surface and serve it until the shutdown broadcast
fn spawn_server(
    state: &Arc<AppState>,
    app: Router,
    address: &str,
    port: u16,
    name: &'static str,
) -> anyhow::Result<JoinHandle<std::io::Result<()>>> {
    let addr = resolve_bind_addr(address, port)?;
    let listener = bind_tcp_listener(addr)
        .map_err(|e| anyhow::anyhow!("Failed to bind {} server on {}: {}", name, addr, e))?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    tracing::info!("Starting {} server on {}", name, addr);

    let mut shutdown_rx = state.shutdown_signal();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
    });
    Ok(tokio::spawn(async move { server.await }))
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}

/// Release devices and child processes
async fn cleanup(state: &Arc<AppState>) {
    state.server.shutdown().await;
    tracing::info!("Camera sessions stopped");

    state.pipelines.stop_all().await;
    tracing::info!("Pipelines stopped");
}
