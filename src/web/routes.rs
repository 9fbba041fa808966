use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::state::AppState;

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Camera streaming surface
pub fn create_stream_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::server_info))
        .route("/health", get(handlers::health_check))
        .route("/discover", get(handlers::discover))
        .route("/camera/:index", get(handlers::camera_stream))
        .route("/snapshot/:index", get(handlers::camera_snapshot))
        .route("/status/:index", get(handlers::camera_status))
        .route("/reconnect/:index", post(handlers::camera_reconnect))
        // Nested forms of the per-camera endpoints
        .route("/camera/:index/status", get(handlers::camera_status))
        .route("/camera/:index/reconnect", post(handlers::camera_reconnect))
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .with_state(state)
}

/// Pipeline control surface
pub fn create_pipeline_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::pipeline::list_pipelines))
        .route("/health", get(handlers::health_check))
        .route("/start/:index", post(handlers::pipeline::start_pipeline))
        .route("/stop/:index", post(handlers::pipeline::stop_pipeline))
        .route("/rtsp/:index", get(handlers::pipeline::pipeline_endpoint))
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureSettings, PipelineSettings};
    use crate::pipeline::PipelineSupervisor;
    use crate::server::StreamingServer;
    use crate::stream::FrameMultiplexer;
    use crate::video::discovery::StaticDiscovery;
    use crate::video::mock::{MockDriver, TEST_JPEG};
    use crate::video::DiscoveredDevice;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Harness {
        state: Arc<AppState>,
        _logs: tempfile::TempDir,
    }

    async fn harness(device_count: usize) -> Harness {
        let logs = tempfile::tempdir().unwrap();
        let capture = CaptureSettings {
            width: 64,
            height: 48,
            fps: 50,
            wait_timeout_ms: 20,
            init_stagger_ms: 0,
            max_slots: 4,
            ..Default::default()
        };
        let pipeline = PipelineSettings {
            command: vec!["sh".into(), "-c".into(), "exec sleep 30".into()],
            log_dir: logs.path().to_string_lossy().to_string(),
            startup_settle_ms: 0,
            ..Default::default()
        };
        let devices: Vec<_> = (0..device_count)
            .map(|i| DiscoveredDevice::new(format!("/dev/video{}", i * 2), format!("Cam {}", i)))
            .collect();

        let server = Arc::new(StreamingServer::new(
            capture.clone(),
            Arc::new(MockDriver::streaming()),
        ));
        server.start(devices.clone()).await;
        let pipelines = Arc::new(PipelineSupervisor::new(pipeline));
        pipelines.register_devices(&devices).await;

        let (shutdown_tx, _) = broadcast::channel(1);
        let state = AppState::new(
            server,
            Arc::new(FrameMultiplexer::new(capture.jpeg_quality)),
            pipelines,
            Arc::new(StaticDiscovery::new(devices)),
            shutdown_tx,
        );
        Harness { state, _logs: logs }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_server() {
        let harness = harness(0).await;
        let base = serve(create_stream_router(harness.state.clone())).await;
        let client = reqwest::Client::new();

        let info: serde_json::Value = client
            .get(format!("{}/", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["status"], "running");
        assert_eq!(info["cameras"].as_array().unwrap().len(), 0);

        for path in ["/camera/0", "/status/0", "/snapshot/0"] {
            let resp = client.get(format!("{}{}", base, path)).send().await.unwrap();
            assert_eq!(resp.status(), 404, "{}", path);
        }
        let resp = client.post(format!("{}/reconnect/0", base)).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let health: serde_json::Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_and_stream() {
        let harness = harness(1).await;
        let base = serve(create_stream_router(harness.state.clone())).await;
        let client = reqwest::Client::new();

        let status: serde_json::Value = client
            .get(format!("{}/status/0", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["connected"], true);
        assert_eq!(status["resolution"]["width"], 64);
        assert_eq!(status["fps"], 50);

        let mut resp = client.get(format!("{}/camera/0", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()[reqwest::header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );
        assert_eq!(resp.headers()["x-accel-buffering"], "no");
        assert_eq!(resp.headers()["x-camera-status"], "connected");

        let mut body = Vec::new();
        while !body.windows(TEST_JPEG.len()).any(|w| w == TEST_JPEG) {
            let chunk = tokio::time::timeout(Duration::from_secs(2), resp.chunk())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            body.extend_from_slice(&chunk);
        }
        assert!(body.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));

        let session = harness.state.server.session(0).unwrap();
        assert_eq!(session.viewers(), 1);
        drop(resp);
        for _ in 0..200 {
            if session.viewers() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.viewers(), 0);

        harness.state.server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_snapshot_reconnect_and_discover() {
        let harness = harness(2).await;
        let base = serve(create_stream_router(harness.state.clone())).await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("{}/snapshot/1", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[reqwest::header::CONTENT_TYPE], "image/jpeg");
        let image = resp.bytes().await.unwrap();
        assert!(image.starts_with(&[0xFF, 0xD8]));

        let resp = client.post(format!("{}/reconnect/1", base)).send().await.unwrap();
        assert_eq!(resp.status(), 202);
        let ack: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(ack["camera_id"], 1);

        let discovered: serde_json::Value = client
            .get(format!("{}/discover", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(discovered["cameras"].as_array().unwrap().len(), 2);

        harness.state.server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pipeline_control() {
        let harness = harness(2).await;
        let base = serve(create_pipeline_router(harness.state.clone())).await;
        let client = reqwest::Client::new();

        let list: serde_json::Value = client
            .get(format!("{}/", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["message"], "RTSP Manager");
        assert_eq!(list["cameras"].as_array().unwrap().len(), 2);
        assert_eq!(list["cameras"][0]["running"], false);

        let resp = client.post(format!("{}/start/1", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let started: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(started["status"], "started");
        assert_eq!(started["rtsp"], "rtsp://127.0.0.1:8554/cam1");

        let resp = client.post(format!("{}/start/1", base)).send().await.unwrap();
        assert_eq!(resp.status(), 409);

        let list: serde_json::Value = client
            .get(format!("{}/", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["cameras"][1]["running"], true);
        assert!(list["cameras"][1]["started"].is_string());

        let endpoint: serde_json::Value = client
            .get(format!("{}/rtsp/0", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(endpoint["rtsp"], "rtsp://127.0.0.1:8554/cam0");

        let resp = client.post(format!("{}/stop/1", base)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let resp = client.post(format!("{}/stop/1", base)).send().await.unwrap();
        assert_eq!(resp.status(), 409);
        let resp = client.post(format!("{}/start/7", base)).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        harness.state.server.shutdown().await;
    }
}
