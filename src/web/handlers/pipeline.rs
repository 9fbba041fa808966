use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::error::Result;
use crate::pipeline::types::{EndpointResponse, PipelineList, StartResponse, StopResponse};
use crate::state::AppState;

/// List pipelines
/// GET /
pub async fn list_pipelines(State(state): State<Arc<AppState>>) -> Json<PipelineList> {
    Json(PipelineList {
        message: "RTSP Manager",
        cameras: state.pipelines.list().await,
    })
}

/// Start the pipeline for one index
/// POST /start/:index
pub async fn start_pipeline(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Json<StartResponse>> {
    let rtsp = state.pipelines.start(index).await?;
    Ok(Json(StartResponse {
        status: "started",
        id: index,
        rtsp,
    }))
}

/// Stop the pipeline for one index
/// POST /stop/:index
pub async fn stop_pipeline(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Json<StopResponse>> {
    state.pipelines.stop(index).await?;
    Ok(Json(StopResponse {
        status: "stopped",
        id: index,
    }))
}

/// Stable endpoint for an index, running or not
/// GET /rtsp/:index
pub async fn pipeline_endpoint(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Json<EndpointResponse>> {
    let rtsp = state.pipelines.endpoint(index).await?;
    Ok(Json(EndpointResponse { rtsp }))
}
