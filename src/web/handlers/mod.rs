use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use super::AppState;
use crate::stream::PipelineStats;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Stream status response
#[derive(Serialize)]
pub struct StreamStatus {
    pub source: String,
    #[serde(flatten)]
    pub stats: PipelineStats,
}

/// Current pipeline statistics
pub async fn stream_status(State(state): State<Arc<AppState>>) -> Json<StreamStatus> {
    Json(StreamStatus {
        source: state.config.stream.source.clone(),
        stats: state.pipeline.stats(),
    })
}
