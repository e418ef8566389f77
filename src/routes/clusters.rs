use axum::extract::State;
use axum::Json;
use garde::Validate;
use serde::Serialize;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::models::aggregation::{AggregationProgress, AggregationResult, ClusterParams};
use crate::routes::ApiError;
use crate::services::aggregation::TriggerOutcome;

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<AggregationProgress>,
}

/// POST /cluster: start an aggregation run. A body is optional.
pub async fn trigger_clustering(
    State(state): State<AppState>,
    params: Option<Json<ClusterParams>>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let params = params.map(|Json(p)| p).unwrap_or_default();
    params.validate()?;

    let response = match state.trigger_aggregation(params) {
        TriggerOutcome::Started => TriggerResponse {
            status: "started",
            progress: None,
        },
        TriggerOutcome::AlreadyRunning(progress) => TriggerResponse {
            status: "already_running",
            progress: Some(progress),
        },
    };
    Ok(Json(response))
}

/// GET /cluster/status
pub async fn clustering_status(State(state): State<AppState>) -> Json<AggregationProgress> {
    Json(state.aggregation_status())
}

#[derive(Debug, Serialize)]
pub struct ClustersResponse {
    #[serde(flatten)]
    pub result: AggregationResult,
    /// False until the first run has completed.
    pub cached: bool,
}

/// GET /clusters: the last stored result, or an empty one.
pub async fn get_clusters(State(state): State<AppState>) -> Json<ClustersResponse> {
    let response = match state.aggregation_result() {
        Some(result) => ClustersResponse { result, cached: true },
        None => ClustersResponse {
            result: AggregationResult::default(),
            cached: false,
        },
    };
    Json(response)
}

/// POST /reset: wipe all jobs, indices and stored files.
pub async fn reset_all(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.reset().await?;
    Ok(Json(json!({ "status": "reset" })))
}
