use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::aggregation::AggregationStatus;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub storage: ComponentHealth,
    pub queue: QueueHealth,
    pub aggregation: AggregationStatus,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub queued: usize,
    pub in_flight: usize,
}

/// GET /health: liveness plus storage reachability and queue depth.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let storage_check = match tokio::fs::metadata(state.storage.results_dir()).await {
        Ok(meta) if meta.is_dir() => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        _ => ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
        },
    };

    let healthy = storage_check.status == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            storage: storage_check,
            queue: QueueHealth {
                queued: state.scheduler.size(),
                in_flight: state.scheduler.checked_out(),
            },
            aggregation: state.aggregation_status().status,
        },
    };

    (status_code, Json(response))
}
