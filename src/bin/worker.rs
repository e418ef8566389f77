//! Headless drain: process every persisted or recovered job, run one
//! aggregation pass and exit.

use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use sticker_sort::app_state::{AppState, Collaborators};
use sticker_sort::config::AppConfig;
use sticker_sort::models::aggregation::{AggregationStatus, ClusterParams};
use sticker_sort::services::worker::Worker;

const POLL_INTERVAL_MS: u64 = 500;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting headless sticker worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let collaborators = Collaborators::from_config(&config);
    let state = AppState::bootstrap(config, collaborators)
        .await
        .expect("Failed to initialize application state");

    let backlog = state.queue_status().queue_size;
    tracing::info!(backlog, "Worker ready, draining queue");
    let worker = Worker::new(state.clone()).start();

    while !state.is_idle() {
        sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }

    // The worker triggers a run itself when it drains a non-empty queue,
    // possibly only after the idle check above.
    settle(&state).await;
    if state.aggregation_status().status == AggregationStatus::Idle {
        state.trigger_aggregation(ClusterParams::default());
    }
    settle(&state).await;

    let counts = state.counts();
    let progress = state.aggregation_status();
    tracing::info!(
        completed = counts.completed,
        failed = counts.failed,
        aggregation = %progress.status,
        artifacts = progress.total,
        "Drain finished"
    );

    worker.shutdown().await;
}

/// Wait until no aggregation run is active. A run can be flagged before its
/// supervisor handle is stored, so `wait` alone may return early.
async fn settle(state: &AppState) {
    loop {
        state.aggregation.wait().await;
        if !state.aggregation.is_running() {
            break;
        }
        sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}
