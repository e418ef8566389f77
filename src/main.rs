use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use sticker_sort::app_state::{AppState, Collaborators};
use sticker_sort::config::AppConfig;
use sticker_sort::routes;
use sticker_sort::services::storage::PUBLIC_PREFIX;
use sticker_sort::services::worker::Worker;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing sticker-sort server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe();

    let bind_addr = config.bind_addr.clone();
    let static_dir = config.static_dir.clone();
    let collaborators = Collaborators::from_config(&config);

    // Snapshots are restored and unfinished jobs re-enqueued before the
    // listener accepts anything.
    let state = AppState::bootstrap(config, collaborators)
        .await
        .expect("Failed to initialize application state");

    let worker = Worker::new(state.clone()).start();

    let app = routes::api_router(state)
        .nest_service(PUBLIC_PREFIX, ServeDir::new(static_dir))
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(50 * 1024 * 1024)); // 50 MB limit

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");

    worker.shutdown().await;
}
