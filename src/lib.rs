pub mod annotate;
pub mod api;
pub mod app_state;
pub mod classes;
pub mod config;
pub mod detection;
pub mod html;
pub mod pipeline;
pub mod session;
pub mod source;
pub mod stream;

use anyhow::Context;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::get;
use std::path::Path;
use tokio::net::TcpListener;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

//
// Re-export
//
pub use api::{log_request_errors, secure_filename};
pub use app_state::AppState;
pub use classes::ClassTable;
pub use config::Config;
pub use detection::{Detection, Detector, SharedDetector, YoloDetector, YoloParams};
pub use pipeline::{FrameAnnotator, OfflineJob, OfflineSummary, StreamSettings, run_offline, spawn_stream};
pub use session::SessionStore;
pub use source::{FrameSource, MediaSource, SourceError};

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(api::home).post(api::home))
        .route("/home", get(api::home).post(api::home))
        .route("/Detections", get(api::upload_page).post(api::upload_media))
        .route("/media", get(api::media))
        .route("/webapp", get(api::webapp))
        .route("/health", get(api::health))
        .fallback(api::not_found)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum::middleware::from_fn(api::log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}

/// Serves the routes on the configured address until the server fails.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        state.config.bind_address, state.config.listen_on_port
    );
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("HTTP server error")
}

/// Loads the model and class names, then serves.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let params = YoloParams {
        input_size: config.input_size,
        iou_threshold: config.iou_threshold,
        max_detections: config.max_detections,
        intra_threads: config.intra_threads,
    };
    let model_path = config.model_path.clone();
    let detector = tokio::task::spawn_blocking(move || {
        YoloDetector::load(Path::new(&model_path), params)
    })
    .await??;

    let classes = ClassTable::load(Path::new(&config.class_path))?;
    info!(
        model = %config.model_path,
        classes = classes.len(),
        "Model loaded"
    );

    let state = AppState::new(config, detection::shared(detector), classes).await?;
    serve(state).await
}
