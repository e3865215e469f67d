//! Live object detection on a webcam stream, served over HTTP.
pub mod artifacts;
pub mod emotion;
pub mod endpoints;
pub mod meter;
pub mod nn;
pub mod overlay;
pub mod processor;
pub mod sensors;
pub mod state;
pub mod stream;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};

use endpoints::Annotators;
use sensors::SharedCamera;
use state::AppState;

/// Build the HTTP router with all endpoints.
pub fn router(
    state: Arc<AppState>,
    camera: Arc<SharedCamera>,
    annotators: Arc<Annotators>,
) -> Router {
    Router::new()
        .route("/", get(endpoints::index))
        .route("/healthcheck", get(endpoints::healthcheck))
        .route("/video", get(endpoints::video_stream))
        .route("/emotion_video", get(endpoints::emotion_stream))
        .route("/stop", get(endpoints::stop))
        .route("/fps", get(endpoints::fps))
        .route("/detections", get(endpoints::detections))
        .route(
            "/settings",
            get(endpoints::get_settings).post(endpoints::update_settings),
        )
        .route("/analyze_frame", post(endpoints::analyze_frame))
        .layer(Extension(state))
        .layer(Extension(camera))
        .layer(Extension(annotators))
}
