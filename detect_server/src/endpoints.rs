//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::{
    body::StreamBody,
    extract::Multipart,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    Extension, Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use common::SettingsPatch;
use futures::StreamExt;
use serde_json::json;

use crate::{
    processor::Annotate,
    sensors::SharedCamera,
    state::AppState,
    stream::{encode_jpeg, spawn_stream, FrameStream, MULTIPART_CONTENT_TYPE},
};

/// Annotators available to the endpoints.
pub struct Annotators {
    pub objects: Arc<dyn Annotate>,
    pub emotions: Option<Arc<dyn Annotate>>,
}

/// Error reported to HTTP callers as a server error with the error text.
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        log::error!("Request failed: {:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": format!("{:#}", self.0) })),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Landing page with the live stream and the settings controls.
pub async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

/// Live object detection stream.
pub async fn video_stream(
    Extension(state): Extension<Arc<AppState>>,
    Extension(camera): Extension<Arc<SharedCamera>>,
    Extension(annotators): Extension<Arc<Annotators>>,
) -> impl IntoResponse {
    log::info!("Video stream requested");
    multipart_response(camera, Arc::clone(&annotators.objects), state)
}

/// Live emotion stream, only available when the emotion models are loaded.
pub async fn emotion_stream(
    Extension(state): Extension<Arc<AppState>>,
    Extension(camera): Extension<Arc<SharedCamera>>,
    Extension(annotators): Extension<Arc<Annotators>>,
) -> Response {
    match annotators.emotions.as_ref() {
        Some(emotions) => {
            log::info!("Emotion stream requested");
            multipart_response(camera, Arc::clone(emotions), state).into_response()
        }
        None => (StatusCode::NOT_FOUND, "emotion stream is disabled").into_response(),
    }
}

fn multipart_response(
    camera: Arc<SharedCamera>,
    annotator: Arc<dyn Annotate>,
    state: Arc<AppState>,
) -> impl IntoResponse {
    let FrameStream { frames, .. } = spawn_stream(camera, annotator, state);

    // Set body and headers for multipart streaming
    let body = StreamBody::new(frames.map(Ok::<_, std::io::Error>));
    let headers = [(header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE)];

    (headers, body)
}

/// Stop all running streams.
pub async fn stop(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    state.stop();
    Json(json!({ "message": "Video stream stopped" }))
}

pub async fn fps(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "fps": state.fps() }))
}

pub async fn detections(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let detections = state.detections();
    Json(json!({ "detections": detections.as_slice() }))
}

pub async fn get_settings(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "config": state.settings() }))
}

pub async fn update_settings(
    Extension(state): Extension<Arc<AppState>>,
    Json(patch): Json<SettingsPatch>,
) -> impl IntoResponse {
    let config = state.update_settings(patch);
    Json(json!({ "message": "Settings updated", "config": config }))
}

/// Annotate a single uploaded image and return it as base64 encoded JPEG.
pub async fn analyze_frame(
    Extension(state): Extension<Arc<AppState>>,
    Extension(annotators): Extension<Arc<Annotators>>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            upload = Some(field.bytes().await?);
            break;
        }
    }
    let upload = upload.ok_or_else(|| anyhow!("missing field `file`"))?;
    log::debug!("Analyzing uploaded frame ({} bytes)", upload.len());

    let settings = state.settings();
    let fps = state.fps();
    let annotator = Arc::clone(&annotators.objects);
    let jpeg = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
        let frame = image::load_from_memory(&upload)
            .context("failed to decode image")?
            .to_rgb8();
        let annotated = annotator.annotate(frame, &settings, fps)?;
        encode_jpeg(&annotated.frame)
    })
    .await??;

    Ok(Json(json!({ "frame": BASE64.encode(jpeg) })))
}

const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Live Detection</title></head>
<body>
    <h3>Live Detection</h3>
    <img id="stream" src="./video" width="100%">
    <div>
        <label><input type="checkbox" data-key="show_fps"> FPS</label>
        <label><input type="checkbox" data-key="dark_mode"> Dark mode</label>
        <label><input type="checkbox" data-key="fancy_boxes"> Fancy boxes</label>
        <label><input type="checkbox" data-key="hide_labels"> Hide labels</label>
        <button onclick="fetch('./stop')">Stop</button>
    </div>
    <script>
        document.querySelectorAll("input[data-key]").forEach((input) => {
            input.addEventListener("change", () => fetch("./settings", {
                method: "POST",
                headers: { "Content-Type": "application/json" },
                body: JSON.stringify({ [input.dataset.key]: input.checked }),
            }));
        });
    </script>
</body>
</html>
"#;
