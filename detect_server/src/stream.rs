//! Multipart JPEG streaming of annotated camera frames.
//!
//! Every stream request starts a session on a blocking thread. A session moves through
//! `Idle -> Running -> Stopped`: it opens the shared camera, then reads, annotates and encodes
//! frames until the camera fails, processing fails, the consumer goes away or the session is
//! cancelled. Frames are handed over through a channel holding a single chunk, so the loop
//! runs only as fast as the HTTP consumer drains the stream.
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use image::RgbImage;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    processor::{process_frame, Annotate},
    sensors::SharedCamera,
    state::AppState,
};

/// Content type of the multipart responses.
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const JPEG_QUALITY: i32 = 85;

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    CameraUnavailable,
    ReadFailed,
    ProcessingFailed,
    Cancelled,
    ConsumerGone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Stopped(StopReason),
}

/// Frames of one session together with the worker producing them.
pub struct FrameStream {
    pub frames: BoxStream<'static, Bytes>,
    pub worker: JoinHandle<StopReason>,
}

/// Start a streaming session.
///
/// The returned frames end as soon as the session is cancelled through `AppState::stop`, or
/// when the worker stops.
pub fn spawn_stream(
    camera: Arc<SharedCamera>,
    annotator: Arc<dyn Annotate>,
    state: Arc<AppState>,
) -> FrameStream {
    let token = state.begin_session();
    let (tx, rx) = mpsc::channel(1);

    let worker = {
        let token = token.clone();
        tokio::task::spawn_blocking(move || {
            let session = Session {
                camera: &camera,
                annotator: annotator.as_ref(),
                state: &state,
                token: &token,
                tx: &tx,
                phase: SessionState::Idle,
            };
            session.run()
        })
    };

    let frames = ReceiverStream::new(rx)
        .take_until(async move { token.cancelled().await })
        .boxed();

    FrameStream { frames, worker }
}

struct Session<'a> {
    camera: &'a SharedCamera,
    annotator: &'a dyn Annotate,
    state: &'a AppState,
    token: &'a CancellationToken,
    tx: &'a mpsc::Sender<Bytes>,
    phase: SessionState,
}

impl Session<'_> {
    fn run(mut self) -> StopReason {
        self.start();
        while self.phase == SessionState::Running {
            self.step();
        }

        match self.phase {
            SessionState::Stopped(reason) => {
                log::info!("Streaming session stopped: {:?}", reason);
                reason
            }
            // Only `Stopped` leaves the loop above
            _ => StopReason::Cancelled,
        }
    }

    fn start(&mut self) {
        self.phase = match self.camera.ensure_open() {
            Ok(()) => {
                log::info!("Streaming session started");
                SessionState::Running
            }
            Err(e) => {
                log::error!("Could not open camera: {e:#}");
                SessionState::Stopped(StopReason::CameraUnavailable)
            }
        };
    }

    fn step(&mut self) {
        if self.token.is_cancelled() {
            self.phase = SessionState::Stopped(StopReason::Cancelled);
            return;
        }

        let frame = match self.camera.read() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Failed to read frame: {e:#}");
                self.phase = SessionState::Stopped(StopReason::ReadFailed);
                return;
            }
        };

        let item = process_frame(self.annotator, frame, self.state, self.token)
            .and_then(|frame| encode_stream_item(&frame));
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                log::error!("Error in video stream: {e:#}");
                self.phase = SessionState::Stopped(StopReason::ProcessingFailed);
                return;
            }
        };

        if self.tx.blocking_send(item).is_err() {
            self.phase = SessionState::Stopped(StopReason::ConsumerGone);
            return;
        }
        self.state.meter().record_streamed();
    }
}

/// Encode a frame as JPEG.
pub fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>> {
    let buf = turbojpeg::compress_image(frame, JPEG_QUALITY, turbojpeg::Subsamp::Sub2x2)
        .context("failed to compress frame")?;
    Ok(buf.to_vec())
}

fn encode_stream_item(frame: &RgbImage) -> Result<Bytes> {
    Ok(as_jpeg_stream_item(&encode_jpeg(frame)?))
}

/// Wrap JPEG data as one part of the multipart stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n".as_bytes(),
        ]
        .concat(),
    )
}
