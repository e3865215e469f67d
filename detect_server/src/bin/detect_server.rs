//! Detect server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use detect_server::{
    artifacts::initialize,
    endpoints::Annotators,
    meter::{spawn_meter_logger, REPORT_PERIOD},
    processor::Annotate,
    router,
    sensors::{parse_frame_rate, parse_resolution, SharedCamera, V4lCamera},
    state::AppState,
};
use env_logger::TimestampPrecision;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve HTTP on
    #[clap(long, default_value = "0.0.0.0:8000")]
    server_address: String,

    /// Directory holding the downloaded model files
    #[clap(long, default_value = "models")]
    model_dir: PathBuf,

    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Capture resolution as `<width>x<height>`, the largest supported one if unset
    #[clap(long, value_parser = parse_resolution)]
    resolution: Option<(u32, u32)>,

    /// Capture frames per second, the highest supported rate if unset
    #[clap(long, value_parser = parse_frame_rate)]
    frame_rate: Option<(u32, u32)>,

    /// Also load the face and emotion models and serve `/emotion_video`
    #[clap(long)]
    emotions: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    // Models are required before the first frame, failing here aborts the start
    let models = initialize(&args.model_dir, args.emotions).await?;
    let annotators = Arc::new(Annotators {
        objects: Arc::new(models.objects),
        emotions: models
            .emotions
            .map(|emotions| Arc::new(emotions) as Arc<dyn Annotate>),
    });

    let state = Arc::new(AppState::default());
    let camera = Arc::new(SharedCamera::new(V4lCamera::opener(
        args.device,
        args.resolution,
        args.frame_rate,
    )));

    spawn_meter_logger(state.clone(), REPORT_PERIOD);

    let app = router(state.clone(), camera.clone(), annotators);

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Serving on http://{addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    camera.release();

    Ok(())
}

/// Resolve on Ctrl-C and end the running streams, so that open connections can finish.
async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutting down");
    state.stop();
}
