use anyhow::{Context, Result};
use camera_hub::bus::Bus;
use camera_hub::config::load_config;
use camera_hub::evidence_runner::EvidenceRunner;
use camera_hub::motion::{FfmpegFrameSource, FrameDiffKernel, MotionWorker};
use camera_hub::object_store::ObjectStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const PIXEL_THRESHOLD: u8 = 25;

/// Per-camera motion-detector child process. Takes `-addr <restream-url>`,
/// grounded on the original supervisor's spawn contract (SPEC_FULL §4.G):
/// one child per paired camera, the camera's UUID derived from the last path
/// segment of its own `-addr` argument.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let addr = std::env::args()
        .collect::<Vec<_>>()
        .windows(2)
        .find(|w| w[0] == "-addr")
        .map(|w| w[1].clone())
        .context("motion-detector: missing required -addr argument")?;

    let config = load_config(None)?;
    let uuid = MotionWorker::<FfmpegFrameSource, FrameDiffKernel>::uuid_from_addr(&addr);
    info!(uuid, addr, "motion detector starting");

    let object_store = Arc::new(ObjectStore::new(&config.object_store).await?);
    let bus = Arc::new(Bus::new(&config.bus, "camera-hub.dlx").await?);
    let evidence_runner = Arc::new(EvidenceRunner::new(
        config.recordings_dir.clone(),
        object_store,
        bus,
        config.object_store.staging_key.clone(),
    ));

    let source = FfmpegFrameSource::spawn(&addr)?;
    let kernel = FrameDiffKernel::new(PIXEL_THRESHOLD);
    let mut worker = MotionWorker::new(uuid, source, kernel);

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.cancel();
    });

    worker
        .run(shutdown, |job| {
            let runner = evidence_runner.clone();
            tokio::spawn(async move { runner.post_job(job).await });
        })
        .await;

    info!("motion detector stopped");
    Ok(())
}
