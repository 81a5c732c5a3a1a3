use anyhow::Result;
use camera_hub::bus::Bus;
use camera_hub::config::load_config;
use camera_hub::frame_analyzer::FrameAnalyzer;
use camera_hub::object_store::ObjectStore;
use camera_hub::registry::{migrations, Registry};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;

/// The frame-analyzer process: one per deployment, consumes `motion.analyze`
/// and runs every evidence batch through person-detection inference.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = load_config(None)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.registry.max_connections)
        .connect(&config.registry.dsn)
        .await?;
    if config.registry.auto_migrate {
        migrations::run(&pool).await?;
    }
    let registry = Arc::new(Registry::new(Arc::new(pool)));

    let object_store = Arc::new(ObjectStore::new(&config.object_store).await?);
    let bus = Arc::new(Bus::new(&config.bus, "camera-hub.dlx").await?);

    let analyzer = Arc::new(FrameAnalyzer::new(
        object_store,
        registry,
        bus,
        &config.object_store,
        &config.inference,
    ));

    info!("frame analyzer starting");
    analyzer.run().await
}
