use anyhow::Result;
use camera_hub::api::edge::{AppState, EdgeApi};
use camera_hub::broker_client::BrokerClient;
use camera_hub::cache::Cache;
use camera_hub::config::load_config;
use camera_hub::discovery_loop::DiscoveryLoop;
use camera_hub::event_proxy;
use camera_hub::object_store::ObjectStore;
use camera_hub::pairing::PairingService;
use camera_hub::ptz::PtzService;
use camera_hub::pubsub::PubSub;
use camera_hub::registry::{migrations, Registry};
use camera_hub::{bus::Bus, dto::CameraProxyEvent};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const LIFECYCLE_CHANNEL_CAPACITY: usize = 64;
const DETECTIONS_QUEUE: &str = "motion.detections";

/// The control-plane process: ONVIF discovery, pairing, PTZ control and the
/// HTTP/SSE edge all run together here, fanning lifecycle events out onto
/// the bus for the supervisor to pick up.
///
/// Grounded on the donor's `main.rs` top-level wiring: config load, pool
/// connect + migrate, constructing every service behind an `Arc`, then
/// running the long-lived tasks concurrently until shutdown.
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

    let cache = Arc::new(Cache::new(&config.cache.addr)?);
    let bus = Arc::new(Bus::new(&config.bus, "camera-hub.dlx").await?);
    let broker = Arc::new(BrokerClient::new(config.broker.clone()));
    let pubsub = Arc::new(PubSub::new());
    let object_store = Arc::new(ObjectStore::new(&config.object_store).await?);

    let (lifecycle_tx, lifecycle_rx) = mpsc::channel::<CameraProxyEvent>(LIFECYCLE_CHANNEL_CAPACITY);

    let pairing = Arc::new(PairingService::new(
        registry.clone(),
        cache.clone(),
        pubsub.clone(),
        broker.clone(),
        config.device_admin.clone(),
        lifecycle_tx.clone(),
    ));
    let ptz = Arc::new(PtzService::new(registry.clone(), cache.clone()));

    let (discovery, _discovery_sse_rx) = DiscoveryLoop::new(
        registry.clone(),
        cache.clone(),
        broker.clone(),
        lifecycle_tx,
        config.env_type.clone(),
    );
    let discovery = Arc::new(discovery);

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.cancel();
    });

    let discovery_task = {
        let discovery = discovery.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { discovery.run(shutdown).await })
    };
    let detections_task = tokio::spawn(run_detections_bridge(bus.clone(), pubsub.clone()));
    let proxy_task = tokio::spawn(event_proxy::run(lifecycle_rx, bus, config.bus.clone()));

    let state = AppState {
        registry,
        pairing,
        ptz,
        discovery,
        pubsub,
        object_store,
    };
    let edge = EdgeApi::new(state, config.api.clone());

    info!("hub starting");
    tokio::select! {
        result = edge.run() => result?,
        result = discovery_task => result?,
        result = detections_task => result?,
        result = proxy_task => result?,
    }

    Ok(())
}

/// Bridges `motion.detections` onto the in-process `PubSub` fan-out: every
/// message must carry a `uuid` header (SPEC_FULL §6) naming the topic to
/// broadcast the body to; messages without one are discarded rather than
/// acked, since there is no camera to key the broadcast on.
async fn run_detections_bridge(bus: Arc<Bus>, pubsub: Arc<PubSub>) -> Result<()> {
    bus.declare_queue(DETECTIONS_QUEUE).await?;
    bus.bind(DETECTIONS_QUEUE, "", DETECTIONS_QUEUE).await?;
    let mut consumer = bus.consume(DETECTIONS_QUEUE, "hub-detections-bridge").await?;

    while let Some(delivery) = consumer.next().await {
        let uuid = delivery.header_str("uuid").and_then(|s| s.parse::<uuid::Uuid>().ok());
        match uuid {
            Some(uuid) => {
                let body = String::from_utf8_lossy(&delivery.body).into_owned();
                pubsub.broadcast(uuid, &body);
                let _ = delivery.finish(camera_hub::bus::Verdict::Ack).await;
            }
            None => {
                warn!("motion.detections: message missing valid uuid header, discarding");
                let _ = delivery.finish(camera_hub::bus::Verdict::NackDiscard).await;
            }
        }
    }

    info!("detections bridge: queue closed");
    Ok(())
}
