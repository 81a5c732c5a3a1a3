use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::bus::Bus;
use crate::config::BusConfig;
use crate::dto::CameraProxyEvent;
use crate::Error;

/// Drains the in-process lifecycle channel and republishes each event onto
/// the bus under the configured pair/unpair routing keys.
///
/// Grounded on the original's event fan-out proxy: a single consumer loop,
/// terminating on the first publish error rather than trying to resume.
pub async fn run(
    mut lifecycle_rx: mpsc::Receiver<CameraProxyEvent>,
    bus: Arc<Bus>,
    bus_config: BusConfig,
) {
    while let Some(event) = lifecycle_rx.recv().await {
        if let Err(e) = publish_one(&bus, &bus_config, &event).await {
            error!("event fan-out proxy: publish failed, terminating: {e}");
            return;
        }
    }
    info!("event fan-out proxy: lifecycle channel closed");
}

async fn publish_one(bus: &Bus, bus_config: &BusConfig, event: &CameraProxyEvent) -> anyhow::Result<()> {
    let (key, body) = match event {
        CameraProxyEvent::Paired(paired) => (
            &bus_config.pair_key,
            serde_json::to_vec(paired).map_err(|e| Error::Permanent(format!("encode paired event: {e}")))?,
        ),
        CameraProxyEvent::Unpaired(unpaired) => (
            &bus_config.unpair_key,
            serde_json::to_vec(unpaired).map_err(|e| Error::Permanent(format!("encode unpaired event: {e}")))?,
        ),
    };

    bus.publish("", key, &body).await
}
