use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker_client::BrokerClient;
use crate::cache::Cache;
use crate::dto::{CameraPairedEvent, CameraProxyEvent, DiscoveryEvent, DiscoveryEventType};
use crate::onvif::probe_all_interfaces;
use crate::registry::Registry;

const CYCLE_PERIOD: Duration = Duration::from_secs(60);
const CYCLE_TIMEOUT: Duration = Duration::from_secs(10);
const SSE_CHANNEL_CAPACITY: usize = 24;

/// Runs the periodic ONVIF discovery cycle and reconciles matches against
/// the Registry.
///
/// Grounded on the original's singleton-scheduled discovery loop: at most
/// one cycle in flight (enforced by holding `cycle_guard` for the cycle's
/// duration), per-match reconciliation driving both the SSE discovery
/// stream and paired-camera broker refresh.
pub struct DiscoveryLoop {
    registry: Arc<Registry>,
    cache: Arc<Cache>,
    broker: Arc<BrokerClient>,
    sse_tx: broadcast::Sender<DiscoveryEvent>,
    lifecycle_tx: tokio::sync::mpsc::Sender<CameraProxyEvent>,
    env_type: String,
    cycle_guard: Mutex<()>,
}

impl DiscoveryLoop {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<Cache>,
        broker: Arc<BrokerClient>,
        lifecycle_tx: tokio::sync::mpsc::Sender<CameraProxyEvent>,
        env_type: String,
    ) -> (Self, broadcast::Receiver<DiscoveryEvent>) {
        let (sse_tx, sse_rx) = broadcast::channel(SSE_CHANNEL_CAPACITY);
        (
            Self {
                registry,
                cache,
                broker,
                sse_tx,
                lifecycle_tx,
                env_type,
                cycle_guard: Mutex::new(()),
            },
            sse_rx,
        )
    }

    pub fn subscribe_sse(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.sse_tx.subscribe()
    }

    /// Runs cycles on a fixed 60 s period until `shutdown` fires. If a cycle
    /// overruns its own 10 s timeout the next tick simply waits for the
    /// cycle guard rather than overlapping it.
    pub async fn run(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let mut interval = tokio::time::interval(CYCLE_PERIOD);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("discovery loop stopping");
                    return;
                }
                _ = interval.tick() => {
                    self.clone().run_cycle().await;
                }
            }
        }
    }

    async fn run_cycle(self: Arc<Self>) {
        let _guard = self.cycle_guard.lock().await;
        match tokio::time::timeout(CYCLE_TIMEOUT, self.probe_and_reconcile()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("discovery cycle failed: {e}"),
            Err(_) => warn!("discovery cycle timed out after {:?}", CYCLE_TIMEOUT),
        }
    }

    async fn probe_and_reconcile(&self) -> Result<()> {
        let matches = probe_all_interfaces(CYCLE_TIMEOUT).await?;
        for m in matches {
            if let Err(e) = self.reconcile_one(m.uuid, &m.addr).await {
                warn!(uuid = %m.uuid, "discovery: reconcile failed: {e}");
            }
        }
        Ok(())
    }

    async fn reconcile_one(&self, uuid: Uuid, addr: &str) -> Result<()> {
        match self.registry.find_one(uuid).await {
            Err(_) => {
                self.emit_sse(uuid, addr, DiscoveryEventType::DeviceNew);
                self.update_cache(uuid, addr).await;
            }
            Ok(camera) if camera.addr != addr => {
                let stored = self.registry.update_camera_addr(uuid, addr).await?;
                self.emit_sse(uuid, addr, DiscoveryEventType::DeviceIpChanged);
                self.refresh_broker_if_paired(&stored).await;
                self.update_cache(uuid, addr).await;
            }
            Ok(camera) => {
                self.refresh_broker_if_paired(&camera).await;
                if self.env_type == "dev" {
                    self.emit_sse(uuid, addr, DiscoveryEventType::DeviceNew);
                }
            }
        }
        Ok(())
    }

    async fn refresh_broker_if_paired(&self, camera: &crate::registry::Camera) {
        let creds = match self.registry.find_creds(camera.id).await {
            Ok(creds) => creds,
            Err(_) => return,
        };

        match self.broker.publish(&camera.id, camera, &creds).await {
            Ok(url) => {
                let event = CameraProxyEvent::Paired(CameraPairedEvent {
                    uuid: camera.id,
                    url,
                    revision: camera.version,
                });
                if self.lifecycle_tx.send(event).await.is_err() {
                    warn!(uuid = %camera.id, "discovery: lifecycle channel closed");
                }
            }
            Err(e) => warn!(uuid = %camera.id, "discovery: broker refresh failed: {e}"),
        }
    }

    async fn update_cache(&self, uuid: Uuid, addr: &str) {
        let key = format!("cam:{uuid}");
        match self.cache.get(&key).await {
            Ok(Some(existing)) if existing == addr => {}
            _ => {
                if let Err(e) = self
                    .cache
                    .set_with_ttl(&key, addr, Duration::from_secs(0))
                    .await
                {
                    warn!(%uuid, "discovery: failed to update cache entry: {e}");
                }
            }
        }
    }

    /// Best-effort send on the bounded SSE broadcast channel: a lagging
    /// subscriber drops messages rather than stalling the cycle.
    fn emit_sse(&self, uuid: Uuid, addr: &str, event_type: DiscoveryEventType) {
        let event = DiscoveryEvent {
            event_type,
            uuid,
            addr: addr.to_string(),
            at: Utc::now(),
        };
        let _ = self.sse_tx.send(event);
    }
}
