use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker_client::BrokerClient;
use crate::cache::Cache;
use crate::config::DeviceAdminConfig;
use crate::dto::{CameraPairedEvent, CameraProxyEvent, CameraUnpairedEvent, PairDeviceReq};
use crate::dvrip::DvripClient;
use crate::onvif::OnvifSessionBuilder;
use crate::pubsub::PubSub;
use crate::registry::{Camera, CameraCreds, Registry};
use crate::Error;

/// Pairs and unpairs cameras: ONVIF negotiation, device-side provisioning,
/// one-transaction persistence, broker path request, and lifecycle-event
/// emission.
///
/// Grounded on the original's `Pair`/`Unpair` flow; the ordering invariant
/// ("registry deletion is last among local state, the lifecycle event fires
/// only after") is preserved exactly so the supervisor never races a restart
/// against a still-present Registry row.
pub struct PairingService {
    registry: Arc<Registry>,
    cache: Arc<Cache>,
    pubsub: Arc<PubSub>,
    broker: Arc<BrokerClient>,
    device_admin: DeviceAdminConfig,
    lifecycle_tx: mpsc::Sender<CameraProxyEvent>,
}

impl PairingService {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<Cache>,
        pubsub: Arc<PubSub>,
        broker: Arc<BrokerClient>,
        device_admin: DeviceAdminConfig,
        lifecycle_tx: mpsc::Sender<CameraProxyEvent>,
    ) -> Self {
        Self {
            registry,
            cache,
            pubsub,
            broker,
            device_admin,
            lifecycle_tx,
        }
    }

    pub async fn pair(&self, req: &PairDeviceReq) -> Result<Camera> {
        let session = OnvifSessionBuilder::new()
            .uri(&req.addr)?
            .credentials(&req.username, &req.password)
            .build()
            .await
            .map_err(|e| Error::Onvif(format!("pairing failed: {e}")))?;

        let info = session
            .get_device_info()
            .await
            .map_err(|e| Error::Onvif(format!("pairing failed: {e}")))?;

        if !self.device_admin.username.is_empty() {
            if let Err(e) = session
                .create_user(&self.device_admin.username, &self.device_admin.password)
                .await
            {
                warn!(uuid = %req.uuid, "pair: best-effort admin account creation failed: {e}");
            }
        }
        if let Err(e) = session.create_user(&req.username, &req.password).await {
            warn!(uuid = %req.uuid, "pair: best-effort user account creation failed: {e}");
        }

        let camera = Camera {
            id: req.uuid,
            name: req.camera_name.clone(),
            manufacturer: info.manufacturer,
            model: info.model,
            firmware_version: info.firmware_version,
            serial_number: info.serial_number,
            hardware_id: info.hardware_id,
            addr: req.addr.clone(),
            version: 0,
        };
        let creds = CameraCreds {
            id: req.uuid,
            username: req.username.clone(),
            password: req.password.clone(),
        };

        let stored = self.persist(&camera, &creds).await?;

        if let Some(wifi_name) = &req.wifi_name {
            let wifi_password = req.wifi_password.as_deref().unwrap_or_default();
            match DvripClient::connect(&req.addr, &req.username, &req.password).await {
                Ok(mut dvrip) => {
                    if let Err(e) = dvrip.pair_wifi(wifi_name, wifi_password).await {
                        warn!(uuid = %req.uuid, "pair: wifi join failed (advisory): {e}");
                    }
                }
                Err(e) => warn!(uuid = %req.uuid, "pair: could not open dvrip session for wifi join: {e}"),
            }
        }

        let url = self.broker.publish(&req.uuid, &stored, &creds).await?;

        self.lifecycle_tx
            .send(CameraProxyEvent::Paired(CameraPairedEvent {
                uuid: stored.id,
                url,
                revision: stored.version,
            }))
            .await
            .map_err(|e| Error::Service(format!("lifecycle channel closed: {e}")))?;

        info!(uuid = %stored.id, revision = stored.version, "camera paired");
        Ok(stored)
    }

    async fn persist(&self, camera: &Camera, creds: &CameraCreds) -> Result<Camera> {
        let pool = self.registry.pool();
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("begin pairing transaction: {e}")))?;

        let stored = self.registry.upsert_camera_tx(&mut tx, camera).await?;
        self.registry.insert_creds(&mut tx, creds).await?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("commit pairing transaction: {e}")))?;
        Ok(stored)
    }

    pub async fn unpair(&self, uuid: Uuid) -> Result<()> {
        let camera = self.registry.find_one(uuid).await?;
        let creds = self.registry.find_creds(uuid).await?;

        match DvripClient::connect(&camera.addr, &creds.username, &creds.password).await {
            Ok(mut dvrip) => {
                if let Err(e) = dvrip.del_user(&creds.username).await {
                    warn!(%uuid, "unpair: failed to delete device-side user: {e}");
                }
                if let Err(e) = dvrip.reboot().await {
                    warn!(%uuid, "unpair: best-effort reboot failed: {e}");
                }
            }
            Err(e) => warn!(%uuid, "unpair: could not open dvrip session: {e}"),
        }

        if let Err(e) = self.broker.delete(&uuid).await {
            warn!(%uuid, "unpair: failed to delete broker path: {e}");
        }

        if let Err(e) = self.cache.delete(&format!("cam:{uuid}")).await {
            warn!(%uuid, "unpair: failed to purge cache entry: {e}");
        }
        self.pubsub.purge(uuid);

        self.registry.delete(uuid).await?;

        self.lifecycle_tx
            .send(CameraProxyEvent::Unpaired(CameraUnpairedEvent { uuid }))
            .await
            .map_err(|e| Error::Service(format!("lifecycle channel closed: {e}")))?;

        info!(%uuid, "camera unpaired");
        Ok(())
    }
}
