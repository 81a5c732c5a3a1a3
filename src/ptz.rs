use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{ptz_token_key, Cache, PTZ_TOKEN_TTL};
use crate::dto::MoveCameraReq;
use crate::onvif::{is_invalid_token_error, OnvifSessionBuilder};
use crate::registry::{PtzToken, Registry};
use crate::Error;

/// Resolves and drives PTZ moves against paired cameras.
///
/// Grounded on the original's `ptz_service.go`: a token resolution order of
/// cache → persisted row → freshly negotiated device profile (each hit
/// back-filling the layers above), and a single retry on a device-signalled
/// stale token.
pub struct PtzService {
    registry: Arc<Registry>,
    cache: Arc<Cache>,
}

impl PtzService {
    pub fn new(registry: Arc<Registry>, cache: Arc<Cache>) -> Self {
        Self { registry, cache }
    }

    /// Resolves a PTZ token for `uuid`, never failing outright on a cache or
    /// repo miss: falls through to negotiating a fresh one from the device.
    /// A failure to persist the freshly negotiated token is logged, not
    /// propagated.
    pub async fn resolve_ptz_token(&self, uuid: Uuid, addr: &str, username: &str, password: &str) -> Result<String> {
        let key = ptz_token_key(&uuid);
        if let Some(token) = self.cache.get(&key).await? {
            return Ok(token);
        }

        if let Ok(row) = self.registry.find_ptz_token(uuid).await {
            if let Err(e) = self.cache.set_with_ttl(&key, &row.token, PTZ_TOKEN_TTL).await {
                warn!(%uuid, "resolve_ptz_token: failed to warm cache: {e}");
            }
            return Ok(row.token);
        }

        let token = self.negotiate_fresh_token(addr, username, password).await?;
        self.upsert_and_cache(uuid, &token).await;
        Ok(token)
    }

    async fn negotiate_fresh_token(&self, addr: &str, username: &str, password: &str) -> Result<String> {
        let session = OnvifSessionBuilder::new()
            .uri(addr)?
            .credentials(username, password)
            .build()
            .await?;
        let token = session.get_ptz_profile().await?;
        Ok(token)
    }

    /// Persists and caches a freshly negotiated token; rejects an empty
    /// token rather than storing it, mirroring the original's guard.
    async fn upsert_and_cache(&self, uuid: Uuid, token: &str) {
        if token.is_empty() {
            warn!(%uuid, "upsert_and_cache: refusing to persist an empty ptz token");
            return;
        }

        if let Err(e) = self
            .registry
            .upsert_ptz_token(&PtzToken {
                id: uuid,
                token: token.to_string(),
            })
            .await
        {
            warn!(%uuid, "upsert_and_cache: failed to persist ptz token: {e}");
        }

        if let Err(e) = self
            .cache
            .set_with_ttl(&ptz_token_key(&uuid), token, PTZ_TOKEN_TTL)
            .await
        {
            warn!(%uuid, "upsert_and_cache: failed to cache ptz token: {e}");
        }
    }

    /// Loads the camera, resolves a token, and issues the move; on a
    /// device-signalled stale token, re-negotiates and retries exactly once.
    pub async fn move_camera(&self, uuid: Uuid, req: &MoveCameraReq) -> Result<()> {
        let camera = self.registry.find_one(uuid).await?;
        let creds = self.registry.find_creds(uuid).await?;

        let mut token = self
            .resolve_ptz_token(uuid, &camera.addr, &creds.username, &creds.password)
            .await?;

        let session = OnvifSessionBuilder::new()
            .uri(&camera.addr)?
            .credentials(&creds.username, &creds.password)
            .build()
            .await?;

        match session.move_camera(&token, &req.translation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err: anyhow::Error = e.into();
                if !is_invalid_token_error(&err) {
                    return Err(err);
                }

                info!(%uuid, "move_camera: stale ptz token signalled, renegotiating");
                token = self
                    .negotiate_fresh_token(&camera.addr, &creds.username, &creds.password)
                    .await?;
                self.upsert_and_cache(uuid, &token).await;

                session
                    .move_camera(&token, &req.translation)
                    .await
                    .map_err(|e| Error::Onvif(format!("ptz move retry failed: {e}")))?;
                Ok(())
            }
        }
    }
}
