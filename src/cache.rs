use anyhow::{Context, Result};
use redis::AsyncCommands;
use std::time::Duration;

use crate::Error;

/// Thin Redis-backed K/V cache with TTL.
///
/// Grounded on `updateCache`/`redis.Nil` handling in the original discovery
/// service: absence is a distinct `Ok(None)`, not an error, so callers can
/// fall through to a persisted row without matching on error text.
#[derive(Clone)]
pub struct Cache {
    client: redis::Client,
}

impl Cache {
    pub fn new(addr: &str) -> Result<Self> {
        let client = redis::Client::open(addr).context("opening redis client")?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Transient(format!("redis connect: {e}")).into())
    }

    /// Returns `None` if the key is absent, distinct from a connection error.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| Error::Transient(format!("redis get {key}: {e}")))?;
        Ok(value)
    }

    /// Sets `key`, with `ttl = 0` meaning no expiry.
    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        if ttl.is_zero() {
            let _: () = conn
                .set(key, value)
                .await
                .map_err(|e| Error::Transient(format!("redis set {key}: {e}")))?;
        } else {
            let _: () = conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| Error::Transient(format!("redis set {key}: {e}")))?;
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| Error::Transient(format!("redis del {key}: {e}")))?;
        Ok(())
    }
}

/// PTZ token cache keys, mirroring `ptz:token:<uuid>`.
pub fn ptz_token_key(uuid: &uuid::Uuid) -> String {
    format!("ptz:token:{uuid}")
}

pub const PTZ_TOKEN_TTL: Duration = Duration::from_secs(3600);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptz_token_key_is_namespaced() {
        let id = uuid::Uuid::nil();
        assert_eq!(ptz_token_key(&id), format!("ptz:token:{id}"));
    }
}
