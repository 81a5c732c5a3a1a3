use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::registry::models::{Camera, CameraCreds, NewRecording, PtzToken, Recording};
use crate::Error;

/// The paired-camera registry: cameras, their credentials, PTZ tokens and
/// recordings, all behind one `Arc<PgPool>`.
///
/// Grounded on the donor's `CamerasRepository` shape (`db/repositories/cameras.rs`):
/// a thin struct wrapping a shared pool, one method per operation, `anyhow::Result`
/// return types with `Error::Database` wrapping at the sqlx boundary.
#[derive(Clone)]
pub struct Registry {
    pool: Arc<PgPool>,
}

impl Registry {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts or updates a camera. Re-pairing bumps `version` by at least 1.
    pub async fn upsert_camera(&self, camera: &Camera) -> Result<Camera> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("begin transaction: {e}")))?;
        let row = self.upsert_camera_tx(&mut tx, camera).await?;
        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("commit transaction: {e}")))?;
        Ok(row)
    }

    /// Same as `upsert_camera`, but participates in a caller-owned transaction
    /// so the Pairing Service can persist the camera and its credentials
    /// atomically.
    pub async fn upsert_camera_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        camera: &Camera,
    ) -> Result<Camera> {
        let row = sqlx::query_as::<_, Camera>(
            r#"
            INSERT INTO cameras (id, name, manufacturer, model, firmware_version, serial_number, hardware_id, addr, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                manufacturer = EXCLUDED.manufacturer,
                model = EXCLUDED.model,
                firmware_version = EXCLUDED.firmware_version,
                serial_number = EXCLUDED.serial_number,
                hardware_id = EXCLUDED.hardware_id,
                addr = EXCLUDED.addr,
                version = cameras.version + 1
            RETURNING *
            "#,
        )
        .bind(camera.id)
        .bind(&camera.name)
        .bind(&camera.manufacturer)
        .bind(&camera.model)
        .bind(&camera.firmware_version)
        .bind(&camera.serial_number)
        .bind(&camera.hardware_id)
        .bind(&camera.addr)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| Error::Database(format!("upsert camera {}: {e}", camera.id)))?;

        Ok(row)
    }

    pub async fn insert_creds(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        creds: &CameraCreds,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO camera_creds (id, username, password)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET username = EXCLUDED.username, password = EXCLUDED.password
            "#,
        )
        .bind(creds.id)
        .bind(&creds.username)
        .bind(&creds.password)
        .execute(&mut **tx)
        .await
        .map_err(|e| Error::Database(format!("insert creds {}: {e}", creds.id)))?;

        Ok(())
    }

    pub async fn find_creds(&self, uuid: Uuid) -> Result<CameraCreds> {
        sqlx::query_as::<_, CameraCreds>(
            "SELECT id, username, password FROM camera_creds WHERE id = $1",
        )
        .bind(uuid)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("find creds {uuid}: {e}")))?
        .ok_or_else(|| Error::NotFound(format!("credentials for camera {uuid}")).into())
    }

    pub async fn find_one(&self, uuid: Uuid) -> Result<Camera> {
        sqlx::query_as::<_, Camera>("SELECT * FROM cameras WHERE id = $1")
            .bind(uuid)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("find camera {uuid}: {e}")))?
            .ok_or_else(|| Error::NotFound(format!("camera {uuid}")).into())
    }

    pub async fn find_many(&self, offset: i64, limit: i64) -> Result<Vec<Camera>> {
        sqlx::query_as::<_, Camera>("SELECT * FROM cameras ORDER BY name OFFSET $1 LIMIT $2")
            .bind(offset)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("find many cameras: {e}")).into())
    }

    /// Hard delete, cascading to credentials, PTZ tokens and recordings by FK.
    pub async fn delete(&self, uuid: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM cameras WHERE id = $1")
            .bind(uuid)
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("delete camera {uuid}: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("camera {uuid}")).into());
        }
        Ok(())
    }

    /// Batched "is this uuid already paired" lookup, preserving input order.
    ///
    /// Resolves the open question around `FindExistingPaired`: a single
    /// `WHERE id = ANY($1)` query rather than N pipelined point queries,
    /// re-ordered in application code to match the caller's uuid list.
    pub async fn find_existing_paired(&self, uuids: &[Uuid]) -> Result<Vec<bool>> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM cameras WHERE id = ANY($1)")
            .bind(uuids)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("find existing paired: {e}")))?;

        let found: std::collections::HashSet<Uuid> = rows.into_iter().collect();
        Ok(uuids.iter().map(|u| found.contains(u)).collect())
    }

    /// Updates only a camera's network address, leaving `version` untouched:
    /// an address change observed by discovery is not a re-pair.
    pub async fn update_camera_addr(&self, uuid: Uuid, addr: &str) -> Result<Camera> {
        sqlx::query_as::<_, Camera>("UPDATE cameras SET addr = $1 WHERE id = $2 RETURNING *")
            .bind(addr)
            .bind(uuid)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("update camera addr {uuid}: {e}")))?
            .ok_or_else(|| Error::NotFound(format!("camera {uuid}")).into())
    }

    pub async fn get_camera_revision(&self, uuid: Uuid) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT version FROM cameras WHERE id = $1")
            .bind(uuid)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("get revision {uuid}: {e}")))?
            .ok_or_else(|| Error::NotFound(format!("camera {uuid}")).into())
    }

    pub async fn upsert_ptz_token(&self, token: &PtzToken) -> Result<PtzToken> {
        sqlx::query_as::<_, PtzToken>(
            r#"
            INSERT INTO ptz_tokens (id, token)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET token = EXCLUDED.token
            RETURNING *
            "#,
        )
        .bind(token.id)
        .bind(&token.token)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("upsert ptz token {}: {e}", token.id)).into())
    }

    pub async fn find_ptz_token(&self, uuid: Uuid) -> Result<PtzToken> {
        sqlx::query_as::<_, PtzToken>("SELECT id, token FROM ptz_tokens WHERE id = $1")
            .bind(uuid)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("find ptz token {uuid}: {e}")))?
            .ok_or_else(|| Error::NotFound(format!("ptz token for camera {uuid}")).into())
    }

    /// Upserts a recording keyed on `vid_key`, refreshing `promoted_at` to now
    /// on every update and deriving `state`/`needs_publish` from the score.
    pub async fn upsert_recording(&self, rec: &NewRecording) -> Result<Recording> {
        let state = rec.state();
        let needs_publish = state == crate::registry::models::RecordingState::Promoted;
        info!(
            vid_key = %rec.vid_key,
            score = rec.score,
            state = state.as_str(),
            "upserting recording"
        );

        sqlx::query_as::<_, Recording>(
            r#"
            INSERT INTO recordings
                (cam_id, bucket_name, vid_key, best_frame_key, evidence, score, state, needs_publish, promoted_at, retention_days, start_ts, end_ts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (vid_key) DO UPDATE SET
                best_frame_key = EXCLUDED.best_frame_key,
                evidence = EXCLUDED.evidence,
                score = EXCLUDED.score,
                state = EXCLUDED.state,
                needs_publish = EXCLUDED.needs_publish,
                promoted_at = EXCLUDED.promoted_at,
                retention_days = EXCLUDED.retention_days,
                end_ts = EXCLUDED.end_ts
            RETURNING *
            "#,
        )
        .bind(rec.cam_id)
        .bind(&rec.bucket_name)
        .bind(&rec.vid_key)
        .bind(&rec.best_frame_key)
        .bind(&rec.evidence)
        .bind(rec.score)
        .bind(state.as_str())
        .bind(needs_publish)
        .bind(Utc::now())
        .bind(rec.retention_days)
        .bind(rec.start_ts)
        .bind(rec.end_ts)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("upsert recording {}: {e}", rec.vid_key)).into())
    }

    pub async fn find_recording(&self, id: Uuid) -> Result<Recording> {
        sqlx::query_as::<_, Recording>("SELECT * FROM recordings WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("find recording {id}: {e}")))?
            .ok_or_else(|| Error::NotFound(format!("recording {id}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::models::RecordingState;

    #[test]
    fn recording_state_round_trips() {
        assert_eq!(RecordingState::from_str("promoted"), RecordingState::Promoted);
        assert_eq!(RecordingState::from_str("discarded"), RecordingState::Discarded);
        assert_eq!(RecordingState::from_str("garbage"), RecordingState::Discarded);
        assert_eq!(RecordingState::Promoted.as_str(), "promoted");
    }

    #[test]
    fn new_recording_state_follows_score_threshold() {
        let base = NewRecording {
            cam_id: Uuid::nil(),
            bucket_name: "b".into(),
            vid_key: "k".into(),
            best_frame_key: "f".into(),
            evidence: serde_json::json!({}),
            score: 0.5,
            retention_days: 3,
            start_ts: Utc::now(),
            end_ts: Utc::now(),
        };
        assert_eq!(base.state(), RecordingState::Promoted);

        let mut low = base.clone();
        low.score = 0.49;
        assert_eq!(low.state(), RecordingState::Discarded);
        low.score = 0.5;
        assert_eq!(low.state(), RecordingState::Promoted);
    }
}
