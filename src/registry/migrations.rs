use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

/// Creates the registry's tables if they don't already exist.
///
/// A real deployment would drive this with `sqlx::migrate!`, but the donor
/// repo runs its schema inline at startup (`db/migrations/mod.rs`) and this
/// keeps that shape rather than introducing a migrations directory for four
/// tables.
pub async fn run(pool: &PgPool) -> Result<()> {
    info!("Running registry migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cameras (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            manufacturer TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            firmware_version TEXT NOT NULL DEFAULT '',
            serial_number TEXT NOT NULL DEFAULT '',
            hardware_id TEXT NOT NULL DEFAULT '',
            addr TEXT NOT NULL,
            version BIGINT NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating cameras table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS camera_creds (
            id UUID PRIMARY KEY REFERENCES cameras(id) ON DELETE CASCADE,
            username TEXT NOT NULL,
            password TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating camera_creds table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ptz_tokens (
            id UUID PRIMARY KEY REFERENCES cameras(id) ON DELETE CASCADE,
            token TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating ptz_tokens table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recordings (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            cam_id UUID NOT NULL REFERENCES cameras(id) ON DELETE CASCADE,
            bucket_name TEXT NOT NULL,
            vid_key TEXT NOT NULL UNIQUE,
            best_frame_key TEXT NOT NULL,
            evidence JSONB NOT NULL,
            score DOUBLE PRECISION NOT NULL,
            state TEXT NOT NULL,
            needs_publish BOOLEAN NOT NULL,
            promoted_at TIMESTAMPTZ NOT NULL,
            retention_days INTEGER NOT NULL,
            start_ts TIMESTAMPTZ NOT NULL,
            end_ts TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating recordings table")?;

    Ok(())
}
