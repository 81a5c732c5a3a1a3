use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A paired (or previously discovered) camera. Identity is the ONVIF-derived
/// UUID, not a surrogate key.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Camera {
    pub id: Uuid,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub hardware_id: String,
    pub addr: String,
    pub version: i64,
}

/// Device-side credentials for a camera, stored 1:1 and deleted with it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CameraCreds {
    pub id: Uuid,
    pub username: String,
    pub password: String,
}

/// A cached PTZ session token, persisted 1:1 with the camera.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PtzToken {
    pub id: Uuid,
    pub token: String,
}

/// Promotion state of a recording, mirroring `state ∈ {promoted, discarded}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Promoted,
    Discarded,
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingState::Promoted => "promoted",
            RecordingState::Discarded => "discarded",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "promoted" => RecordingState::Promoted,
            _ => RecordingState::Discarded,
        }
    }
}

/// A single analyzer verdict, keyed for uniqueness on `vid_key`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recording {
    pub id: Uuid,
    pub cam_id: Uuid,
    pub bucket_name: String,
    pub vid_key: String,
    pub best_frame_key: String,
    pub evidence: Value,
    pub score: f64,
    pub state: String,
    pub needs_publish: bool,
    pub promoted_at: DateTime<Utc>,
    pub retention_days: i32,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
}

impl Recording {
    pub fn state(&self) -> RecordingState {
        RecordingState::from_str(&self.state)
    }
}

/// Input to `upsert_recording`, mirroring the analyzer's computed verdict
/// before a row id or `promoted_at` exist.
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub cam_id: Uuid,
    pub bucket_name: String,
    pub vid_key: String,
    pub best_frame_key: String,
    pub evidence: Value,
    pub score: f64,
    pub retention_days: i32,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
}

impl NewRecording {
    pub fn state(&self) -> RecordingState {
        if self.score >= 0.5 {
            RecordingState::Promoted
        } else {
            RecordingState::Discarded
        }
    }
}
