use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single discovery-cycle observation, surfaced on the SSE discovery stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryEventType {
    DeviceNew,
    DeviceIpChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    #[serde(rename = "type")]
    pub event_type: DiscoveryEventType,
    pub uuid: Uuid,
    pub addr: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraPairedEvent {
    pub uuid: Uuid,
    pub url: String,
    pub revision: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraUnpairedEvent {
    pub uuid: Uuid,
}

/// Lifecycle event published on the control-plane's in-process proxy channel
/// before being republished onto the bus by the Event Fan-out Proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum CameraProxyEvent {
    Paired(CameraPairedEvent),
    Unpaired(CameraUnpairedEvent),
}

/// Request handed to the Evidence Runner by the motion detector. `tp` is the
/// motion timepoint string itself (resolved open question: not a type tag).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeImgsEvent {
    pub uuid: Uuid,
    pub tp: String,
    pub vid_path: String,
    pub frame_paths: Vec<String>,
}

/// The bounding box and confidence the analyzer extracts from an inference
/// response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Evidence {
    pub conf: f64,
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRecordingReq {
    pub bucket_name: String,
    pub vid_key: String,
    pub best_frame_key: String,
    pub evidence: Value,
    pub score: f64,
    pub retention_days: i32,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairDeviceReq {
    pub uuid: Uuid,
    pub addr: String,
    pub username: String,
    pub password: String,
    pub camera_name: String,
    pub wifi_name: Option<String>,
    pub wifi_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpairDeviceReq {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PanTilt {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Zoom {
    pub x: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PtzTranslation {
    pub pan_tilt: PanTilt,
    pub zoom: Zoom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveCameraReq {
    pub translation: PtzTranslation,
}
