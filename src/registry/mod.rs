pub mod migrations;
pub mod models;
pub mod repo;

pub use models::{Camera, CameraCreds, NewRecording, PtzToken, Recording, RecordingState};
pub use repo::Registry;
