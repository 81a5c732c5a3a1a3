//! The library's own HTTP/SSE surface lives in [`edge`].
//!
//! `rest`, `webrtc`, `websocket` and `websocket_stream` below are reference
//! material from the donor stream-management REST API (ffmpeg/HLS/WebRTC
//! session endpoints) and are not part of this crate's module tree; they
//! are not declared here and build against the donor's own `db`/`recorder`/
//! `security` modules, not this crate's registry/pairing/ptz services.

pub mod edge;
