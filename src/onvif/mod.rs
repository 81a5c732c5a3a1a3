pub mod client;
pub mod probe;

pub use client::{is_invalid_token_error, DeviceInfo, OnvifSession, OnvifSessionBuilder};
pub use probe::{extract_match, probe_all_interfaces, DiscoveryMatch};
