use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Registry miss, distinct from a transport/connection failure.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network/bus/object-store failure the caller should retry, or the bus should requeue.
    #[error("transient error: {0}")]
    Transient(String),

    /// Malformed event, missing header, or bad request body.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unresolvable segment file, inference shape mismatch, bad retention config.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("ONVIF error: {0}")]
    Onvif(String),

    #[error("DVRIP error: {0}")]
    Dvrip(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("camera error: {0}")]
    Camera(String),

    #[error("service error: {0}")]
    Service(String),

    #[error("other error: {0}")]
    Other(String),
}

impl Error {
    /// True if the device rejected a PTZ call because its token is stale.
    ///
    /// Isolated behind a single predicate per design note: the device has no
    /// machine-readable code for this, only a free-text ONVIF fault string.
    pub fn is_invalid_ptz_token(err: &anyhow::Error) -> bool {
        let s = err.to_string();
        s.contains("Invalid") && s.contains("Token")
    }
}
