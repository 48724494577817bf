use tokio_tungstenite::tungstenite;

/// Errors surfaced by the hub, its sessions, and the sender facade.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Trigger was called for a channel the session is not subscribed to.
    #[error("no channel")]
    NoChannel,

    /// Trigger was called with a payload from a different tenant.
    #[error("no appKey")]
    AppKeyMismatch,

    /// The shared bus rejected an operation or the connection dropped.
    #[error("bus error: {0}")]
    Bus(#[from] redis::RedisError),

    /// WebSocket handshake or frame-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    /// A control envelope could not be encoded or decoded.
    #[error("invalid control envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// The pattern subscription ended; the caller is expected to restart.
    #[error("bus subscription closed")]
    BusClosed,

    /// The channel prefix is fixed at listen time and cannot change.
    #[error("channel prefix is already set")]
    PrefixAlreadySet,

    /// The session's pumps are already running.
    #[error("client is already listening")]
    AlreadyListening,
}
