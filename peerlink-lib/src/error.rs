use thiserror::Error;

/// Failure classes of the session core.
///
/// Per-candidate and per-frame errors are recovered where they occur and
/// never surface through this type; session-level failures surface through
/// the observable connection state rather than as return values of
/// asynchronous operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("channel not ready")]
    ChannelNotReady,
    #[error("malformed frame: {0}")]
    Codec(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
