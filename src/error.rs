use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("broker refused connection or host unreachable")]
    /// The broker refused the connection outright. No state is recorded for the host.
    NoBroker,
    #[error("channel open failed: {0}")]
    /// The connection was accepted but channel negotiation failed.
    ChannelOpenFailed(String),
    #[error("invalid `{0}` envelope")]
    /// The envelope shaper rejected the payload. Nothing was published.
    EnvelopeInvalid(&'static str),
    #[error("request timed out")]
    Timeout,
    #[error("media document not found")]
    NotFound,
    #[error("media document has no streamable data")]
    NoData,
    #[error("no media ports available")]
    NoPorts,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("service is shut down")]
    /// The coordinator behind a handle has exited and can no longer be reached.
    Closed,
}
