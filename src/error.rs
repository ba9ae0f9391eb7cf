use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StubError>;

/// Unified error type for the stub server.
#[derive(Debug, Clone, Error)]
pub enum StubError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    // Wire format errors
    #[error("packet too short for DNS header")]
    ShortPacket,
    #[error("invalid DNS label")]
    InvalidLabel,
    #[error("name exceeds 255 octets")]
    NameTooLong,
    #[error("compression pointer loop")]
    PointerLoop,
    #[error("header counts disagree with packet body")]
    CountMismatch,
    #[error("truncated record data")]
    TruncatedRecord,
    #[error("malformed OPT record")]
    InvalidOpt,

    // Packet construction errors
    #[error("append would exceed packet maximum size")]
    SizeExceeded,

    // Configuration errors
    #[error("invalid listener spec: {0}")]
    InvalidListenerSpec(String),
    #[error("invalid upstream server: {0}")]
    InvalidUpstreamServer(String),
    #[error("configuration parse error: {0}")]
    ConfigParse(String),

    // Environment errors
    #[error("cannot read machine id: {0}")]
    MachineId(String),

    // Upstream transaction errors
    #[error("upstream query timed out")]
    UpstreamTimeout,
    #[error("no upstream servers configured")]
    NoUpstreamServers,
    #[error("invalid upstream reply")]
    InvalidUpstreamReply,
}

impl From<std::io::Error> for StubError {
    fn from(err: std::io::Error) -> Self {
        StubError::Io(Arc::new(err))
    }
}

impl StubError {
    /// True for the dedicated size-exceeded error returned by the packet
    /// append operations.
    pub fn is_size_exceeded(&self) -> bool {
        matches!(self, StubError::SizeExceeded)
    }
}
