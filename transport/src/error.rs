use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by the transport core to its callers.
///
/// NB: Duplicate or unknown acknowledgements are deliberately absent - they feed the capacity
///      policy and are never reported as errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The operation was attempted after the connection started closing, closed or was aborted
    #[error("connection closed")]
    ConnectionClosed,

    /// A datagram could not be decoded. The datagram is dropped, the connection is unaffected.
    #[error("malformed segment: {0}")]
    MalformedSegment(String),

    /// Segment tracking is in a state that should be impossible
    #[error("internal consistency error: {0}")]
    InternalConsistency(String),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn malformed(reason: impl Into<String>) -> TransportError {
        TransportError::MalformedSegment(reason.into())
    }
}

/// For exposing connections through tokio's I/O traits
impl From<TransportError> for std::io::Error {
    fn from(e: TransportError) -> std::io::Error {
        match e {
            TransportError::Io(e) => e,
            e @ TransportError::ConnectionClosed => std::io::Error::new(std::io::ErrorKind::ConnectionAborted, e),
            e => std::io::Error::other(e),
        }
    }
}
