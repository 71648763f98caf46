use thiserror::Error;

use relay_proto::DecodeError;

use crate::pipe::PipeIoError;

/// Failure surfaced by the transport layer to its caller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("pipe operation timed out")]
    Timeout,
    #[error("pipe channel is closed")]
    Closed,
    #[error("pipe io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed packet stream: {0}")]
    Decode(#[from] DecodeError),
    #[error("handshake did not complete within the allotted time")]
    HandshakeTimeout,
    #[error("handshake ack did not match the client_id we advertised")]
    HandshakeMismatch,
}

impl From<PipeIoError> for TransportError {
    fn from(err: PipeIoError) -> Self {
        match err {
            PipeIoError::Timeout => Self::Timeout,
            PipeIoError::Closed => Self::Closed,
            PipeIoError::Io(e) => Self::Io(e),
        }
    }
}
