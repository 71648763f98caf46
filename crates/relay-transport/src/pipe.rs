use std::time::Duration;

use thiserror::Error;

/// I/O failure from a [`PipeEndpoint`] operation.
#[derive(Debug, Error)]
pub enum PipeIoError {
    #[error("pipe operation timed out")]
    Timeout,
    #[error("pipe closed")]
    Closed,
    #[error("pipe io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One named-pipe instance, as provided by the SMB collaborator.
///
/// `read`/`write` block up to `timeout`. A clean EOF is reported as
/// `Ok(vec![])` from `read`; `PipeIoError::Timeout` is distinct from other
/// errors so callers can treat steady-state timeouts as normal idle.
pub trait PipeEndpoint: Send {
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, PipeIoError>;
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), PipeIoError>;
    fn close(&mut self);
}

/// Opens named-pipe instances against a remote SMB session.
///
/// Implementations are expected to poll for the pipe's availability rather
/// than failing the moment it isn't there yet, giving up only once it has
/// stayed absent for a reasonable deadline.
pub trait PipeOpener: Send + Sync {
    fn open(&self, name: &str) -> Result<Box<dyn PipeEndpoint>, PipeIoError>;
}
