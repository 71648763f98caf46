use thiserror::Error;

/// Failure parsing a single frame out of the wire format.
///
/// Every variant is fatal to the *frame* being parsed; `InputStream` treats
/// `BadMagic` as resynchronizable garbage (see [`crate::stream::InputStream`])
/// but all other variants are surfaced to the caller as a corrupt stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("incorrect magic word")]
    BadMagic,
    #[error("packet length {0} exceeds the {1} byte ceiling")]
    OversizedLength(u32, u32),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("crc32 mismatch: got {actual:#010x}, expected {expected:#010x}")]
    CrcMismatch { actual: u32, expected: u32 },
    #[error("malformed {opcode} payload: {reason}")]
    MalformedPayload { opcode: &'static str, reason: String },
}
