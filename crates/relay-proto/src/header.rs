use crate::error::DecodeError;
use crate::opcode::OpCode;

/// Frame delimiter, little-endian as emitted on the wire.
pub const MAGIC: [u8; 4] = [0xE4, 0x85, 0xB4, 0xB2];

/// `magic(4) + total_length(4) + crc32(4) + uid(4) + opcode(1)`.
pub const HEADER_SIZE: usize = 17;

/// Offset of the `crc32` field within a serialized header.
pub const CRC32_OFFSET: usize = 8;

/// Hard ceiling on `total_length`, enforced during parse.
pub const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// Parsed fixed-size header, prior to payload validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub total_length: u32,
    pub crc32: u32,
    pub uid: u32,
    pub opcode: OpCode,
}

impl PacketHeader {
    /// Parses `bytes[..HEADER_SIZE]`. Does not validate CRC or `total_length`
    /// against the buffer's actual length — callers do that once enough
    /// bytes have accumulated.
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        debug_assert!(bytes.len() >= HEADER_SIZE);

        if bytes[0..4] != MAGIC {
            return Err(DecodeError::BadMagic);
        }

        let total_length = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if total_length > MAX_PACKET_SIZE {
            return Err(DecodeError::OversizedLength(total_length, MAX_PACKET_SIZE));
        }

        let crc32 = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let uid = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let opcode_byte = bytes[16];
        let opcode = OpCode::from_u8(opcode_byte).ok_or(DecodeError::UnknownOpcode(opcode_byte))?;

        Ok(Self { total_length, crc32, uid, opcode })
    }

    /// Writes the header into `out[..HEADER_SIZE]`.
    pub fn write(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= HEADER_SIZE);
        out[0..4].copy_from_slice(&MAGIC);
        out[4..8].copy_from_slice(&self.total_length.to_le_bytes());
        out[8..12].copy_from_slice(&self.crc32.to_le_bytes());
        out[12..16].copy_from_slice(&self.uid.to_le_bytes());
        out[16] = self.opcode.as_u8();
    }
}

/// IEEE/zlib CRC-32 over a full frame, with the header's `crc32` field
/// treated as zero — without mutating `frame`.
pub fn crc32_frame(frame: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame[0..CRC32_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&frame[CRC32_OFFSET + 4..]);
    hasher.finalize()
}
