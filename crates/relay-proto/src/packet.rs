use crate::error::DecodeError;
use crate::header::{HEADER_SIZE, PacketHeader, crc32_frame};
use crate::ids::generate_uid;
use crate::opcode::{ChannelSetupFlags, OpCode, Status};

/// INVALID_SOCKS_ID / client_id sentinel: "assign me" on the wire.
pub const UNASSIGNED_ID: u64 = 0;

/// A fully typed, decoded (or about-to-be-encoded) packet.
///
/// Construct via the `Packet::*` associated functions, which draw a fresh
/// `uid` unless one is supplied. Parse with [`Packet::decode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    ChannelSetup { uid: u32, client_id: u64, flags: ChannelSetupFlags },
    ChannelSetupAck { uid: u32, client_id: u64 },
    Status { uid: u32, status: Status },
    Ping { uid: u32 },
    Socks { uid: u32, link_id: u64, data: Vec<u8> },
    SocksClose { uid: u32, link_id: u64 },
    SocksDisconnected { uid: u32, link_id: u64 },
    UninstallSelf { uid: u32 },
}

impl Packet {
    pub fn channel_setup(client_id: u64, flags: ChannelSetupFlags) -> Self {
        Self::ChannelSetup { uid: generate_uid(), client_id, flags }
    }

    pub fn channel_setup_with_uid(uid: u32, client_id: u64, flags: ChannelSetupFlags) -> Self {
        Self::ChannelSetup { uid, client_id, flags }
    }

    pub fn channel_setup_ack(client_id: u64) -> Self {
        Self::ChannelSetupAck { uid: generate_uid(), client_id }
    }

    pub fn status(uid: u32, status: Status) -> Self {
        Self::Status { uid, status }
    }

    pub fn ping() -> Self {
        Self::Ping { uid: generate_uid() }
    }

    pub fn ping_with_uid(uid: u32) -> Self {
        Self::Ping { uid }
    }

    pub fn socks(link_id: u64, data: Vec<u8>) -> Self {
        Self::Socks { uid: generate_uid(), link_id, data }
    }

    pub fn socks_close(link_id: u64) -> Self {
        Self::SocksClose { uid: generate_uid(), link_id }
    }

    pub fn socks_disconnected(link_id: u64) -> Self {
        Self::SocksDisconnected { uid: generate_uid(), link_id }
    }

    pub fn uninstall_self() -> Self {
        Self::UninstallSelf { uid: generate_uid() }
    }

    pub fn uid(&self) -> u32 {
        match *self {
            Self::ChannelSetup { uid, .. }
            | Self::ChannelSetupAck { uid, .. }
            | Self::Status { uid, .. }
            | Self::Ping { uid }
            | Self::Socks { uid, .. }
            | Self::SocksClose { uid, .. }
            | Self::SocksDisconnected { uid, .. }
            | Self::UninstallSelf { uid } => uid,
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Self::ChannelSetup { .. } => OpCode::ChannelSetup,
            Self::ChannelSetupAck { .. } => OpCode::ChannelSetupAck,
            Self::Status { .. } => OpCode::Status,
            Self::Ping { .. } => OpCode::Ping,
            Self::Socks { .. } => OpCode::Socks,
            Self::SocksClose { .. } => OpCode::SocksClose,
            Self::SocksDisconnected { .. } => OpCode::SocksDisconnected,
            Self::UninstallSelf { .. } => OpCode::UninstallSelf,
        }
    }

    fn write_payload(&self, out: &mut Vec<u8>) {
        match self {
            Self::ChannelSetup { client_id, flags, .. } => {
                out.extend_from_slice(&client_id.to_le_bytes());
                out.extend_from_slice(&flags.bits().to_le_bytes());
            }
            Self::ChannelSetupAck { client_id, .. } => {
                out.extend_from_slice(&client_id.to_le_bytes());
            }
            Self::Status { status, .. } => out.push(status.as_u8()),
            Self::Ping { .. } | Self::UninstallSelf { .. } => {}
            Self::Socks { link_id, data, .. } => {
                out.extend_from_slice(&link_id.to_le_bytes());
                out.extend_from_slice(data);
            }
            Self::SocksClose { link_id, .. } | Self::SocksDisconnected { link_id, .. } => {
                out.extend_from_slice(&link_id.to_le_bytes());
            }
        }
    }

    /// Serializes this packet: compute payload, write header with a zeroed
    /// CRC, compute the real CRC over the whole frame, then patch it in.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        self.write_payload(&mut payload);

        let total_length = (HEADER_SIZE + payload.len()) as u32;
        let mut frame = vec![0u8; total_length as usize];

        let header =
            PacketHeader { total_length, crc32: 0, uid: self.uid(), opcode: self.opcode() };
        header.write(&mut frame[0..HEADER_SIZE]);
        frame[HEADER_SIZE..].copy_from_slice(&payload);

        let crc32 = crc32_frame(&frame);
        let header = PacketHeader { crc32, ..header };
        header.write(&mut frame[0..HEADER_SIZE]);

        frame
    }

    /// Builds the typed packet from an already-header-validated frame.
    /// `payload` is `frame[HEADER_SIZE..header.total_length]`.
    pub fn decode(header: &PacketHeader, payload: &[u8]) -> Result<Self, DecodeError> {
        let uid = header.uid;

        match header.opcode {
            OpCode::ChannelSetup => {
                expect_len(header.opcode, payload, 12)?;
                let client_id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                let flags_bits = u32::from_le_bytes(payload[8..12].try_into().unwrap());
                let flags = ChannelSetupFlags::from_bits_truncate(flags_bits);
                Ok(Self::ChannelSetup { uid, client_id, flags })
            }
            OpCode::ChannelSetupAck => {
                expect_len(header.opcode, payload, 8)?;
                let client_id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                Ok(Self::ChannelSetupAck { uid, client_id })
            }
            OpCode::Status => {
                expect_len(header.opcode, payload, 1)?;
                Ok(Self::Status { uid, status: Status::from_u8(payload[0]) })
            }
            OpCode::Ping => {
                expect_len(header.opcode, payload, 0)?;
                Ok(Self::Ping { uid })
            }
            OpCode::Socks => {
                if payload.len() <= 8 {
                    return Err(DecodeError::MalformedPayload {
                        opcode: header.opcode.name(),
                        reason: format!("payload is {} bytes, expected more than 8", payload.len()),
                    });
                }
                let link_id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                if link_id == UNASSIGNED_ID {
                    return Err(DecodeError::MalformedPayload {
                        opcode: header.opcode.name(),
                        reason: "link_id is zero".to_string(),
                    });
                }
                Ok(Self::Socks { uid, link_id, data: payload[8..].to_vec() })
            }
            OpCode::SocksClose => {
                expect_len(header.opcode, payload, 8)?;
                let link_id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                Ok(Self::SocksClose { uid, link_id })
            }
            OpCode::SocksDisconnected => {
                expect_len(header.opcode, payload, 8)?;
                let link_id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                Ok(Self::SocksDisconnected { uid, link_id })
            }
            OpCode::UninstallSelf => {
                expect_len(header.opcode, payload, 0)?;
                Ok(Self::UninstallSelf { uid })
            }
        }
    }
}

fn expect_len(opcode: OpCode, payload: &[u8], expected: usize) -> Result<(), DecodeError> {
    if payload.len() != expected {
        return Err(DecodeError::MalformedPayload {
            opcode: opcode.name(),
            reason: format!("payload is {} bytes, expected {expected}", payload.len()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        let packet = Packet::ping_with_uid(0x0011_2233);
        let encoded = packet.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);

        let header = PacketHeader::parse(&encoded[..HEADER_SIZE]).unwrap();
        assert_eq!(header.opcode, OpCode::Ping);
        assert_eq!(header.uid, 0x0011_2233);
        assert_eq!(crc32_frame(&encoded), header.crc32);

        let decoded = Packet::decode(&header, &encoded[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn socks_envelope_layout() {
        let packet = Packet::Socks { uid: 7, link_id: 0x0102_0304_0506_0708, data: b"AB".to_vec() };
        let encoded = packet.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + 8 + 2);

        let payload = &encoded[HEADER_SIZE..];
        assert_eq!(
            payload,
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, b'A', b'B']
        );
    }

    #[test]
    fn socks_zero_link_id_rejected() {
        let packet = Packet::Socks { uid: 1, link_id: 0, data: b"x".to_vec() };
        let encoded = packet.encode();
        let header = PacketHeader::parse(&encoded[..HEADER_SIZE]).unwrap();
        let err = Packet::decode(&header, &encoded[HEADER_SIZE..]).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload { .. }));
    }

    #[test]
    fn channel_setup_round_trips_with_flags() {
        let packet = Packet::channel_setup_with_uid(42, 0xAABB, ChannelSetupFlags::WRITE);
        let encoded = packet.encode();
        let header = PacketHeader::parse(&encoded[..HEADER_SIZE]).unwrap();
        let decoded = Packet::decode(&header, &encoded[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn duplex_flag_is_read_or_write() {
        assert_eq!(ChannelSetupFlags::DUPLEX, ChannelSetupFlags::READ | ChannelSetupFlags::WRITE);
    }

    #[test]
    fn bit_flip_in_payload_is_detected_by_crc() {
        let packet = Packet::socks_disconnected(5);
        let mut encoded = packet.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;

        let header = PacketHeader::parse(&encoded[..HEADER_SIZE]).unwrap();
        let actual = crc32_frame(&encoded);
        assert_ne!(actual, header.crc32);
    }

    #[test]
    fn unknown_status_value_is_preserved_not_rejected() {
        let packet = Packet::status(1, Status::Unknown(0xAA));
        let encoded = packet.encode();
        let header = PacketHeader::parse(&encoded[..HEADER_SIZE]).unwrap();
        let decoded = Packet::decode(&header, &encoded[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, Packet::Status { uid: 1, status: Status::Unknown(0xAA) });
    }
}
