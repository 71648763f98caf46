//! Wire format for the SOCKS-over-named-pipe tunnel: framed packets with a
//! magic/length/crc32/uid/opcode header, typed payloads, and a
//! resynchronizing streaming parser.

mod error;
mod header;
mod ids;
mod opcode;
mod packet;
mod stream;

pub use error::DecodeError;
pub use header::{CRC32_OFFSET, HEADER_SIZE, MAGIC, MAX_PACKET_SIZE, PacketHeader, crc32_frame};
pub use ids::{generate_socks_id, generate_uid};
pub use opcode::{ChannelSetupFlags, OpCode, Status};
pub use packet::{Packet, UNASSIGNED_ID};
pub use stream::InputStream;
