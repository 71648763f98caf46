use std::sync::Mutex;

use crate::error::DecodeError;
use crate::header::{HEADER_SIZE, MAGIC, PacketHeader, crc32_frame};
use crate::packet::Packet;

/// Turns an arbitrary byte stream into a lazy sequence of typed packets,
/// tolerating interleaved garbage.
///
/// `feed` only ever appends and can be called concurrently with a
/// `flush_next_packet` in progress; `flush_next_packet` itself serializes
/// against other flushers so at most one flush runs at a time.
pub struct InputStream {
    buffer: Mutex<Vec<u8>>,
    flush_guard: Mutex<()>,
}

impl Default for InputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InputStream {
    pub fn new() -> Self {
        Self { buffer: Mutex::new(Vec::new()), flush_guard: Mutex::new(()) }
    }

    pub fn feed(&self, data: &[u8]) {
        self.buffer.lock().unwrap().extend_from_slice(data);
    }

    pub fn clear(&self) {
        let _flush_guard = self.flush_guard.lock().unwrap();
        self.buffer.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the next complete packet, `Ok(None)` if more bytes are
    /// needed, or `Err` if the stream is corrupt (caller should drop the
    /// connection and reconnect).
    pub fn flush_next_packet(&self) -> Result<Option<Packet>, DecodeError> {
        let _flush_guard = self.flush_guard.lock().unwrap();
        let mut buf = self.buffer.lock().unwrap();

        if buf.is_empty() {
            return Ok(None);
        }

        match find_magic(&buf) {
            None => {
                // A magic word may straddle a feed boundary; keep the last
                // few bytes in case the prefix of MAGIC just arrived.
                let keep_from = buf.len().saturating_sub(MAGIC.len() - 1);
                if keep_from > 0 {
                    tracing::warn!(dropped = keep_from, "skipping garbage input data");
                    buf.drain(0..keep_from);
                }
                return Ok(None);
            }
            Some(0) => {}
            Some(offset) => {
                tracing::warn!(dropped = offset, "skipping garbage input data");
                buf.drain(0..offset);
            }
        }

        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = PacketHeader::parse(&buf[..HEADER_SIZE])?;

        if buf.len() < header.total_length as usize {
            return Ok(None);
        }

        let frame = &buf[..header.total_length as usize];
        let actual_crc32 = crc32_frame(frame);
        if actual_crc32 != header.crc32 {
            return Err(DecodeError::CrcMismatch { actual: actual_crc32, expected: header.crc32 });
        }

        let packet = Packet::decode(&header, &frame[HEADER_SIZE..])?;
        buf.drain(0..header.total_length as usize);

        Ok(Some(packet))
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC.len()).position(|window| window == MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Status;

    #[test]
    fn split_feed_one_byte_at_a_time() {
        let packet = Packet::socks(1, b"AB".to_vec());
        let encoded = packet.encode();

        let stream = InputStream::new();
        for (i, byte) in encoded.iter().enumerate() {
            stream.feed(std::slice::from_ref(byte));
            let result = stream.flush_next_packet().unwrap();
            if i + 1 < encoded.len() {
                assert!(result.is_none(), "expected None at byte {i}");
            } else {
                assert_eq!(result, Some(packet.clone()));
            }
        }
    }

    #[test]
    fn garbage_prefix_is_skipped() {
        let stream = InputStream::new();
        stream.feed(&[0xDE, 0xAD, 0xBE, 0xEF]);
        stream.feed(&Packet::ping_with_uid(7).encode());

        let packet = stream.flush_next_packet().unwrap();
        assert_eq!(packet, Some(Packet::ping_with_uid(7)));
    }

    #[test]
    fn garbage_between_packets_is_resynchronized() {
        let stream = InputStream::new();
        let first = Packet::ping_with_uid(1);
        let second = Packet::status(2, Status::Ok);

        stream.feed(&first.encode());
        stream.feed(b"\x00\x01garbage\x02");
        stream.feed(&second.encode());

        assert_eq!(stream.flush_next_packet().unwrap(), Some(first));
        assert_eq!(stream.flush_next_packet().unwrap(), Some(second));
        assert_eq!(stream.flush_next_packet().unwrap(), None);
    }

    #[test]
    fn concatenated_stream_yields_exact_sequence() {
        let packets = vec![
            Packet::ping(),
            Packet::socks(42, b"hello".to_vec()),
            Packet::socks_disconnected(42),
            Packet::status(99, Status::Unsupported),
        ];

        let mut bytes = Vec::new();
        for p in &packets {
            bytes.extend(p.encode());
        }

        // Feed in odd-sized chunks to exercise partial reads.
        let stream = InputStream::new();
        for chunk in bytes.chunks(3) {
            stream.feed(chunk);
        }

        let mut decoded = Vec::new();
        while let Some(packet) = stream.flush_next_packet().unwrap() {
            decoded.push(packet);
        }

        assert_eq!(decoded, packets);
    }

    #[test]
    fn corrupt_crc_is_fatal_not_resynchronized() {
        let stream = InputStream::new();
        let mut encoded = Packet::ping_with_uid(1).encode();
        *encoded.last_mut().unwrap() ^= 0xFF;
        stream.feed(&encoded);

        let err = stream.flush_next_packet().unwrap_err();
        assert!(matches!(err, DecodeError::CrcMismatch { .. }));
    }

    #[test]
    fn clear_drops_buffered_bytes() {
        let stream = InputStream::new();
        stream.feed(&Packet::ping().encode()[..5]);
        assert!(!stream.is_empty());
        stream.clear();
        assert!(stream.is_empty());
    }
}
