use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::crc::{crc16, crc32};
use crate::error::{ChecksumRegion, FrameError, Result};
use crate::opcode::{Flags, Opcode, PacketKind};

/// Packet header: sync (2) + seq (1) + opcode (1) + flags (1) + length (2) + CRC-16 (2).
pub const HEADER_SIZE: usize = 9;

/// Trailing payload CRC-32, present only for non-empty payloads.
pub const PAYLOAD_CRC_SIZE: usize = 4;

/// Sync marker that opens every packet.
pub const SYNC: [u8; 2] = [0xD5, 0xAA];

/// Default maximum payload size negotiated with the device.
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;

const HEADER_CRC_OFFSET: usize = 7;

/// A decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: Opcode,
    pub flags: Flags,
    pub sequence: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(opcode: Opcode, flags: Flags, sequence: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            flags,
            sequence,
            payload: payload.into(),
        }
    }

    /// Role of this packet as derived from its flags.
    pub fn kind(&self) -> PacketKind {
        PacketKind::from_flags(self.flags)
    }

    /// Whether more fragments of the same message follow.
    pub fn is_fragment(&self) -> bool {
        self.flags.contains(Flags::FRAGMENT)
    }

    /// The total wire size of this packet.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE
            + self.payload.len()
            + if self.payload.is_empty() {
                0
            } else {
                PAYLOAD_CRC_SIZE
            }
    }
}

/// Decoder settings fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Largest payload accepted by the decoder.
    pub max_payload: usize,
    /// Verify header and payload CRCs on receive.
    pub crc: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            crc: true,
        }
    }
}

/// Encode a packet into the wire format.
///
/// Wire format:
/// ```text
/// ┌───────────┬─────┬────────┬───────┬──────────┬──────────┬─────────┬──────────┐
/// │ Sync (2B) │ Seq │ Opcode │ Flags │ Length   │ CRC-16   │ Payload │ CRC-32   │
/// │ 0xD5 0xAA │ 1B  │ 1B     │ 1B    │ (2B LE)  │ (2B LE)  │         │ (4B LE)  │
/// └───────────┴─────┴────────┴───────┴──────────┴──────────┴─────────┴──────────┘
/// ```
///
/// The CRC-32 trailer is omitted when the payload is empty. Checksums are
/// always written, whether or not the receiver verifies them.
pub fn encode_packet(packet: &Packet, dst: &mut BytesMut) -> Result<()> {
    let len = packet.payload.len();
    if len > usize::from(u16::MAX) {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: usize::from(u16::MAX),
        });
    }

    dst.reserve(packet.wire_size());
    let start = dst.len();
    dst.put_slice(&SYNC);
    dst.put_u8(packet.sequence);
    dst.put_u8(packet.opcode.as_u8());
    dst.put_u8(packet.flags.bits());
    dst.put_u16_le(len as u16);
    let header_crc = crc16(&dst[start..start + HEADER_CRC_OFFSET]);
    dst.put_u16_le(header_crc);

    if len > 0 {
        dst.put_slice(&packet.payload);
        dst.put_u32_le(crc32(&packet.payload));
    }
    Ok(())
}

/// Decode a packet from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete packet yet.
/// Bytes preceding the sync marker are discarded. On an integrity or header
/// error the offending bytes are consumed so the next call resumes scanning:
/// one byte for a bad header, the whole packet for a bad payload.
pub fn decode_packet(src: &mut BytesMut, config: &CodecConfig) -> Result<Option<Packet>> {
    match src.windows(2).position(|w| w == SYNC) {
        Some(0) => {}
        Some(skip) => {
            trace!(skip, "discarding bytes before sync");
            src.advance(skip);
        }
        None => {
            // Keep a trailing first sync byte; its partner may still be in flight.
            let keep = usize::from(src.last() == Some(&SYNC[0]));
            let skip = src.len() - keep;
            if skip > 0 {
                trace!(skip, "discarding bytes without sync");
                src.advance(skip);
            }
            return Ok(None);
        }
    }

    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    if config.crc {
        let expected = crc16(&src[..HEADER_CRC_OFFSET]);
        let actual = u16::from_le_bytes([src[HEADER_CRC_OFFSET], src[HEADER_CRC_OFFSET + 1]]);
        if expected != actual {
            src.advance(1);
            return Err(FrameError::ChecksumMismatch {
                region: ChecksumRegion::Header,
            });
        }
    }

    let sequence = src[2];
    let opcode = match Opcode::try_from(src[3]) {
        Ok(op) => op,
        Err(byte) => {
            src.advance(1);
            return Err(FrameError::UnknownOpcode(byte));
        }
    };
    let flags = Flags::from_bits(src[4]);
    let payload_len = usize::from(u16::from_le_bytes([src[5], src[6]]));

    if payload_len > config.max_payload {
        src.advance(1);
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: config.max_payload,
        });
    }

    let trailer = if payload_len > 0 { PAYLOAD_CRC_SIZE } else { 0 };
    let total = HEADER_SIZE + payload_len + trailer;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    if config.crc && payload_len > 0 {
        let body = &src[HEADER_SIZE..HEADER_SIZE + payload_len];
        let at = HEADER_SIZE + payload_len;
        let actual = u32::from_le_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]]);
        if crc32(body) != actual {
            src.advance(total);
            return Err(FrameError::ChecksumMismatch {
                region: ChecksumRegion::Payload,
            });
        }
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();
    src.advance(trailer);

    Ok(Some(Packet {
        opcode,
        flags,
        sequence,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn cfg() -> CodecConfig {
        CodecConfig::default()
    }

    fn encoded(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_packet(packet, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_known_wire_bytes_empty_payload() {
        let packet = Packet::new(Opcode::Sync, Flags::ACK_REQ, 0, Bytes::new());
        let buf = encoded(&packet);
        assert_eq!(
            buf.as_ref(),
            &[0xD5, 0xAA, 0x00, 0x00, 0x04, 0x00, 0x00, 0x01, 0x53]
        );
    }

    #[test]
    fn test_known_wire_bytes_with_payload() {
        let packet = Packet::new(Opcode::Status, Flags::ACK, 7, vec![1, 0, 0, 0]);
        let buf = encoded(&packet);
        assert_eq!(
            buf.as_ref(),
            &[
                0xD5, 0xAA, 0x07, 0x12, 0x01, 0x04, 0x00, 0x4C, 0xA8, 0x01, 0x00, 0x00, 0x00,
                0xEA, 0x37, 0xDC, 0xC5
            ]
        );
        assert_eq!(buf.len(), packet.wire_size());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let packet = Packet::new(Opcode::ChannelData, Flags::EVENT, 200, &b"hello, omvp!"[..]);
        let mut buf = encoded(&packet);

        let decoded = decode_packet(&mut buf, &cfg()).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.kind(), PacketKind::Event);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0xD5, 0xAA, 0x00][..]);
        assert!(decode_packet(&mut buf, &cfg()).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = encoded(&Packet::new(Opcode::Status, Flags::ACK, 1, &b"hello"[..]));
        buf.truncate(HEADER_SIZE + 2);
        assert!(decode_packet(&mut buf, &cfg()).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 2);
    }

    #[test]
    fn test_leading_garbage_discarded() {
        let mut buf = BytesMut::from(&[0x00, 0x13, 0xAA, 0xD5, 0x01][..]);
        buf.extend_from_slice(&encoded(&Packet::new(
            Opcode::Version,
            Flags::ACK,
            3,
            vec![4, 7, 0],
        )));

        let decoded = decode_packet(&mut buf, &cfg()).unwrap().unwrap();
        assert_eq!(decoded.opcode, Opcode::Version);
        assert_eq!(decoded.payload.as_ref(), &[4, 7, 0]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_trailing_sync_byte_retained() {
        let mut buf = BytesMut::from(&[0x01, 0x02, 0xD5][..]);
        assert!(decode_packet(&mut buf, &cfg()).unwrap().is_none());
        assert_eq!(buf.as_ref(), &[0xD5]);

        let mut buf = BytesMut::from(&[0x01, 0x02, 0x03][..]);
        assert!(decode_packet(&mut buf, &cfg()).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_crc_mismatch_consumes_one_byte() {
        let mut buf = encoded(&Packet::new(Opcode::Caps, Flags::ACK, 0, Bytes::new()));
        buf[7] ^= 0xFF;
        let before = buf.len();

        let err = decode_packet(&mut buf, &cfg()).unwrap_err();
        assert!(matches!(
            err,
            FrameError::ChecksumMismatch {
                region: ChecksumRegion::Header
            }
        ));
        assert_eq!(buf.len(), before - 1);
    }

    #[test]
    fn test_payload_crc_mismatch_consumes_packet() {
        let mut buf = encoded(&Packet::new(Opcode::Status, Flags::ACK, 0, vec![9u8; 8]));
        buf.extend_from_slice(&encoded(&Packet::new(Opcode::Sync, Flags::ACK, 0, Bytes::new())));
        buf[HEADER_SIZE + 1] ^= 0x10;

        let err = decode_packet(&mut buf, &cfg()).unwrap_err();
        assert!(matches!(
            err,
            FrameError::ChecksumMismatch {
                region: ChecksumRegion::Payload
            }
        ));

        let next = decode_packet(&mut buf, &cfg()).unwrap().unwrap();
        assert_eq!(next.opcode, Opcode::Sync);
    }

    #[test]
    fn test_crc_disabled_accepts_corrupt_payload() {
        let mut buf = encoded(&Packet::new(Opcode::Status, Flags::ACK, 0, vec![9u8; 8]));
        buf[HEADER_SIZE] ^= 0x01;
        let config = CodecConfig {
            crc: false,
            ..cfg()
        };
        let decoded = decode_packet(&mut buf, &config).unwrap().unwrap();
        assert_eq!(decoded.payload[0], 8);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut raw = BytesMut::new();
        raw.put_slice(&SYNC);
        raw.put_slice(&[0x00, 0x7F, 0x00, 0x00, 0x00]);
        let crc = crc16(&raw[..7]);
        raw.put_u16_le(crc);

        let err = decode_packet(&mut raw, &cfg()).unwrap_err();
        assert!(matches!(err, FrameError::UnknownOpcode(0x7F)));
        assert_eq!(raw.len(), HEADER_SIZE - 1);
    }

    #[test]
    fn test_decode_payload_too_large() {
        let packet = Packet::new(Opcode::StreamFrame, Flags::EVENT, 0, vec![0u8; 128]);
        let mut buf = encoded(&packet);
        let config = CodecConfig {
            max_payload: 64,
            ..cfg()
        };
        let err = decode_packet(&mut buf, &config).unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge { size: 128, max: 64 }
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let packet = Packet::new(Opcode::ScriptExec, Flags::NONE, 0, vec![0u8; 70_000]);
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_packet(&packet, &mut buf),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_multiple_packets() {
        let mut buf = BytesMut::new();
        for seq in 0..3u8 {
            encode_packet(
                &Packet::new(Opcode::ChannelData, Flags::EVENT, seq, vec![seq; 3]),
                &mut buf,
            )
            .unwrap();
        }
        for seq in 0..3u8 {
            let packet = decode_packet(&mut buf, &cfg()).unwrap().unwrap();
            assert_eq!(packet.sequence, seq);
            assert_eq!(packet.payload.as_ref(), &[seq; 3]);
        }
        assert!(buf.is_empty());
    }

    fn any_opcode() -> impl Strategy<Value = Opcode> {
        (0..Opcode::ALL.len()).prop_map(|i| Opcode::ALL[i])
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            opcode in any_opcode(),
            flags in any::<u8>(),
            sequence in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let packet = Packet::new(opcode, Flags::from_bits(flags), sequence, payload);
            let mut buf = encoded(&packet);
            let decoded = decode_packet(&mut buf, &cfg()).unwrap();
            prop_assert_eq!(decoded, Some(packet));
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_single_bit_flip_detected(
            opcode in any_opcode(),
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            pos_seed in any::<usize>(),
            bit in 0u8..8,
        ) {
            let packet = Packet::new(opcode, Flags::ACK, 5, payload);
            let mut buf = encoded(&packet);
            // Everything after the sync marker is covered by a checksum.
            let pos = SYNC.len() + pos_seed % (buf.len() - SYNC.len());
            buf[pos] ^= 1 << bit;

            let config = CodecConfig { max_payload: usize::from(u16::MAX), crc: true };
            let result = decode_packet(&mut buf, &config);
            prop_assert!(
                matches!(result, Err(FrameError::ChecksumMismatch { .. })),
                "flip at {} bit {} gave {:?}", pos, bit, result
            );
        }
    }
}
