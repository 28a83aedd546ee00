//! Frame streaming: control payloads and fragment reassembly.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use omvp_frame::Packet;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Result, SessionError};

/// `[width u32][height u32][depth u32][format u32][raw_size u32]`.
pub const FRAME_HEADER_SIZE: usize = 20;

/// Requested stream resolution. `0×0` keeps the sensor's native size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u16,
    pub height: u16,
}

impl Resolution {
    pub const NATIVE: Resolution = Resolution {
        width: 0,
        height: 0,
    };

    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

/// Payload of a `StreamControl` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    pub enable: bool,
    /// Uncompressed pixels; the device then fills in `raw_size`.
    pub raw: bool,
    pub resolution: Resolution,
}

impl StreamSettings {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u8(u8::from(self.enable));
        buf.put_u8(u8::from(self.raw));
        buf.put_u16_le(self.resolution.width);
        buf.put_u16_le(self.resolution.height);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.len() < 6 {
            return Err(SessionError::MalformedFrame(format!(
                "stream control too short: {} bytes",
                payload.len()
            )));
        }
        Ok(Self {
            enable: payload.get_u8() != 0,
            raw: payload.get_u8() != 0,
            resolution: Resolution {
                width: payload.get_u16_le(),
                height: payload.get_u16_le(),
            },
        })
    }
}

/// One complete image from the stream. Pixel data is left undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Bytes per pixel, or 0 for compressed formats.
    pub depth: u32,
    /// Device pixel-format code.
    pub format: u32,
    /// Expected data length for raw frames; 0 when not applicable.
    pub raw_size: u32,
    pub data: Bytes,
}

impl Frame {
    /// Wire form: header followed by data, unfragmented.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.data.len());
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.depth);
        buf.put_u32_le(self.format);
        buf.put_u32_le(self.raw_size);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// Largest reassembled frame accepted, header included.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reassembles `StreamFrame` fragments and keeps only the newest result.
///
/// Reassembly is bounded: by `raw_size` in raw mode once the header is in,
/// and by a fixed ceiling otherwise.
#[derive(Debug)]
pub struct FrameDecoder {
    partial: Option<BytesMut>,
    slot: Option<std::result::Result<Frame, String>>,
    raw: bool,
    superseded: u64,
    limit: usize,
    /// Dropping the remaining fragments of an oversized frame.
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A decoder that rejects frames larger than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            partial: None,
            slot: None,
            raw: false,
            superseded: 0,
            limit,
            discarding: false,
        }
    }

    /// Whether raw-size checking applies to completed frames.
    pub fn set_raw(&mut self, raw: bool) {
        self.raw = raw;
    }

    /// Feed one `StreamFrame` packet.
    pub fn push(&mut self, packet: &Packet) {
        if self.discarding {
            self.discarding = packet.is_fragment();
            return;
        }

        let (raw, ceiling) = (self.raw, self.limit);
        let buf = self.partial.get_or_insert_with(BytesMut::new);
        buf.extend_from_slice(&packet.payload);
        let limit = reassembly_limit(buf, raw, ceiling);
        if buf.len() > limit {
            let size = buf.len();
            self.partial = None;
            self.discarding = packet.is_fragment();
            debug!(size, limit, "oversized frame dropped");
            self.store(Err(format!("frame exceeds {limit} bytes ({size} so far)")));
            return;
        }
        if packet.is_fragment() {
            trace!(buffered = buf.len(), "frame fragment");
            return;
        }

        let Some(complete) = self.partial.take() else {
            return;
        };
        let result = decode_frame(complete.freeze(), self.raw);
        self.store(result);
    }

    fn store(&mut self, result: std::result::Result<Frame, String>) {
        if self.slot.is_some() {
            self.superseded += 1;
            trace!(superseded = self.superseded, "undelivered frame replaced");
        }
        self.slot = Some(result);
    }

    /// Take the newest undelivered frame, or its decode failure.
    pub fn take(&mut self) -> Result<Option<Frame>> {
        match self.slot.take() {
            None => Ok(None),
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(reason)) => Err(SessionError::MalformedFrame(reason)),
        }
    }

    /// Drop a half-assembled frame. The delivery slot is untouched.
    pub fn reset_partial(&mut self) {
        self.discarding = false;
        if let Some(partial) = self.partial.take() {
            debug!(dropped = partial.len(), "discarded partial frame");
        }
    }

    /// Frames overwritten before anyone read them.
    pub fn superseded(&self) -> u64 {
        self.superseded
    }
}

/// Bytes a frame may grow to, given what has arrived so far.
fn reassembly_limit(buf: &[u8], raw: bool, ceiling: usize) -> usize {
    if !raw || buf.len() < FRAME_HEADER_SIZE {
        return ceiling;
    }
    let mut raw_size = &buf[FRAME_HEADER_SIZE - 4..FRAME_HEADER_SIZE];
    match raw_size.get_u32_le() as usize {
        0 => ceiling,
        size => ceiling.min(FRAME_HEADER_SIZE.saturating_add(size)),
    }
}

fn decode_frame(mut bytes: Bytes, raw: bool) -> std::result::Result<Frame, String> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(format!(
            "frame header truncated: {} of {FRAME_HEADER_SIZE} bytes",
            bytes.len()
        ));
    }
    let width = bytes.get_u32_le();
    let height = bytes.get_u32_le();
    let depth = bytes.get_u32_le();
    let format = bytes.get_u32_le();
    let raw_size = bytes.get_u32_le();

    if raw && raw_size != 0 && bytes.len() != raw_size as usize {
        return Err(format!(
            "raw frame size mismatch: header says {raw_size}, got {} bytes",
            bytes.len()
        ));
    }

    Ok(Frame {
        width,
        height,
        depth,
        format,
        raw_size,
        data: bytes,
    })
}

#[cfg(test)]
mod tests {
    use omvp_frame::{Flags, Opcode};

    use super::*;

    fn frame(tag: u8, len: usize) -> Frame {
        Frame {
            width: 4,
            height: 2,
            depth: 1,
            format: 0,
            raw_size: len as u32,
            data: Bytes::from(vec![tag; len]),
        }
    }

    fn packets(wire: &Bytes, fragment: usize) -> Vec<Packet> {
        let chunks: Vec<&[u8]> = wire.chunks(fragment).collect();
        let last = chunks.len() - 1;
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let flags = if i < last {
                    Flags::EVENT | Flags::FRAGMENT
                } else {
                    Flags::EVENT
                };
                Packet::new(Opcode::StreamFrame, flags, 0, chunk.to_vec())
            })
            .collect()
    }

    #[test]
    fn test_settings_layout() {
        let settings = StreamSettings {
            enable: true,
            raw: false,
            resolution: Resolution::new(320, 240),
        };
        let wire = settings.encode();
        assert_eq!(wire.as_ref(), &[1, 0, 0x40, 0x01, 0xF0, 0x00]);
        assert_eq!(StreamSettings::decode(&wire).unwrap(), settings);
    }

    #[test]
    fn test_none_before_any_frame() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.take().unwrap().is_none());
    }

    #[test]
    fn test_reassembles_fragments() {
        let mut decoder = FrameDecoder::new();
        let expected = frame(7, 8);
        for packet in packets(&expected.encode(), 10) {
            decoder.push(&packet);
        }
        assert_eq!(decoder.take().unwrap(), Some(expected));
        assert!(decoder.take().unwrap().is_none());
    }

    #[test]
    fn test_latest_wins() {
        let mut decoder = FrameDecoder::new();
        for tag in [1u8, 2] {
            for packet in packets(&frame(tag, 8).encode(), 16) {
                decoder.push(&packet);
            }
        }
        let got = decoder.take().unwrap().unwrap();
        assert_eq!(got.data[0], 2);
        assert_eq!(decoder.superseded(), 1);
        assert!(decoder.take().unwrap().is_none());
    }

    #[test]
    fn test_short_header_is_malformed_once() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&Packet::new(Opcode::StreamFrame, Flags::EVENT, 0, vec![0u8; 10]));
        assert!(matches!(
            decoder.take(),
            Err(SessionError::MalformedFrame(_))
        ));
        assert!(decoder.take().unwrap().is_none());
    }

    #[test]
    fn test_raw_size_checked_only_in_raw_mode() {
        let mut bad = frame(3, 8);
        bad.raw_size = 12;

        let mut decoder = FrameDecoder::new();
        decoder.push(&Packet::new(Opcode::StreamFrame, Flags::EVENT, 0, bad.encode()));
        assert!(decoder.take().unwrap().is_some());

        decoder.set_raw(true);
        decoder.push(&Packet::new(Opcode::StreamFrame, Flags::EVENT, 0, bad.encode()));
        assert!(matches!(
            decoder.take(),
            Err(SessionError::MalformedFrame(_))
        ));

        bad.raw_size = 0;
        decoder.push(&Packet::new(Opcode::StreamFrame, Flags::EVENT, 0, bad.encode()));
        assert!(decoder.take().unwrap().is_some());
    }

    #[test]
    fn test_reset_partial_discards_fragments() {
        let mut decoder = FrameDecoder::new();
        let wire = frame(9, 8).encode();
        let parts = packets(&wire, 10);
        decoder.push(&parts[0]);
        decoder.reset_partial();

        let fresh = frame(5, 8);
        for packet in packets(&fresh.encode(), 10) {
            decoder.push(&packet);
        }
        assert_eq!(decoder.take().unwrap(), Some(fresh));
    }

    #[test]
    fn test_endless_fragments_are_bounded() {
        let mut decoder = FrameDecoder::with_limit(64);
        let fragment = Packet::new(
            Opcode::StreamFrame,
            Flags::EVENT | Flags::FRAGMENT,
            0,
            vec![0u8; 16],
        );
        for _ in 0..100 {
            decoder.push(&fragment);
            assert!(decoder.partial.as_ref().map_or(0, BytesMut::len) <= 64);
        }
        assert!(matches!(
            decoder.take(),
            Err(SessionError::MalformedFrame(_))
        ));

        // The tail of the dropped frame is skipped, then decoding resumes.
        decoder.push(&Packet::new(Opcode::StreamFrame, Flags::EVENT, 0, vec![0u8; 4]));
        assert!(decoder.take().unwrap().is_none());
        let next = frame(6, 8);
        decoder.push(&Packet::new(Opcode::StreamFrame, Flags::EVENT, 0, next.encode()));
        assert_eq!(decoder.take().unwrap(), Some(next));
    }

    #[test]
    fn test_raw_frame_bounded_by_declared_size() {
        let mut decoder = FrameDecoder::new();
        decoder.set_raw(true);
        let mut oversized = frame(1, 8).encode().to_vec();
        oversized.extend_from_slice(&[1u8; 4]);
        for packet in packets(&Bytes::from(oversized), 10) {
            decoder.push(&packet);
        }
        let err = decoder.take().unwrap_err();
        assert!(err.to_string().contains("exceeds 28 bytes"), "{err}");
        assert!(decoder.partial.is_none());
    }
}
