//! Payload layouts for the link-control, script and channel opcodes.
//!
//! All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Longest channel name a tag byte can describe.
pub const MAX_CHANNEL_NAME: usize = u8::MAX as usize;

/// Built-in channel carrying script text output.
pub const STDOUT_CHANNEL: &str = "stdout";

/// NAK status: the named channel does not exist on the device.
pub const NAK_NO_CHANNEL: u8 = 0x01;
/// NAK status: malformed request payload.
pub const NAK_BAD_REQUEST: u8 = 0x02;
/// NAK status: opcode not valid in this direction or state.
pub const NAK_UNSUPPORTED: u8 = 0x03;

fn malformed(what: &str, detail: impl std::fmt::Display) -> SessionError {
    SessionError::MalformedFrame(format!("{what}: {detail}"))
}

fn need(buf: &[u8], len: usize, what: &str) -> Result<()> {
    if buf.len() < len {
        return Err(malformed(
            what,
            format_args!("need {len} bytes, got {}", buf.len()),
        ));
    }
    Ok(())
}

/// Feature switches and packet size exchanged in the `Caps` handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub crc: bool,
    pub seq: bool,
    pub ack: bool,
    pub events: bool,
    pub max_payload: u16,
}

impl Capabilities {
    const CRC: u8 = 0x01;
    const SEQ: u8 = 0x02;
    const ACK: u8 = 0x04;
    const EVENTS: u8 = 0x08;

    pub fn encode(&self) -> Bytes {
        let mut flags = 0u8;
        if self.crc {
            flags |= Self::CRC;
        }
        if self.seq {
            flags |= Self::SEQ;
        }
        if self.ack {
            flags |= Self::ACK;
        }
        if self.events {
            flags |= Self::EVENTS;
        }
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u8(flags);
        buf.put_u16_le(self.max_payload);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        need(payload, 3, "caps")?;
        let flags = payload.get_u8();
        Ok(Self {
            crc: flags & Self::CRC != 0,
            seq: flags & Self::SEQ != 0,
            ack: flags & Self::ACK != 0,
            events: flags & Self::EVENTS != 0,
            max_payload: payload.get_u16_le(),
        })
    }

    /// Features both sides enabled, and the smaller payload limit.
    pub fn intersect(&self, other: &Capabilities) -> Capabilities {
        Capabilities {
            crc: self.crc && other.crc,
            seq: self.seq && other.seq,
            ack: self.ack && other.ack,
            events: self.events && other.events,
            max_payload: self.max_payload.min(other.max_payload),
        }
    }
}

/// Firmware release reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.major, self.minor, self.patch])
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        need(payload, 3, "version")?;
        Ok(Self {
            major: payload[0],
            minor: payload[1],
            patch: payload[2],
        })
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Device state flags.
///
/// Bit layout matches the firmware debug flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Status {
    pub script_running: bool,
    pub stdout_pending: bool,
    pub frame_pending: bool,
    pub profile_enabled: bool,
    pub profile_has_pmu: bool,
}

impl Status {
    const SCRIPT_RUNNING: u32 = 1 << 0;
    const TEXTBUF_NOTEMPTY: u32 = 1 << 1;
    const FRAMEBUF_READY: u32 = 1 << 2;
    const PROFILE_ENABLED: u32 = 1 << 3;
    const PROFILE_HAS_PMU: u32 = 1 << 4;

    pub fn from_bits(bits: u32) -> Self {
        Self {
            script_running: bits & Self::SCRIPT_RUNNING != 0,
            stdout_pending: bits & Self::TEXTBUF_NOTEMPTY != 0,
            frame_pending: bits & Self::FRAMEBUF_READY != 0,
            profile_enabled: bits & Self::PROFILE_ENABLED != 0,
            profile_has_pmu: bits & Self::PROFILE_HAS_PMU != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        for (set, bit) in [
            (self.script_running, Self::SCRIPT_RUNNING),
            (self.stdout_pending, Self::TEXTBUF_NOTEMPTY),
            (self.frame_pending, Self::FRAMEBUF_READY),
            (self.profile_enabled, Self::PROFILE_ENABLED),
            (self.profile_has_pmu, Self::PROFILE_HAS_PMU),
        ] {
            if set {
                bits |= bit;
            }
        }
        bits
    }

    pub fn encode(&self) -> Bytes {
        encode_u32(self.bits())
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(Self::from_bits(decode_u32(payload, "status")?))
    }
}

pub fn encode_u32(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

pub fn decode_u32(mut payload: &[u8], what: &str) -> Result<u32> {
    need(payload, 4, what)?;
    Ok(payload.get_u32_le())
}

/// `[count u8]` followed by length-prefixed names.
pub fn encode_channel_list<S: AsRef<str>>(names: &[S]) -> Result<Bytes> {
    let count = u8::try_from(names.len()).map_err(|_| SessionError::PayloadTooLarge {
        size: names.len(),
        max: u8::MAX as usize,
    })?;
    let mut buf = BytesMut::new();
    buf.put_u8(count);
    for name in names {
        put_name(&mut buf, name.as_ref())?;
    }
    Ok(buf.freeze())
}

pub fn decode_channel_list(mut payload: &[u8]) -> Result<Vec<String>> {
    need(payload, 1, "channel list")?;
    let count = payload.get_u8();
    let mut names = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        names.push(take_name(&mut payload, "channel list")?);
    }
    Ok(names)
}

/// `[name_len u8][name][data]`.
pub fn encode_tagged(name: &str, data: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(1 + name.len() + data.len());
    put_name(&mut buf, name)?;
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Split a channel-tagged payload into its name and data.
pub fn decode_tagged(payload: &Bytes) -> Result<(String, Bytes)> {
    let mut cursor = payload.as_ref();
    let name = take_name(&mut cursor, "channel tag")?;
    let data = payload.slice(1 + name.len()..);
    Ok((name, data))
}

/// NAK payloads carry a single status byte; an empty NAK reads as 0.
pub fn decode_nak(payload: &[u8]) -> u8 {
    payload.first().copied().unwrap_or(0)
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<()> {
    if name.len() > MAX_CHANNEL_NAME {
        return Err(SessionError::PayloadTooLarge {
            size: name.len(),
            max: MAX_CHANNEL_NAME,
        });
    }
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn take_name(payload: &mut &[u8], what: &str) -> Result<String> {
    need(payload, 1, what)?;
    let len = usize::from(payload.get_u8());
    need(payload, len, what)?;
    let name = std::str::from_utf8(&payload[..len])
        .map_err(|e| malformed(what, e))?
        .to_string();
    payload.advance(len);
    Ok(name)
}
