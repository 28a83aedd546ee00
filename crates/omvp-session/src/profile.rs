//! Profiler control payloads and snapshot decoding.
//!
//! A snapshot is a 4-byte header followed by fixed-stride records:
//!
//! ```text
//! [event_count u8][reserved u8][record_size u16]
//! record: address u32, caller u32, call_count u32, min_ticks u32, max_ticks u32,
//!         total_ticks u64, total_cycles u64, events[event_count] u64, padding
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::control::encode_u32;
use crate::error::{Result, SessionError};

pub const SNAPSHOT_HEADER_SIZE: usize = 4;
/// Record bytes before the per-slot event counters.
pub const RECORD_FIXED_SIZE: usize = 36;

/// How time spent in callees is attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileMode {
    /// A function's totals include its callees.
    Inclusive = 0,
    /// A function's totals exclude its callees.
    Exclusive = 1,
}

impl ProfileMode {
    pub fn from_exclusive(exclusive: bool) -> Self {
        if exclusive {
            ProfileMode::Exclusive
        } else {
            ProfileMode::Inclusive
        }
    }

    pub fn encode(self) -> Bytes {
        encode_u32(self as u32)
    }
}

/// Per-function profiling counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub address: u32,
    pub caller: u32,
    pub call_count: u32,
    pub min_ticks: u32,
    pub max_ticks: u32,
    pub total_ticks: u64,
    pub total_cycles: u64,
    /// One counter per configured event slot.
    pub events: Vec<u64>,
}

impl ProfileEntry {
    pub fn mean_ticks(&self) -> u64 {
        if self.call_count == 0 {
            0
        } else {
            self.total_ticks / u64::from(self.call_count)
        }
    }
}

/// `ProfileEvent` payload: assign hardware event `event_id` to counter `slot`.
pub fn encode_event_type(slot: u32, event_id: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(slot);
    buf.put_u32_le(event_id);
    buf.freeze()
}

/// `ProfileRead` request payload.
pub fn encode_read_request(offset: u32, len: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(offset);
    buf.put_u32_le(len);
    buf.freeze()
}

pub fn decode_read_request(mut payload: &[u8]) -> Result<(u32, u32)> {
    if payload.len() < 8 {
        return Err(SessionError::MalformedFrame(
            "profile read request too short".to_string(),
        ));
    }
    Ok((payload.get_u32_le(), payload.get_u32_le()))
}

/// Minimum record stride for `event_count` counters.
pub fn record_size(event_count: u8) -> usize {
    RECORD_FIXED_SIZE + 8 * usize::from(event_count)
}

/// Serialize entries into a snapshot with tightly packed records.
///
/// Every entry must carry exactly `event_count` counters.
pub fn encode_snapshot(entries: &[ProfileEntry], event_count: u8) -> Result<Bytes> {
    let stride = record_size(event_count);
    let stride_u16 = u16::try_from(stride).map_err(|_| SessionError::PayloadTooLarge {
        size: stride,
        max: u16::MAX as usize,
    })?;
    let mut buf = BytesMut::with_capacity(SNAPSHOT_HEADER_SIZE + stride * entries.len());
    buf.put_u8(event_count);
    buf.put_u8(0);
    buf.put_u16_le(stride_u16);
    for entry in entries {
        if entry.events.len() != usize::from(event_count) {
            return Err(SessionError::MalformedFrame(format!(
                "entry at 0x{:08x} has {} events, snapshot has {event_count}",
                entry.address,
                entry.events.len()
            )));
        }
        buf.put_u32_le(entry.address);
        buf.put_u32_le(entry.caller);
        buf.put_u32_le(entry.call_count);
        buf.put_u32_le(entry.min_ticks);
        buf.put_u32_le(entry.max_ticks);
        buf.put_u64_le(entry.total_ticks);
        buf.put_u64_le(entry.total_cycles);
        for event in &entry.events {
            buf.put_u64_le(*event);
        }
    }
    Ok(buf.freeze())
}

/// Parse a snapshot, trusting its own `event_count` and `record_size`.
pub fn decode_snapshot(snapshot: &[u8]) -> Result<Vec<ProfileEntry>> {
    if snapshot.is_empty() {
        return Ok(Vec::new());
    }
    if snapshot.len() < SNAPSHOT_HEADER_SIZE {
        return Err(SessionError::MalformedFrame(format!(
            "profile header truncated: {} bytes",
            snapshot.len()
        )));
    }

    let mut header = &snapshot[..SNAPSHOT_HEADER_SIZE];
    let event_count = header.get_u8();
    let _reserved = header.get_u8();
    let stride = usize::from(header.get_u16_le());

    let minimum = record_size(event_count);
    if stride < minimum {
        return Err(SessionError::MalformedFrame(format!(
            "profile record size {stride} below minimum {minimum} for {event_count} events"
        )));
    }

    let body = &snapshot[SNAPSHOT_HEADER_SIZE..];
    if body.len() % stride != 0 {
        return Err(SessionError::MalformedFrame(format!(
            "profile body of {} bytes is not a multiple of record size {stride}",
            body.len()
        )));
    }

    let entries = body
        .chunks_exact(stride)
        .map(|mut record| {
            let mut entry = ProfileEntry {
                address: record.get_u32_le(),
                caller: record.get_u32_le(),
                call_count: record.get_u32_le(),
                min_ticks: record.get_u32_le(),
                max_ticks: record.get_u32_le(),
                total_ticks: record.get_u64_le(),
                total_cycles: record.get_u64_le(),
                events: Vec::with_capacity(usize::from(event_count)),
            };
            for _ in 0..event_count {
                entry.events.push(record.get_u64_le());
            }
            entry
        })
        .collect();
    Ok(entries)
}
