use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

const COUNTER_COUNT: usize = 7;

/// Link counters, kept by the host locally and by the device for `Stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub retries: u64,
    pub checksum_errors: u64,
    pub sequence_errors: u64,
    pub resyncs: u64,
    pub timeouts: u64,
    /// Payload bytes moved per channel, both directions.
    pub bytes_per_channel: BTreeMap<String, u64>,
}

impl Statistics {
    fn counters(&self) -> [u64; COUNTER_COUNT] {
        [
            self.packets_sent,
            self.packets_received,
            self.retries,
            self.checksum_errors,
            self.sequence_errors,
            self.resyncs,
            self.timeouts,
        ]
    }

    /// Counter names paired with values, in wire order.
    pub fn rows(&self) -> Vec<(&'static str, u64)> {
        [
            "packets_sent",
            "packets_received",
            "retries",
            "checksum_errors",
            "sequence_errors",
            "resyncs",
            "timeouts",
        ]
        .into_iter()
        .zip(self.counters())
        .collect()
    }

    /// Wire form of a `Stats` reply. Counters saturate at `u32::MAX`.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        for value in self.counters() {
            buf.put_u32_le(saturate(value));
        }
        let count = u8::try_from(self.bytes_per_channel.len()).map_err(|_| {
            SessionError::PayloadTooLarge {
                size: self.bytes_per_channel.len(),
                max: u8::MAX as usize,
            }
        })?;
        buf.put_u8(count);
        for (name, bytes) in &self.bytes_per_channel {
            let len = u8::try_from(name.len()).map_err(|_| SessionError::PayloadTooLarge {
                size: name.len(),
                max: u8::MAX as usize,
            })?;
            buf.put_u8(len);
            buf.put_slice(name.as_bytes());
            buf.put_u32_le(saturate(*bytes));
        }
        Ok(buf.freeze())
    }

    /// Parse a `Stats` reply. A reply with only the counters is accepted.
    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.len() < COUNTER_COUNT * 4 {
            return Err(SessionError::MalformedFrame(format!(
                "stats reply too short: {} bytes",
                payload.len()
            )));
        }
        let mut next = || u64::from(payload.get_u32_le());
        let mut stats = Statistics {
            packets_sent: next(),
            packets_received: next(),
            retries: next(),
            checksum_errors: next(),
            sequence_errors: next(),
            resyncs: next(),
            timeouts: next(),
            bytes_per_channel: BTreeMap::new(),
        };

        if payload.is_empty() {
            return Ok(stats);
        }
        let count = payload.get_u8();
        for _ in 0..count {
            let truncated = || SessionError::MalformedFrame("stats channel table truncated".into());
            if payload.is_empty() {
                return Err(truncated());
            }
            let len = usize::from(payload.get_u8());
            if payload.len() < len + 4 {
                return Err(truncated());
            }
            let name = String::from_utf8_lossy(&payload[..len]).into_owned();
            payload.advance(len);
            stats
                .bytes_per_channel
                .insert(name, u64::from(payload.get_u32_le()));
        }
        Ok(stats)
    }
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
