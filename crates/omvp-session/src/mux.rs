use std::collections::{BTreeMap, VecDeque};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::control::{encode_tagged, MAX_CHANNEL_NAME};
use crate::error::{Result, SessionError};

/// One named byte channel.
#[derive(Debug, Default)]
struct Channel {
    inbound: VecDeque<Bytes>,
    outbound: VecDeque<Bytes>,
    bytes_in: u64,
    bytes_out: u64,
    /// Advertised at handshake; survives script restarts.
    persistent: bool,
}

/// Demultiplexes channel-tagged payloads into per-name queues.
///
/// Channels come into existence when advertised, registered by the device or
/// first seen in traffic. Only advertised channels outlive the running script.
#[derive(Debug, Default)]
pub struct ChannelMux {
    channels: BTreeMap<String, Channel>,
}

impl ChannelMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `data` for `name`, split so each tagged chunk fits `max_payload`.
    ///
    /// Returns the number of chunks queued.
    pub fn write(&mut self, name: &str, data: &[u8], max_payload: usize) -> Result<usize> {
        let room = chunk_room(name, max_payload)?;
        let channel = self.channels.entry(name.to_string()).or_default();
        let mut queued = 0;
        for chunk in data.chunks(room) {
            channel.outbound.push_back(Bytes::copy_from_slice(chunk));
            queued += 1;
        }
        trace!(channel = name, len = data.len(), chunks = queued, "queued outbound");
        Ok(queued)
    }

    /// Pop the next outbound chunk for `name`, already tagged for the wire.
    pub fn take_outbound(&mut self, name: &str) -> Result<Option<Bytes>> {
        let Some(channel) = self.channels.get_mut(name) else {
            return Ok(None);
        };
        let Some(chunk) = channel.outbound.pop_front() else {
            return Ok(None);
        };
        channel.bytes_out += chunk.len() as u64;
        encode_tagged(name, &chunk).map(Some)
    }

    /// Drop chunks of `name` not yet sent. Returns how many were dropped.
    pub fn clear_outbound(&mut self, name: &str) -> usize {
        let Some(channel) = self.channels.get_mut(name) else {
            return 0;
        };
        let dropped = channel.outbound.len();
        channel.outbound.clear();
        if dropped > 0 {
            debug!(channel = name, chunks = dropped, "dropped unsent chunks");
        }
        dropped
    }

    /// Drain and concatenate everything received on `name`. Never blocks.
    pub fn read(&mut self, name: &str) -> Option<Bytes> {
        let channel = self.channels.get_mut(name)?;
        match channel.inbound.len() {
            0 => None,
            1 => channel.inbound.pop_front(),
            _ => {
                let total = channel.inbound.iter().map(Bytes::len).sum();
                let mut joined = BytesMut::with_capacity(total);
                for chunk in channel.inbound.drain(..) {
                    joined.extend_from_slice(&chunk);
                }
                Some(joined.freeze())
            }
        }
    }

    /// Record inbound data, creating the channel on first sight.
    pub fn deliver(&mut self, name: &str, chunk: Bytes) {
        let channel = self.channels.entry(name.to_string()).or_default();
        if chunk.is_empty() {
            return;
        }
        channel.bytes_in += chunk.len() as u64;
        channel.inbound.push_back(chunk);
    }

    /// A device-announced channel, scoped to the running script.
    pub fn register(&mut self, name: &str) {
        if !self.channels.contains_key(name) {
            debug!(channel = name, "channel registered");
            self.channels.insert(name.to_string(), Channel::default());
        }
    }

    /// Channels known from the handshake; these persist across scripts.
    pub fn advertise<S: AsRef<str>>(&mut self, names: &[S]) {
        for name in names {
            self.channels
                .entry(name.as_ref().to_string())
                .or_default()
                .persistent = true;
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Forget every channel the previous script created.
    pub fn reset_script_channels(&mut self) {
        let before = self.channels.len();
        self.channels.retain(|_, channel| channel.persistent);
        let removed = before - self.channels.len();
        if removed > 0 {
            debug!(removed, "dropped script channels");
        }
    }

    /// Channel names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Payload bytes moved per channel, both directions.
    pub fn bytes_per_channel(&self) -> BTreeMap<String, u64> {
        self.channels
            .iter()
            .map(|(name, ch)| (name.clone(), ch.bytes_in + ch.bytes_out))
            .collect()
    }
}

/// Data bytes that fit in one packet after the name tag.
fn chunk_room(name: &str, max_payload: usize) -> Result<usize> {
    if name.len() > MAX_CHANNEL_NAME {
        return Err(SessionError::PayloadTooLarge {
            size: name.len(),
            max: MAX_CHANNEL_NAME,
        });
    }
    let tag = 1 + name.len();
    if tag >= max_payload {
        return Err(SessionError::PayloadTooLarge {
            size: tag + 1,
            max: max_payload,
        });
    }
    Ok(max_payload - tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::decode_tagged;

    #[test]
    fn test_write_chunks_fit_payload() {
        let mut mux = ChannelMux::new();
        let data: Vec<u8> = (0..200u8).collect();
        // tag is 1 + 6 bytes, leaving 57 per chunk at max_payload 64
        assert_eq!(mux.write("buffer", &data, 64).unwrap(), 4);

        let mut rebuilt = Vec::new();
        while let Some(wire) = mux.take_outbound("buffer").unwrap() {
            assert!(wire.len() <= 64);
            let (name, chunk) = decode_tagged(&wire).unwrap();
            assert_eq!(name, "buffer");
            rebuilt.extend_from_slice(&chunk);
        }
        assert_eq!(rebuilt, data);
        assert_eq!(mux.bytes_per_channel()["buffer"], 200);
    }

    #[test]
    fn test_read_concatenates_and_drains() {
        let mut mux = ChannelMux::new();
        mux.deliver("stdout", Bytes::from_static(b"hello "));
        mux.deliver("stdout", Bytes::from_static(b"world"));

        assert_eq!(mux.read("stdout").unwrap().as_ref(), b"hello world");
        assert!(mux.read("stdout").is_none());
        assert!(mux.read("missing").is_none());
    }

    #[test]
    fn test_has() {
        let mut mux = ChannelMux::new();
        assert!(!mux.has("nonexistent"));

        mux.advertise(&["stdout"]);
        mux.register("telemetry");
        mux.deliver("observed", Bytes::new());

        assert!(mux.has("stdout"));
        assert!(mux.has("telemetry"));
        assert!(mux.has("observed"));
        assert!(!mux.has("nonexistent"));
    }

    #[test]
    fn test_reset_keeps_advertised() {
        let mut mux = ChannelMux::new();
        mux.advertise(&["stdout", "buffer"]);
        mux.register("telemetry");
        mux.deliver("stdout", Bytes::from_static(b"x"));

        mux.reset_script_channels();
        assert_eq!(mux.names(), vec!["buffer".to_string(), "stdout".to_string()]);
        assert_eq!(mux.read("stdout").unwrap().as_ref(), b"x");
    }

    #[test]
    fn test_name_limits() {
        let mut mux = ChannelMux::new();
        let long = "n".repeat(256);
        assert!(matches!(
            mux.write(&long, b"data", 4096),
            Err(SessionError::PayloadTooLarge { .. })
        ));

        let name = "n".repeat(63);
        assert!(matches!(
            mux.write(&name, b"data", 64),
            Err(SessionError::PayloadTooLarge { max: 64, .. })
        ));
        assert!(!mux.has(&name));

        let name = "n".repeat(62);
        assert_eq!(mux.write(&name, b"data", 64).unwrap(), 4);
    }

    #[test]
    fn test_per_channel_order() {
        let mut mux = ChannelMux::new();
        mux.write("a", b"first", 64).unwrap();
        mux.write("b", b"other", 64).unwrap();
        mux.write("a", b"second", 64).unwrap();

        let first = mux.take_outbound("a").unwrap().unwrap();
        let second = mux.take_outbound("a").unwrap().unwrap();
        assert_eq!(&first[2..], b"first");
        assert_eq!(&second[2..], b"second");
        assert!(mux.take_outbound("a").unwrap().is_none());
    }

    #[test]
    fn test_clear_outbound_keeps_later_writes_whole() {
        let mut mux = ChannelMux::new();
        mux.write("buffer", &[b'A'; 150], 64).unwrap();
        mux.take_outbound("buffer").unwrap().unwrap();

        assert_eq!(mux.clear_outbound("buffer"), 2);
        assert_eq!(mux.clear_outbound("missing"), 0);

        mux.write("buffer", b"NEW", 64).unwrap();
        let wire = mux.take_outbound("buffer").unwrap().unwrap();
        assert_eq!(decode_tagged(&wire).unwrap().1.as_ref(), b"NEW");
        assert!(mux.take_outbound("buffer").unwrap().is_none());
        assert_eq!(mux.bytes_per_channel()["buffer"], 57 + 3);
    }
}
