use std::io::{ErrorKind, Read};
use std::time::Instant;

use bytes::BytesMut;
use omvp_transport::Transport;

use crate::codec::{decode_packet, CodecConfig, Packet};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Reads complete packets from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete packets.
/// Integrity errors are returned one at a time and the offending bytes are
/// dropped, so calling again continues with the rest of the stream.
pub struct PacketReader<T> {
    inner: T,
    buf: BytesMut,
    config: CodecConfig,
}

impl<T: Read> PacketReader<T> {
    /// Create a new packet reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, CodecConfig::default())
    }

    /// Create a new packet reader with explicit configuration.
    pub fn with_config(inner: T, config: CodecConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete packet (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_packet(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = decode_packet(&mut self.buf, &self.config)? {
                return Ok(packet);
            }
            self.fill()?;
        }
    }

    /// Decode a packet from bytes already buffered, without touching the stream.
    pub fn next_buffered(&mut self) -> Result<Option<Packet>> {
        decode_packet(&mut self.buf, &self.config)
    }

    /// Drop everything buffered but not yet decoded.
    pub fn discard_buffered(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        dropped
    }

    /// Bytes received but not yet decoded.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent packet decoding.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.config.max_payload = max_payload;
    }

    /// Turn checksum verification on or off for subsequent packets.
    pub fn set_crc(&mut self, crc: bool) {
        self.config.crc = crc;
    }

    /// Current decoder configuration.
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }
}

impl<T: Transport> PacketReader<T> {
    /// Read the next packet, giving up at `deadline`.
    ///
    /// Returns `Ok(None)` if the deadline passes first. Bytes of a partial
    /// packet stay buffered for the next call.
    pub fn read_packet_before(&mut self, deadline: Instant) -> Result<Option<Packet>> {
        loop {
            if let Some(packet) = decode_packet(&mut self.buf, &self.config)? {
                return Ok(Some(packet));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.inner.set_read_timeout(Some(deadline - now))?;

            match self.fill() {
                Ok(()) => {}
                Err(err) if err.is_timeout() => continue,
                Err(err) => return Err(err),
            }
        }
    }
}
