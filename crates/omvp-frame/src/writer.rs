use std::io::{ErrorKind, Write};

use bytes::{Bytes, BytesMut};

use crate::codec::{encode_packet, Packet, DEFAULT_MAX_PAYLOAD};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete packets to any `Write` stream.
pub struct PacketWriter<T> {
    inner: T,
    buf: BytesMut,
    max_payload: usize,
}

impl<T: Write> PacketWriter<T> {
    /// Create a new packet writer with the default payload limit.
    pub fn new(inner: T) -> Self {
        Self::with_max_payload(inner, DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(inner: T, max_payload: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_payload,
        }
    }

    /// Encode a packet into wire bytes without sending it.
    pub fn encode(&mut self, packet: &Packet) -> Result<Bytes> {
        if packet.payload.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: packet.payload.len(),
                max: self.max_payload,
            });
        }
        self.buf.clear();
        encode_packet(packet, &mut self.buf)?;
        Ok(self.buf.split().freeze())
    }

    /// Encode and send a packet (blocking). Returns the exact bytes written.
    pub fn write_packet(&mut self, packet: &Packet) -> Result<Bytes> {
        let wire = self.encode(packet)?;
        self.write_raw(&wire)?;
        Ok(wire)
    }

    /// Send previously encoded bytes byte-for-byte.
    pub fn write_raw(&mut self, wire: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < wire.len() {
            match self.inner.write(&wire[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
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

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent packet encoding.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}
