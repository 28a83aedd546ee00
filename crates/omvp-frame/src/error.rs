/// Which part of a packet failed its integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumRegion {
    Header,
    Payload,
}

impl std::fmt::Display for ChecksumRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumRegion::Header => f.write_str("header"),
            ChecksumRegion::Payload => f.write_str("payload"),
        }
    }
}

/// Errors that can occur during packet encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A CRC did not match the bytes it covers.
    #[error("{region} checksum mismatch")]
    ChecksumMismatch { region: ChecksumRegion },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A header with a valid checksum named an opcode this host does not know.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    /// An I/O error occurred while reading or writing packets.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete packet was received.
    #[error("connection closed (incomplete packet)")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether this error is a recoverable integrity failure.
    pub fn is_checksum(&self) -> bool {
        matches!(self, FrameError::ChecksumMismatch { .. })
    }

    /// Whether this error is a read deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

impl From<omvp_transport::TransportError> for FrameError {
    fn from(err: omvp_transport::TransportError) -> Self {
        match err {
            omvp_transport::TransportError::Io(io) => FrameError::Io(io),
            omvp_transport::TransportError::Open { source, .. }
            | omvp_transport::TransportError::Configure { source, .. } => FrameError::Io(source),
            omvp_transport::TransportError::Shutdown => FrameError::ConnectionClosed,
            other => FrameError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
