use std::time::Duration;

use omvp_frame::Opcode;

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No valid reply within the retry budget.
    #[error("request timed out after {attempts} attempts ({timeout:?} each)")]
    Timeout { attempts: u32, timeout: Duration },

    /// Every retry of a request came back corrupted.
    #[error("checksum mismatch persisted through all retries")]
    ChecksumMismatch,

    /// Sequence numbers still disagreed after a resync.
    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    /// The resync handshake failed; the session is unusable.
    #[error("resync failed: {0}")]
    ResyncFailed(String),

    /// The named channel was never advertised, registered or observed.
    #[error("channel '{0}' is not available")]
    ChannelUnavailable(String),

    /// Payload does not fit the negotiated packet size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A stream frame or profile snapshot could not be decoded.
    #[error("malformed data: {0}")]
    MalformedFrame(String),

    /// The device answered with a NAK.
    #[error("device rejected {opcode} (status {status})")]
    Rejected { opcode: Opcode, status: u8 },

    /// A previous resync failed; no further traffic is possible.
    #[error("session is faulted")]
    Faulted,

    /// The device went away.
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] omvp_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] omvp_frame::FrameError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Lift a frame error, folding a closed or broken link into `Disconnected`.
pub(crate) fn from_frame(err: omvp_frame::FrameError) -> SessionError {
    use std::io::ErrorKind;

    match err {
        omvp_frame::FrameError::ConnectionClosed => {
            SessionError::Disconnected("device closed the link".to_string())
        }
        omvp_frame::FrameError::Io(io)
            if matches!(
                io.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ) =>
        {
            SessionError::Disconnected(io.to_string())
        }
        other => SessionError::Frame(other),
    }
}
