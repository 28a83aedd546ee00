use std::path::PathBuf;

/// Errors that can occur in serial transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to open the specified port.
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The port opened but could not be switched to raw mode.
    #[error("failed to configure {path}: {source}")]
    Configure {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The requested baud rate has no termios equivalent on this platform.
    #[error("unsupported baud rate {0}")]
    UnsupportedBaudrate(u32),

    /// Drop rate outside `0.0..=1.0`.
    #[error("invalid drop rate {0} (expected 0.0..=1.0)")]
    InvalidDropRate(f64),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device hung up (USB unplug, peer closed the bridge).
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// Whether the failure means the link is gone rather than transiently busy.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Shutdown => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}


pub type Result<T> = std::result::Result<T, TransportError>;
