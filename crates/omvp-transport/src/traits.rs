use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Shortest read timeout handed to socket-backed streams.
///
/// `UnixStream::set_read_timeout(Some(Duration::ZERO))` is rejected by std, so
/// zero is rounded up to this value.
const MIN_SOCKET_TIMEOUT: Duration = Duration::from_micros(100);

/// A duplex byte stream the protocol engine can own for a session.
///
/// Implementors must support splitting into a reader and a writer half via
/// [`Transport::try_clone`]; both halves refer to the same underlying link.
pub trait Transport: Read + Write {
    /// Set the read timeout. `None` blocks indefinitely.
    ///
    /// A timed-out read fails with `ErrorKind::WouldBlock` or
    /// `ErrorKind::TimedOut`.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Create a second handle to the same link.
    fn try_clone(&self) -> Result<Self>
    where
        Self: Sized;

    /// Transport name for diagnostics.
    fn transport_name(&self) -> &'static str;
}

/// A connected serial byte stream.
///
/// On Unix this is either a raw-mode tty device or a Unix domain socket that
/// bridges a serial line (emulators, `socat`, in-process test pairs).
pub struct SerialStream {
    inner: SerialStreamInner,
}

enum SerialStreamInner {
    #[cfg(unix)]
    Tty(crate::serial::TtyPort),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl SerialStream {
    /// Open a port by name.
    ///
    /// `unix:<path>` connects to a Unix-socket bridged serial line. Anything
    /// else is treated as a tty device path and configured for raw I/O at
    /// `baudrate`.
    #[cfg(unix)]
    pub fn open(port: &str, baudrate: u32) -> Result<Self> {
        match port.strip_prefix("unix:") {
            Some(path) => {
                let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
                    crate::TransportError::Open {
                        path: path.into(),
                        source: e,
                    }
                })?;
                tracing::debug!(path, "connected to unix-bridged serial line");
                Ok(Self::from_unix(stream))
            }
            None => {
                let tty = crate::serial::TtyPort::open(port, baudrate)?;
                Ok(Self {
                    inner: SerialStreamInner::Tty(tty),
                })
            }
        }
    }

    /// Create a connected in-process pair.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Wrap an already-connected Unix stream.
    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: SerialStreamInner::Unix(stream),
        }
    }
}

impl Read for SerialStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            SerialStreamInner::Tty(port) => port.read(buf),
            #[cfg(unix)]
            SerialStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for SerialStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            SerialStreamInner::Tty(port) => port.write(buf),
            #[cfg(unix)]
            SerialStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            SerialStreamInner::Tty(port) => port.flush(),
            #[cfg(unix)]
            SerialStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl Transport for SerialStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            SerialStreamInner::Tty(port) => {
                port.set_read_timeout(timeout);
                Ok(())
            }
            #[cfg(unix)]
            SerialStreamInner::Unix(stream) => stream
                .set_read_timeout(timeout.map(|t| t.max(MIN_SOCKET_TIMEOUT)))
                .map_err(Into::into),
        }
    }

    fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            SerialStreamInner::Tty(port) => Ok(Self {
                inner: SerialStreamInner::Tty(port.try_clone()?),
            }),
            #[cfg(unix)]
            SerialStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
        }
    }

    fn transport_name(&self) -> &'static str {
        match &self.inner {
            #[cfg(unix)]
            SerialStreamInner::Tty(_) => "serial-tty",
            #[cfg(unix)]
            SerialStreamInner::Unix(_) => "unix-serial-bridge",
        }
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(
            self,
            timeout.map(|t| t.max(MIN_SOCKET_TIMEOUT)),
        )
        .map_err(Into::into)
    }

    fn try_clone(&self) -> Result<Self> {
        std::os::unix::net::UnixStream::try_clone(self).map_err(Into::into)
    }

    fn transport_name(&self) -> &'static str {
        "unix-stream"
    }
}

impl std::fmt::Debug for SerialStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialStream")
            .field("type", &self.transport_name())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::ErrorKind;
    use std::os::unix::net::UnixListener;

    use super::*;

    #[test]
    fn pair_roundtrip() {
        let (mut left, mut right) = SerialStream::pair().unwrap();
        left.write_all(b"hello").unwrap();

        let mut buf = [0u8; 5];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(left.transport_name(), "unix-serial-bridge");
    }

    #[test]
    fn read_timeout_expires() {
        let (_left, mut right) = SerialStream::pair().unwrap();
        right
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();

        let mut buf = [0u8; 1];
        let err = right.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::WouldBlock | ErrorKind::TimedOut
        ));
    }

    #[test]
    fn zero_timeout_is_accepted() {
        let (_left, mut right) = SerialStream::pair().unwrap();
        assert!(right.set_read_timeout(Some(Duration::ZERO)).is_ok());
    }

    #[test]
    fn cloned_halves_share_the_link() {
        let (left, mut right) = SerialStream::pair().unwrap();
        let mut writer = left.try_clone().unwrap();
        writer.write_all(b"x").unwrap();

        let mut buf = [0u8; 1];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
        drop(left);
    }

    #[test]
    fn open_unix_bridge() {
        let dir = std::env::temp_dir().join(format!("omvp-bridge-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("serial.sock");
        let _ = std::fs::remove_file(&sock_path);
        let listener = UnixListener::bind(&sock_path).unwrap();

        let port = format!("unix:{}", sock_path.display());
        let mut stream = SerialStream::open(&port, 921_600).unwrap();
        let (mut device, _) = listener.accept().unwrap();

        stream.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        device.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn open_missing_unix_bridge_fails() {
        let result = SerialStream::open("unix:/nonexistent/omvp.sock", 921_600);
        assert!(matches!(result, Err(crate::TransportError::Open { .. })));
    }
}
