use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// A tty device configured for raw 8N1 byte I/O.
///
/// Read timeouts are implemented with `poll(2)` instead of `VTIME` so that
/// sub-100ms deadlines work and the semantics match socket-backed streams: a
/// read that sees no data before the deadline fails with
/// `ErrorKind::TimedOut`.
pub struct TtyPort {
    file: File,
    path: PathBuf,
    read_timeout: Option<Duration>,
}

impl TtyPort {
    /// Open `path` and switch it to raw mode at `baudrate`.
    pub fn open(path: impl AsRef<Path>, baudrate: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let speed = baud_constant(baudrate)?;

        // O_NONBLOCK keeps open() from waiting on carrier detect.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| TransportError::Open {
                path: path.clone(),
                source: e,
            })?;

        let fd = file.as_raw_fd();
        configure_raw(fd, speed).map_err(|e| TransportError::Configure {
            path: path.clone(),
            source: e,
        })?;
        clear_nonblocking(fd).map_err(|e| TransportError::Configure {
            path: path.clone(),
            source: e,
        })?;

        info!(?path, baudrate, "opened serial port");

        Ok(Self {
            file,
            path,
            read_timeout: None,
        })
    }

    /// The device path this port was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set the read timeout applied to each `read` call.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Duplicate the descriptor. Both handles share the line settings.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
            path: self.path.clone(),
            read_timeout: self.read_timeout,
        })
    }

    fn wait_readable(&self) -> io::Result<()> {
        let Some(timeout) = self.read_timeout else {
            return Ok(());
        };
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        loop {
            // SAFETY: `pfd` is a valid pollfd for an open descriptor and the
            // count passed is exactly one.
            let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if rc == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "serial read timed out",
                ));
            }
            if pfd.revents & libc::POLLIN == 0 && pfd.revents & libc::POLLHUP != 0 {
                debug!(path = ?self.path, "serial device hung up");
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    TransportError::Shutdown,
                ));
            }
            return Ok(());
        }
    }
}

impl Read for TtyPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.wait_readable()?;
        self.file.read(buf)
    }
}

impl Write for TtyPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        // SAFETY: the descriptor is owned by `self.file` and open.
        let rc = unsafe { libc::tcdrain(self.file.as_raw_fd()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl std::fmt::Debug for TtyPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtyPort")
            .field("path", &self.path)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

fn configure_raw(fd: RawFd, speed: libc::speed_t) -> io::Result<()> {
    // SAFETY: an all-zero termios is a valid out-parameter for tcgetattr.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };

    // SAFETY: `fd` is open and `tio` is a valid writable termios.
    if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `tio` was initialised by tcgetattr above.
    unsafe { libc::cfmakeraw(&mut tio) };
    tio.c_cflag |= libc::CLOCAL | libc::CREAD;
    tio.c_cc[libc::VMIN] = 1;
    tio.c_cc[libc::VTIME] = 0;

    // SAFETY: `tio` is a valid termios and `speed` came from baud_constant.
    unsafe {
        if libc::cfsetispeed(&mut tio, speed) != 0 || libc::cfsetospeed(&mut tio, speed) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    // SAFETY: `fd` is open and `tio` is fully initialised.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // Drop whatever the device sent before we were listening.
    // SAFETY: `fd` is open.
    if unsafe { libc::tcflush(fd, libc::TCIOFLUSH) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn clear_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFL/F_SETFL on an open descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Map a numeric baud rate to its termios speed constant.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn baud_constant(baudrate: u32) -> Result<libc::speed_t> {
    let speed = match baudrate {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        460_800 => libc::B460800,
        500_000 => libc::B500000,
        576_000 => libc::B576000,
        921_600 => libc::B921600,
        1_000_000 => libc::B1000000,
        1_500_000 => libc::B1500000,
        2_000_000 => libc::B2000000,
        other => return Err(TransportError::UnsupportedBaudrate(other)),
    };
    Ok(speed)
}

/// BSD-derived systems (macOS included) take the numeric rate directly.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn baud_constant(baudrate: u32) -> Result<libc::speed_t> {
    if baudrate == 0 {
        return Err(TransportError::UnsupportedBaudrate(baudrate));
    }
    Ok(baudrate as libc::speed_t)
}
