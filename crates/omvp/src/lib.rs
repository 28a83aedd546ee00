//! Host-side engine for the OpenMV serial protocol (OMVP).
//!
//! Talks to a camera board over a serial line: runs scripts, reads their
//! output, moves bytes on named channels, pulls the frame stream and reads
//! profiler snapshots, while retrying and resynchronizing over a lossy link.
//!
//! # Crate Structure
//!
//! - [`transport`]: Serial tty and socket-bridged byte streams, fault injection
//! - [`frame`]: Packet framing, checksums and sequence numbers
//! - [`session`]: Reliable sessions and the device-facing API (behind `session` feature)

/// Re-export transport types.
pub mod transport {
    pub use omvp_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use omvp_frame::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use omvp_session::*;
}

#[cfg(feature = "session")]
pub use omvp_session::{connect, Session, SessionConfig, SessionError};
