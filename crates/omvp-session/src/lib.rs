//! Reliable sessions with an OMVP device.
//!
//! This is the "just works" layer. [`connect`] opens a port and performs the
//! handshake; the returned [`Session`] runs scripts, moves bytes on named
//! channels, pulls stream frames and reads profiler snapshots.
//!
//! Below the session, [`Link`] resends corrupted or lost requests, recovers
//! from sequence gaps with a resync, and queues device events.

pub mod config;
pub mod connector;
pub mod control;
pub mod error;
pub mod handshake;
pub mod link;
pub mod mux;
pub mod profile;
pub mod session;
pub mod stats;
pub mod stream;

pub use config::{SessionConfig, MAX_MAX_PAYLOAD, MIN_MAX_PAYLOAD};
pub use connector::connect;
pub use control::{Capabilities, FirmwareVersion, Status, STDOUT_CHANNEL};
pub use error::{Result, SessionError};
pub use handshake::{handshake, HandshakeResult};
pub use link::{ConnectionState, Link, LinkEvent, Request};
pub use mux::ChannelMux;
pub use profile::{ProfileEntry, ProfileMode};
pub use session::Session;
pub use stats::Statistics;
pub use stream::{Frame, FrameDecoder, Resolution, StreamSettings};
