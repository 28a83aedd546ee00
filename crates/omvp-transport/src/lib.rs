//! Duplex byte-stream transport for the OMVP host engine.
//!
//! Provides the lowest layer of the stack:
//! - Serial tty ports in raw mode (Linux/macOS)
//! - Unix-socket bridged serial lines (`unix:<path>`), used by emulators
//! - In-process stream pairs for tests
//!
//! [`FaultInjector`] wraps the outbound half of any [`Transport`] and discards
//! a configurable fraction of writes so retry logic can be exercised.

pub mod error;
pub mod fault;
pub mod traits;

#[cfg(unix)]
pub mod serial;

pub use error::{Result, TransportError};
pub use fault::FaultInjector;
pub use traits::{SerialStream, Transport};
