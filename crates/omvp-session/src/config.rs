use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Smallest negotiable packet payload.
pub const MIN_MAX_PAYLOAD: usize = 64;
/// Largest payload the 16-bit length field can describe.
pub const MAX_MAX_PAYLOAD: usize = u16::MAX as usize;

/// Everything needed to open and drive a session.
///
/// Missing fields in a config file fall back to [`SessionConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Serial device path, or `unix:<path>` for a socket-bridged line.
    pub port: String,
    pub baudrate: u32,
    /// Verify CRCs on every received packet.
    pub crc: bool,
    /// Verify sequence numbers on every received packet.
    pub seq: bool,
    /// Request acknowledgement of channel writes and acknowledge device events.
    pub ack: bool,
    /// Let the device push status, channel and frame events.
    pub events: bool,
    /// Per-attempt reply timeout, in seconds in serialized form.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Resends after the first attempt before giving up.
    pub max_retry: u32,
    /// Requested packet payload limit; the device may lower it.
    pub max_payload: usize,
    /// Probability of discarding each outbound write (fault injection).
    pub drop_rate: f64,
    /// Seed for reproducible fault injection.
    pub drop_seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baudrate: 921_600,
            crc: true,
            seq: true,
            ack: false,
            events: true,
            timeout: Duration::from_secs(1),
            max_retry: 3,
            max_payload: 4096,
            drop_rate: 0.0,
            drop_seed: None,
        }
    }
}

impl SessionConfig {
    /// Reject values the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.drop_rate) {
            return Err(SessionError::InvalidConfig(format!(
                "drop_rate {} outside 0.0..=1.0",
                self.drop_rate
            )));
        }
        if !(MIN_MAX_PAYLOAD..=MAX_MAX_PAYLOAD).contains(&self.max_payload) {
            return Err(SessionError::InvalidConfig(format!(
                "max_payload {} outside {MIN_MAX_PAYLOAD}..={MAX_MAX_PAYLOAD}",
                self.max_payload
            )));
        }
        if self.timeout.is_zero() {
            return Err(SessionError::InvalidConfig(
                "timeout must be non-zero".to_string(),
            ));
        }
        if self.port.is_empty() {
            return Err(SessionError::InvalidConfig("port is empty".to_string()));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| D::Error::custom(format!("invalid timeout {secs}")))
    }
}
