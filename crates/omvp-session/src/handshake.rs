use omvp_frame::Opcode;
use omvp_transport::Transport;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::control::{decode_channel_list, Capabilities, FirmwareVersion};
use crate::error::{Result, SessionError};
use crate::link::{ConnectionState, Link, Request};

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResult {
    /// Features both sides agreed on and the negotiated payload limit.
    pub capabilities: Capabilities,
    pub firmware: FirmwareVersion,
    /// Channels the device advertised; these persist across scripts.
    pub channels: Vec<String>,
}

impl HandshakeResult {
    pub fn max_payload(&self) -> usize {
        usize::from(self.capabilities.max_payload)
    }
}

/// Bring a fresh link to `Connected`.
///
/// Establishes the sequence baseline, negotiates capabilities, then reads the
/// firmware version and advertised channels. Any failure aborts the
/// connection and leaves the link `Disconnected`.
pub fn handshake<T: Transport>(link: &mut Link<T>, config: &SessionConfig) -> Result<HandshakeResult> {
    link.set_state(ConnectionState::Handshaking);
    let result = negotiate(link, config);
    match &result {
        Ok(outcome) => {
            link.set_state(ConnectionState::Connected);
            info!(
                firmware = %outcome.firmware,
                max_payload = outcome.capabilities.max_payload,
                channels = outcome.channels.len(),
                "handshake complete"
            );
        }
        Err(err) => {
            if link.state() != ConnectionState::Faulted {
                link.set_state(ConnectionState::Disconnected);
            }
            debug!(%err, "handshake failed");
        }
    }
    result
}

fn negotiate<T: Transport>(link: &mut Link<T>, config: &SessionConfig) -> Result<HandshakeResult> {
    link.synchronize()?;

    let requested = Capabilities {
        crc: config.crc,
        seq: config.seq,
        ack: config.ack,
        events: config.events,
        max_payload: u16::try_from(config.max_payload).map_err(|_| {
            SessionError::InvalidConfig(format!("max_payload {} exceeds u16", config.max_payload))
        })?,
    };
    let reply = expect_reply(link, Request::new(Opcode::Caps, requested.encode()))?;
    let offered = Capabilities::decode(&reply)?;
    let capabilities = requested.intersect(&offered);
    if usize::from(capabilities.max_payload) < crate::config::MIN_MAX_PAYLOAD {
        return Err(SessionError::InvalidConfig(format!(
            "device payload limit {} below minimum",
            capabilities.max_payload
        )));
    }
    link.apply(&capabilities);
    debug!(?requested, ?offered, "capabilities negotiated");

    let reply = expect_reply(link, Request::empty(Opcode::Version))?;
    let firmware = FirmwareVersion::decode(&reply)?;

    let reply = expect_reply(link, Request::empty(Opcode::ChannelList))?;
    let channels = decode_channel_list(&reply)?;

    Ok(HandshakeResult {
        capabilities,
        firmware,
        channels,
    })
}

fn expect_reply<T: Transport>(link: &mut Link<T>, request: Request) -> Result<bytes::Bytes> {
    let opcode = request.opcode;
    link.send_request(request, true)?
        .map(|packet| packet.payload)
        .ok_or_else(|| SessionError::Disconnected(format!("no reply to {opcode}")))
}
