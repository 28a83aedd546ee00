//! Reliability layer: retries, sequence recovery and event intake.
//!
//! Every request is encoded once. Corrupted or missing replies cause the same
//! bytes to be resent; a sequence disagreement costs one resync handshake and a
//! re-encode with a fresh sequence number. Unsolicited device packets that
//! arrive while waiting are parked in an inbox for the session to interpret.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use omvp_frame::{
    CodecConfig, FrameError, Flags, Opcode, Packet, PacketKind, PacketReader, PacketWriter,
    SequenceError, SequenceFault, Sequencer,
};
use omvp_transport::{FaultInjector, Transport};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::control::{decode_nak, Capabilities};
use crate::error::{from_frame, Result, SessionError};
use crate::stats::Statistics;

/// Read slice used by non-blocking event polls.
const POLL_SLICE: Duration = Duration::from_millis(1);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
    Resyncing,
    /// A resync failed. Terminal.
    Faulted,
}

/// An outbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub payload: Bytes,
    /// Set `FRAGMENT`: more parts of the same message follow.
    pub more: bool,
}

impl Request {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
            more: false,
        }
    }

    pub fn empty(opcode: Opcode) -> Self {
        Self::new(opcode, Bytes::new())
    }

    #[must_use]
    pub fn with_more(mut self, more: bool) -> Self {
        self.more = more;
        self
    }
}

/// Something the device pushed, or a link-level occurrence the session must see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A validated unsolicited packet.
    Packet(Packet),
    /// Sequence state was reset; partially assembled data is void.
    Resynced,
}

/// Outcome of one transmission of a request.
enum Attempt {
    Reply(Packet),
    ChecksumFailed,
    TimedOut,
    SequenceFailed(SequenceError),
}

/// What to do with an inbound packet.
enum Intake {
    /// Reply or NAK for the outstanding request.
    Matched(Packet),
    /// Consumed (event, stale reply, duplicate); keep waiting.
    Absorbed,
    /// Sequence gap; resync required.
    Gap(SequenceError),
}

/// Most recent recoverable failure, surfaced when retries run out.
#[derive(Clone, Copy)]
enum Failure {
    Checksum,
    Timeout,
}

#[derive(Debug, Clone)]
struct LinkSettings {
    seq: bool,
    ack: bool,
    timeout: Duration,
    max_retry: u32,
}

/// One endpoint of a reliable packet link over a [`Transport`].
///
/// The transport is split into a reader half and a writer half; the writer is
/// wrapped in a [`FaultInjector`] so configured loss applies to outbound
/// traffic only.
pub struct Link<T: Transport> {
    reader: PacketReader<T>,
    writer: PacketWriter<FaultInjector<T>>,
    sequencer: Sequencer,
    settings: LinkSettings,
    state: ConnectionState,
    stats: Statistics,
    inbox: VecDeque<LinkEvent>,
}

impl<T: Transport> Link<T> {
    /// Wrap a connected transport. No traffic is sent.
    pub fn new(transport: T, config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        let reader_half = transport.try_clone()?;
        let writer_half =
            FaultInjector::with_seed(transport, config.drop_rate, config.drop_seed)?;

        let codec = CodecConfig {
            max_payload: config.max_payload,
            crc: config.crc,
        };
        debug!(
            transport = reader_half.transport_name(),
            crc = config.crc,
            seq = config.seq,
            drop_rate = config.drop_rate,
            "link created"
        );

        Ok(Self {
            reader: PacketReader::with_config(reader_half, codec),
            writer: PacketWriter::with_max_payload(writer_half, config.max_payload),
            sequencer: Sequencer::new(),
            settings: LinkSettings {
                seq: config.seq,
                ack: config.ack,
                timeout: config.timeout,
                max_retry: config.max_retry,
            },
            state: ConnectionState::Disconnected,
            stats: Statistics::default(),
            inbox: VecDeque::new(),
        })
    }

    /// Send a request and, if `requires_ack`, wait for its reply.
    ///
    /// Returns `Ok(None)` for fire-and-forget requests.
    pub fn send_request(&mut self, request: Request, requires_ack: bool) -> Result<Option<Packet>> {
        self.ensure_usable()?;

        let mut flags = Flags::NONE;
        if requires_ack {
            flags |= Flags::ACK_REQ;
        }
        if request.more {
            flags |= Flags::FRAGMENT;
        }
        let mut packet = Packet::new(
            request.opcode,
            flags,
            self.sequencer.next_send_seq(),
            request.payload,
        );
        let mut wire = self.writer.encode(&packet)?;

        let mut resends = 0u32;
        let mut resynced = false;
        loop {
            self.transmit(&wire)?;
            trace!(opcode = ?packet.opcode, seq = packet.sequence, resends, "request sent");
            if !requires_ack {
                return Ok(None);
            }

            let failure = match self.await_reply(packet.opcode)? {
                Attempt::Reply(reply) => {
                    if reply.kind() == PacketKind::Nak {
                        let status = decode_nak(&reply.payload);
                        debug!(opcode = ?packet.opcode, status, "request rejected");
                        return Err(SessionError::Rejected {
                            opcode: packet.opcode,
                            status,
                        });
                    }
                    return Ok(Some(reply));
                }
                Attempt::SequenceFailed(err) => {
                    if resynced {
                        return Err(SessionError::SequenceMismatch {
                            expected: err.expected,
                            actual: err.actual,
                        });
                    }
                    resynced = true;
                    self.resync()?;
                    packet.sequence = self.sequencer.next_send_seq();
                    wire = self.writer.encode(&packet)?;
                    continue;
                }
                Attempt::ChecksumFailed => Failure::Checksum,
                Attempt::TimedOut => Failure::Timeout,
            };

            if resends >= self.settings.max_retry {
                warn!(opcode = ?packet.opcode, attempts = resends + 1, "retries exhausted");
                return Err(match failure {
                    Failure::Checksum => SessionError::ChecksumMismatch,
                    Failure::Timeout => SessionError::Timeout {
                        attempts: resends + 1,
                        timeout: self.settings.timeout,
                    },
                });
            }
            resends += 1;
            self.stats.retries += 1;
            warn!(
                opcode = ?packet.opcode,
                seq = packet.sequence,
                attempt = resends + 1,
                checksum = matches!(failure, Failure::Checksum),
                "retrying request"
            );
        }
    }

    fn await_reply(&mut self, opcode: Opcode) -> Result<Attempt> {
        let deadline = Instant::now() + self.settings.timeout;
        loop {
            match self.reader.read_packet_before(deadline) {
                Ok(Some(packet)) => match self.intake(packet, Some(opcode)) {
                    Intake::Matched(reply) => return Ok(Attempt::Reply(reply)),
                    Intake::Absorbed => continue,
                    Intake::Gap(err) => return Ok(Attempt::SequenceFailed(err)),
                },
                Ok(None) => {
                    self.stats.timeouts += 1;
                    let dropped = self.reader.discard_buffered();
                    debug!(?opcode, dropped, "reply timed out");
                    return Ok(Attempt::TimedOut);
                }
                Err(err) if err.is_checksum() => {
                    self.stats.checksum_errors += 1;
                    debug!(?opcode, %err, "corrupted packet while awaiting reply");
                    return Ok(Attempt::ChecksumFailed);
                }
                Err(err) => self.framing_error(err)?,
            }
        }
    }

    /// Validate and route one inbound packet.
    fn intake(&mut self, packet: Packet, awaiting: Option<Opcode>) -> Intake {
        // Unsequenced traffic: late sync replies and echoes of our own acks.
        if packet.opcode.is_unsequenced() || packet.kind() == PacketKind::Ack {
            trace!(opcode = ?packet.opcode, "ignoring unsequenced packet");
            return Intake::Absorbed;
        }

        if self.settings.seq {
            if let Err(err) = self.sequencer.validate_recv_seq(packet.sequence) {
                self.stats.sequence_errors += 1;
                return match err.fault {
                    SequenceFault::Duplicate => {
                        debug!(opcode = ?packet.opcode, seq = packet.sequence, "dropping duplicate");
                        Intake::Absorbed
                    }
                    SequenceFault::Gap => {
                        warn!(
                            opcode = ?packet.opcode,
                            expected = err.expected,
                            actual = err.actual,
                            "sequence gap"
                        );
                        Intake::Gap(err)
                    }
                };
            }
        }
        self.stats.packets_received += 1;

        match packet.kind() {
            PacketKind::Event => {
                self.accept_event(packet);
                Intake::Absorbed
            }
            PacketKind::Reply | PacketKind::Nak if Some(packet.opcode) == awaiting => {
                Intake::Matched(packet)
            }
            PacketKind::Reply | PacketKind::Nak => {
                debug!(opcode = ?packet.opcode, "dropping stale reply");
                Intake::Absorbed
            }
            PacketKind::Request | PacketKind::Ack => {
                debug!(opcode = ?packet.opcode, "dropping unexpected packet from device");
                Intake::Absorbed
            }
        }
    }

    fn accept_event(&mut self, packet: Packet) {
        if self.settings.ack && packet.flags.contains(Flags::ACK_REQ) {
            let ack = Packet::new(
                packet.opcode,
                Flags::ACK | Flags::EVENT,
                packet.sequence,
                Bytes::new(),
            );
            // A lost ack only makes the device repeat the event, which the
            // sequencer then drops as a duplicate.
            match self.writer.write_packet(&ack) {
                Ok(_) => self.stats.packets_sent += 1,
                Err(err) => debug!(%err, "failed to acknowledge event"),
            }
        }
        trace!(opcode = ?packet.opcode, len = packet.payload.len(), "event queued");
        self.inbox.push_back(LinkEvent::Packet(packet));
    }

    /// Skip packets the decoder could not frame; fail on anything else.
    fn framing_error(&mut self, err: FrameError) -> Result<()> {
        match err {
            FrameError::UnknownOpcode(_) | FrameError::PayloadTooLarge { .. } => {
                debug!(%err, "skipping unframeable bytes");
                Ok(())
            }
            other => {
                let err = from_frame(other);
                if matches!(err, SessionError::Disconnected(_)) {
                    self.state = ConnectionState::Disconnected;
                }
                Err(err)
            }
        }
    }

    fn transmit(&mut self, wire: &[u8]) -> Result<()> {
        self.stats.packets_sent += 1;
        self.writer.write_raw(wire).map_err(|err| {
            let err = from_frame(err);
            if matches!(err, SessionError::Disconnected(_)) {
                self.state = ConnectionState::Disconnected;
            }
            err
        })
    }

    /// Re-establish sequence agreement after a gap.
    ///
    /// On failure the link becomes [`ConnectionState::Faulted`].
    pub fn resync(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.state = ConnectionState::Resyncing;
        warn!("resynchronizing link");

        match self.sync_exchange() {
            Ok(()) => {
                self.stats.resyncs += 1;
                self.inbox.push_back(LinkEvent::Resynced);
                self.state = ConnectionState::Connected;
                info!(resyncs = self.stats.resyncs, "link resynchronized");
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Faulted;
                error!(%err, "resync failed; link faulted");
                Err(SessionError::ResyncFailed(err.to_string()))
            }
        }
    }

    /// Establish the sequence baseline before any sequenced traffic.
    ///
    /// Unlike [`Link::resync`] this is not counted as a recovery.
    pub(crate) fn synchronize(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.sync_exchange()
    }

    fn sync_exchange(&mut self) -> Result<()> {
        self.reader.discard_buffered();
        let wire = self
            .writer
            .encode(&Packet::new(Opcode::Sync, Flags::ACK_REQ, 0, Bytes::new()))?;

        let attempts = self.settings.max_retry + 1;
        for attempt in 1..=attempts {
            self.transmit(&wire)?;
            if self.await_sync()? {
                self.sequencer.reset();
                self.reader.discard_buffered();
                debug!(attempt, "sync acknowledged");
                return Ok(());
            }
            if attempt < attempts {
                self.stats.retries += 1;
            }
        }
        Err(SessionError::Timeout {
            attempts,
            timeout: self.settings.timeout,
        })
    }

    /// Wait for a sync reply, discarding everything else. `false` means retry.
    fn await_sync(&mut self) -> Result<bool> {
        let deadline = Instant::now() + self.settings.timeout;
        loop {
            match self.reader.read_packet_before(deadline) {
                Ok(Some(packet)) => {
                    if packet.opcode == Opcode::Sync && packet.kind() == PacketKind::Reply {
                        self.stats.packets_received += 1;
                        return Ok(true);
                    }
                    trace!(opcode = ?packet.opcode, "discarding packet during sync");
                }
                Ok(None) => {
                    self.stats.timeouts += 1;
                    return Ok(false);
                }
                Err(err) if err.is_checksum() => {
                    self.stats.checksum_errors += 1;
                }
                Err(err) => self.framing_error(err)?,
            }
        }
    }

    /// Read every packet already available without blocking for more.
    pub fn poll_events(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let deadline = Instant::now() + POLL_SLICE;
        loop {
            match self.reader.read_packet_before(deadline) {
                Ok(Some(packet)) => {
                    if let Intake::Gap(_) = self.intake(packet, None) {
                        self.resync()?;
                    }
                }
                Ok(None) => return Ok(()),
                Err(err) if err.is_checksum() => {
                    self.stats.checksum_errors += 1;
                    debug!(%err, "dropping corrupted event");
                }
                Err(err) => self.framing_error(err)?,
            }
        }
    }

    /// Drain queued events in arrival order.
    pub fn take_events(&mut self) -> Vec<LinkEvent> {
        self.inbox.drain(..).collect()
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            ConnectionState::Faulted => Err(SessionError::Faulted),
            _ => Ok(()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Host-side counters. `bytes_per_channel` is filled in by the session.
    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    pub fn max_payload(&self) -> usize {
        self.writer.max_payload()
    }

    /// Apply the negotiated payload limit to both directions.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.reader.set_max_payload(max_payload);
        self.writer.set_max_payload(max_payload);
    }

    /// Switch to the features both endpoints agreed on.
    ///
    /// Outbound checksums are always written; `crc` only controls verification.
    pub fn apply(&mut self, negotiated: &Capabilities) {
        self.reader.set_crc(negotiated.crc);
        self.settings.seq = negotiated.seq;
        self.settings.ack = negotiated.ack;
        self.set_max_payload(usize::from(negotiated.max_payload));
        debug!(?negotiated, "link features applied");
    }

    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    /// Writes discarded by fault injection so far.
    pub fn dropped_writes(&self) -> u64 {
        self.writer.get_ref().dropped()
    }

    pub fn transport_name(&self) -> &'static str {
        self.reader.get_ref().transport_name()
    }
}

impl<T: Transport> std::fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("transport", &self.transport_name())
            .field("state", &self.state)
            .field("max_payload", &self.max_payload())
            .field("queued_events", &self.inbox.len())
            .finish()
    }
}
