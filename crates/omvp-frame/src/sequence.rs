/// How a received sequence number deviated from the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceFault {
    /// Same number as the previously accepted packet.
    Duplicate,
    /// Any other deviation: packets lost, reordered or the peer restarted.
    Gap,
}

/// A received packet did not carry the expected sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sequence {fault:?}: expected {expected}, got {actual}")]
pub struct SequenceError {
    pub expected: u8,
    pub actual: u8,
    pub fault: SequenceFault,
}

/// Per-direction sequence tracking.
///
/// Both directions start at 0 and wrap 255 → 0. Only a successful resync
/// handshake calls [`Sequencer::reset`].
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    next_send: u8,
    expected_recv: u8,
    received_any: bool,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the sequence number for the next outbound packet.
    pub fn next_send_seq(&mut self) -> u8 {
        let seq = self.next_send;
        self.next_send = self.next_send.wrapping_add(1);
        seq
    }

    /// Check an inbound sequence number and advance on success.
    ///
    /// A rejected number leaves the expected value unchanged.
    pub fn validate_recv_seq(&mut self, seq: u8) -> Result<(), SequenceError> {
        if seq == self.expected_recv {
            self.expected_recv = self.expected_recv.wrapping_add(1);
            self.received_any = true;
            return Ok(());
        }

        let fault = if self.received_any && seq == self.expected_recv.wrapping_sub(1) {
            SequenceFault::Duplicate
        } else {
            SequenceFault::Gap
        };
        Err(SequenceError {
            expected: self.expected_recv,
            actual: seq,
            fault,
        })
    }

    /// Number the next outbound packet will carry.
    pub fn peek_send(&self) -> u8 {
        self.next_send
    }

    /// Number the next inbound packet must carry.
    pub fn expected_recv(&self) -> u8 {
        self.expected_recv
    }

    /// Return both directions to 0.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
