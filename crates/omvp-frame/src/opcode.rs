//! Opcodes, flag bits and packet classification.
//!
//! Opcodes are grouped by subsystem in the high nibble:
//! `0x0_` link control, `0x1_` script, `0x2_` channels, `0x3_` streaming,
//! `0x4_` profiler.

/// Every command the protocol defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Sync = 0x00,
    Caps = 0x01,
    Stats = 0x02,
    Version = 0x03,
    ScriptExec = 0x10,
    ScriptStop = 0x11,
    Status = 0x12,
    ChannelList = 0x20,
    ChannelRead = 0x21,
    ChannelWrite = 0x22,
    ChannelData = 0x23,
    ChannelRegister = 0x24,
    StreamControl = 0x30,
    StreamFrame = 0x31,
    ProfileMode = 0x40,
    ProfileEvent = 0x41,
    ProfileReset = 0x42,
    ProfileSize = 0x43,
    ProfileRead = 0x44,
}

impl Opcode {
    pub const ALL: [Opcode; 19] = [
        Opcode::Sync,
        Opcode::Caps,
        Opcode::Stats,
        Opcode::Version,
        Opcode::ScriptExec,
        Opcode::ScriptStop,
        Opcode::Status,
        Opcode::ChannelList,
        Opcode::ChannelRead,
        Opcode::ChannelWrite,
        Opcode::ChannelData,
        Opcode::ChannelRegister,
        Opcode::StreamControl,
        Opcode::StreamFrame,
        Opcode::ProfileMode,
        Opcode::ProfileEvent,
        Opcode::ProfileReset,
        Opcode::ProfileSize,
        Opcode::ProfileRead,
    ];

    /// Wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name for logs and CLI output.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Sync => "SYNC",
            Opcode::Caps => "CAPS",
            Opcode::Stats => "STATS",
            Opcode::Version => "VERSION",
            Opcode::ScriptExec => "SCRIPT_EXEC",
            Opcode::ScriptStop => "SCRIPT_STOP",
            Opcode::Status => "STATUS",
            Opcode::ChannelList => "CHANNEL_LIST",
            Opcode::ChannelRead => "CHANNEL_READ",
            Opcode::ChannelWrite => "CHANNEL_WRITE",
            Opcode::ChannelData => "CHANNEL_DATA",
            Opcode::ChannelRegister => "CHANNEL_REGISTER",
            Opcode::StreamControl => "STREAM_CONTROL",
            Opcode::StreamFrame => "STREAM_FRAME",
            Opcode::ProfileMode => "PROFILE_MODE",
            Opcode::ProfileEvent => "PROFILE_EVENT",
            Opcode::ProfileReset => "PROFILE_RESET",
            Opcode::ProfileSize => "PROFILE_SIZE",
            Opcode::ProfileRead => "PROFILE_READ",
        }
    }

    /// Packets that bypass sequence tracking.
    ///
    /// `Sync` establishes the sequence baseline, so it cannot be subject to it.
    pub fn is_unsequenced(self) -> bool {
        matches!(self, Opcode::Sync)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let op = match value {
            0x00 => Opcode::Sync,
            0x01 => Opcode::Caps,
            0x02 => Opcode::Stats,
            0x03 => Opcode::Version,
            0x10 => Opcode::ScriptExec,
            0x11 => Opcode::ScriptStop,
            0x12 => Opcode::Status,
            0x20 => Opcode::ChannelList,
            0x21 => Opcode::ChannelRead,
            0x22 => Opcode::ChannelWrite,
            0x23 => Opcode::ChannelData,
            0x24 => Opcode::ChannelRegister,
            0x30 => Opcode::StreamControl,
            0x31 => Opcode::StreamFrame,
            0x40 => Opcode::ProfileMode,
            0x41 => Opcode::ProfileEvent,
            0x42 => Opcode::ProfileReset,
            0x43 => Opcode::ProfileSize,
            0x44 => Opcode::ProfileRead,
            other => return Err(other),
        };
        Ok(op)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Packet flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Positive reply.
    pub const ACK: Flags = Flags(0x01);
    /// Negative reply; payload carries a status byte.
    pub const NAK: Flags = Flags(0x02);
    /// Sender expects a reply.
    pub const ACK_REQ: Flags = Flags(0x04);
    /// More fragments of the same logical message follow.
    pub const FRAGMENT: Flags = Flags(0x08);
    /// Unsolicited device push.
    pub const EVENT: Flags = Flags(0x10);

    const KNOWN: u8 = 0x1F;

    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Flags) -> Flags {
        Flags(self.0 & !other.0)
    }

    /// Bits set that this host does not interpret.
    pub const fn unknown_bits(self) -> u8 {
        self.0 & !Self::KNOWN
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        self.with(rhs)
    }
}

impl std::ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        *self = self.with(rhs);
    }
}

/// Role of a packet, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Host-initiated command.
    Request,
    /// Positive reply to a request.
    Reply,
    /// Negative reply to a request.
    Nak,
    /// Unsolicited device push.
    Event,
    /// Host acknowledgement of an event.
    Ack,
}

impl PacketKind {
    pub fn from_flags(flags: Flags) -> Self {
        if flags.contains(Flags::NAK) {
            PacketKind::Nak
        } else if flags.contains(Flags::ACK) && flags.contains(Flags::EVENT) {
            PacketKind::Ack
        } else if flags.contains(Flags::ACK) {
            PacketKind::Reply
        } else if flags.contains(Flags::EVENT) {
            PacketKind::Event
        } else {
            PacketKind::Request
        }
    }
}
