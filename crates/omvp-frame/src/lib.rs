//! Checksummed, sequenced packet framing for the OMVP serial protocol.
//!
//! Every packet on the wire is framed with:
//! - A 2-byte sync marker (`0xD5 0xAA`) for stream resynchronization
//! - Sequence number, opcode, flags and a little-endian payload length
//! - A CRC-16 over the header and a CRC-32 over the payload
//!
//! Decoding tolerates line noise: garbage before a sync marker is skipped and
//! a false sync costs exactly one byte.

pub mod codec;
pub mod crc;
pub mod error;
pub mod opcode;
pub mod reader;
pub mod sequence;
pub mod writer;

pub use codec::{
    decode_packet, encode_packet, CodecConfig, Packet, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
    PAYLOAD_CRC_SIZE, SYNC,
};
pub use self::crc::{crc16, crc32};
pub use error::{ChecksumRegion, FrameError, Result};
pub use opcode::{Flags, Opcode, PacketKind};
pub use reader::PacketReader;
pub use sequence::{SequenceError, SequenceFault, Sequencer};
pub use writer::PacketWriter;
