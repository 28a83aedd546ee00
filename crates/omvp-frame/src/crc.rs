//! CRCs matching the camera firmware.
//!
//! Both are MSB-first with no input/output reflection and no final XOR.

use ::crc::{Algorithm, Crc};

/// CRC-16 polynomial. HD=5 up to 108 bits, which covers the packet header.
pub const CRC16_POLY: u16 = 0xBAAD;
pub const CRC16_INIT: u16 = 0xFFFF;

/// CRC-32 polynomial used for payloads.
pub const CRC32_POLY: u32 = 0xFA56_7D89;
pub const CRC32_INIT: u32 = 0xFFFF_FFFF;

/// Header checksum parameters.
pub const OMVP_CRC16: Algorithm<u16> = Algorithm {
    width: 16,
    poly: CRC16_POLY,
    init: CRC16_INIT,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0x932D,
    residue: 0,
};

/// Payload checksum parameters.
pub const OMVP_CRC32: Algorithm<u32> = Algorithm {
    width: 32,
    poly: CRC32_POLY,
    init: CRC32_INIT,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0x41B4_03D3,
    residue: 0,
};

static CRC16: Crc<u16> = Crc::<u16>::new(&OMVP_CRC16);
static CRC32: Crc<u32> = Crc::<u32>::new(&OMVP_CRC32);

/// Continue a CRC-16 over more bytes.
pub fn crc16_update(crc: u16, data: &[u8]) -> u16 {
    let mut digest = CRC16.digest_with_initial(crc);
    digest.update(data);
    digest.finalize()
}

/// CRC-16 of `data` from the standard initial value.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Continue a CRC-32 over more bytes.
pub fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    let mut digest = CRC32.digest_with_initial(crc);
    digest.update(data);
    digest.finalize()
}

/// CRC-32 of `data` from the standard initial value.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}
