//! CRC-32 checksums for Matroska CRC-32 elements.
//!
//! Matroska uses the IEEE 802.3 polynomial. The checksum covers all bytes of
//! the enclosing element after the CRC-32 element itself and is stored
//! little-endian.

use std::io::{Read, Seek, SeekFrom};

use retag_core::Result;

/// CRC-32 lookup table (IEEE 802.3, reflected).
const CRC_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            if c & 1 != 0 {
                c = 0xEDB8_8320 ^ (c >> 1);
            } else {
                c >>= 1;
            }
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
};

/// Feed a buffer into a running checksum state.
fn update(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = CRC_TABLE[index] ^ (crc >> 8);
    }
    crc
}

/// Calculate the CRC-32 of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    update(0xFFFF_FFFF, data) ^ 0xFFFF_FFFF
}

/// Calculate the CRC-32 of `count` bytes starting at `offset` in `reader`.
pub fn crc32_of_range<R: Read + Seek>(reader: &mut R, offset: u64, count: u64) -> Result<u32> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut crc = 0xFFFF_FFFFu32;
    let mut buffer = [0u8; 0x2000];
    let mut remaining = count;
    while remaining > 0 {
        let chunk = remaining.min(buffer.len() as u64) as usize;
        reader.read_exact(&mut buffer[..chunk])?;
        crc = update(crc, &buffer[..chunk]);
        remaining -= chunk as u64;
    }
    Ok(crc ^ 0xFFFF_FFFF)
}
