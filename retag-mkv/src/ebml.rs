//! EBML (Extensible Binary Meta Language) parsing and writing utilities.
//!
//! EBML frames every element as `(vint_id, vint_size, payload)`. Both the
//! identifier and the size use variable-length integers (VINTs) whose first
//! byte carries a leading 1-bit marker indicating the width.

use std::io::{Read, Write};

use byteorder::WriteBytesExt;
use retag_core::{Error, Result};

/// Maximum VINT length in bytes.
pub const MAX_VINT_LENGTH: u32 = 8;

/// Maximum element ID length supported (Matroska fixes this at 4).
pub const MAX_ID_LENGTH: u32 = 4;

/// Per-width VINT value with all data bits set; reserved to denote an
/// unknown element size.
const UNKNOWN_SIZE_MARKERS: [u64; 8] = [
    0x7F,
    0x3FFF,
    0x1F_FFFF,
    0x0FFF_FFFF,
    0x07_FFFF_FFFF,
    0x03FF_FFFF_FFFF,
    0x01_FFFF_FFFF_FFFF,
    0x00FF_FFFF_FFFF_FFFF,
];

fn read_byte<R: Read>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).map_err(map_eof)?;
    Ok(byte[0])
}

fn map_eof(error: std::io::Error) -> Error {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::parse(0, "stream ended before the element header was complete")
    } else {
        Error::Io(error)
    }
}

/// Rewrite the offset of a parse error produced by the offset-less readers.
pub fn at_offset(error: Error, offset: u64) -> Error {
    match error {
        Error::Parse { message, .. } => Error::Parse { offset, message },
        other => other,
    }
}

/// Read a VINT, returning the decoded value and the number of bytes read.
pub fn read_vint<R: Read>(reader: &mut R) -> Result<(u64, u32)> {
    let first = read_byte(reader)?;
    if first == 0 {
        return Err(Error::parse(0, "invalid VINT marker byte"));
    }
    let length = first.leading_zeros() + 1;

    let mask = if length >= 8 { 0u8 } else { 0xFFu8 >> length };
    let mut value = (first & mask) as u64;
    for _ in 1..length {
        value = (value << 8) | read_byte(reader)? as u64;
    }
    Ok((value, length))
}

/// Read an element ID.
///
/// IDs keep the VINT width marker as part of the value, so equality against
/// the canonical Matroska constants is a plain integer comparison.
pub fn read_element_id<R: Read>(reader: &mut R) -> Result<(u32, u32)> {
    let first = read_byte(reader)?;
    if first == 0 {
        return Err(Error::parse(0, "invalid element ID marker byte"));
    }
    let length = first.leading_zeros() + 1;
    if length > MAX_ID_LENGTH {
        return Err(Error::parse(0, format!("element ID wider than {MAX_ID_LENGTH} bytes")));
    }
    let mut value = first as u32;
    for _ in 1..length {
        value = (value << 8) | read_byte(reader)? as u32;
    }
    Ok((value, length))
}

/// Read an element size.
///
/// Returns `None` when the reserved all-ones marker denotes an unknown size.
pub fn read_element_size<R: Read>(reader: &mut R) -> Result<(Option<u64>, u32)> {
    let (value, length) = read_vint(reader)?;
    if value == UNKNOWN_SIZE_MARKERS[length as usize - 1] {
        Ok((None, length))
    } else {
        Ok((Some(value), length))
    }
}

/// Number of raw bytes of an element ID (marker included).
pub fn id_length(id: u32) -> u32 {
    match id {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

/// Write the raw bytes of an element ID.
pub fn write_id<W: Write>(writer: &mut W, id: u32) -> Result<u32> {
    let length = id_length(id);
    let bytes = id.to_be_bytes();
    writer.write_all(&bytes[(4 - length) as usize..])?;
    Ok(length)
}

/// The size-denotation width: the minimum `k` in `1..=8` such that `k`
/// bytes can encode `value` (the per-width all-ones value is reserved).
pub fn calculate_size_denotation_length(value: u64) -> u32 {
    for (index, marker) in UNKNOWN_SIZE_MARKERS.iter().enumerate() {
        if value < *marker {
            return index as u32 + 1;
        }
    }
    8
}

/// Serialize `value` as a minimal-width size denotation into `buffer`.
///
/// Returns the number of bytes used. Values at or above `2^56 - 1` cannot
/// be denoted and fail with `InvalidData`.
pub fn make_size_denotation(value: u64, buffer: &mut [u8; 8]) -> Result<u32> {
    if value >= UNKNOWN_SIZE_MARKERS[7] {
        return Err(Error::invalid_data(format!(
            "size {value} exceeds the EBML size denotation range"
        )));
    }
    let length = calculate_size_denotation_length(value);
    let bytes = value.to_be_bytes();
    buffer[..length as usize].copy_from_slice(&bytes[(8 - length) as usize..]);
    buffer[0] |= 0x80u8 >> (length - 1);
    Ok(length)
}

/// Write a minimal-width size denotation.
pub fn write_size<W: Write>(writer: &mut W, value: u64) -> Result<u32> {
    let mut buffer = [0u8; 8];
    let length = make_size_denotation(value, &mut buffer)?;
    writer.write_all(&buffer[..length as usize])?;
    Ok(length)
}

/// Number of content bytes needed to store an unsigned integer (at least one).
pub fn calculate_uint_length(value: u64) -> u32 {
    let significant = 8 - value.leading_zeros() / 8;
    significant.max(1)
}

/// Serialize an unsigned integer in minimal content bytes.
pub fn make_uint(value: u64, buffer: &mut [u8; 8]) -> u32 {
    let length = calculate_uint_length(value);
    let bytes = value.to_be_bytes();
    buffer[..length as usize].copy_from_slice(&bytes[(8 - length) as usize..]);
    length
}

/// Serialize an unsigned integer using at least `min_length` content bytes,
/// zero-padded at the front. Used to patch a value into an existing element
/// without changing the element's span.
pub fn make_uint_padded(value: u64, min_length: u32, buffer: &mut [u8; 8]) -> u32 {
    let length = calculate_uint_length(value).max(min_length).min(8);
    let bytes = value.to_be_bytes();
    buffer[..length as usize].copy_from_slice(&bytes[(8 - length) as usize..]);
    length
}

/// Write a complete unsigned-integer element (`id`, 1-byte size, content).
pub fn write_uint_element<W: Write>(writer: &mut W, id: u32, value: u64) -> Result<u64> {
    let id_len = write_id(writer, id)?;
    let mut buffer = [0u8; 8];
    let length = make_uint(value, &mut buffer);
    writer.write_u8(0x80 | length as u8)?;
    writer.write_all(&buffer[..length as usize])?;
    Ok(id_len as u64 + 1 + length as u64)
}

/// Write a complete string element.
pub fn write_string_element<W: Write>(writer: &mut W, id: u32, value: &str) -> Result<u64> {
    write_binary_element(writer, id, value.as_bytes())
}

/// Write a complete binary element.
pub fn write_binary_element<W: Write>(writer: &mut W, id: u32, data: &[u8]) -> Result<u64> {
    let id_len = write_id(writer, id)?;
    let size_len = write_size(writer, data.len() as u64)?;
    writer.write_all(data)?;
    Ok(id_len as u64 + size_len as u64 + data.len() as u64)
}

/// Serialized size of a complete unsigned-integer element.
pub fn uint_element_length(id: u32, value: u64) -> u64 {
    id_length(id) as u64 + 1 + calculate_uint_length(value) as u64
}

/// Serialized size of a complete string or binary element.
pub fn string_element_length(id: u32, data_length: u64) -> u64 {
    id_length(id) as u64 + calculate_size_denotation_length(data_length) as u64 + data_length
}

/// Decode an unsigned integer from element content bytes.
pub fn read_unsigned_int(data: &[u8]) -> u64 {
    let mut value = 0u64;
    for &byte in data {
        value = (value << 8) | byte as u64;
    }
    value
}

/// Decode a float from element content bytes (0, 4 or 8 bytes).
pub fn read_float(data: &[u8]) -> Result<f64> {
    match data.len() {
        0 => Ok(0.0),
        4 => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(data);
            Ok(f32::from_bits(u32::from_be_bytes(bytes)) as f64)
        }
        8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(data);
            Ok(f64::from_bits(u64::from_be_bytes(bytes)))
        }
        other => Err(Error::invalid_data(format!(
            "float element has invalid content length {other}"
        ))),
    }
}

/// Decode a string from element content bytes, dropping a trailing
/// null terminator when present.
pub fn read_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_vint() {
        let mut cursor = Cursor::new(vec![0x81]);
        assert_eq!(read_vint(&mut cursor).unwrap(), (1, 1));

        let mut cursor = Cursor::new(vec![0x40, 0x81]);
        assert_eq!(read_vint(&mut cursor).unwrap(), (129, 2));

        let mut cursor = Cursor::new(vec![0x20, 0x40, 0x00]);
        assert_eq!(read_vint(&mut cursor).unwrap(), (16384, 3));
    }

    #[test]
    fn test_read_vint_invalid_marker() {
        let mut cursor = Cursor::new(vec![0x00]);
        assert!(read_vint(&mut cursor).is_err());
    }

    #[test]
    fn test_read_element_id() {
        let mut cursor = Cursor::new(vec![0xEC]);
        assert_eq!(read_element_id(&mut cursor).unwrap(), (0xEC, 1));

        let mut cursor = Cursor::new(vec![0x1A, 0x45, 0xDF, 0xA3]);
        assert_eq!(read_element_id(&mut cursor).unwrap(), (0x1A45DFA3, 4));
    }

    #[test]
    fn test_read_element_size_unknown() {
        let mut cursor = Cursor::new(vec![0xFF]);
        assert_eq!(read_element_size(&mut cursor).unwrap(), (None, 1));

        let mut cursor = Cursor::new(vec![0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(read_element_size(&mut cursor).unwrap(), (None, 8));

        let mut cursor = Cursor::new(vec![0x82]);
        assert_eq!(read_element_size(&mut cursor).unwrap(), (Some(2), 1));
    }

    #[test]
    fn test_id_length() {
        assert_eq!(id_length(0xEC), 1);
        assert_eq!(id_length(0x4DBB), 2);
        assert_eq!(id_length(0x2AD7B1), 3);
        assert_eq!(id_length(0x1A45DFA3), 4);
    }

    #[test]
    fn test_size_denotation_length_boundaries() {
        assert_eq!(calculate_size_denotation_length(0), 1);
        assert_eq!(calculate_size_denotation_length(0x7E), 1);
        // 0x7F is the reserved unknown marker for one byte
        assert_eq!(calculate_size_denotation_length(0x7F), 2);
        assert_eq!(calculate_size_denotation_length(0x3FFE), 2);
        assert_eq!(calculate_size_denotation_length(0x3FFF), 3);
        assert_eq!(calculate_size_denotation_length(u64::from(u32::MAX)), 5);
    }

    #[test]
    fn test_size_denotation_roundtrip() {
        for value in [0u64, 1, 0x7E, 0x7F, 0x3FFE, 0x3FFF, 100_000, 0x0FFF_FFFE, 1 << 40] {
            let mut buffer = [0u8; 8];
            let length = make_size_denotation(value, &mut buffer).unwrap();
            let mut cursor = Cursor::new(&buffer[..length as usize]);
            let (decoded, decoded_length) = read_element_size(&mut cursor).unwrap();
            assert_eq!(decoded, Some(value), "value {value} failed roundtrip");
            assert_eq!(decoded_length, length);
        }
    }

    #[test]
    fn test_size_denotation_overflow() {
        let mut buffer = [0u8; 8];
        assert!(make_size_denotation(u64::MAX, &mut buffer).is_err());
    }

    #[test]
    fn test_uint_length() {
        assert_eq!(calculate_uint_length(0), 1);
        assert_eq!(calculate_uint_length(0xFF), 1);
        assert_eq!(calculate_uint_length(0x100), 2);
        assert_eq!(calculate_uint_length(u64::MAX), 8);
    }

    #[test]
    fn test_make_uint_padded() {
        let mut buffer = [0u8; 8];
        let length = make_uint_padded(5, 4, &mut buffer);
        assert_eq!(length, 4);
        assert_eq!(&buffer[..4], &[0, 0, 0, 5]);

        // padding never truncates a value that needs more bytes
        let length = make_uint_padded(0x1_0000, 1, &mut buffer);
        assert_eq!(length, 3);
        assert_eq!(&buffer[..3], &[1, 0, 0]);
    }

    #[test]
    fn test_write_uint_element() {
        let mut output = Vec::new();
        let written = write_uint_element(&mut output, 0xA7, 0x1234).unwrap();
        assert_eq!(output, vec![0xA7, 0x82, 0x12, 0x34]);
        assert_eq!(written, output.len() as u64);
        assert_eq!(uint_element_length(0xA7, 0x1234), written);
    }

    #[test]
    fn test_write_string_element() {
        let mut output = Vec::new();
        let written = write_string_element(&mut output, 0x4D80, "app").unwrap();
        assert_eq!(output, vec![0x4D, 0x80, 0x83, b'a', b'p', b'p']);
        assert_eq!(written, output.len() as u64);
        assert_eq!(string_element_length(0x4D80, 3), written);
    }

    #[test]
    fn test_read_unsigned_int() {
        assert_eq!(read_unsigned_int(&[]), 0);
        assert_eq!(read_unsigned_int(&[0x01]), 1);
        assert_eq!(read_unsigned_int(&[0x01, 0x00]), 256);
    }

    #[test]
    fn test_read_float() {
        assert_eq!(read_float(&[]).unwrap(), 0.0);
        assert_eq!(read_float(&1.5f32.to_bits().to_be_bytes()).unwrap(), 1.5);
        assert_eq!(read_float(&2.5f64.to_bits().to_be_bytes()).unwrap(), 2.5);
        assert!(read_float(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_read_string() {
        assert_eq!(read_string(b"hello"), "hello");
        assert_eq!(read_string(b"hello\x00junk"), "hello");
    }
}
