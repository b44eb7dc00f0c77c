//! OGG page header parsing.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use retag_core::{Error, Result};

/// Size of the fixed part of an OGG page header.
pub const FIXED_HEADER_SIZE: u64 = 27;

/// The capture pattern every page starts with.
pub const CAPTURE_PATTERN: &[u8; 4] = b"OggS";

/// A parsed OGG page header.
///
/// Consecutive lacing values of 255 belong to one logical segment, so the
/// recorded segment sizes may exceed 255; a trailing lacing value of 255
/// denotes a segment continued on the next page.
#[derive(Debug, Clone)]
pub struct OggPage {
    start_offset: u64,
    stream_structure_version: u8,
    header_type_flag: u8,
    absolute_granule_position: u64,
    stream_serial_number: u32,
    sequence_number: u32,
    checksum: u32,
    segment_table_length: u32,
    segment_sizes: Vec<u32>,
}

impl OggPage {
    /// Parse the page header at `start_offset`; at most `max_size` bytes
    /// belong to this page.
    pub fn parse<R: Read + Seek>(reader: &mut R, start_offset: u64, max_size: u64) -> Result<Self> {
        if max_size < FIXED_HEADER_SIZE {
            return Err(Error::parse(
                start_offset,
                "stream ended before the OGG page header was complete",
            ));
        }
        reader.seek(SeekFrom::Start(start_offset))?;
        let mut pattern = [0u8; 4];
        reader.read_exact(&mut pattern)?;
        if &pattern != CAPTURE_PATTERN {
            return Err(Error::parse(start_offset, "capture pattern \"OggS\" expected"));
        }
        let stream_structure_version = reader.read_u8()?;
        if stream_structure_version != 0 {
            return Err(Error::parse(
                start_offset,
                format!("stream structure version {stream_structure_version} is not supported"),
            ));
        }
        let header_type_flag = reader.read_u8()?;
        let absolute_granule_position = reader.read_u64::<LittleEndian>()?;
        let stream_serial_number = reader.read_u32::<LittleEndian>()?;
        let sequence_number = reader.read_u32::<LittleEndian>()?;
        let checksum = reader.read_u32::<LittleEndian>()?;

        let segment_table_length = reader.read_u8()? as u32;
        if max_size < FIXED_HEADER_SIZE + segment_table_length as u64 {
            return Err(Error::parse(
                start_offset,
                "stream ended within the OGG page segment table",
            ));
        }
        let mut table = vec![0u8; segment_table_length as usize];
        reader.read_exact(&mut table)?;

        let mut segment_sizes = Vec::new();
        let mut current = 0u32;
        for &lacing in &table {
            current += lacing as u32;
            if lacing < 0xFF {
                segment_sizes.push(current);
                current = 0;
            }
        }
        if current != 0 {
            // continued on the next page
            segment_sizes.push(current);
        }

        Ok(Self {
            start_offset,
            stream_structure_version,
            header_type_flag,
            absolute_granule_position,
            stream_serial_number,
            sequence_number,
            checksum,
            segment_table_length,
            segment_sizes,
        })
    }

    /// Offset of the page in the stream.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Stream structure version (always zero).
    pub fn stream_structure_version(&self) -> u8 {
        self.stream_structure_version
    }

    /// Raw header type flag.
    pub fn header_type_flag(&self) -> u8 {
        self.header_type_flag
    }

    /// Whether the first segment continues a packet of the previous page.
    pub fn is_continued(&self) -> bool {
        self.header_type_flag & 0x01 != 0
    }

    /// Whether this is the first page of its logical bitstream.
    pub fn is_first_page(&self) -> bool {
        self.header_type_flag & 0x02 != 0
    }

    /// Whether this is the last page of its logical bitstream.
    pub fn is_last_page(&self) -> bool {
        self.header_type_flag & 0x04 != 0
    }

    /// Absolute granule position of the page.
    pub fn absolute_granule_position(&self) -> u64 {
        self.absolute_granule_position
    }

    /// Serial number of the logical bitstream the page belongs to.
    pub fn stream_serial_number(&self) -> u32 {
        self.stream_serial_number
    }

    /// Page sequence number.
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// CRC checksum stored in the header.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Header size in bytes (fixed part plus segment table).
    pub fn header_size(&self) -> u64 {
        FIXED_HEADER_SIZE + self.segment_table_length as u64
    }

    /// Sizes of the segments in this page.
    pub fn segment_sizes(&self) -> &[u32] {
        &self.segment_sizes
    }

    /// Total size of the page including its header.
    pub fn total_size(&self) -> u64 {
        self.header_size() + self.segment_sizes.iter().map(|&s| s as u64).sum::<u64>()
    }

    /// Offset of the data of the segment with the given index.
    pub fn data_offset(&self, segment_index: usize) -> u64 {
        self.start_offset
            + self.header_size()
            + self.segment_sizes[..segment_index]
                .iter()
                .map(|&s| s as u64)
                .sum::<u64>()
    }
}
