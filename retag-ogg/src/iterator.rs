//! Iteration over the segments of an OGG bitstream.
//!
//! The iterator walks pages and segments in both directions, reads across
//! page boundaries (skipping page headers) and optionally filters pages by
//! their stream serial number. Fetched pages are cached and never evicted;
//! fetching is strictly monotonic.

use std::io::{Read, Seek, SeekFrom};

use tracing::debug;

use retag_core::{Error, Result};

use crate::page::OggPage;

/// Cursor over the pages and segments of an OGG stream.
///
/// A freshly constructed iterator is invalid; call [`reset`](Self::reset) to
/// move it to the first matching segment. Methods that may fetch pages or
/// read data take the stream as a parameter.
#[derive(Debug)]
pub struct OggIterator {
    start_offset: u64,
    stream_size: u64,
    pages: Vec<OggPage>,
    page: usize,
    segment: usize,
    offset: u64,
    bytes_read: u32,
    filter: Option<u32>,
}

impl OggIterator {
    /// Create an iterator over `stream_size` bytes starting at
    /// `start_offset`.
    pub fn new(start_offset: u64, stream_size: u64) -> Self {
        Self {
            start_offset,
            stream_size,
            pages: Vec::new(),
            page: 0,
            segment: 0,
            offset: 0,
            bytes_read: 0,
            filter: None,
        }
    }

    /// The pages fetched so far.
    pub fn pages(&self) -> &[OggPage] {
        &self.pages
    }

    /// Whether the iterator points at a segment.
    pub fn is_valid(&self) -> bool {
        self.page < self.pages.len()
            && self.segment < self.pages[self.page].segment_sizes().len()
    }

    /// The current page; `None` when the iterator is invalid.
    pub fn current_page(&self) -> Option<&OggPage> {
        self.pages.get(self.page)
    }

    /// Index of the current page.
    pub fn current_page_index(&self) -> usize {
        self.page
    }

    /// Move to the first segment of an already fetched page.
    pub fn set_page_index(&mut self, index: usize) {
        let page = &self.pages[index];
        self.page = index;
        self.segment = 0;
        self.bytes_read = 0;
        self.offset = page.start_offset() + page.header_size();
    }

    /// Move to a segment of the current page.
    pub fn set_segment_index(&mut self, index: usize) {
        let page = &self.pages[self.page];
        self.segment = index;
        self.bytes_read = 0;
        self.offset = page.data_offset(index);
    }

    /// Index of the current segment within the current page.
    pub fn current_segment_index(&self) -> usize {
        self.segment
    }

    /// Offset of the current segment in the stream.
    pub fn current_segment_offset(&self) -> u64 {
        self.offset
    }

    /// Offset of the next character to be read.
    pub fn current_character_offset(&self) -> u64 {
        self.offset + self.bytes_read as u64
    }

    /// Size of the current segment; only meaningful while the iterator is
    /// valid.
    pub fn current_segment_size(&self) -> u32 {
        self.pages[self.page].segment_sizes()[self.segment]
    }

    /// Skip pages whose stream serial number differs from `serial`.
    pub fn set_filter(&mut self, serial: u32) {
        self.filter = Some(serial);
    }

    /// Remove a previously set filter.
    pub fn remove_filter(&mut self) {
        self.filter = None;
    }

    /// Whether every page in the covered range has been fetched.
    pub fn all_pages_fetched(&self) -> bool {
        self.pages
            .last()
            .map_or(self.start_offset, |page| page.start_offset() + page.total_size())
            >= self.stream_size
    }

    fn matches_filter(&self, page: &OggPage) -> bool {
        self.filter
            .map_or(true, |serial| serial == page.stream_serial_number())
    }

    /// Move to the first segment of the first non-empty page matching the
    /// filter. Fetched pages remain cached across resets.
    pub fn reset<R: Read + Seek>(&mut self, io: &mut R) -> Result<()> {
        self.page = 0;
        self.segment = 0;
        self.offset = 0;
        self.bytes_read = 0;
        loop {
            if self.page >= self.pages.len() && !self.fetch_next_page(io)? {
                // no matching page: the iterator stays invalid
                return Ok(());
            }
            let page = &self.pages[self.page];
            if !page.segment_sizes().is_empty() && self.matches_filter(page) {
                self.offset = page.start_offset() + page.header_size();
                return Ok(());
            }
            self.page += 1;
        }
    }

    /// Advance to the first segment of the next matching page, if any.
    pub fn next_page<R: Read + Seek>(&mut self, io: &mut R) -> Result<()> {
        if !self.is_valid() {
            return Ok(());
        }
        loop {
            self.page += 1;
            if self.page >= self.pages.len() && !self.fetch_next_page(io)? {
                // no next page: the iterator becomes invalid
                return Ok(());
            }
            let page = &self.pages[self.page];
            if !page.segment_sizes().is_empty() && self.matches_filter(page) {
                self.segment = 0;
                self.bytes_read = 0;
                self.offset = page.start_offset() + page.header_size();
                return Ok(());
            }
        }
    }

    /// Advance by one segment, crossing to the next matching page when the
    /// current one is exhausted.
    pub fn next_segment<R: Read + Seek>(&mut self, io: &mut R) -> Result<()> {
        if !self.is_valid() {
            return Ok(());
        }
        let page = &self.pages[self.page];
        if self.segment + 1 < page.segment_sizes().len() && self.matches_filter(page) {
            self.offset += page.segment_sizes()[self.segment] as u64;
            self.segment += 1;
            self.bytes_read = 0;
            Ok(())
        } else {
            self.next_page(io)
        }
    }

    /// Step back to the last segment of the previous matching page.
    pub fn previous_page(&mut self) {
        if !self.is_valid() {
            return;
        }
        while self.page > 0 {
            self.page -= 1;
            let page = &self.pages[self.page];
            if !page.segment_sizes().is_empty() && self.matches_filter(page) {
                self.segment = page.segment_sizes().len() - 1;
                self.bytes_read = 0;
                self.offset = page.data_offset(self.segment);
                return;
            }
        }
    }

    /// Step back by one segment.
    pub fn previous_segment(&mut self) {
        if !self.is_valid() {
            return;
        }
        let page = &self.pages[self.page];
        if self.segment > 0 && self.matches_filter(page) {
            self.offset -= page.segment_sizes()[self.segment - 1] as u64;
            self.segment -= 1;
            self.bytes_read = 0;
        } else {
            self.previous_page();
        }
    }

    /// Fill `buffer` from the stream, skipping page headers and advancing
    /// the iterator across segment and page boundaries.
    pub fn read<R: Read + Seek>(&mut self, io: &mut R, buffer: &mut [u8]) -> Result<()> {
        let mut written = 0usize;
        let mut remaining = buffer.len();
        while self.is_valid() && remaining > 0 {
            let available = (self.current_segment_size() - self.bytes_read) as usize;
            io.seek(SeekFrom::Start(self.current_character_offset()))?;
            if remaining <= available {
                io.read_exact(&mut buffer[written..written + remaining])?;
                self.bytes_read += remaining as u32;
                return Ok(());
            }
            io.read_exact(&mut buffer[written..written + available])?;
            self.next_segment(io)?;
            written += available;
            remaining -= available;
        }
        if remaining == 0 {
            Ok(())
        } else {
            Err(Error::parse(
                self.current_character_offset(),
                "stream ended before the requested number of bytes could be read",
            ))
        }
    }

    /// Advance the read position by `count` bytes, skipping page headers.
    pub fn seek_forward<R: Read + Seek>(&mut self, io: &mut R, count: u64) -> Result<()> {
        let mut remaining = count;
        while self.is_valid() && remaining > 0 {
            let available = (self.current_segment_size() - self.bytes_read) as u64;
            if remaining <= available {
                self.bytes_read += remaining as u32;
                return Ok(());
            }
            self.next_segment(io)?;
            remaining -= available;
        }
        if remaining == 0 {
            Ok(())
        } else {
            Err(Error::parse(
                self.current_character_offset(),
                "stream ended before the requested position",
            ))
        }
    }

    /// Fetch the page following the last cached one.
    ///
    /// Only possible while the cursor sits on the last cached page; returns
    /// whether a page was fetched.
    fn fetch_next_page<R: Read + Seek>(&mut self, io: &mut R) -> Result<bool> {
        if self.page == self.pages.len() {
            let offset = self
                .pages
                .last()
                .map_or(self.start_offset, |page| page.start_offset() + page.total_size());
            if offset < self.stream_size {
                let page = OggPage::parse(io, offset, self.stream_size - offset)?;
                debug!(offset, segments = page.segment_sizes().len(), "fetched OGG page");
                self.pages.push(page);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn page_bytes(serial: u32, sequence: u32, lacing: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"OggS");
        bytes.push(0);
        bytes.push(0);
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&serial.to_le_bytes());
        bytes.extend_from_slice(&sequence.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.push(lacing.len() as u8);
        bytes.extend_from_slice(lacing);
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Two pages of stream 1 with an interleaved page of stream 2; the
    /// payload of stream 1 is "hello world!" split across the pages.
    fn sample_stream() -> Vec<u8> {
        let mut bytes = page_bytes(1, 0, &[5, 1], b"hello ");
        bytes.extend(page_bytes(2, 0, &[4], b"!!!!"));
        bytes.extend(page_bytes(1, 1, &[6], b"world!"));
        bytes
    }

    #[test]
    fn test_reset_and_stepping() {
        let bytes = sample_stream();
        let size = bytes.len() as u64;
        let mut io = Cursor::new(bytes);
        let mut iterator = OggIterator::new(0, size);
        assert!(!iterator.is_valid());

        iterator.reset(&mut io).unwrap();
        assert!(iterator.is_valid());
        assert_eq!(iterator.current_page_index(), 0);
        assert_eq!(iterator.current_segment_index(), 0);
        assert_eq!(iterator.current_segment_size(), 5);
        assert_eq!(iterator.current_segment_offset(), 29);

        iterator.next_segment(&mut io).unwrap();
        assert_eq!(iterator.current_segment_index(), 1);
        assert_eq!(iterator.current_segment_size(), 1);

        iterator.next_segment(&mut io).unwrap();
        assert_eq!(iterator.current_page_index(), 1);
        assert_eq!(iterator.current_segment_index(), 0);

        iterator.previous_segment();
        assert_eq!(iterator.current_page_index(), 0);
        assert_eq!(iterator.current_segment_index(), 1);

        iterator.previous_segment();
        assert_eq!(iterator.current_segment_index(), 0);
        assert_eq!(iterator.current_segment_offset(), 29);
    }

    #[test]
    fn test_read_across_pages_with_filter() {
        let bytes = sample_stream();
        let size = bytes.len() as u64;
        let mut io = Cursor::new(bytes);
        let mut iterator = OggIterator::new(0, size);
        iterator.set_filter(1);
        iterator.reset(&mut io).unwrap();

        let mut buffer = [0u8; 12];
        iterator.read(&mut io, &mut buffer).unwrap();
        assert_eq!(&buffer, b"hello world!");
    }

    #[test]
    fn test_read_past_end_fails() {
        let bytes = sample_stream();
        let size = bytes.len() as u64;
        let mut io = Cursor::new(bytes);
        let mut iterator = OggIterator::new(0, size);
        iterator.set_filter(1);
        iterator.reset(&mut io).unwrap();

        let mut buffer = [0u8; 13];
        assert!(iterator.read(&mut io, &mut buffer).is_err());
    }

    #[test]
    fn test_seek_forward() {
        let bytes = sample_stream();
        let size = bytes.len() as u64;
        let mut io = Cursor::new(bytes);
        let mut iterator = OggIterator::new(0, size);
        iterator.set_filter(1);
        iterator.reset(&mut io).unwrap();

        iterator.seek_forward(&mut io, 6).unwrap();
        let mut buffer = [0u8; 6];
        iterator.read(&mut io, &mut buffer).unwrap();
        assert_eq!(&buffer, b"world!");
    }

    #[test]
    fn test_filter_skips_other_streams() {
        let bytes = sample_stream();
        let size = bytes.len() as u64;
        let mut io = Cursor::new(bytes);
        let mut iterator = OggIterator::new(0, size);
        iterator.set_filter(2);
        iterator.reset(&mut io).unwrap();
        assert!(iterator.is_valid());
        assert_eq!(iterator.current_page().unwrap().stream_serial_number(), 2);

        let mut buffer = [0u8; 4];
        iterator.read(&mut io, &mut buffer).unwrap();
        assert_eq!(&buffer, b"!!!!");
    }

    #[test]
    fn test_pages_are_cached_monotonically() {
        let bytes = sample_stream();
        let size = bytes.len() as u64;
        let mut io = Cursor::new(bytes);
        let mut iterator = OggIterator::new(0, size);
        iterator.reset(&mut io).unwrap();
        assert_eq!(iterator.pages().len(), 1);
        assert!(!iterator.all_pages_fetched());

        while iterator.is_valid() {
            iterator.next_page(&mut io).unwrap();
        }
        assert_eq!(iterator.pages().len(), 3);
        assert!(iterator.all_pages_fetched());

        // fetched pages survive a reset
        iterator.reset(&mut io).unwrap();
        assert_eq!(iterator.pages().len(), 3);
        assert!(iterator.is_valid());
    }
}
