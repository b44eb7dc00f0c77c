//! # retag-ogg
//!
//! OGG page parsing and segment iteration for the retag media tag editing
//! library.
//!
//! An OGG physical stream is a sequence of pages, each carrying segments of
//! one logical bitstream. Tag data (e.g. a Vorbis comment header) spans
//! segments and pages, so [`OggIterator`] exposes reads that cross those
//! boundaries while skipping the page framing.
//!
//! ```
//! use std::io::Cursor;
//! use retag_ogg::OggIterator;
//!
//! # fn page(serial: u32, lacing: &[u8], payload: &[u8]) -> Vec<u8> {
//! #     let mut b = Vec::new();
//! #     b.extend_from_slice(b"OggS");
//! #     b.push(0);
//! #     b.push(0);
//! #     b.extend_from_slice(&0u64.to_le_bytes());
//! #     b.extend_from_slice(&serial.to_le_bytes());
//! #     b.extend_from_slice(&0u32.to_le_bytes());
//! #     b.extend_from_slice(&0u32.to_le_bytes());
//! #     b.push(lacing.len() as u8);
//! #     b.extend_from_slice(lacing);
//! #     b.extend_from_slice(payload);
//! #     b
//! # }
//! let bytes = page(1, &[4], b"data");
//! let size = bytes.len() as u64;
//! let mut io = Cursor::new(bytes);
//!
//! let mut iterator = OggIterator::new(0, size);
//! iterator.reset(&mut io).unwrap();
//! let mut buffer = [0u8; 4];
//! iterator.read(&mut io, &mut buffer).unwrap();
//! assert_eq!(&buffer, b"data");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod iterator;
pub mod page;

pub use iterator::OggIterator;
pub use page::OggPage;

pub use retag_core::{Error, Result};
