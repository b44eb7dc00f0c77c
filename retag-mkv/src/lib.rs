//! # retag-mkv
//!
//! Matroska/EBML tag rewrite engine: read, edit and rewrite tag metadata in
//! Matroska and WebM files while preserving the playback-critical
//! structures (Cues, Cluster positions, track tables).
//!
//! The crate parses a lazily materialized EBML element tree from a seekable
//! stream, precomputes the exact byte layout of the rewritten segments
//! (including the size-of-size feedback between SeekHead/Cues offsets and
//! the sizes that encode them), and then either patches the file in place
//! when enough padding is available, or performs a full rewrite guarded by
//! a backup file.
//!
//! ## Example
//!
//! ```no_run
//! use retag_core::NoProgress;
//! use retag_mkv::{MatroskaContainer, MatroskaTag, TagTarget, WriteConfig};
//!
//! let mut container = MatroskaContainer::open("movie.mkv").unwrap();
//! container.parse_header().unwrap();
//! container.parse_tags().unwrap();
//!
//! let mut tag = MatroskaTag::new(TagTarget::with_level(50));
//! tag.set_value("TITLE", "A Better Title");
//! container.tags_mut().push(tag);
//!
//! container.save(&WriteConfig::default(), &NoProgress).unwrap();
//! ```
//!
//! ## File layout
//!
//! A segment written by this engine starts with a CRC-32 element iff the
//! original had one, followed by a SeekHead covering every subsequent major
//! child, the SegmentInfo (with regenerated MuxingApp/WritingApp), verbatim
//! copies of Tracks and Chapters, and then Tags, Attachments, Cues, padding
//! and Clusters per the configured positions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attachments;
pub mod config;
pub mod container;
pub mod crc;
pub mod cues;
pub mod ebml;
pub mod element;
pub mod elements;
pub mod seekhead;
pub mod tags;
mod writer;

pub use attachments::{AttachmentData, AttachmentMaker, MatroskaAttachment};
pub use config::{ElementPosition, WriteConfig};
pub use container::{detect_doc_type, is_matroska_signature, MatroskaContainer};
pub use cues::CuePositionUpdater;
pub use element::{ElemRef, ElementTree, TreeStructure};
pub use seekhead::{SeekEntry, SeekInfo};
pub use tags::{MatroskaTag, SimpleTag, TagMaker, TagTarget};

pub use retag_core::{Error, Result};
