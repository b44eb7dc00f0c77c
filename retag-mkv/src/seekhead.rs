//! SeekHead building and parsing.
//!
//! A SeekHead is an ordered table of `(element id, offset)` pairs locating
//! the major children of a Segment; offsets are measured from the Segment's
//! data offset. During layout planning the builder is filled via
//! [`SeekInfo::push`], which reports whether the update changed the
//! serialized size; a changed size forces the planner to restart its
//! size computation.

use std::io::{Read, Seek, Write};

use retag_core::{NotificationList, Result};

use crate::ebml;
use crate::element::{ElemRef, ElementTree};
use crate::elements;

/// One `(id, offset)` pair destined for a Seek entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekEntry {
    /// ID of the referenced element.
    pub id: u32,
    /// Offset of the referenced element from the Segment's data offset.
    pub offset: u64,
}

/// Builder and parsed view of a SeekHead element.
#[derive(Debug, Default)]
pub struct SeekInfo {
    entries: Vec<SeekEntry>,
}

impl SeekInfo {
    /// Create an empty seek table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The collected entries.
    pub fn entries(&self) -> &[SeekEntry] {
        &self.entries
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Read an existing SeekHead element into a seek table.
    ///
    /// Entries missing their ID or position are skipped with a warning.
    pub fn parse<R: Read + Seek>(
        tree: &mut ElementTree,
        seek_head: ElemRef,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<Self> {
        const CONTEXT: &str = "parsing SeekHead element";

        let mut info = SeekInfo::new();
        let mut child = tree.first_child(seek_head, io)?;
        while let Some(seek) = child {
            tree.parse(seek, io)?;
            match tree.id(seek) {
                elements::SEEK => {
                    let mut id = None;
                    let mut offset = None;
                    let mut field = tree.first_child(seek, io)?;
                    while let Some(element) = field {
                        tree.parse(element, io)?;
                        match tree.id(element) {
                            elements::SEEK_ID => {
                                let bytes = tree.read_bytes(element, io)?;
                                if bytes.is_empty() || bytes.len() > 4 {
                                    notifications.warning(
                                        CONTEXT,
                                        format!(
                                            "\"SeekID\" element at {} has an invalid length",
                                            tree.start_offset(element)
                                        ),
                                    );
                                } else {
                                    id = Some(ebml::read_unsigned_int(&bytes) as u32);
                                }
                            }
                            elements::SEEK_POSITION => {
                                offset = Some(tree.read_uint(element, io)?);
                            }
                            elements::CRC32 | elements::VOID => {}
                            _ => notifications.warning(
                                CONTEXT,
                                format!(
                                    "\"Seek\" element contains unknown child {}",
                                    tree.id_string(element)
                                ),
                            ),
                        }
                        field = tree.next_sibling(element, io)?;
                    }
                    match (id, offset) {
                        (Some(id), Some(offset)) => info.entries.push(SeekEntry { id, offset }),
                        _ => notifications.warning(
                            CONTEXT,
                            "\"Seek\" element lacks a \"SeekID\" or \"SeekPosition\" child",
                        ),
                    }
                }
                elements::CRC32 | elements::VOID => {}
                _ => notifications.warning(
                    CONTEXT,
                    format!(
                        "\"SeekHead\" element contains unknown child {}",
                        tree.id_string(seek)
                    ),
                ),
            }
            child = tree.next_sibling(seek, io)?;
        }
        Ok(info)
    }

    /// Insert or update the `index`-th entry with the given `id`.
    ///
    /// Returns whether the update changed [`actual_size`](Self::actual_size);
    /// a `true` return obliges the caller to restart any offset computation
    /// that already accounted for this table.
    pub fn push(&mut self, index: usize, id: u32, offset: u64) -> bool {
        let size_before = self.actual_size();
        let mut seen = 0usize;
        let mut updated = false;
        for entry in &mut self.entries {
            if entry.id == id {
                if seen == index {
                    entry.offset = offset;
                    updated = true;
                    break;
                }
                seen += 1;
            }
        }
        if !updated {
            self.entries.push(SeekEntry { id, offset });
        }
        self.actual_size() != size_before
    }

    /// Exact serialized size of the SeekHead with the current entries.
    ///
    /// Zero when the table is empty; the element is then omitted entirely.
    pub fn actual_size(&self) -> u64 {
        if self.entries.is_empty() {
            return 0;
        }
        let content: u64 = self.entries.iter().map(Self::entry_size).sum();
        4 + ebml::calculate_size_denotation_length(content) as u64 + content
    }

    fn entry_size(entry: &SeekEntry) -> u64 {
        let seek_id =
            ebml::string_element_length(elements::SEEK_ID, ebml::id_length(entry.id) as u64);
        let seek_position = ebml::uint_element_length(elements::SEEK_POSITION, entry.offset);
        let content = seek_id + seek_position;
        2 + ebml::calculate_size_denotation_length(content) as u64 + content
    }

    /// Write the SeekHead element; writes nothing when the table is empty.
    pub fn make<W: Write>(&self, out: &mut W) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let content: u64 = self.entries.iter().map(Self::entry_size).sum();
        ebml::write_id(out, elements::SEEK_HEAD)?;
        ebml::write_size(out, content)?;
        for entry in &self.entries {
            let id_bytes = entry.id.to_be_bytes();
            let id_length = ebml::id_length(entry.id) as usize;
            let seek_content = ebml::string_element_length(elements::SEEK_ID, id_length as u64)
                + ebml::uint_element_length(elements::SEEK_POSITION, entry.offset);
            ebml::write_id(out, elements::SEEK)?;
            ebml::write_size(out, seek_content)?;
            ebml::write_binary_element(out, elements::SEEK_ID, &id_bytes[4 - id_length..])?;
            ebml::write_uint_element(out, elements::SEEK_POSITION, entry.offset)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_empty_table() {
        let info = SeekInfo::new();
        assert_eq!(info.actual_size(), 0);
        let mut out = Vec::new();
        info.make(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_push_insert_and_update() {
        let mut info = SeekInfo::new();
        // first insertion always changes the size
        assert!(info.push(0, elements::INFO, 100));
        // same width update is silent
        assert!(!info.push(0, elements::INFO, 200));
        // width growth is reported
        assert!(info.push(0, elements::INFO, 0x1_0000));
        assert_eq!(info.entries().len(), 1);
        assert_eq!(info.entries()[0].offset, 0x1_0000);
    }

    #[test]
    fn test_push_indexed_entries() {
        let mut info = SeekInfo::new();
        info.push(0, elements::TRACKS, 10);
        info.push(1, elements::TRACKS, 20);
        assert_eq!(info.entries().len(), 2);
        info.push(1, elements::TRACKS, 30);
        assert_eq!(info.entries().len(), 2);
        assert_eq!(info.entries()[1].offset, 30);
    }

    #[test]
    fn test_actual_size_matches_emitted_bytes() {
        let mut info = SeekInfo::new();
        info.push(0, elements::INFO, 0x65);
        info.push(0, elements::TRACKS, 0x1234);
        info.push(0, elements::CUES, 0x0FFF_0000);
        let mut out = Vec::new();
        info.make(&mut out).unwrap();
        assert_eq!(out.len() as u64, info.actual_size());
    }

    #[test]
    fn test_emit_parse_roundtrip() {
        let mut info = SeekInfo::new();
        info.push(0, elements::INFO, 0x65);
        info.push(0, elements::CLUSTER, 0xABCDE);
        let mut out = Vec::new();
        info.make(&mut out).unwrap();

        let len = out.len() as u64;
        let mut io = Cursor::new(out);
        let mut tree = ElementTree::new();
        let root = tree.create(0, len);
        let mut notifications = NotificationList::new();
        let parsed = SeekInfo::parse(&mut tree, root, &mut io, &mut notifications).unwrap();
        assert!(notifications.is_empty());
        assert_eq!(parsed.entries(), info.entries());
    }
}
