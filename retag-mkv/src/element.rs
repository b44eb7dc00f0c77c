//! Lazy EBML element tree.
//!
//! Elements parse only their header (identifier and size denotation) and
//! materialize links to their first child and next sibling on demand, so a
//! multi-gigabyte file costs a handful of header reads until something
//! actually navigates into it.
//!
//! Nodes live in an arena owned by [`ElementTree`]; an [`ElemRef`] is a
//! copyable index into it. Resetting the tree invalidates every reference at
//! once, which mirrors the ownership rule that elements never outlive their
//! container.

use std::io::{Read, Seek, SeekFrom, Write};

use retag_core::io::copy_range;
use retag_core::tree::ElementStructure;
use retag_core::{Error, ProgressSink, Result};

use crate::ebml;
use crate::elements;

/// Reference to an element node inside an [`ElementTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElemRef(pub(crate) usize);

#[derive(Debug, Clone, Default)]
struct Node {
    id: u32,
    id_length: u32,
    size_length: u32,
    data_size: u64,
    size_unknown: bool,
    start_offset: u64,
    max_size: u64,
    parent: Option<ElemRef>,
    first_child: Option<ElemRef>,
    next_sibling: Option<ElemRef>,
    parsed: bool,
}

/// Arena of lazily parsed EBML elements backed by one seekable stream.
#[derive(Debug)]
pub struct ElementTree {
    nodes: Vec<Node>,
    max_id_length: u32,
    max_size_length: u32,
}

impl Default for ElementTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ElementTree {
    /// Create an empty tree with the Matroska default limits.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            max_id_length: ebml::MAX_ID_LENGTH,
            max_size_length: ebml::MAX_VINT_LENGTH,
        }
    }

    /// Restrict the accepted identifier and size denotation widths.
    pub fn set_limits(&mut self, max_id_length: u32, max_size_length: u32) {
        self.max_id_length = max_id_length.min(ebml::MAX_ID_LENGTH);
        self.max_size_length = max_size_length.min(ebml::MAX_VINT_LENGTH);
    }

    /// Drop all nodes, invalidating every [`ElemRef`] handed out so far.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.max_id_length = ebml::MAX_ID_LENGTH;
        self.max_size_length = ebml::MAX_VINT_LENGTH;
    }

    /// Whether the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Create an unparsed element spanning at most `max_size` bytes starting
    /// at `start_offset`. Used for the file root and for probing elements at
    /// offsets denoted by seek or cue information.
    pub fn create(&mut self, start_offset: u64, max_size: u64) -> ElemRef {
        self.push_node(Node {
            start_offset,
            max_size,
            ..Node::default()
        })
    }

    fn push_node(&mut self, node: Node) -> ElemRef {
        self.nodes.push(node);
        ElemRef(self.nodes.len() - 1)
    }

    fn node(&self, elem: ElemRef) -> &Node {
        &self.nodes[elem.0]
    }

    /// Parse the element header at the node's start offset.
    ///
    /// Idempotent once the node is parsed; use [`reparse`](Self::reparse) to
    /// force a fresh read. Creates the unparsed first-child and next-sibling
    /// nodes so navigation can continue lazily.
    pub fn parse<R: Read + Seek>(&mut self, elem: ElemRef, io: &mut R) -> Result<()> {
        if self.node(elem).parsed {
            return Ok(());
        }
        let start_offset = self.node(elem).start_offset;
        let max_size = self.node(elem).max_size;
        let parent = self.node(elem).parent;

        if max_size < 2 {
            return Err(Error::parse(
                start_offset,
                "stream ended before the element header was complete",
            ));
        }
        io.seek(SeekFrom::Start(start_offset))?;
        let (id, id_length) =
            ebml::read_element_id(io).map_err(|e| ebml::at_offset(e, start_offset))?;
        if id_length > self.max_id_length {
            return Err(Error::parse(
                start_offset,
                format!(
                    "element ID length {id_length} exceeds the configured maximum of {} bytes",
                    self.max_id_length
                ),
            ));
        }
        let (size, size_length) =
            ebml::read_element_size(io).map_err(|e| ebml::at_offset(e, start_offset))?;
        if size_length > self.max_size_length {
            return Err(Error::parse(
                start_offset,
                format!(
                    "element size length {size_length} exceeds the configured maximum of {} bytes",
                    self.max_size_length
                ),
            ));
        }

        let data_offset = start_offset + id_length as u64 + size_length as u64;
        let (data_size, size_unknown) = match size {
            Some(size) => (size, false),
            None if id == elements::SEGMENT && parent.is_none() => {
                let measured =
                    self.measure_unknown_size(io, data_offset, start_offset + max_size)?;
                (measured, true)
            }
            None => {
                return Err(Error::parse(
                    start_offset,
                    "an unknown element size is only supported for the top-level Segment",
                ));
            }
        };
        let total_size = id_length as u64 + size_length as u64 + data_size;
        if total_size > max_size {
            return Err(Error::parse(
                start_offset,
                format!("total element size {total_size} exceeds the available {max_size} bytes"),
            ));
        }

        let first_child = if elements::is_master_element(id) && data_size > 0 {
            Some(self.push_node(Node {
                start_offset: data_offset,
                max_size: data_size,
                parent: Some(elem),
                ..Node::default()
            }))
        } else {
            None
        };
        let next_sibling = if total_size < max_size {
            Some(self.push_node(Node {
                start_offset: start_offset + total_size,
                max_size: max_size - total_size,
                parent,
                ..Node::default()
            }))
        } else {
            None
        };

        let node = &mut self.nodes[elem.0];
        node.id = id;
        node.id_length = id_length;
        node.size_length = size_length;
        node.data_size = data_size;
        node.size_unknown = size_unknown;
        node.first_child = first_child;
        node.next_sibling = next_sibling;
        node.parsed = true;
        Ok(())
    }

    /// Clear the parsed state and parse the header again.
    ///
    /// Previously materialized descendants are detached; their nodes stay in
    /// the arena until the tree is cleared.
    pub fn reparse<R: Read + Seek>(&mut self, elem: ElemRef, io: &mut R) -> Result<()> {
        let node = &mut self.nodes[elem.0];
        node.id = 0;
        node.id_length = 0;
        node.size_length = 0;
        node.data_size = 0;
        node.size_unknown = false;
        node.first_child = None;
        node.next_sibling = None;
        node.parsed = false;
        self.parse(elem, io)
    }

    /// Measure the payload of an unknown-size Segment by scanning child
    /// headers until EOF or the next top-level element.
    fn measure_unknown_size<R: Read + Seek>(
        &self,
        io: &mut R,
        data_offset: u64,
        bound: u64,
    ) -> Result<u64> {
        let mut cursor = data_offset;
        while cursor < bound {
            io.seek(SeekFrom::Start(cursor))?;
            let Ok((id, id_length)) = ebml::read_element_id(io) else {
                break;
            };
            if id == elements::EBML || id == elements::SEGMENT {
                break;
            }
            let Ok((size, size_length)) = ebml::read_element_size(io) else {
                break;
            };
            let Some(size) = size else {
                return Err(Error::parse(cursor, "nested element with unknown size"));
            };
            let total = id_length as u64 + size_length as u64 + size;
            if cursor + total > bound {
                cursor = bound;
                break;
            }
            cursor += total;
        }
        Ok(cursor - data_offset)
    }

    /// The element ID (raw bytes including the width marker).
    pub fn id(&self, elem: ElemRef) -> u32 {
        self.node(elem).id
    }

    /// Printable form of the element ID.
    pub fn id_string(&self, elem: ElemRef) -> String {
        format!("0x{:X}", self.node(elem).id)
    }

    /// Length of the identifier denotation in bytes.
    pub fn id_length(&self, elem: ElemRef) -> u32 {
        self.node(elem).id_length
    }

    /// Length of the size denotation in bytes.
    pub fn size_length(&self, elem: ElemRef) -> u32 {
        self.node(elem).size_length
    }

    /// Identifier length plus size denotation length.
    pub fn header_size(&self, elem: ElemRef) -> u32 {
        let node = self.node(elem);
        node.id_length + node.size_length
    }

    /// Size of the payload in bytes.
    pub fn data_size(&self, elem: ElemRef) -> u64 {
        self.node(elem).data_size
    }

    /// Whether the size denotation was the reserved unknown marker.
    pub fn size_unknown(&self, elem: ElemRef) -> bool {
        self.node(elem).size_unknown
    }

    /// Offset of the element in the stream.
    pub fn start_offset(&self, elem: ElemRef) -> u64 {
        self.node(elem).start_offset
    }

    /// Offset of the payload in the stream.
    pub fn data_offset(&self, elem: ElemRef) -> u64 {
        let node = self.node(elem);
        node.start_offset + node.id_length as u64 + node.size_length as u64
    }

    /// Header size plus payload size.
    pub fn total_size(&self, elem: ElemRef) -> u64 {
        let node = self.node(elem);
        node.id_length as u64 + node.size_length as u64 + node.data_size
    }

    /// Offset of the first byte after the element.
    pub fn end_offset(&self, elem: ElemRef) -> u64 {
        self.start_offset(elem) + self.total_size(elem)
    }

    /// Maximum total size the element may occupy.
    pub fn max_size(&self, elem: ElemRef) -> u64 {
        self.node(elem).max_size
    }

    /// The owning parent element, if any.
    pub fn parent(&self, elem: ElemRef) -> Option<ElemRef> {
        self.node(elem).parent
    }

    /// Whether the header has been parsed.
    pub fn is_parsed(&self, elem: ElemRef) -> bool {
        self.node(elem).parsed
    }

    /// Whether the element is pure padding.
    pub fn is_padding(&self, elem: ElemRef) -> bool {
        self.node(elem).id == elements::VOID
    }

    /// First child, parsing the element first.
    pub fn first_child<R: Read + Seek>(
        &mut self,
        elem: ElemRef,
        io: &mut R,
    ) -> Result<Option<ElemRef>> {
        self.parse(elem, io)?;
        Ok(self.node(elem).first_child)
    }

    /// Next sibling, parsing the element first.
    pub fn next_sibling<R: Read + Seek>(
        &mut self,
        elem: ElemRef,
        io: &mut R,
    ) -> Result<Option<ElemRef>> {
        self.parse(elem, io)?;
        Ok(self.node(elem).next_sibling)
    }

    /// First child with the given ID, or `None` when absent.
    pub fn child_by_id<R: Read + Seek>(
        &mut self,
        elem: ElemRef,
        id: u32,
        io: &mut R,
    ) -> Result<Option<ElemRef>> {
        let mut child = self.first_child(elem, io)?;
        while let Some(current) = child {
            self.parse(current, io)?;
            if self.node(current).id == id {
                return Ok(Some(current));
            }
            child = self.node(current).next_sibling;
        }
        Ok(None)
    }

    /// First later sibling with the given ID, or `None` when absent.
    pub fn sibling_by_id<R: Read + Seek>(
        &mut self,
        elem: ElemRef,
        id: u32,
        io: &mut R,
    ) -> Result<Option<ElemRef>> {
        self.parse(elem, io)?;
        let mut sibling = self.node(elem).next_sibling;
        while let Some(current) = sibling {
            self.parse(current, io)?;
            if self.node(current).id == id {
                return Ok(Some(current));
            }
            sibling = self.node(current).next_sibling;
        }
        Ok(None)
    }

    /// Resolve a path of IDs starting at `elem` (which must match the first
    /// path component), descending one level per component.
    pub fn subelement_by_path<R: Read + Seek>(
        &mut self,
        elem: ElemRef,
        path: &[u32],
        io: &mut R,
    ) -> Result<Option<ElemRef>> {
        let mut current = Some(elem);
        let mut depth = 0usize;
        while let Some(elem) = current {
            let Some(&expected) = path.get(depth) else {
                return Ok(None);
            };
            self.parse(elem, io)?;
            if self.node(elem).id == expected {
                if depth + 1 == path.len() {
                    return Ok(Some(elem));
                }
                depth += 1;
                current = self.node(elem).first_child;
            } else {
                current = self.node(elem).next_sibling;
            }
        }
        Ok(None)
    }

    /// Read the payload as an unsigned integer.
    pub fn read_uint<R: Read + Seek>(&mut self, elem: ElemRef, io: &mut R) -> Result<u64> {
        self.parse(elem, io)?;
        let data_size = self.node(elem).data_size;
        if data_size > 8 {
            return Err(Error::invalid_data(format!(
                "integer element at {} has {data_size} content bytes",
                self.node(elem).start_offset
            )));
        }
        io.seek(SeekFrom::Start(self.data_offset(elem)))?;
        let mut buffer = [0u8; 8];
        io.read_exact(&mut buffer[..data_size as usize])?;
        Ok(ebml::read_unsigned_int(&buffer[..data_size as usize]))
    }

    /// Read the payload as a float (0, 4 or 8 content bytes).
    pub fn read_float<R: Read + Seek>(&mut self, elem: ElemRef, io: &mut R) -> Result<f64> {
        let bytes = self.read_bytes(elem, io)?;
        ebml::read_float(&bytes)
    }

    /// Read the payload as a UTF-8 string.
    pub fn read_string<R: Read + Seek>(&mut self, elem: ElemRef, io: &mut R) -> Result<String> {
        let bytes = self.read_bytes(elem, io)?;
        Ok(ebml::read_string(&bytes))
    }

    /// Read the raw payload bytes.
    pub fn read_bytes<R: Read + Seek>(&mut self, elem: ElemRef, io: &mut R) -> Result<Vec<u8>> {
        self.parse(elem, io)?;
        let data_size = self.node(elem).data_size as usize;
        io.seek(SeekFrom::Start(self.data_offset(elem)))?;
        let mut buffer = vec![0u8; data_size];
        io.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Snapshot the entire element (header and payload) into memory.
    ///
    /// Needed for metadata elements that must survive while the region they
    /// were read from is being overwritten.
    pub fn buffer_element<R: Read + Seek>(&mut self, elem: ElemRef, io: &mut R) -> Result<Vec<u8>> {
        self.parse(elem, io)?;
        let total = self.total_size(elem) as usize;
        io.seek(SeekFrom::Start(self.start_offset(elem)))?;
        let mut buffer = vec![0u8; total];
        io.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Copy the entire element from `io` to `out`, honoring abort requests.
    pub fn copy_entirely<R: Read + Seek, W: Write>(
        &mut self,
        elem: ElemRef,
        io: &mut R,
        out: &mut W,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        self.parse(elem, io)?;
        copy_range(io, out, self.start_offset(elem), self.total_size(elem), progress)
    }
}

/// Adapter binding an [`ElementTree`] and its stream to the generic
/// element-structure walker.
pub struct TreeStructure<'a, R> {
    tree: &'a mut ElementTree,
    io: &'a mut R,
    root: ElemRef,
}

impl<'a, R: Read + Seek> TreeStructure<'a, R> {
    /// Walk the structure rooted at `root`.
    pub fn new(tree: &'a mut ElementTree, io: &'a mut R, root: ElemRef) -> Self {
        Self { tree, io, root }
    }
}

impl<R: Read + Seek> ElementStructure for TreeStructure<'_, R> {
    fn first(&mut self) -> Result<Option<usize>> {
        self.tree.parse(self.root, self.io)?;
        Ok(Some(self.root.0))
    }

    fn first_child(&mut self, handle: usize) -> Result<Option<usize>> {
        Ok(self.tree.first_child(ElemRef(handle), self.io)?.map(|e| e.0))
    }

    fn next_sibling(&mut self, handle: usize) -> Result<Option<usize>> {
        Ok(self.tree.next_sibling(ElemRef(handle), self.io)?.map(|e| e.0))
    }

    fn id_string(&self, handle: usize) -> String {
        self.tree.id_string(ElemRef(handle))
    }

    fn start_offset(&self, handle: usize) -> u64 {
        self.tree.start_offset(ElemRef(handle))
    }

    fn total_size(&self, handle: usize) -> u64 {
        self.tree.total_size(ElemRef(handle))
    }

    fn is_padding(&self, handle: usize) -> bool {
        self.tree.is_padding(ElemRef(handle))
    }
}
