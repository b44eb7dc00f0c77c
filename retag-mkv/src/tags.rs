//! Matroska tags: targets, simple tags and the precomputed tag maker.

use std::io::{Read, Seek, Write};

use retag_core::{Error, NotificationList, Result};

use crate::ebml;
use crate::element::{ElemRef, ElementTree};
use crate::elements;

/// Target information of a tag: which part of the file the tag applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagTarget {
    /// Target type value (e.g. 50 for the whole movie); 0 when unset.
    pub level: u64,
    /// Target type name (e.g. "MOVIE"); empty when unset.
    pub level_name: String,
    /// UIDs of targeted tracks.
    pub tracks: Vec<u64>,
    /// UIDs of targeted chapters.
    pub chapters: Vec<u64>,
    /// UIDs of targeted editions.
    pub editions: Vec<u64>,
    /// UIDs of targeted attachments.
    pub attachments: Vec<u64>,
}

impl TagTarget {
    /// Target with only a type value set.
    pub fn with_level(level: u64) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Whether no target information is present.
    pub fn is_empty(&self) -> bool {
        self.level == 0
            && self.level_name.is_empty()
            && self.tracks.is_empty()
            && self.chapters.is_empty()
            && self.editions.is_empty()
            && self.attachments.is_empty()
    }

    /// Reset to the empty target.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// A simple tag: one name/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleTag {
    /// Tag name, e.g. "TITLE".
    pub name: String,
    /// Tag language; `None` means the Matroska default ("und").
    pub language: Option<String>,
    /// Whether this is the default variant of the tag.
    pub default: bool,
    /// String value.
    pub value: Option<String>,
    /// Binary value.
    pub binary: Option<Vec<u8>>,
}

impl SimpleTag {
    /// Create a simple tag with a string value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language: None,
            default: true,
            value: Some(value.into()),
            binary: None,
        }
    }

    /// Whether the tag carries no value at all.
    pub fn is_empty(&self) -> bool {
        self.value.as_deref().map_or(true, str::is_empty)
            && self.binary.as_deref().map_or(true, <[u8]>::is_empty)
    }
}

/// A Matroska tag: a target plus its simple tags.
#[derive(Debug, Clone, Default)]
pub struct MatroskaTag {
    target: TagTarget,
    simple_tags: Vec<SimpleTag>,
}

impl MatroskaTag {
    /// Create an empty tag for the given target.
    pub fn new(target: TagTarget) -> Self {
        Self {
            target,
            simple_tags: Vec::new(),
        }
    }

    /// The tag's target.
    pub fn target(&self) -> &TagTarget {
        &self.target
    }

    /// Mutable access to the tag's target.
    pub fn target_mut(&mut self) -> &mut TagTarget {
        &mut self.target
    }

    /// The simple tags.
    pub fn simple_tags(&self) -> &[SimpleTag] {
        &self.simple_tags
    }

    /// Mutable access to the simple tags.
    pub fn simple_tags_mut(&mut self) -> &mut Vec<SimpleTag> {
        &mut self.simple_tags
    }

    /// String value of the simple tag with the given name, if present.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.simple_tags
            .iter()
            .find(|tag| tag.name == name)
            .and_then(|tag| tag.value.as_deref())
    }

    /// Set (or insert) the string value of the simple tag with the given name.
    pub fn set_value(&mut self, name: &str, value: impl Into<String>) {
        if let Some(tag) = self.simple_tags.iter_mut().find(|tag| tag.name == name) {
            tag.value = Some(value.into());
            tag.binary = None;
        } else {
            self.simple_tags.push(SimpleTag::new(name, value));
        }
    }

    /// Remove the simple tag with the given name; returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.simple_tags.len();
        self.simple_tags.retain(|tag| tag.name != name);
        self.simple_tags.len() != before
    }

    /// Parse a Tag element.
    ///
    /// Fails with `NoData` when the tag holds no simple tags so the caller
    /// can drop the entry.
    pub fn parse<R: Read + Seek>(
        tree: &mut ElementTree,
        tag: ElemRef,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<Self> {
        const CONTEXT: &str = "parsing Tag element";

        let mut parsed = MatroskaTag::default();
        let mut child = tree.first_child(tag, io)?;
        while let Some(current) = child {
            tree.parse(current, io)?;
            match tree.id(current) {
                elements::TARGETS => {
                    parsed.target = Self::parse_target(tree, current, io)?;
                }
                elements::SIMPLE_TAG => {
                    parsed
                        .simple_tags
                        .push(Self::parse_simple_tag(tree, current, io, notifications)?);
                }
                elements::CRC32 | elements::VOID => {}
                _ => notifications.warning(
                    CONTEXT,
                    format!(
                        "\"Tag\" element contains unknown child {}; it will be ignored",
                        tree.id_string(current)
                    ),
                ),
            }
            child = tree.next_sibling(current, io)?;
        }
        if parsed.simple_tags.is_empty() {
            return Err(Error::no_data("tag holds no simple tags"));
        }
        Ok(parsed)
    }

    fn parse_target<R: Read + Seek>(
        tree: &mut ElementTree,
        targets: ElemRef,
        io: &mut R,
    ) -> Result<TagTarget> {
        let mut target = TagTarget::default();
        let mut child = tree.first_child(targets, io)?;
        while let Some(current) = child {
            tree.parse(current, io)?;
            match tree.id(current) {
                elements::TARGET_TYPE_VALUE => target.level = tree.read_uint(current, io)?,
                elements::TARGET_TYPE => target.level_name = tree.read_string(current, io)?,
                elements::TAG_TRACK_UID => target.tracks.push(tree.read_uint(current, io)?),
                elements::TAG_CHAPTER_UID => target.chapters.push(tree.read_uint(current, io)?),
                elements::TAG_EDITION_UID => target.editions.push(tree.read_uint(current, io)?),
                elements::TAG_ATTACHMENT_UID => {
                    target.attachments.push(tree.read_uint(current, io)?)
                }
                _ => {}
            }
            child = tree.next_sibling(current, io)?;
        }
        Ok(target)
    }

    fn parse_simple_tag<R: Read + Seek>(
        tree: &mut ElementTree,
        simple_tag: ElemRef,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<SimpleTag> {
        const CONTEXT: &str = "parsing Tag element";

        let mut parsed = SimpleTag {
            name: String::new(),
            language: None,
            default: true,
            value: None,
            binary: None,
        };
        let mut child = tree.first_child(simple_tag, io)?;
        while let Some(current) = child {
            tree.parse(current, io)?;
            match tree.id(current) {
                elements::TAG_NAME => parsed.name = tree.read_string(current, io)?,
                elements::TAG_LANGUAGE => {
                    parsed.language = Some(tree.read_string(current, io)?)
                }
                elements::TAG_DEFAULT => {
                    parsed.default = tree.read_uint(current, io)? != 0
                }
                elements::TAG_STRING => parsed.value = Some(tree.read_string(current, io)?),
                elements::TAG_BINARY => parsed.binary = Some(tree.read_bytes(current, io)?),
                elements::SIMPLE_TAG => notifications.warning(
                    CONTEXT,
                    "nested \"SimpleTag\" elements are not supported and will be dropped",
                ),
                elements::CRC32 | elements::VOID => {}
                _ => {}
            }
            child = tree.next_sibling(current, io)?;
        }
        Ok(parsed)
    }

    /// Precompute the serialized form of this tag.
    pub fn prepare_making(&self) -> Result<TagMaker> {
        let mut content = Vec::new();

        // Targets come first; an empty target serializes as an empty element.
        let mut targets = Vec::new();
        if self.target.level != 0 {
            ebml::write_uint_element(&mut targets, elements::TARGET_TYPE_VALUE, self.target.level)?;
        }
        if !self.target.level_name.is_empty() {
            ebml::write_string_element(
                &mut targets,
                elements::TARGET_TYPE,
                &self.target.level_name,
            )?;
        }
        for (id, uids) in [
            (elements::TAG_TRACK_UID, &self.target.tracks),
            (elements::TAG_EDITION_UID, &self.target.editions),
            (elements::TAG_CHAPTER_UID, &self.target.chapters),
            (elements::TAG_ATTACHMENT_UID, &self.target.attachments),
        ] {
            for &uid in uids {
                ebml::write_uint_element(&mut targets, id, uid)?;
            }
        }
        ebml::write_binary_element(&mut content, elements::TARGETS, &targets)?;

        let mut has_fields = false;
        for simple_tag in &self.simple_tags {
            if simple_tag.is_empty() {
                continue;
            }
            has_fields = true;
            let mut fields = Vec::new();
            ebml::write_string_element(&mut fields, elements::TAG_NAME, &simple_tag.name)?;
            if let Some(language) = &simple_tag.language {
                ebml::write_string_element(&mut fields, elements::TAG_LANGUAGE, language)?;
            }
            if !simple_tag.default {
                ebml::write_uint_element(&mut fields, elements::TAG_DEFAULT, 0)?;
            }
            if let Some(value) = &simple_tag.value {
                ebml::write_string_element(&mut fields, elements::TAG_STRING, value)?;
            } else if let Some(binary) = &simple_tag.binary {
                ebml::write_binary_element(&mut fields, elements::TAG_BINARY, binary)?;
            }
            ebml::write_binary_element(&mut content, elements::SIMPLE_TAG, &fields)?;
        }

        let mut buffer = Vec::new();
        if has_fields {
            ebml::write_binary_element(&mut buffer, elements::TAG, &content)?;
        } else {
            // an empty tag serializes to its bare header so the planner can
            // recognize and drop it
            ebml::write_binary_element(&mut buffer, elements::TAG, &[])?;
        }
        Ok(TagMaker { buffer })
    }
}

/// Precomputed byte layout of one Tag element.
#[derive(Debug)]
pub struct TagMaker {
    buffer: Vec<u8>,
}

impl TagMaker {
    /// Exact number of bytes [`make`](Self::make) will write.
    ///
    /// A value of 3 or less denotes an empty tag which the writer drops.
    pub fn required_size(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Write the precomputed bytes.
    pub fn make<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(&self.buffer)?;
        Ok(())
    }
}
