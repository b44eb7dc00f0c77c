//! Matroska attachments and the precomputed attachment maker.
//!
//! Attachment payloads can be large (cover art, fonts), so a parsed
//! attachment references its span in the input stream instead of holding the
//! bytes. Before an in-place rewrite overwrites the region the payload came
//! from, [`AttachmentMaker::buffer_attachment`] pulls the span into memory.

use std::io::{Read, Seek, Write};
use std::path::Path;

use retag_core::io::copy_range;
use retag_core::{Error, NotificationList, ProgressSink, Result};

use crate::ebml;
use crate::element::{ElemRef, ElementTree};
use crate::elements;

/// Payload of an attachment: owned bytes or a span of the input stream.
#[derive(Debug, Clone)]
pub enum AttachmentData {
    /// Payload held in memory.
    Buffered(Vec<u8>),
    /// Payload located in the input stream.
    InFile {
        /// Offset of the payload in the input stream.
        offset: u64,
        /// Payload size in bytes.
        size: u64,
    },
}

impl AttachmentData {
    fn size(&self) -> u64 {
        match self {
            AttachmentData::Buffered(data) => data.len() as u64,
            AttachmentData::InFile { size, .. } => *size,
        }
    }
}

/// An attached file.
#[derive(Debug, Clone)]
pub struct MatroskaAttachment {
    /// File UID.
    pub id: u64,
    /// File name.
    pub name: String,
    /// Media type, e.g. "image/jpeg".
    pub mime_type: String,
    /// Optional description.
    pub description: Option<String>,
    /// Payload, if any.
    pub data: Option<AttachmentData>,
    /// Whether the attachment is excluded from the output.
    pub ignored: bool,
}

impl MatroskaAttachment {
    /// Create an empty attachment with the given UID.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            name: String::new(),
            mime_type: String::new(),
            description: None,
            data: None,
            ignored: false,
        }
    }

    /// Load the payload (and default name) from a file on disk.
    pub fn set_data_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        if self.name.is_empty() {
            if let Some(name) = path.file_name() {
                self.name = name.to_string_lossy().into_owned();
            }
        }
        self.data = Some(AttachmentData::Buffered(data));
        Ok(())
    }

    /// Parse an AttachedFile element.
    ///
    /// The payload stays in the stream as an `(offset, size)` span. Fails
    /// with `NoData` when the element carries no payload.
    pub fn parse<R: Read + Seek>(
        tree: &mut ElementTree,
        attached_file: ElemRef,
        io: &mut R,
        notifications: &mut NotificationList,
    ) -> Result<Self> {
        const CONTEXT: &str = "parsing AttachedFile element";

        let mut attachment = MatroskaAttachment::new(0);
        let mut child = tree.first_child(attached_file, io)?;
        while let Some(current) = child {
            tree.parse(current, io)?;
            match tree.id(current) {
                elements::FILE_UID => attachment.id = tree.read_uint(current, io)?,
                elements::FILE_NAME => attachment.name = tree.read_string(current, io)?,
                elements::FILE_MEDIA_TYPE => {
                    attachment.mime_type = tree.read_string(current, io)?
                }
                elements::FILE_DESCRIPTION => {
                    attachment.description = Some(tree.read_string(current, io)?)
                }
                elements::FILE_DATA => {
                    attachment.data = Some(AttachmentData::InFile {
                        offset: tree.data_offset(current),
                        size: tree.data_size(current),
                    });
                }
                elements::CRC32 | elements::VOID => {}
                _ => notifications.warning(
                    CONTEXT,
                    format!(
                        "\"AttachedFile\" element contains unknown child {}; it will be ignored",
                        tree.id_string(current)
                    ),
                ),
            }
            child = tree.next_sibling(current, io)?;
        }
        if attachment.data.is_none() {
            return Err(Error::no_data("attached file holds no data"));
        }
        Ok(attachment)
    }

    /// Precompute the serialized form of this attachment.
    pub fn prepare_making(&self) -> Result<AttachmentMaker> {
        let Some(data) = &self.data else {
            // empty attachment: bare header so the planner can drop it
            let mut prefix = Vec::new();
            ebml::write_binary_element(&mut prefix, elements::ATTACHED_FILE, &[])?;
            return Ok(AttachmentMaker {
                required_size: prefix.len() as u64,
                prefix,
                data: AttachmentData::Buffered(Vec::new()),
            });
        };

        let data_size = data.size();
        let mut content_size = 0u64;
        if let Some(description) = &self.description {
            content_size +=
                ebml::string_element_length(elements::FILE_DESCRIPTION, description.len() as u64);
        }
        content_size += ebml::string_element_length(elements::FILE_NAME, self.name.len() as u64);
        content_size +=
            ebml::string_element_length(elements::FILE_MEDIA_TYPE, self.mime_type.len() as u64);
        content_size += ebml::uint_element_length(elements::FILE_UID, self.id);
        content_size += ebml::string_element_length(elements::FILE_DATA, data_size);

        let mut prefix = Vec::new();
        ebml::write_id(&mut prefix, elements::ATTACHED_FILE)?;
        ebml::write_size(&mut prefix, content_size)?;
        if let Some(description) = &self.description {
            ebml::write_string_element(&mut prefix, elements::FILE_DESCRIPTION, description)?;
        }
        ebml::write_string_element(&mut prefix, elements::FILE_NAME, &self.name)?;
        ebml::write_string_element(&mut prefix, elements::FILE_MEDIA_TYPE, &self.mime_type)?;
        ebml::write_uint_element(&mut prefix, elements::FILE_UID, self.id)?;
        ebml::write_id(&mut prefix, elements::FILE_DATA)?;
        ebml::write_size(&mut prefix, data_size)?;

        Ok(AttachmentMaker {
            required_size: prefix.len() as u64 + data_size,
            prefix,
            data: data.clone(),
        })
    }
}

/// Precomputed byte layout of one AttachedFile element.
#[derive(Debug)]
pub struct AttachmentMaker {
    prefix: Vec<u8>,
    data: AttachmentData,
    required_size: u64,
}

impl AttachmentMaker {
    /// Exact number of bytes [`make`](Self::make) will write.
    ///
    /// A value of 3 or less denotes an empty attachment which the writer
    /// drops.
    pub fn required_size(&self) -> u64 {
        self.required_size
    }

    /// Pull an in-stream payload into memory so the input stream may be
    /// overwritten or closed.
    pub fn buffer_attachment<R: Read + Seek>(&mut self, input: &mut R) -> Result<()> {
        if let AttachmentData::InFile { offset, size } = self.data {
            input.seek(std::io::SeekFrom::Start(offset))?;
            let mut buffer = vec![0u8; size as usize];
            input.read_exact(&mut buffer)?;
            self.data = AttachmentData::Buffered(buffer);
        }
        Ok(())
    }

    /// Write the precomputed bytes, streaming an unbuffered payload from
    /// `input`.
    pub fn make<R: Read + Seek, W: Write>(
        &self,
        out: &mut W,
        input: &mut R,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        if self.required_size <= 3 {
            return Ok(());
        }
        out.write_all(&self.prefix)?;
        match &self.data {
            AttachmentData::Buffered(data) => out.write_all(data)?,
            AttachmentData::InFile { offset, size } => {
                copy_range(input, out, *offset, *size, progress)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retag_core::NoProgress;
    use std::io::Cursor;

    #[test]
    fn test_make_parse_roundtrip() {
        let mut attachment = MatroskaAttachment::new(0x1234);
        attachment.name = "cover.jpg".to_string();
        attachment.mime_type = "image/jpeg".to_string();
        attachment.description = Some("front cover".to_string());
        attachment.data = Some(AttachmentData::Buffered(vec![0xFF, 0xD8, 0xFF]));

        let maker = attachment.prepare_making().unwrap();
        let mut bytes = Vec::new();
        let mut no_input = Cursor::new(Vec::new());
        maker.make(&mut bytes, &mut no_input, &NoProgress).unwrap();
        assert_eq!(bytes.len() as u64, maker.required_size());

        let len = bytes.len() as u64;
        let mut io = Cursor::new(bytes);
        let mut tree = ElementTree::new();
        let root = tree.create(0, len);
        let mut notifications = NotificationList::new();
        let parsed =
            MatroskaAttachment::parse(&mut tree, root, &mut io, &mut notifications).unwrap();
        assert!(notifications.is_empty());
        assert_eq!(parsed.id, 0x1234);
        assert_eq!(parsed.name, "cover.jpg");
        assert_eq!(parsed.mime_type, "image/jpeg");
        assert_eq!(parsed.description.as_deref(), Some("front cover"));
        match parsed.data.unwrap() {
            AttachmentData::InFile { size, .. } => assert_eq!(size, 3),
            AttachmentData::Buffered(_) => panic!("parsed payload should stay in the stream"),
        }
    }

    #[test]
    fn test_streamed_payload_and_buffering() {
        // input stream: payload lives at offset 4
        let input_bytes = vec![0u8, 0, 0, 0, 0xAA, 0xBB, 0xCC, 0xDD];
        let mut attachment = MatroskaAttachment::new(1);
        attachment.name = "blob".to_string();
        attachment.mime_type = "application/octet-stream".to_string();
        attachment.data = Some(AttachmentData::InFile { offset: 4, size: 4 });

        let mut maker = attachment.prepare_making().unwrap();
        let mut out_streamed = Vec::new();
        let mut input = Cursor::new(input_bytes.clone());
        maker
            .make(&mut out_streamed, &mut input, &NoProgress)
            .unwrap();
        assert_eq!(out_streamed.len() as u64, maker.required_size());
        assert!(out_streamed.ends_with(&[0xAA, 0xBB, 0xCC, 0xDD]));

        // buffering then writing without touching the input again
        let mut input = Cursor::new(input_bytes);
        maker.buffer_attachment(&mut input).unwrap();
        let mut empty = Cursor::new(Vec::new());
        let mut out_buffered = Vec::new();
        maker
            .make(&mut out_buffered, &mut empty, &NoProgress)
            .unwrap();
        assert_eq!(out_buffered, out_streamed);
    }

    #[test]
    fn test_empty_attachment_is_droppable() {
        let attachment = MatroskaAttachment::new(9);
        let maker = attachment.prepare_making().unwrap();
        assert!(maker.required_size() <= 3);
        let mut out = Vec::new();
        let mut empty = Cursor::new(Vec::new());
        maker.make(&mut out, &mut empty, &NoProgress).unwrap();
        assert!(out.is_empty());
    }
}
