//! Matroska container: parse state, gathered top-level elements and the
//! editing surface (tags, attachments, title).

use std::io::{Read, Seek};

use tracing::{debug, warn};

use retag_core::{
    validate_structure, Error, MediaFile, NotificationList, ProgressSink, Result, Severity,
};

use crate::attachments::MatroskaAttachment;
use crate::config::WriteConfig;
use crate::element::{ElemRef, ElementTree, TreeStructure};
use crate::elements;
use crate::seekhead::SeekInfo;
use crate::tags::MatroskaTag;
use crate::writer;

/// Parse state and editing surface of one Matroska file.
pub struct MatroskaContainer {
    pub(crate) file: MediaFile,
    pub(crate) tree: ElementTree,
    pub(crate) first_element: Option<ElemRef>,

    // EBML header fields
    pub(crate) version: u64,
    pub(crate) read_version: u64,
    pub(crate) max_id_length: u64,
    pub(crate) max_size_length: u64,
    pub(crate) doc_type: String,
    pub(crate) doc_type_version: u64,
    pub(crate) doc_type_read_version: u64,

    // gathered top-level elements
    pub(crate) tracks_elements: Vec<ElemRef>,
    pub(crate) segment_info_elements: Vec<ElemRef>,
    pub(crate) tags_elements: Vec<ElemRef>,
    pub(crate) chapters_elements: Vec<ElemRef>,
    pub(crate) attachments_elements: Vec<ElemRef>,
    pub(crate) seek_infos: Vec<SeekInfo>,
    pub(crate) segment_count: usize,

    // parsed segment information
    pub(crate) titles: Vec<String>,
    pub(crate) duration_secs: f64,

    // editable state
    pub(crate) tags: Vec<MatroskaTag>,
    pub(crate) attachments: Vec<MatroskaAttachment>,

    pub(crate) notifications: NotificationList,
    pub(crate) header_parsed: bool,
    max_full_parse_size: u64,
}

impl MatroskaContainer {
    /// Open the file at `path` read-only.
    pub fn open(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        Ok(Self::from_file(MediaFile::open(path)?))
    }

    /// Wrap an already opened media file.
    pub fn from_file(file: MediaFile) -> Self {
        Self {
            file,
            tree: ElementTree::new(),
            first_element: None,
            version: 1,
            read_version: 1,
            max_id_length: 4,
            max_size_length: 8,
            doc_type: "matroska".to_string(),
            doc_type_version: 1,
            doc_type_read_version: 1,
            tracks_elements: Vec::new(),
            segment_info_elements: Vec::new(),
            tags_elements: Vec::new(),
            chapters_elements: Vec::new(),
            attachments_elements: Vec::new(),
            seek_infos: Vec::new(),
            segment_count: 0,
            titles: Vec::new(),
            duration_secs: 0.0,
            tags: Vec::new(),
            attachments: Vec::new(),
            notifications: NotificationList::new(),
            header_parsed: false,
            max_full_parse_size: WriteConfig::default().max_full_parse_size,
        }
    }

    /// Restrict eager header parsing for huge files.
    pub fn set_max_full_parse_size(&mut self, size: u64) {
        self.max_full_parse_size = size;
    }

    /// The underlying media file.
    pub fn file(&self) -> &MediaFile {
        &self.file
    }

    /// Whether [`parse_header`](Self::parse_header) completed.
    pub fn is_header_parsed(&self) -> bool {
        self.header_parsed
    }

    /// Document type from the EBML header ("matroska" or "webm").
    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    /// Number of Segment elements found.
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Combined duration of all segments in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    /// Per-segment titles; empty strings for segments without one.
    pub fn titles(&self) -> &[String] {
        &self.titles
    }

    /// Set the title of the first segment.
    pub fn set_title(&mut self, title: impl Into<String>) {
        if self.titles.is_empty() {
            self.titles.push(title.into());
        } else {
            self.titles[0] = title.into();
        }
    }

    /// The parsed (and editable) tags.
    pub fn tags(&self) -> &[MatroskaTag] {
        &self.tags
    }

    /// Mutable access to the tags.
    pub fn tags_mut(&mut self) -> &mut Vec<MatroskaTag> {
        &mut self.tags
    }

    /// The parsed (and editable) attachments.
    pub fn attachments(&self) -> &[MatroskaAttachment] {
        &self.attachments
    }

    /// Mutable access to the attachments.
    pub fn attachments_mut(&mut self) -> &mut Vec<MatroskaAttachment> {
        &mut self.attachments
    }

    /// Create a new attachment with a fresh unique UID.
    pub fn create_attachment(&mut self) -> &mut MatroskaAttachment {
        let mut id = random_uid();
        let mut tries = 0u16;
        while tries < 0xFF && self.attachments.iter().any(|a| a.id == id) {
            id = random_uid();
            tries += 1;
        }
        self.attachments.push(MatroskaAttachment::new(id));
        let index = self.attachments.len() - 1;
        &mut self.attachments[index]
    }

    /// Diagnostics accumulated by parsing and writing.
    pub fn notifications(&self) -> &NotificationList {
        &self.notifications
    }

    /// Mutable access to the accumulated diagnostics.
    pub fn notifications_mut(&mut self) -> &mut NotificationList {
        &mut self.notifications
    }

    /// Drop the parse state, invalidating all element references; pending
    /// tag/attachment edits are kept.
    pub(crate) fn reset_parse_state(&mut self) {
        self.tree.clear();
        self.first_element = None;
        self.version = 1;
        self.read_version = 1;
        self.max_id_length = 4;
        self.max_size_length = 8;
        self.doc_type = "matroska".to_string();
        self.doc_type_version = 1;
        self.doc_type_read_version = 1;
        self.tracks_elements.clear();
        self.segment_info_elements.clear();
        self.tags_elements.clear();
        self.chapters_elements.clear();
        self.attachments_elements.clear();
        self.seek_infos.clear();
        self.segment_count = 0;
        self.titles.clear();
        self.duration_secs = 0.0;
        self.header_parsed = false;
    }

    /// Restore the container to its construction state.
    pub fn reset(&mut self) {
        self.reset_parse_state();
        self.tags.clear();
        self.attachments.clear();
    }

    /// Parse the EBML header and gather the major children of every Segment.
    ///
    /// Stops scanning early once tracks, tags and segment information are
    /// known (or the file exceeds the configured full-parse bound), using
    /// SeekHead information to discover elements stored behind the cluster
    /// region. A failing sibling is recorded as a critical notification and
    /// does not abort the walk.
    pub fn parse_header(&mut self) -> Result<()> {
        const CONTEXT: &str = "parsing header of Matroska container";

        self.reset_parse_state();
        let file_size = self.file.size();
        let root = self.tree.create(0, file_size);
        self.first_element = Some(root);
        let mut seek_infos_index = 0usize;

        let mut top = Some(root);
        'top: while let Some(level0) = top {
            if let Err(error) = self.tree.parse(level0, &mut self.file) {
                self.notifications.critical(
                    CONTEXT,
                    format!(
                        "unable to parse top-level element at {}: {error}",
                        self.tree.start_offset(level0)
                    ),
                );
                break;
            }
            match self.tree.id(level0) {
                elements::EBML => self.parse_ebml_header_fields(level0)?,
                elements::SEGMENT => {
                    self.segment_count += 1;
                    let mut child = match self.tree.first_child(level0, &mut self.file) {
                        Ok(child) => child,
                        Err(error) => {
                            self.notifications.critical(
                                CONTEXT,
                                format!("unable to parse all children of \"Segment\" element: {error}"),
                            );
                            None
                        }
                    };
                    while let Some(level1) = child {
                        if let Err(error) = self.tree.parse(level1, &mut self.file) {
                            self.notifications.critical(
                                CONTEXT,
                                format!("unable to parse all children of \"Segment\" element: {error}"),
                            );
                            break;
                        }
                        match self.tree.id(level1) {
                            elements::SEEK_HEAD => {
                                let mut gathered = NotificationList::new();
                                match SeekInfo::parse(
                                    &mut self.tree,
                                    level1,
                                    &mut self.file,
                                    &mut gathered,
                                ) {
                                    Ok(info) => self.seek_infos.push(info),
                                    Err(error) => self.notifications.critical(
                                        CONTEXT,
                                        format!("unable to parse \"SeekHead\" element: {error}"),
                                    ),
                                }
                                self.notifications.take_from(&mut gathered);
                            }
                            elements::TRACKS => {
                                push_unique(&self.tree, &mut self.tracks_elements, level1)
                            }
                            elements::INFO => {
                                push_unique(&self.tree, &mut self.segment_info_elements, level1)
                            }
                            elements::TAGS => {
                                push_unique(&self.tree, &mut self.tags_elements, level1)
                            }
                            elements::CHAPTERS => {
                                push_unique(&self.tree, &mut self.chapters_elements, level1)
                            }
                            elements::ATTACHMENTS => {
                                push_unique(&self.tree, &mut self.attachments_elements, level1)
                            }
                            elements::CLUSTER => {
                                self.resolve_seek_information(level0, &mut seek_infos_index);
                                // scanning further clusters is pointless once
                                // the relevant metadata has been found
                                if ((!self.tracks_elements.is_empty()
                                    && !self.tags_elements.is_empty())
                                    || file_size > self.max_full_parse_size)
                                    && !self.segment_info_elements.is_empty()
                                {
                                    debug!("stopping header scan at first cluster");
                                    break 'top;
                                }
                            }
                            _ => {}
                        }
                        child = match self.tree.next_sibling(level1, &mut self.file) {
                            Ok(next) => next,
                            Err(error) => {
                                self.notifications.critical(
                                    CONTEXT,
                                    format!(
                                        "unable to parse all children of \"Segment\" element: {error}"
                                    ),
                                );
                                break;
                            }
                        };
                    }
                }
                _ => {}
            }
            top = match self.tree.next_sibling(level0, &mut self.file) {
                Ok(next) => next,
                Err(error) => {
                    self.notifications.critical(
                        CONTEXT,
                        format!("unable to parse top-level element: {error}"),
                    );
                    break;
                }
            };
        }

        self.header_parsed = true;
        if let Err(error) = self.parse_segment_info() {
            self.notifications.critical(
                CONTEXT,
                format!("unable to parse EBML (segment) \"Info\" element: {error}"),
            );
        }
        Ok(())
    }

    fn parse_ebml_header_fields(&mut self, header: ElemRef) -> Result<()> {
        const CONTEXT: &str = "parsing header of Matroska container";

        let mut child = self.tree.first_child(header, &mut self.file)?;
        while let Some(current) = child {
            if let Err(error) = self.tree.parse(current, &mut self.file) {
                self.notifications.critical(
                    CONTEXT,
                    format!("unable to parse all children of the EBML header: {error}"),
                );
                break;
            }
            match self.tree.id(current) {
                elements::EBML_VERSION => {
                    self.version = self.tree.read_uint(current, &mut self.file)?
                }
                elements::EBML_READ_VERSION => {
                    self.read_version = self.tree.read_uint(current, &mut self.file)?
                }
                elements::DOC_TYPE => {
                    self.doc_type = self.tree.read_string(current, &mut self.file)?
                }
                elements::DOC_TYPE_VERSION => {
                    self.doc_type_version = self.tree.read_uint(current, &mut self.file)?
                }
                elements::DOC_TYPE_READ_VERSION => {
                    self.doc_type_read_version = self.tree.read_uint(current, &mut self.file)?
                }
                elements::EBML_MAX_ID_LENGTH => {
                    self.max_id_length = self.tree.read_uint(current, &mut self.file)?;
                    if self.max_id_length > 4 {
                        self.notifications.critical(
                            CONTEXT,
                            format!(
                                "maximum EBML element ID length of {} bytes is not supported",
                                self.max_id_length
                            ),
                        );
                        return Err(Error::invalid_data("unsupported maximum EBML ID length"));
                    }
                }
                elements::EBML_MAX_SIZE_LENGTH => {
                    self.max_size_length = self.tree.read_uint(current, &mut self.file)?;
                    if self.max_size_length > 8 {
                        self.notifications.critical(
                            CONTEXT,
                            format!(
                                "maximum EBML element size length of {} bytes is not supported",
                                self.max_size_length
                            ),
                        );
                        return Err(Error::invalid_data("unsupported maximum EBML size length"));
                    }
                }
                _ => {}
            }
            child = self.tree.next_sibling(current, &mut self.file)?;
        }
        self.tree
            .set_limits(self.max_id_length as u32, self.max_size_length as u32);
        Ok(())
    }

    /// Probe the offsets denoted by the seek information gathered so far and
    /// register elements located behind the cluster region.
    fn resolve_seek_information(&mut self, segment: ElemRef, seek_infos_index: &mut usize) {
        const CONTEXT: &str = "parsing header of Matroska container";

        let file_size = self.file.size();
        let segment_data_offset = self.tree.data_offset(segment);
        while *seek_infos_index < self.seek_infos.len() {
            let entries = self.seek_infos[*seek_infos_index].entries().to_vec();
            *seek_infos_index += 1;
            for entry in entries {
                let offset = segment_data_offset + entry.offset;
                if offset >= file_size {
                    self.notifications.critical(
                        CONTEXT,
                        format!("offset ({offset}) denoted by \"SeekHead\" element is invalid"),
                    );
                    continue;
                }
                let probe = self.tree.create(offset, file_size - offset);
                if let Err(error) = self.tree.parse(probe, &mut self.file) {
                    self.notifications.critical(
                        CONTEXT,
                        format!(
                            "unable to parse element at {offset} (denoted using \"SeekHead\" element): {error}"
                        ),
                    );
                    continue;
                }
                let id = self.tree.id(probe);
                if id != entry.id {
                    self.notifications.critical(
                        CONTEXT,
                        format!(
                            "ID of element {} at {offset} does not match the ID denoted in the \"SeekHead\" element (0x{:X})",
                            self.tree.id_string(probe),
                            entry.id
                        ),
                    );
                    continue;
                }
                match id {
                    elements::INFO => {
                        push_unique(&self.tree, &mut self.segment_info_elements, probe)
                    }
                    elements::TRACKS => push_unique(&self.tree, &mut self.tracks_elements, probe),
                    elements::TAGS => push_unique(&self.tree, &mut self.tags_elements, probe),
                    elements::CHAPTERS => {
                        push_unique(&self.tree, &mut self.chapters_elements, probe)
                    }
                    elements::ATTACHMENTS => {
                        push_unique(&self.tree, &mut self.attachments_elements, probe)
                    }
                    _ => {}
                }
            }
        }
    }

    /// Parse titles and duration from the gathered Info elements.
    fn parse_segment_info(&mut self) -> Result<()> {
        if self.segment_info_elements.is_empty() {
            return Err(Error::no_data("no \"Info\" element found"));
        }
        self.duration_secs = 0.0;
        self.titles.clear();
        let info_elements = self.segment_info_elements.clone();
        for info in info_elements {
            let mut raw_duration = 0.0f64;
            let mut time_scale = 0u64;
            let mut has_title = false;
            let mut child = self.tree.first_child(info, &mut self.file)?;
            while let Some(current) = child {
                self.tree.parse(current, &mut self.file)?;
                match self.tree.id(current) {
                    elements::TITLE => {
                        self.titles.push(self.tree.read_string(current, &mut self.file)?);
                        has_title = true;
                    }
                    elements::DURATION => {
                        raw_duration = self.tree.read_float(current, &mut self.file)?
                    }
                    elements::TIMECODE_SCALE => {
                        time_scale = self.tree.read_uint(current, &mut self.file)?
                    }
                    _ => {}
                }
                child = self.tree.next_sibling(current, &mut self.file)?;
            }
            if !has_title {
                self.titles.push(String::new());
            }
            if raw_duration > 0.0 && time_scale > 0 {
                self.duration_secs += raw_duration * time_scale as f64 / 1_000_000_000.0;
            }
        }
        Ok(())
    }

    /// Parse the gathered Tags elements into the editable tag list.
    ///
    /// Empty tags are dropped; a tag failing to parse is recorded and does
    /// not stop its siblings from being parsed.
    pub fn parse_tags(&mut self) -> Result<()> {
        const CONTEXT: &str = "parsing tags of Matroska container";

        self.tags.clear();
        let tags_elements = self.tags_elements.clone();
        for tags in tags_elements {
            self.tree.parse(tags, &mut self.file).map_err(|error| {
                self.notifications
                    .critical(CONTEXT, "element structure seems to be invalid");
                error
            })?;
            let mut child = self.tree.first_child(tags, &mut self.file)?;
            while let Some(current) = child {
                self.tree.parse(current, &mut self.file)?;
                match self.tree.id(current) {
                    elements::TAG => {
                        match MatroskaTag::parse(
                            &mut self.tree,
                            current,
                            &mut self.file,
                            &mut self.notifications,
                        ) {
                            Ok(tag) => self.tags.push(tag),
                            Err(error) if error.is_no_data() => {
                                debug!("dropping empty tag");
                            }
                            Err(error) => self.notifications.critical(
                                CONTEXT,
                                format!("unable to parse tag {}: {error}", self.tags.len() + 1),
                            ),
                        }
                    }
                    elements::CRC32 | elements::VOID => {}
                    _ => self.notifications.warning(
                        CONTEXT,
                        "\"Tags\" element contains unknown child; it will be ignored",
                    ),
                }
                child = self.tree.next_sibling(current, &mut self.file)?;
            }
        }
        Ok(())
    }

    /// Parse the gathered Attachments elements into the editable list.
    pub fn parse_attachments(&mut self) -> Result<()> {
        const CONTEXT: &str = "parsing attachments of Matroska container";

        self.attachments.clear();
        let attachments_elements = self.attachments_elements.clone();
        for attachments in attachments_elements {
            self.tree.parse(attachments, &mut self.file).map_err(|error| {
                self.notifications
                    .critical(CONTEXT, "element structure seems to be invalid");
                error
            })?;
            let mut child = self.tree.first_child(attachments, &mut self.file)?;
            while let Some(current) = child {
                self.tree.parse(current, &mut self.file)?;
                match self.tree.id(current) {
                    elements::ATTACHED_FILE => {
                        match MatroskaAttachment::parse(
                            &mut self.tree,
                            current,
                            &mut self.file,
                            &mut self.notifications,
                        ) {
                            Ok(attachment) => self.attachments.push(attachment),
                            Err(error) if error.is_no_data() => {
                                debug!("dropping empty attachment");
                            }
                            Err(error) => self.notifications.critical(
                                CONTEXT,
                                format!(
                                    "unable to parse attached file {}: {error}",
                                    self.attachments.len() + 1
                                ),
                            ),
                        }
                    }
                    elements::CRC32 | elements::VOID => {}
                    _ => self.notifications.warning(
                        CONTEXT,
                        "\"Attachments\" element contains unknown child; it will be ignored",
                    ),
                }
                child = self.tree.next_sibling(current, &mut self.file)?;
            }
        }
        Ok(())
    }

    /// Validate the file index: every CueClusterPosition must denote a
    /// Cluster, relative positions must denote block elements, and Cluster
    /// `Position`/`PrevSize` children must hold consistent values.
    pub fn validate_index(&mut self) -> Result<()> {
        const CONTEXT: &str = "validating Matroska file index (cues)";

        let Some(first) = self.first_element else {
            return Ok(());
        };
        let mut cues_found = false;
        let file_size = self.file.size();

        let mut segment = self.top_level_by_id(first, elements::SEGMENT)?;
        while let Some(current_segment) = segment {
            let segment_data_offset = self.tree.data_offset(current_segment);
            let mut prev_cluster_size = 0u64;
            let mut child = self.tree.first_child(current_segment, &mut self.file)?;
            while let Some(level1) = child {
                self.tree.parse(level1, &mut self.file)?;
                match self.tree.id(level1) {
                    elements::CUES => {
                        cues_found = true;
                        self.validate_cues(level1, segment_data_offset, file_size)?;
                    }
                    elements::CLUSTER => {
                        let mut cluster_child = self.tree.first_child(level1, &mut self.file)?;
                        while let Some(level2) = cluster_child {
                            self.tree.parse(level2, &mut self.file)?;
                            match self.tree.id(level2) {
                                elements::POSITION => {
                                    let position =
                                        self.tree.read_uint(level2, &mut self.file)?;
                                    let expected =
                                        self.tree.start_offset(level1) - segment_data_offset;
                                    if position > 0 && position != expected {
                                        self.notifications.critical(
                                            CONTEXT,
                                            format!(
                                                "\"Position\" element at {} points to {position} which is not the offset of the containing \"Cluster\" element",
                                                self.tree.start_offset(level2)
                                            ),
                                        );
                                    }
                                }
                                elements::PREV_SIZE => {
                                    if self.tree.read_uint(level2, &mut self.file)?
                                        != prev_cluster_size
                                    {
                                        self.notifications.critical(
                                            CONTEXT,
                                            format!(
                                                "\"PrevSize\" element at {} has an invalid value",
                                                self.tree.start_offset(level2)
                                            ),
                                        );
                                    }
                                }
                                _ => {}
                            }
                            cluster_child = self.tree.next_sibling(level2, &mut self.file)?;
                        }
                        prev_cluster_size = self.tree.total_size(level1);
                    }
                    _ => {}
                }
                child = self.tree.next_sibling(level1, &mut self.file)?;
            }
            segment = self.tree.sibling_by_id(current_segment, elements::SEGMENT, &mut self.file)?;
        }

        if !cues_found {
            self.notifications
                .warning(CONTEXT, "no \"Cues\" element (index) found");
        }
        Ok(())
    }

    fn validate_cues(
        &mut self,
        cues: ElemRef,
        segment_data_offset: u64,
        file_size: u64,
    ) -> Result<()> {
        const CONTEXT: &str = "validating Matroska file index (cues)";

        let mut cue_point = self.tree.first_child(cues, &mut self.file)?;
        while let Some(point) = cue_point {
            self.tree.parse(point, &mut self.file)?;
            if self.tree.id(point) == elements::CUE_POINT {
                let mut time_found = false;
                let mut positions_found = false;
                let mut child = self.tree.first_child(point, &mut self.file)?;
                while let Some(level3) = child {
                    self.tree.parse(level3, &mut self.file)?;
                    match self.tree.id(level3) {
                        elements::CUE_TIME => {
                            if time_found {
                                self.notifications.warning(
                                    CONTEXT,
                                    "\"CuePoint\" element contains multiple \"CueTime\" elements",
                                );
                            }
                            time_found = true;
                        }
                        elements::CUE_TRACK_POSITIONS => {
                            positions_found = true;
                            self.validate_track_positions(
                                level3,
                                segment_data_offset,
                                file_size,
                            )?;
                        }
                        _ => {}
                    }
                    child = self.tree.next_sibling(level3, &mut self.file)?;
                }
                if !time_found {
                    self.notifications.warning(
                        CONTEXT,
                        "\"CuePoint\" element lacks the mandatory \"CueTime\" element",
                    );
                }
                if !positions_found {
                    self.notifications.warning(
                        CONTEXT,
                        "\"CuePoint\" element lacks the mandatory \"CueTrackPositions\" element",
                    );
                }
            }
            cue_point = self.tree.next_sibling(point, &mut self.file)?;
        }
        Ok(())
    }

    fn validate_track_positions(
        &mut self,
        positions: ElemRef,
        segment_data_offset: u64,
        file_size: u64,
    ) -> Result<()> {
        const CONTEXT: &str = "validating Matroska file index (cues)";

        let mut track_found = false;
        let mut cluster: Option<ElemRef> = None;
        let mut relative_position: Option<u64> = None;
        let mut child = self.tree.first_child(positions, &mut self.file)?;
        while let Some(current) = child {
            self.tree.parse(current, &mut self.file)?;
            match self.tree.id(current) {
                elements::CUE_TRACK => track_found = true,
                elements::CUE_CLUSTER_POSITION => {
                    let position = self.tree.read_uint(current, &mut self.file)?;
                    let offset = segment_data_offset + position;
                    if offset >= file_size {
                        self.notifications.critical(
                            CONTEXT,
                            format!(
                                "\"CueClusterPosition\" element at {} points outside the file",
                                self.tree.start_offset(current)
                            ),
                        );
                    } else {
                        let probe = self.tree.create(offset, file_size - offset);
                        match self.tree.parse(probe, &mut self.file) {
                            Ok(()) if self.tree.id(probe) == elements::CLUSTER => {
                                cluster = Some(probe);
                            }
                            Ok(()) => self.notifications.critical(
                                CONTEXT,
                                format!(
                                    "\"CueClusterPosition\" element at {} does not point to a \"Cluster\" element (points to {offset})",
                                    self.tree.start_offset(current)
                                ),
                            ),
                            Err(error) => self.notifications.critical(
                                CONTEXT,
                                format!("unable to parse element denoted by \"CueClusterPosition\": {error}"),
                            ),
                        }
                    }
                }
                elements::CUE_RELATIVE_POSITION => {
                    relative_position = Some(self.tree.read_uint(current, &mut self.file)?);
                }
                _ => {}
            }
            child = self.tree.next_sibling(current, &mut self.file)?;
        }
        if !track_found {
            self.notifications.warning(
                CONTEXT,
                "\"CueTrackPositions\" element lacks the mandatory \"CueTrack\" element",
            );
        }
        match (cluster, relative_position) {
            (None, _) => self.notifications.warning(
                CONTEXT,
                "\"CueTrackPositions\" element lacks a valid \"CueClusterPosition\" element",
            ),
            (Some(cluster), Some(relative)) => {
                let offset = self.tree.data_offset(cluster) + relative;
                if offset >= file_size {
                    self.notifications.critical(
                        CONTEXT,
                        "\"CueRelativePosition\" element points outside the file",
                    );
                } else {
                    let probe = self.tree.create(offset, file_size - offset);
                    match self.tree.parse(probe, &mut self.file) {
                        Ok(()) => match self.tree.id(probe) {
                            elements::SIMPLE_BLOCK | elements::BLOCK | elements::BLOCK_GROUP => {}
                            _ => self.notifications.critical(
                                CONTEXT,
                                format!(
                                    "\"CueRelativePosition\" element does not point to a \"Block\", \"BlockGroup\" or \"SimpleBlock\" element (points to {offset})"
                                ),
                            ),
                        },
                        Err(error) => self.notifications.critical(
                            CONTEXT,
                            format!("unable to parse element denoted by \"CueRelativePosition\": {error}"),
                        ),
                    }
                }
            }
            (Some(_), None) => {}
        }
        Ok(())
    }

    /// First top-level element with the given ID, including `start` itself.
    fn top_level_by_id(&mut self, start: ElemRef, id: u32) -> Result<Option<ElemRef>> {
        self.tree.parse(start, &mut self.file)?;
        if self.tree.id(start) == id {
            return Ok(Some(start));
        }
        self.tree.sibling_by_id(start, id, &mut self.file)
    }

    /// Walk the whole element structure, recording problems as notifications
    /// and returning the accumulated padding size.
    pub fn validate_structure(&mut self) -> Result<u64> {
        let Some(first) = self.first_element else {
            return Ok(0);
        };
        let mut gathered = NotificationList::new();
        let padding = {
            let mut structure = TreeStructure::new(&mut self.tree, &mut self.file, first);
            validate_structure(&mut structure, &mut gathered)?
        };
        if gathered.worst_severity() >= Some(Severity::Critical) {
            warn!("element structure validation found critical problems");
        }
        self.notifications.take_from(&mut gathered);
        Ok(padding)
    }

    /// Apply the pending tag, attachment and title edits to the file.
    ///
    /// Chooses between patching the file in place and performing a full
    /// rewrite through a backup file, per the configuration.
    pub fn save(&mut self, config: &WriteConfig, progress: &dyn ProgressSink) -> Result<()> {
        writer::make_file(self, config, progress)
    }
}

/// Append `elem` unless an element with the same start offset was gathered
/// before (elements may be discovered both by scanning and via SeekHead).
fn push_unique(tree: &ElementTree, list: &mut Vec<ElemRef>, elem: ElemRef) {
    let offset = tree.start_offset(elem);
    if !list.iter().any(|&e| tree.start_offset(e) == offset) {
        list.push(elem);
    }
}

fn random_uid() -> u64 {
    let (high, low) = uuid::Uuid::new_v4().as_u64_pair();
    // fold both halves so the UID stays nonzero for practical purposes
    high ^ low | 1
}

/// Quick check whether a buffer starts with the EBML signature.
pub fn is_matroska_signature(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..4] == [0x1A, 0x45, 0xDF, 0xA3]
}

/// Detect the document type of a Matroska/WebM stream.
pub fn detect_doc_type<R: Read + Seek>(reader: &mut R, size: u64) -> Option<String> {
    let mut tree = ElementTree::new();
    let root = tree.create(0, size);
    tree.parse(root, reader).ok()?;
    if tree.id(root) != elements::EBML {
        return None;
    }
    let doc_type = tree
        .child_by_id(root, elements::DOC_TYPE, reader)
        .ok()
        .flatten()?;
    tree.read_string(doc_type, reader).ok()
}
